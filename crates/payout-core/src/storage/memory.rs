use crate::balance::BalanceInputs;
use crate::error::StoreError;
use crate::flow::WithdrawalStage;
use crate::locks::KeyedLocks;
use crate::store::{BankAccountStore, ChallengeStore, CommitScope, PayoutStore};
use crate::types::{
    BankAccount, FeeFields, PasscodePurpose, Transaction, TransactionStatus, Withdrawal,
    WithdrawalChallenge, WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, RwLock};

#[derive(Debug, Default)]
struct MemoryState {
    transactions: BTreeMap<String, Transaction>,
    withdrawals: Vec<Withdrawal>,
    bank_accounts: HashMap<String, BankAccount>,
    challenges: HashMap<String, WithdrawalChallenge>,
}

impl MemoryState {
    fn balance_inputs(&self, user_id: &str, staged: &[Withdrawal]) -> BalanceInputs {
        BalanceInputs::from_records(
            self.transactions.values().filter(|tx| tx.user_id == user_id),
            self.withdrawals
                .iter()
                .filter(|wd| wd.user_id == user_id)
                .chain(staged.iter()),
        )
    }

    fn withdrawal_by_key(&self, key: &str) -> Option<&Withdrawal> {
        self.withdrawals.iter().find(|wd| wd.idempotency_key == key)
    }
}

/// Process-local store for tests and single-node development runs.
///
/// Commit scopes are serialized per user with [`KeyedLocks`]; staged inserts
/// become visible only when the scope commits.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    commit_locks: Arc<KeyedLocks>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every read and write, for exercising timeout handling.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn insert_transaction(&self, transaction: Transaction) {
        self.state
            .write()
            .await
            .transactions
            .insert(transaction.id.clone(), transaction);
    }

    pub async fn insert_withdrawal(&self, withdrawal: Withdrawal) {
        self.state.write().await.withdrawals.push(withdrawal);
    }

    pub async fn upsert_bank_account(&self, account: BankAccount) {
        self.state
            .write()
            .await
            .bank_accounts
            .insert(account.id.clone(), account);
    }

    /// Overwrite persisted fee fields without marking a correction, the way
    /// a faulty writer outside this core would.
    pub async fn overwrite_fee_fields(
        &self,
        transaction_id: &str,
        fees: FeeFields,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let tx = state
            .transactions
            .get_mut(transaction_id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction '{transaction_id}'")))?;
        tx.fees = fees;
        Ok(())
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl PayoutStore for MemoryStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn transactions_for_user(
        &self,
        user_id: &str,
        statuses: &[TransactionStatus],
    ) -> Result<Vec<Transaction>, StoreError> {
        self.simulate_latency().await;
        let state = self.state.read().await;
        let mut transactions = state
            .transactions
            .values()
            .filter(|tx| tx.user_id == user_id && statuses.contains(&tx.status))
            .cloned()
            .collect::<Vec<_>>();
        transactions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(transactions)
    }

    async fn transaction(&self, transaction_id: &str) -> Result<Option<Transaction>, StoreError> {
        self.simulate_latency().await;
        Ok(self.state.read().await.transactions.get(transaction_id).cloned())
    }

    async fn update_fee_fields(
        &self,
        transaction_id: &str,
        fees: &FeeFields,
        corrected_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;
        let tx = state
            .transactions
            .get_mut(transaction_id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction '{transaction_id}'")))?;
        tx.fees = *fees;
        tx.fees_corrected_at = Some(corrected_at);
        Ok(())
    }

    async fn balance_inputs(&self, user_id: &str) -> Result<BalanceInputs, StoreError> {
        self.simulate_latency().await;
        Ok(self.state.read().await.balance_inputs(user_id, &[]))
    }

    async fn latest_withdrawal_at(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .state
            .read()
            .await
            .withdrawals
            .iter()
            .filter(|wd| wd.user_id == user_id && wd.status != WithdrawalStatus::Rejected)
            .map(|wd| wd.created_at)
            .max())
    }

    async fn withdrawal(&self, withdrawal_id: &str) -> Result<Option<Withdrawal>, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .state
            .read()
            .await
            .withdrawals
            .iter()
            .find(|wd| wd.id == withdrawal_id)
            .cloned())
    }

    async fn withdrawals_for_user(&self, user_id: &str) -> Result<Vec<Withdrawal>, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .state
            .read()
            .await
            .withdrawals
            .iter()
            .filter(|wd| wd.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_withdrawal_status(
        &self,
        withdrawal_id: &str,
        status: WithdrawalStatus,
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;
        let withdrawal = state
            .withdrawals
            .iter_mut()
            .find(|wd| wd.id == withdrawal_id)
            .ok_or_else(|| StoreError::NotFound(format!("withdrawal '{withdrawal_id}'")))?;
        withdrawal.status = status;
        Ok(())
    }

    async fn begin_commit(&self, user_id: &str) -> Result<Box<dyn CommitScope>, StoreError> {
        self.simulate_latency().await;
        let guard = self.commit_locks.lock(user_id).await;
        Ok(Box::new(MemoryCommitScope {
            user_id: user_id.to_string(),
            state: self.state.clone(),
            staged: Vec::new(),
            latency: self.latency,
            _guard: guard,
        }))
    }
}

struct MemoryCommitScope {
    user_id: String,
    state: Arc<RwLock<MemoryState>>,
    staged: Vec<Withdrawal>,
    latency: Option<Duration>,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryCommitScope {
    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl CommitScope for MemoryCommitScope {
    async fn balance_inputs(&mut self) -> Result<BalanceInputs, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .state
            .read()
            .await
            .balance_inputs(&self.user_id, &self.staged))
    }

    async fn find_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> Result<Option<Withdrawal>, StoreError> {
        self.simulate_latency().await;
        if let Some(staged) = self.staged.iter().find(|wd| wd.idempotency_key == key) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.state.read().await.withdrawal_by_key(key).cloned())
    }

    async fn insert_withdrawal(&mut self, withdrawal: &Withdrawal) -> Result<(), StoreError> {
        self.simulate_latency().await;
        if withdrawal.user_id != self.user_id {
            return Err(StoreError::Conflict(format!(
                "commit scope for '{}' cannot insert a withdrawal for '{}'",
                self.user_id, withdrawal.user_id
            )));
        }
        let duplicate = self
            .staged
            .iter()
            .any(|wd| wd.idempotency_key == withdrawal.idempotency_key)
            || self
                .state
                .read()
                .await
                .withdrawal_by_key(&withdrawal.idempotency_key)
                .is_some();
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "idempotency key '{}' already used",
                withdrawal.idempotency_key
            )));
        }
        self.staged.push(withdrawal.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;
        state.withdrawals.extend(self.staged.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl BankAccountStore for MemoryStore {
    async fn bank_account(
        &self,
        bank_account_id: &str,
        user_id: &str,
    ) -> Result<Option<BankAccount>, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .state
            .read()
            .await
            .bank_accounts
            .get(bank_account_id)
            .filter(|account| account.user_id == user_id)
            .cloned())
    }
}

#[async_trait]
impl ChallengeStore for MemoryStore {
    async fn save_challenge(&self, challenge: &WithdrawalChallenge) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.state
            .write()
            .await
            .challenges
            .insert(challenge.challenge_id.clone(), challenge.clone());
        Ok(())
    }

    async fn replace_open_challenge(
        &self,
        challenge: &WithdrawalChallenge,
    ) -> Result<Vec<String>, StoreError> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;
        let mut cancelled = Vec::new();
        for open in state.challenges.values_mut().filter(|open| {
            open.user_id == challenge.user_id
                && open.purpose == challenge.purpose
                && open.stage == WithdrawalStage::OtpRequested
                && open.challenge_id != challenge.challenge_id
        }) {
            open.stage = WithdrawalStage::Cancelled;
            cancelled.push(open.challenge_id.clone());
        }
        state
            .challenges
            .insert(challenge.challenge_id.clone(), challenge.clone());
        Ok(cancelled)
    }

    async fn claim_passcode_attempt(
        &self,
        challenge_id: &str,
        max_attempts: u32,
    ) -> Result<Option<u32>, StoreError> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;
        Ok(state
            .challenges
            .get_mut(challenge_id)
            .filter(|challenge| {
                challenge.stage == WithdrawalStage::OtpRequested
                    && challenge.attempts < max_attempts
            })
            .map(|challenge| {
                challenge.attempts += 1;
                challenge.attempts
            }))
    }

    async fn open_challenge(
        &self,
        user_id: &str,
        purpose: PasscodePurpose,
    ) -> Result<Option<WithdrawalChallenge>, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .state
            .read()
            .await
            .challenges
            .values()
            .filter(|challenge| {
                challenge.user_id == user_id
                    && challenge.purpose == purpose
                    && challenge.stage == WithdrawalStage::OtpRequested
            })
            .max_by_key(|challenge| challenge.issued_at)
            .cloned())
    }
}
