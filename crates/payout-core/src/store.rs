//! Contracts this core expects from the persistent store.
//!
//! The store is an external collaborator: implementations live in
//! [`crate::storage`] (memory, PostgreSQL) or in the host application.

use crate::balance::BalanceInputs;
use crate::error::StoreError;
use crate::journal::JournalEntry;
use crate::types::{
    BankAccount, FeeFields, PasscodePurpose, Transaction, TransactionStatus, Withdrawal,
    WithdrawalChallenge, WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

/// Transactions and withdrawals.
#[async_trait]
pub trait PayoutStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    async fn transactions_for_user(
        &self,
        user_id: &str,
        statuses: &[TransactionStatus],
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn transaction(&self, transaction_id: &str) -> Result<Option<Transaction>, StoreError>;

    /// Overwrite the four fee fields and stamp the correction time.
    async fn update_fee_fields(
        &self,
        transaction_id: &str,
        fees: &FeeFields,
        corrected_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn balance_inputs(&self, user_id: &str) -> Result<BalanceInputs, StoreError>;

    /// Creation time of the user's most recent withdrawal that was not rejected.
    async fn latest_withdrawal_at(&self, user_id: &str)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn withdrawal(&self, withdrawal_id: &str) -> Result<Option<Withdrawal>, StoreError>;

    async fn withdrawals_for_user(&self, user_id: &str) -> Result<Vec<Withdrawal>, StoreError>;

    async fn update_withdrawal_status(
        &self,
        withdrawal_id: &str,
        status: WithdrawalStatus,
    ) -> Result<(), StoreError>;

    /// Open an exclusive per-user unit of work for a withdrawal commit.
    ///
    /// While the scope is alive no other scope for the same user may read a
    /// balance or insert a withdrawal. Dropping the scope without
    /// [`CommitScope::commit`] discards everything it staged.
    async fn begin_commit(&self, user_id: &str) -> Result<Box<dyn CommitScope>, StoreError>;
}

/// Serialized balance read + insert for one user.
#[async_trait]
pub trait CommitScope: Send {
    async fn balance_inputs(&mut self) -> Result<BalanceInputs, StoreError>;

    async fn find_by_idempotency_key(&mut self, key: &str)
        -> Result<Option<Withdrawal>, StoreError>;

    async fn insert_withdrawal(&mut self, withdrawal: &Withdrawal) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Bank account lookups, always scoped by owner.
#[async_trait]
pub trait BankAccountStore: Send + Sync {
    async fn bank_account(
        &self,
        bank_account_id: &str,
        user_id: &str,
    ) -> Result<Option<BankAccount>, StoreError>;
}

/// Persisted passcode challenges.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Insert or replace by `challenge_id`.
    async fn save_challenge(&self, challenge: &WithdrawalChallenge) -> Result<(), StoreError>;

    /// Persist a freshly issued challenge and cancel every other open
    /// challenge of the same user and purpose, all or nothing. Returns the
    /// ids that were cancelled.
    async fn replace_open_challenge(
        &self,
        challenge: &WithdrawalChallenge,
    ) -> Result<Vec<String>, StoreError>;

    /// Atomically consume one passcode attempt of an open challenge and
    /// return the attempt count including this one. `None` when the
    /// challenge is no longer open or has used `max_attempts` already.
    async fn claim_passcode_attempt(
        &self,
        challenge_id: &str,
        max_attempts: u32,
    ) -> Result<Option<u32>, StoreError>;

    /// Most recent challenge for the user and purpose still awaiting a code.
    async fn open_challenge(
        &self,
        user_id: &str,
        purpose: PasscodePurpose,
    ) -> Result<Option<WithdrawalChallenge>, StoreError>;
}

/// Durable mirror of the correction journal.
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// All entries in index order.
    async fn load_journal(&self) -> Result<Vec<JournalEntry>, StoreError>;

    async fn append_journal_entry(&self, entry: &JournalEntry) -> Result<(), StoreError>;
}

/// Bound a store call; an elapsed deadline becomes [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(
    limit: Duration,
    operation: &'static str,
    future: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation,
            after_ms: limit.as_millis() as u64,
        }),
    }
}
