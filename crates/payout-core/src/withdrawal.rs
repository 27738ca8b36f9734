//! Two-step withdrawal: request (validate, quote, send passcode) then confirm
//! (verify passcode, re-validate, commit under a per-user scope).
//!
//! The balance is read twice. The first read only fails fast for the user;
//! the authoritative read happens inside the commit scope, after the passcode
//! is verified and immediately before the insert.

use crate::clock::Clock;
use crate::error::{PayoutError, WithdrawalRejection};
use crate::fees::{FeeCalculator, WithdrawalFee};
use crate::flow::WithdrawalFlow;
use crate::journal::{Journal, JournalEntryKind};
use crate::money::Money;
use crate::otp::PasscodeChannel;
use crate::storage::Stores;
use crate::store::{with_timeout, CommitScope};
use crate::types::{
    BankAccountStatus, OtpChallenge, PasscodePurpose, Withdrawal, WithdrawalChallenge,
    WithdrawalStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Limits applied to every withdrawal request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawalPolicy {
    pub min_withdrawal: Money,
    pub max_withdrawal: Money,
    /// Minimum gap between two accepted withdrawals of one user.
    pub cooldown_minutes: i64,
    pub challenge_ttl_secs: i64,
    pub max_passcode_attempts: u32,
    pub store_timeout_ms: u64,
}

impl Default for WithdrawalPolicy {
    fn default() -> Self {
        Self {
            // 10.00
            min_withdrawal: Money::from_minor(1_000),
            // 50,000.00
            max_withdrawal: Money::from_minor(5_000_000),
            cooldown_minutes: 15,
            challenge_ttl_secs: 600,
            max_passcode_attempts: 5,
            store_timeout_ms: 5_000,
        }
    }
}

impl WithdrawalPolicy {
    pub fn validate(&self) -> Result<(), PayoutError> {
        if self.min_withdrawal.is_negative() || self.min_withdrawal > self.max_withdrawal {
            return Err(PayoutError::Configuration(format!(
                "withdrawal bounds are inconsistent: min {} max {}",
                self.min_withdrawal, self.max_withdrawal
            )));
        }
        if self.cooldown_minutes < 0 || self.challenge_ttl_secs <= 0 {
            return Err(PayoutError::Configuration(
                "cooldown must be >= 0 and challenge ttl > 0".to_string(),
            ));
        }
        if self.max_passcode_attempts == 0 || self.store_timeout_ms == 0 {
            return Err(PayoutError::Configuration(
                "passcode attempts and store timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Drives the withdrawal state machine against the stores.
pub struct WithdrawalOrchestrator {
    stores: Stores,
    calculator: FeeCalculator,
    channel: Arc<dyn PasscodeChannel>,
    journal: Arc<Journal>,
    clock: Arc<dyn Clock>,
    policy: WithdrawalPolicy,
}

impl WithdrawalOrchestrator {
    pub fn new(
        stores: Stores,
        calculator: FeeCalculator,
        channel: Arc<dyn PasscodeChannel>,
        journal: Arc<Journal>,
        clock: Arc<dyn Clock>,
        policy: WithdrawalPolicy,
    ) -> Result<Self, PayoutError> {
        policy.validate()?;
        Ok(Self {
            stores,
            calculator,
            channel,
            journal,
            clock,
            policy,
        })
    }

    pub fn policy(&self) -> &WithdrawalPolicy {
        &self.policy
    }

    pub async fn available_balance(&self, user_id: &str) -> Result<Money, PayoutError> {
        let inputs = with_timeout(
            self.policy.store_timeout(),
            "balance_inputs",
            self.stores.payouts.balance_inputs(user_id),
        )
        .await?;
        Ok(inputs.available())
    }

    /// Validate a withdrawal and send a passcode. Nothing is reserved yet.
    pub async fn request_withdrawal(
        &self,
        user_id: &str,
        requested_amount: Money,
        bank_account_id: &str,
    ) -> Result<OtpChallenge, PayoutError> {
        let now = self.clock.now();
        self.check_bounds(user_id, requested_amount)?;
        self.check_cooldown(user_id, now).await?;
        self.check_bank_account(user_id, bank_account_id).await?;

        let available = self.available_balance(user_id).await?;
        if requested_amount > available {
            return Err(rejected(
                user_id,
                WithdrawalRejection::insufficient(requested_amount, available),
            ));
        }
        let WithdrawalFee {
            fee, net_amount, ..
        } = self.calculator.compute_withdrawal_fee(requested_amount)?;

        // A code whose challenge never gets persisted verifies against nothing,
        // so sending first cannot leave a usable orphan.
        let challenge_id = self.channel.send(user_id, PasscodePurpose::Withdrawal).await?;

        let mut flow = WithdrawalFlow::new(challenge_id.clone());
        flow.mark_otp_requested()?;
        let expires_at = now + chrono::Duration::seconds(self.policy.challenge_ttl_secs);
        let challenge = WithdrawalChallenge {
            challenge_id: challenge_id.clone(),
            user_id: user_id.to_string(),
            purpose: PasscodePurpose::Withdrawal,
            requested_amount,
            bank_account_id: bank_account_id.to_string(),
            stage: flow.stage(),
            attempts: 0,
            issued_at: now,
            expires_at,
            withdrawal_id: None,
        };
        let superseded = with_timeout(
            self.policy.store_timeout(),
            "replace_open_challenge",
            self.stores.challenges.replace_open_challenge(&challenge),
        )
        .await?;
        for previous in &superseded {
            tracing::info!(
                user_id,
                challenge_id = %previous,
                "superseded withdrawal challenge cancelled"
            );
        }

        tracing::info!(
            user_id,
            challenge_id = %challenge_id,
            requested = requested_amount.minor(),
            channel = self.channel.channel_name(),
            "withdrawal passcode sent"
        );

        Ok(OtpChallenge {
            challenge_id,
            expires_at,
            requested_amount,
            fee,
            net_amount,
            available_balance: available,
        })
    }

    /// Verify the passcode and commit the withdrawal as `pending`.
    ///
    /// Retrying after a lost response returns the withdrawal already
    /// committed for the challenge instead of creating a second one.
    pub async fn confirm_withdrawal(
        &self,
        user_id: &str,
        code: &str,
    ) -> Result<Withdrawal, PayoutError> {
        let now = self.clock.now();
        let mut challenge = with_timeout(
            self.policy.store_timeout(),
            "open_challenge",
            self.stores
                .challenges
                .open_challenge(user_id, PasscodePurpose::Withdrawal),
        )
        .await?
        .ok_or_else(|| rejected(user_id, WithdrawalRejection::NoActiveChallenge))?;
        let mut flow = WithdrawalFlow::resume(challenge.challenge_id.clone(), challenge.stage);

        if challenge.is_expired(now) {
            flow.mark_expired()?;
            challenge.stage = flow.stage();
            self.save_challenge(&challenge).await?;
            return Err(rejected(user_id, WithdrawalRejection::ChallengeExpired));
        }

        let attempt = with_timeout(
            self.policy.store_timeout(),
            "claim_passcode_attempt",
            self.stores.challenges.claim_passcode_attempt(
                &challenge.challenge_id,
                self.policy.max_passcode_attempts,
            ),
        )
        .await?
        .ok_or_else(|| rejected(user_id, WithdrawalRejection::TooManyAttempts))?;
        challenge.attempts = attempt;

        if !self.channel.verify(&challenge.challenge_id, code).await? {
            let attempts_remaining = self.policy.max_passcode_attempts.saturating_sub(attempt);
            if attempts_remaining > 0 {
                return Err(rejected(
                    user_id,
                    WithdrawalRejection::PasscodeMismatch { attempts_remaining },
                ));
            }
            flow.mark_rejected()?;
            challenge.stage = flow.stage();
            self.save_challenge(&challenge).await?;
            return Err(rejected(user_id, WithdrawalRejection::TooManyAttempts));
        }

        match self.commit(&challenge, now).await {
            Ok((withdrawal, newly_committed)) => {
                if newly_committed {
                    tracing::info!(
                        user_id,
                        withdrawal_id = %withdrawal.id,
                        requested = withdrawal.requested_amount.minor(),
                        fee = withdrawal.fee.minor(),
                        "withdrawal committed"
                    );
                }
                // Also on the idempotent path: a retry after a failed journal
                // write backfills the entry, and an existing one is kept.
                self.journal
                    .record_once(
                        JournalEntryKind::WithdrawalCommitted,
                        &withdrawal.id,
                        user_id,
                        now,
                        &withdrawal,
                    )
                    .await?;

                flow.mark_committed()?;
                challenge.stage = flow.stage();
                challenge.withdrawal_id = Some(withdrawal.id.clone());
                self.save_challenge(&challenge).await?;
                Ok(withdrawal)
            }
            Err(err @ PayoutError::Validation(_)) => {
                flow.mark_rejected()?;
                challenge.stage = flow.stage();
                self.save_challenge(&challenge).await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Move a committed withdrawal forward for downstream payout processing.
    pub async fn transition_withdrawal(
        &self,
        withdrawal_id: &str,
        next: WithdrawalStatus,
    ) -> Result<Withdrawal, PayoutError> {
        let mut withdrawal = with_timeout(
            self.policy.store_timeout(),
            "withdrawal",
            self.stores.payouts.withdrawal(withdrawal_id),
        )
        .await?
        .ok_or_else(|| PayoutError::NotFound(format!("withdrawal '{withdrawal_id}'")))?;

        let previous = withdrawal.status;
        if !previous.can_transition_to(next) {
            return Err(PayoutError::InvalidInput(format!(
                "withdrawal '{withdrawal_id}' cannot move from {} to {}",
                previous.as_str(),
                next.as_str()
            )));
        }

        with_timeout(
            self.policy.store_timeout(),
            "update_withdrawal_status",
            self.stores
                .payouts
                .update_withdrawal_status(withdrawal_id, next),
        )
        .await?;
        withdrawal.status = next;

        self.journal
            .record(
                JournalEntryKind::WithdrawalStatusChanged,
                withdrawal_id,
                &withdrawal.user_id,
                self.clock.now(),
                &serde_json::json!({ "from": previous, "to": next }),
            )
            .await?;
        tracing::info!(
            withdrawal_id,
            from = previous.as_str(),
            to = next.as_str(),
            "withdrawal status changed"
        );
        Ok(withdrawal)
    }

    /// Returns the withdrawal and whether this call inserted it.
    async fn commit(
        &self,
        challenge: &WithdrawalChallenge,
        now: DateTime<Utc>,
    ) -> Result<(Withdrawal, bool), PayoutError> {
        let user_id = challenge.user_id.as_str();
        let amount = challenge.requested_amount;
        self.check_bank_account(user_id, &challenge.bank_account_id)
            .await?;
        let WithdrawalFee {
            fee, net_amount, ..
        } = self.calculator.compute_withdrawal_fee(amount)?;

        let limit = self.policy.store_timeout();
        let mut scope: Box<dyn CommitScope> = with_timeout(
            limit,
            "begin_commit",
            self.stores.payouts.begin_commit(user_id),
        )
        .await?;

        if let Some(existing) = with_timeout(
            limit,
            "find_by_idempotency_key",
            scope.find_by_idempotency_key(&challenge.challenge_id),
        )
        .await?
        {
            tracing::info!(
                user_id,
                withdrawal_id = %existing.id,
                "withdrawal already committed for challenge"
            );
            return Ok((existing, false));
        }

        self.check_cooldown(user_id, now).await?;

        let available = with_timeout(limit, "balance_inputs", scope.balance_inputs())
            .await?
            .available();
        if amount > available {
            return Err(rejected(
                user_id,
                WithdrawalRejection::insufficient(amount, available),
            ));
        }

        let withdrawal = Withdrawal {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            requested_amount: amount,
            fee,
            net_amount,
            bank_account_id: challenge.bank_account_id.clone(),
            status: WithdrawalStatus::Pending,
            idempotency_key: challenge.challenge_id.clone(),
            created_at: now,
        };
        with_timeout(limit, "insert_withdrawal", scope.insert_withdrawal(&withdrawal)).await?;
        with_timeout(limit, "commit", scope.commit()).await?;
        Ok((withdrawal, true))
    }

    fn check_bounds(&self, user_id: &str, amount: Money) -> Result<(), PayoutError> {
        if amount < self.policy.min_withdrawal {
            return Err(rejected(
                user_id,
                WithdrawalRejection::AmountBelowMinimum {
                    requested: amount,
                    minimum: self.policy.min_withdrawal,
                },
            ));
        }
        if amount > self.policy.max_withdrawal {
            return Err(rejected(
                user_id,
                WithdrawalRejection::AmountAboveMaximum {
                    requested: amount,
                    maximum: self.policy.max_withdrawal,
                },
            ));
        }
        Ok(())
    }

    async fn check_cooldown(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), PayoutError> {
        let latest = with_timeout(
            self.policy.store_timeout(),
            "latest_withdrawal_at",
            self.stores.payouts.latest_withdrawal_at(user_id),
        )
        .await?;

        if let Some(remaining_minutes) = cooldown_remaining(latest, now, self.policy.cooldown_minutes)
        {
            return Err(rejected(
                user_id,
                WithdrawalRejection::CooldownActive { remaining_minutes },
            ));
        }
        Ok(())
    }

    async fn check_bank_account(
        &self,
        user_id: &str,
        bank_account_id: &str,
    ) -> Result<(), PayoutError> {
        let account = with_timeout(
            self.policy.store_timeout(),
            "bank_account",
            self.stores.bank_accounts.bank_account(bank_account_id, user_id),
        )
        .await?
        .ok_or_else(|| {
            rejected(
                user_id,
                WithdrawalRejection::BankAccountNotFound {
                    bank_account_id: bank_account_id.to_string(),
                },
            )
        })?;

        if account.status != BankAccountStatus::Approved {
            return Err(rejected(
                user_id,
                WithdrawalRejection::BankAccountNotApproved {
                    bank_account_id: bank_account_id.to_string(),
                    status: account.status.as_str().to_string(),
                },
            ));
        }
        Ok(())
    }

    async fn save_challenge(&self, challenge: &WithdrawalChallenge) -> Result<(), PayoutError> {
        with_timeout(
            self.policy.store_timeout(),
            "save_challenge",
            self.stores.challenges.save_challenge(challenge),
        )
        .await?;
        Ok(())
    }
}

/// Whole minutes left in the cooldown window, rounded up; `None` once it
/// has elapsed.
pub fn cooldown_remaining(
    latest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown_minutes: i64,
) -> Option<i64> {
    let ends_at = latest? + chrono::Duration::minutes(cooldown_minutes);
    let remaining_secs = (ends_at - now).num_seconds();
    (remaining_secs > 0).then(|| (remaining_secs + 59) / 60)
}

fn rejected(user_id: &str, rejection: WithdrawalRejection) -> PayoutError {
    tracing::warn!(user_id, reason = %rejection, "withdrawal rejected");
    PayoutError::Validation(rejection)
}
