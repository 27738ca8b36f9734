use crate::money::Money;
use thiserror::Error;

/// Payout engine errors.
#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Net amount would be negative: gross {gross}, deductions {deductions}")]
    NegativeNetAmount { gross: Money, deductions: Money },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Withdrawal rejected: {0}")]
    Validation(#[from] WithdrawalRejection),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Audit already in progress for user '{0}'")]
    AuditInProgress(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Passcode channel '{channel}' failed: {message}")]
    PasscodeChannel { channel: String, message: String },

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl PayoutError {
    pub fn stage_violation(expected: &str, actual: &str) -> Self {
        Self::InvariantViolation(format!(
            "stage order violation: expected '{}', got '{}'",
            expected, actual
        ))
    }

    pub fn missing_fee_config(key: impl std::fmt::Display) -> Self {
        Self::Configuration(format!("no fee configuration resolves for {key}"))
    }

    /// Short machine-readable label, used in API payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::NegativeNetAmount { .. } => "negative_net_amount",
            Self::InvalidInput(_) => "invalid_input",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::AuditInProgress(_) => "audit_in_progress",
            Self::Store(_) => "store",
            Self::PasscodeChannel { .. } => "passcode_channel",
            Self::Journal(_) => "journal",
            Self::InvariantViolation(_) => "invariant_violation",
        }
    }
}

/// Failures reported by the transaction/withdrawal/bank-account stores.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store operation '{operation}' timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    #[error("store conflict: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// User-recoverable reasons a withdrawal is refused.
///
/// Every variant carries the figures a caller needs to re-prompt the user.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WithdrawalRejection {
    #[error("amount {requested} is below the minimum withdrawal of {minimum}")]
    AmountBelowMinimum { requested: Money, minimum: Money },

    #[error("amount {requested} is above the maximum withdrawal of {maximum}")]
    AmountAboveMaximum { requested: Money, maximum: Money },

    #[error("a withdrawal was requested recently; wait {remaining_minutes} more minute(s)")]
    CooldownActive { remaining_minutes: i64 },

    #[error("bank account '{bank_account_id}' not found for this user")]
    BankAccountNotFound { bank_account_id: String },

    #[error("bank account '{bank_account_id}' is not approved (status: {status})")]
    BankAccountNotApproved {
        bank_account_id: String,
        status: String,
    },

    #[error("insufficient balance: requested {requested}, available {available}, short by {shortfall}")]
    InsufficientBalance {
        requested: Money,
        available: Money,
        shortfall: Money,
    },

    #[error("no withdrawal awaiting passcode confirmation")]
    NoActiveChallenge,

    #[error("passcode challenge expired; request the withdrawal again")]
    ChallengeExpired,

    #[error("passcode mismatch; {attempts_remaining} attempt(s) remaining")]
    PasscodeMismatch { attempts_remaining: u32 },

    #[error("too many passcode attempts; request the withdrawal again")]
    TooManyAttempts,
}

impl WithdrawalRejection {
    pub fn insufficient(requested: Money, available: Money) -> Self {
        Self::InsufficientBalance {
            requested,
            available,
            shortfall: requested.saturating_sub(available),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_message_names_remaining_minutes() {
        let err = PayoutError::from(WithdrawalRejection::CooldownActive {
            remaining_minutes: 10,
        });
        assert!(err.to_string().contains("wait 10 more minute(s)"));
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn insufficient_balance_reports_exact_shortfall() {
        let rejection =
            WithdrawalRejection::insufficient(Money::from_minor(5_000), Money::from_minor(3_250));
        assert!(rejection.to_string().contains("short by 1750"));
    }
}
