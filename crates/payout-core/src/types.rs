use crate::error::PayoutError;
use crate::fees::{FeeBreakdown, PaymentMethod};
use crate::flow::WithdrawalStage;
use crate::money::{Money, Rate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Checkout transaction lifecycle as recorded by the checkout process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Retained,
    Cancelled,
    Refused,
    Refunded,
}

impl TransactionStatus {
    /// Statuses whose fees and net amount count toward balances and audits.
    pub const CONTRIBUTING: [TransactionStatus; 2] = [Self::Approved, Self::Retained];

    pub fn contributes(self) -> bool {
        matches!(self, Self::Approved | Self::Retained)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Retained => "retained",
            Self::Cancelled => "cancelled",
            Self::Refused => "refused",
            Self::Refunded => "refunded",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = PayoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "retained" => Ok(Self::Retained),
            "cancelled" => Ok(Self::Cancelled),
            "refused" => Ok(Self::Refused),
            "refunded" => Ok(Self::Refunded),
            other => Err(PayoutError::InvalidInput(format!(
                "unknown transaction status '{other}'"
            ))),
        }
    }
}

/// The four persisted fee fields the auditor compares and repairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeFields {
    pub platform_fee: Money,
    pub acquirer_fee: Money,
    pub commission_amount: Money,
    pub net_amount: Money,
}

impl From<&FeeBreakdown> for FeeFields {
    fn from(breakdown: &FeeBreakdown) -> Self {
        Self {
            platform_fee: breakdown.platform_fee(),
            acquirer_fee: breakdown.acquirer_fee(),
            commission_amount: breakdown.affiliate_commission(),
            net_amount: breakdown.net_amount(),
        }
    }
}

/// Checkout transaction as read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub gross_amount: Money,
    pub payment_method: PaymentMethod,
    pub settlement_days: u16,
    pub affiliate_commission_percent: Option<Rate>,
    pub status: TransactionStatus,
    pub fees: FeeFields,
    pub created_at: DateTime<Utc>,
    /// Set when the auditor last rewrote the fee fields.
    pub fees_corrected_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Fresh transaction whose fee fields are copied from a breakdown, the
    /// way the checkout process persists them.
    pub fn from_breakdown(
        user_id: impl Into<String>,
        payment_method: PaymentMethod,
        settlement_days: u16,
        affiliate_commission_percent: Option<Rate>,
        status: TransactionStatus,
        breakdown: &FeeBreakdown,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            gross_amount: breakdown.gross_amount(),
            payment_method,
            settlement_days,
            affiliate_commission_percent,
            status,
            fees: FeeFields::from(breakdown),
            created_at: Utc::now(),
            fees_corrected_at: None,
        }
    }
}

/// Payout lifecycle. Creation always starts at `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Completed,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    /// Downstream payout processing may only move forward.
    pub fn can_transition_to(self, next: WithdrawalStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Approved, Self::Completed)
                | (Self::Approved, Self::Rejected)
        )
    }
}

impl FromStr for WithdrawalStatus {
    type Err = PayoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            other => Err(PayoutError::InvalidInput(format!(
                "unknown withdrawal status '{other}'"
            ))),
        }
    }
}

/// Committed payout request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: String,
    pub user_id: String,
    pub requested_amount: Money,
    pub fee: Money,
    pub net_amount: Money,
    pub bank_account_id: String,
    pub status: WithdrawalStatus,
    /// One withdrawal per confirmed challenge; the challenge id is the key.
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BankAccountStatus {
    Pending,
    Approved,
    Rejected,
}

impl BankAccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for BankAccountStatus {
    type Err = PayoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(PayoutError::InvalidInput(format!(
                "unknown bank account status '{other}'"
            ))),
        }
    }
}

/// Payout destination registered by a merchant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccount {
    pub id: String,
    pub user_id: String,
    pub status: BankAccountStatus,
}

/// What a one-time passcode authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasscodePurpose {
    Withdrawal,
}

impl PasscodePurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Withdrawal => "withdrawal",
        }
    }
}

impl FromStr for PasscodePurpose {
    type Err = PayoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "withdrawal" => Ok(Self::Withdrawal),
            other => Err(PayoutError::InvalidInput(format!(
                "unknown passcode purpose '{other}'"
            ))),
        }
    }
}

/// Persisted two-step withdrawal state. Survives restarts, so a confirmation
/// can arrive at any process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalChallenge {
    pub challenge_id: String,
    pub user_id: String,
    pub purpose: PasscodePurpose,
    pub requested_amount: Money,
    pub bank_account_id: String,
    pub stage: WithdrawalStage,
    pub attempts: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub withdrawal_id: Option<String>,
}

impl WithdrawalChallenge {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Returned to the caller after a passcode is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpChallenge {
    pub challenge_id: String,
    pub expires_at: DateTime<Utc>,
    pub requested_amount: Money,
    pub fee: Money,
    pub net_amount: Money,
    pub available_balance: Money,
}
