//! Payout core: fee calculation, fee reconciliation and the two-step
//! withdrawal flow.
//!
//! Money is integral minor units throughout. Fee rules are injected through
//! [`FeeConfigProvider`], persistence through the async store contracts in
//! [`store`], and passcode delivery through [`PasscodeChannel`].

#![deny(unsafe_code)]

pub mod audit;
pub mod balance;
pub mod clock;
pub mod error;
pub mod fees;
pub mod flow;
pub mod journal;
pub mod locks;
pub mod money;
pub mod otp;
pub mod storage;
pub mod store;
pub mod types;
pub mod withdrawal;

pub use audit::{
    AuditReport, AuditResult, AuditStatus, AuditSummary, Auditor, BatchCorrection,
    CorrectionFailure, CorrectionOutcome, Divergence, FeeField,
};
pub use balance::BalanceInputs;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{PayoutError, StoreError, WithdrawalRejection};
pub use fees::{
    FeeBreakdown, FeeCalculator, FeeConfig, FeeConfigProvider, FeeConfigRow, FeeKey, FeeTable,
    OperationType, PaymentMethod, ReloadableFeeTable, WithdrawalFee,
    ACQUIRER_FEE_PER_TRANSACTION, DEFAULT_FEE_CONFIG,
};
pub use flow::{WithdrawalFlow, WithdrawalStage};
pub use journal::{Journal, JournalChain, JournalEntry, JournalEntryKind};
pub use money::{apply_rate, Money, Rate, RoundingMode, ROUNDING_MODE};
pub use otp::PasscodeChannel;
pub use storage::{MemoryStore, PostgresStore, StoreConfig, Stores};
pub use store::{BankAccountStore, ChallengeStore, CommitScope, JournalStore, PayoutStore};
pub use types::{
    BankAccount, BankAccountStatus, FeeFields, OtpChallenge, PasscodePurpose, Transaction,
    TransactionStatus, Withdrawal, WithdrawalChallenge, WithdrawalStatus,
};
pub use withdrawal::{WithdrawalOrchestrator, WithdrawalPolicy};
