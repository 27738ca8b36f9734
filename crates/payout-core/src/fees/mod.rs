//! Fee configuration and the pure fee calculator.

pub mod calculator;
pub mod config;

pub use calculator::{FeeBreakdown, FeeCalculator, WithdrawalFee};
pub use config::{
    FeeConfig, FeeConfigProvider, FeeConfigRow, FeeKey, FeeTable, OperationType, PaymentMethod,
    ReloadableFeeTable, ACQUIRER_FEE_PER_TRANSACTION, DEFAULT_FEE_CONFIG,
};
