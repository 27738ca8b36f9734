use crate::error::PayoutError;
use crate::money::{Money, Rate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Flat per-transaction cost charged by the card acquirer (minor units).
pub const ACQUIRER_FEE_PER_TRANSACTION: Money = Money::from_minor(50);

/// Operation families. Each one resolves its own configuration rows; a rate
/// configured for one family can never be looked up for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Sale,
    Withdrawal,
    Subscription,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sale => "sale",
            Self::Withdrawal => "withdrawal",
            Self::Subscription => "subscription",
        }
    }
}

/// Payment methods accepted at checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Pix,
    Boleto,
    CreditCard,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pix => "pix",
            Self::Boleto => "boleto",
            Self::CreditCard => "credit_card",
        }
    }

    /// Settlement term used when the caller does not choose one
    /// (subscription renewals).
    pub fn standard_settlement_days(self) -> u16 {
        match self {
            Self::Pix => 0,
            Self::Boleto => 2,
            Self::CreditCard => 30,
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = PayoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "pix" => Ok(Self::Pix),
            "boleto" => Ok(Self::Boleto),
            "credit_card" | "card" => Ok(Self::CreditCard),
            other => Err(PayoutError::InvalidInput(format!(
                "unknown payment method '{other}'"
            ))),
        }
    }
}

/// Lookup key for one fee configuration row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeKey {
    pub operation: OperationType,
    pub method: PaymentMethod,
    pub settlement_days: u16,
}

impl FeeKey {
    pub fn sale(method: PaymentMethod, settlement_days: u16) -> Self {
        Self {
            operation: OperationType::Sale,
            method,
            settlement_days,
        }
    }

    pub fn subscription(method: PaymentMethod) -> Self {
        Self {
            operation: OperationType::Subscription,
            method,
            settlement_days: method.standard_settlement_days(),
        }
    }

    /// Payouts leave over PIX with immediate settlement.
    pub fn withdrawal() -> Self {
        Self {
            operation: OperationType::Withdrawal,
            method: PaymentMethod::Pix,
            settlement_days: 0,
        }
    }
}

impl fmt::Display for FeeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}d)",
            self.operation.as_str(),
            self.method.as_str(),
            self.settlement_days
        )
    }
}

/// Rates and flat amounts charged for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfig {
    pub percent_fee: Rate,
    pub fixed_fee: Money,
    #[serde(default)]
    pub acquirer_fee_per_transaction: Money,
    #[serde(default)]
    pub security_reserve_percent: Rate,
}

/// One row of a configuration source (file, settings table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfigRow {
    #[serde(flatten)]
    pub key: FeeKey,
    #[serde(flatten)]
    pub config: FeeConfig,
}

const fn row(
    operation: OperationType,
    method: PaymentMethod,
    settlement_days: u16,
    percent_bps: u32,
    fixed_minor: i64,
    acquirer_minor: i64,
    reserve_bps: u32,
) -> FeeConfigRow {
    FeeConfigRow {
        key: FeeKey {
            operation,
            method,
            settlement_days,
        },
        config: FeeConfig {
            percent_fee: Rate::const_bps(percent_bps),
            fixed_fee: Money::from_minor(fixed_minor),
            acquirer_fee_per_transaction: Money::from_minor(acquirer_minor),
            security_reserve_percent: Rate::const_bps(reserve_bps),
        },
    }
}

use OperationType::{Sale, Subscription, Withdrawal};
use PaymentMethod::{Boleto, CreditCard, Pix};

const CARD_ACQUIRER: i64 = ACQUIRER_FEE_PER_TRANSACTION.minor();

/// Documented default table. Card sales are tiered by settlement term:
/// earlier access to funds costs the merchant more.
pub const DEFAULT_FEE_CONFIG: [FeeConfigRow; 10] = [
    row(Sale, Pix, 0, 499, 149, 0, 0),
    row(Sale, Boleto, 2, 499, 149, 0, 0),
    row(Sale, CreditCard, 2, 699, 149, CARD_ACQUIRER, 500),
    row(Sale, CreditCard, 7, 599, 149, CARD_ACQUIRER, 500),
    row(Sale, CreditCard, 15, 549, 149, CARD_ACQUIRER, 500),
    row(Sale, CreditCard, 30, 499, 149, CARD_ACQUIRER, 500),
    row(Subscription, Pix, 0, 399, 99, 0, 0),
    row(Subscription, Boleto, 2, 399, 99, 0, 0),
    row(Subscription, CreditCard, 30, 449, 99, CARD_ACQUIRER, 0),
    row(Withdrawal, Pix, 0, 0, 490, 0, 0),
];

/// Source of fee configuration injected into the calculator.
pub trait FeeConfigProvider: Send + Sync {
    /// Resolve exactly one row or fail with a configuration error.
    fn resolve(&self, key: &FeeKey) -> Result<FeeConfig, PayoutError>;
}

/// Validated, immutable fee table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeTable {
    rows: BTreeMap<FeeKey, FeeConfig>,
}

impl FeeTable {
    /// Validate and index configuration rows.
    ///
    /// Fails on duplicate keys, negative amounts, and percentage-based
    /// withdrawal rows. Percent ranges are already enforced by [`Rate`].
    pub fn new(rows: impl IntoIterator<Item = FeeConfigRow>) -> Result<Self, PayoutError> {
        let mut indexed = BTreeMap::new();
        for FeeConfigRow { key, config } in rows {
            if config.fixed_fee.is_negative() || config.acquirer_fee_per_transaction.is_negative()
            {
                return Err(PayoutError::Configuration(format!(
                    "negative flat fee configured for {key}"
                )));
            }
            if key.operation == OperationType::Withdrawal && !config.percent_fee.is_zero() {
                return Err(PayoutError::Configuration(format!(
                    "withdrawal fees must be flat; {key} configures {}%",
                    config.percent_fee
                )));
            }
            if indexed.insert(key, config).is_some() {
                return Err(PayoutError::Configuration(format!(
                    "duplicate fee configuration for {key}"
                )));
            }
        }
        Ok(Self { rows: indexed })
    }

    pub fn defaults() -> Self {
        Self {
            rows: DEFAULT_FEE_CONFIG
                .iter()
                .map(|row| (row.key, row.config))
                .collect(),
        }
    }

    pub fn rows(&self) -> Vec<FeeConfigRow> {
        self.rows
            .iter()
            .map(|(key, config)| FeeConfigRow {
                key: *key,
                config: *config,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Default for FeeTable {
    fn default() -> Self {
        Self::defaults()
    }
}

impl FeeConfigProvider for FeeTable {
    fn resolve(&self, key: &FeeKey) -> Result<FeeConfig, PayoutError> {
        self.rows
            .get(key)
            .copied()
            .ok_or_else(|| PayoutError::missing_fee_config(key))
    }
}

/// Fee table backed by a live settings source.
///
/// Readers always see one complete validated snapshot; a reload replaces the
/// snapshot atomically or leaves the previous one in place.
#[derive(Debug)]
pub struct ReloadableFeeTable {
    current: RwLock<Arc<FeeTable>>,
}

impl ReloadableFeeTable {
    pub fn new(table: FeeTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    pub fn snapshot(&self) -> Arc<FeeTable> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reload(&self, rows: impl IntoIterator<Item = FeeConfigRow>) -> Result<(), PayoutError> {
        let table = FeeTable::new(rows)?;
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(table);
        tracing::info!(rows = guard.len(), "fee table reloaded");
        Ok(())
    }
}

impl FeeConfigProvider for ReloadableFeeTable {
    fn resolve(&self, key: &FeeKey) -> Result<FeeConfig, PayoutError> {
        self.snapshot().resolve(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_is_valid() {
        let table = FeeTable::new(DEFAULT_FEE_CONFIG).unwrap();
        assert_eq!(table, FeeTable::defaults());
        assert_eq!(table.len(), DEFAULT_FEE_CONFIG.len());
    }

    #[test]
    fn shorter_card_terms_cost_more() {
        let table = FeeTable::defaults();
        let fees = [2, 7, 15, 30]
            .map(|days| {
                table
                    .resolve(&FeeKey::sale(PaymentMethod::CreditCard, days))
                    .unwrap()
                    .percent_fee
            });
        assert!(fees.windows(2).all(|pair| pair[0] > pair[1]));
    }

    #[test]
    fn unknown_key_fails_loudly() {
        let table = FeeTable::defaults();
        let err = table
            .resolve(&FeeKey::sale(PaymentMethod::CreditCard, 10))
            .unwrap_err();
        assert!(matches!(err, PayoutError::Configuration(_)));
        assert!(err.to_string().contains("(sale, credit_card, 10d)"));
    }

    #[test]
    fn operation_type_is_part_of_the_key() {
        let table = FeeTable::defaults();
        let sale = table.resolve(&FeeKey::sale(PaymentMethod::Pix, 0)).unwrap();
        let withdrawal = table.resolve(&FeeKey::withdrawal()).unwrap();
        assert_ne!(sale, withdrawal);
        assert!(withdrawal.percent_fee.is_zero());
    }

    #[test]
    fn duplicate_rows_are_rejected() {
        let rows = [DEFAULT_FEE_CONFIG[0], DEFAULT_FEE_CONFIG[0]];
        let err = FeeTable::new(rows).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn percentage_withdrawal_rows_are_rejected() {
        let mut withdrawal = DEFAULT_FEE_CONFIG[9];
        withdrawal.config.percent_fee = Rate::from_bps(100).unwrap();
        let err = FeeTable::new([withdrawal]).unwrap_err();
        assert!(err.to_string().contains("must be flat"));
    }

    #[test]
    fn out_of_range_percent_in_source_fails_at_parse_time() {
        let raw = r#"{
            "operation": "sale",
            "method": "pix",
            "settlement_days": 0,
            "percent_fee": 140,
            "fixed_fee": 149
        }"#;
        assert!(serde_json::from_str::<FeeConfigRow>(raw).is_err());
    }

    #[test]
    fn rows_deserialize_from_flat_records() {
        let raw = r#"{
            "operation": "sale",
            "method": "credit_card",
            "settlement_days": 30,
            "percent_fee": 4.99,
            "fixed_fee": 149,
            "acquirer_fee_per_transaction": 50,
            "security_reserve_percent": "5"
        }"#;
        let row: FeeConfigRow = serde_json::from_str(raw).unwrap();
        assert_eq!(row, DEFAULT_FEE_CONFIG[5]);
    }

    #[test]
    fn reload_keeps_previous_snapshot_on_invalid_rows() {
        let reloadable = ReloadableFeeTable::new(FeeTable::defaults());
        let before = reloadable.snapshot();

        let bad = [DEFAULT_FEE_CONFIG[1], DEFAULT_FEE_CONFIG[1]];
        assert!(reloadable.reload(bad).is_err());
        assert_eq!(*reloadable.snapshot(), *before);

        reloadable.reload([DEFAULT_FEE_CONFIG[9]]).unwrap();
        assert_eq!(reloadable.snapshot().len(), 1);
        assert!(reloadable
            .resolve(&FeeKey::sale(PaymentMethod::Pix, 0))
            .is_err());
    }
}
