use crate::error::PayoutError;
use crate::fees::config::{FeeConfig, FeeConfigProvider, FeeKey, OperationType, PaymentMethod};
use crate::money::{Money, Rate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Full fee breakdown for one charge. Built only by [`FeeCalculator`], so
/// `net = gross - platform - acquirer - affiliate` and `net >= 0` always hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeBreakdown {
    operation: OperationType,
    gross_amount: Money,
    platform_fee: Money,
    platform_fee_percent: Rate,
    acquirer_fee: Money,
    affiliate_commission: Money,
    affiliate_commission_percent: Rate,
    net_amount: Money,
    amount_in_retention: Money,
    security_reserve_percent: Rate,
    release_after_days: u16,
}

impl FeeBreakdown {
    pub fn operation(&self) -> OperationType {
        self.operation
    }

    pub fn gross_amount(&self) -> Money {
        self.gross_amount
    }

    pub fn platform_fee(&self) -> Money {
        self.platform_fee
    }

    pub fn platform_fee_percent(&self) -> Rate {
        self.platform_fee_percent
    }

    pub fn acquirer_fee(&self) -> Money {
        self.acquirer_fee
    }

    pub fn affiliate_commission(&self) -> Money {
        self.affiliate_commission
    }

    pub fn affiliate_commission_percent(&self) -> Rate {
        self.affiliate_commission_percent
    }

    pub fn net_amount(&self) -> Money {
        self.net_amount
    }

    /// Portion of the net withheld as security reserve. Reported only; it is
    /// not subtracted from `net_amount`.
    pub fn amount_in_retention(&self) -> Money {
        self.amount_in_retention
    }

    pub fn security_reserve_percent(&self) -> Rate {
        self.security_reserve_percent
    }

    pub fn release_after_days(&self) -> u16 {
        self.release_after_days
    }
}

/// Flat withdrawal fee and the amount actually paid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalFee {
    pub requested_amount: Money,
    pub fee: Money,
    pub net_amount: Money,
}

/// Pure fee computations over an injected configuration provider.
#[derive(Clone)]
pub struct FeeCalculator {
    provider: Arc<dyn FeeConfigProvider>,
}

impl FeeCalculator {
    pub fn new(provider: Arc<dyn FeeConfigProvider>) -> Self {
        Self { provider }
    }

    /// Fee breakdown for a checkout sale.
    ///
    /// `settlement_days` selects the credit-card tier. An affiliate rate of
    /// `None` means no affiliate is attached.
    pub fn compute_sale_fee(
        &self,
        gross_amount: Money,
        method: PaymentMethod,
        settlement_days: u16,
        affiliate_commission_percent: Option<Rate>,
    ) -> Result<FeeBreakdown, PayoutError> {
        let key = FeeKey::sale(method, settlement_days);
        let config = self.provider.resolve(&key)?;
        breakdown(
            OperationType::Sale,
            gross_amount,
            &config,
            affiliate_commission_percent.unwrap_or(Rate::ZERO),
            settlement_days,
        )
    }

    /// Fee breakdown for a recurring subscription charge. Subscriptions carry
    /// no affiliate commission and settle on the method's standard term.
    pub fn compute_subscription_fee(
        &self,
        gross_amount: Money,
        method: PaymentMethod,
    ) -> Result<FeeBreakdown, PayoutError> {
        let key = FeeKey::subscription(method);
        let config = self.provider.resolve(&key)?;
        breakdown(
            OperationType::Subscription,
            gross_amount,
            &config,
            Rate::ZERO,
            key.settlement_days,
        )
    }

    /// Flat payout fee. Resolved from the withdrawal row only; sale rates
    /// never enter this computation.
    pub fn compute_withdrawal_fee(
        &self,
        requested_amount: Money,
    ) -> Result<WithdrawalFee, PayoutError> {
        ensure_non_negative("requested amount", requested_amount)?;
        let config = self.provider.resolve(&FeeKey::withdrawal())?;
        let fee = total_fee(&[config.percent_fee.apply(requested_amount), config.fixed_fee])?;
        let net_amount = net_or_fail(requested_amount, fee)?;

        Ok(WithdrawalFee {
            requested_amount,
            fee,
            net_amount,
        })
    }
}

fn breakdown(
    operation: OperationType,
    gross_amount: Money,
    config: &FeeConfig,
    affiliate_commission_percent: Rate,
    release_after_days: u16,
) -> Result<FeeBreakdown, PayoutError> {
    ensure_non_negative("gross amount", gross_amount)?;

    let platform_fee = total_fee(&[config.percent_fee.apply(gross_amount), config.fixed_fee])?;
    let acquirer_fee = config.acquirer_fee_per_transaction;
    let affiliate_commission = affiliate_commission_percent.apply(gross_amount);
    let deductions = total_fee(&[platform_fee, acquirer_fee, affiliate_commission])?;
    let net_amount = net_or_fail(gross_amount, deductions)?;
    let amount_in_retention = config.security_reserve_percent.apply(gross_amount);

    tracing::trace!(
        operation = operation.as_str(),
        gross = gross_amount.minor(),
        platform = platform_fee.minor(),
        acquirer = acquirer_fee.minor(),
        affiliate = affiliate_commission.minor(),
        net = net_amount.minor(),
        "fee breakdown computed"
    );

    Ok(FeeBreakdown {
        operation,
        gross_amount,
        platform_fee,
        platform_fee_percent: config.percent_fee,
        acquirer_fee,
        affiliate_commission,
        affiliate_commission_percent,
        net_amount,
        amount_in_retention,
        security_reserve_percent: config.security_reserve_percent,
        release_after_days,
    })
}

fn ensure_non_negative(label: &str, amount: Money) -> Result<(), PayoutError> {
    if amount.is_negative() {
        return Err(PayoutError::InvalidInput(format!(
            "{label} must not be negative (got {amount})"
        )));
    }
    Ok(())
}

/// Sum fee parts, refusing a total that does not fit in minor units.
fn total_fee(parts: &[Money]) -> Result<Money, PayoutError> {
    parts
        .iter()
        .try_fold(Money::ZERO, |total, part| total.checked_add(*part))
        .ok_or_else(|| {
            PayoutError::Configuration("fee components overflow the money range".to_string())
        })
}

fn net_or_fail(gross: Money, deductions: Money) -> Result<Money, PayoutError> {
    match gross.checked_sub(deductions) {
        Some(net) if !net.is_negative() => Ok(net),
        _ => Err(PayoutError::NegativeNetAmount { gross, deductions }),
    }
}
