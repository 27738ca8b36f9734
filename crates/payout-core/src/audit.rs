//! Reconciliation of persisted fee fields against a fresh recomputation.
//!
//! Only approved and retained transactions are audited; they are the only
//! ones that contribute fees and net amount to a balance. Comparison is exact
//! to the minor unit, and recomputation shares the calculator's rounding mode.

use crate::clock::Clock;
use crate::error::PayoutError;
use crate::fees::{FeeBreakdown, FeeCalculator};
use crate::journal::{Journal, JournalEntryKind};
use crate::locks::KeyedLocks;
use crate::money::Money;
use crate::store::{with_timeout, PayoutStore};
use crate::types::{FeeFields, Transaction, TransactionStatus};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// Stored fields match the recomputation.
    Correct,
    /// Stored fields match because the auditor rewrote them.
    Corrected,
    /// At least one field differs, or the recomputation failed.
    Divergent,
}

/// One of the four persisted fee fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FeeField {
    #[serde(rename = "platformFee")]
    PlatformFee,
    #[serde(rename = "acquirerFee")]
    AcquirerFee,
    #[serde(rename = "commissionAmount")]
    CommissionAmount,
    #[serde(rename = "netAmount")]
    NetAmount,
}

impl FeeField {
    pub const ALL: [FeeField; 4] = [
        Self::PlatformFee,
        Self::AcquirerFee,
        Self::CommissionAmount,
        Self::NetAmount,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::PlatformFee => "platformFee",
            Self::AcquirerFee => "acquirerFee",
            Self::CommissionAmount => "commissionAmount",
            Self::NetAmount => "netAmount",
        }
    }

    fn read(self, fees: &FeeFields) -> Money {
        match self {
            Self::PlatformFee => fees.platform_fee,
            Self::AcquirerFee => fees.acquirer_fee,
            Self::CommissionAmount => fees.commission_amount,
            Self::NetAmount => fees.net_amount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub field: FeeField,
    pub stored: Money,
    pub computed: Money,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: stored={}, computed={}",
            self.field.name(),
            self.stored,
            self.computed
        )
    }
}

/// Field-by-field comparison in [`FeeField::ALL`] order.
pub fn compare_fee_fields(stored: &FeeFields, computed: &FeeFields) -> Vec<Divergence> {
    FeeField::ALL
        .into_iter()
        .filter_map(|field| {
            let (stored, computed) = (field.read(stored), field.read(computed));
            (stored != computed).then_some(Divergence {
                field,
                stored,
                computed,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditResult {
    pub transaction_id: String,
    pub status: AuditStatus,
    pub breakdown: Option<FeeBreakdown>,
    pub divergences: Vec<Divergence>,
    /// Why no breakdown could be computed (missing configuration, bad data).
    pub error: Option<String>,
}

impl AuditResult {
    /// Divergences rendered as `"field: stored=x, computed=y"`.
    pub fn descriptions(&self) -> Vec<String> {
        self.divergences.iter().map(ToString::to_string).collect()
    }
}

/// Totals over every audited transaction. Fee totals use recomputed values;
/// transactions without a breakdown contribute only their gross amount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub transaction_count: usize,
    pub total_gross: Money,
    pub total_platform_fee: Money,
    pub total_acquirer_fee: Money,
    pub total_commission: Money,
    pub total_net: Money,
    pub total_in_retention: Money,
    pub correct: usize,
    pub corrected: usize,
    pub divergent: usize,
    /// Divergent because no breakdown could be computed.
    pub unresolved: usize,
}

impl AuditSummary {
    fn absorb(&mut self, transaction: &Transaction, result: &AuditResult) {
        self.transaction_count += 1;
        self.total_gross = self.total_gross + transaction.gross_amount;
        if let Some(breakdown) = &result.breakdown {
            self.total_platform_fee = self.total_platform_fee + breakdown.platform_fee();
            self.total_acquirer_fee = self.total_acquirer_fee + breakdown.acquirer_fee();
            self.total_commission = self.total_commission + breakdown.affiliate_commission();
            self.total_net = self.total_net + breakdown.net_amount();
            self.total_in_retention = self.total_in_retention + breakdown.amount_in_retention();
        }
        match result.status {
            AuditStatus::Correct => self.correct += 1,
            AuditStatus::Corrected => self.corrected += 1,
            AuditStatus::Divergent => self.divergent += 1,
        }
        if result.error.is_some() {
            self.unresolved += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub user_id: String,
    pub results: Vec<AuditResult>,
    pub summary: AuditSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CorrectionOutcome {
    Applied { before: FeeFields, after: FeeFields },
    /// Stored fields already matched; nothing was written.
    AlreadyCorrect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrectionFailure {
    pub transaction_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchCorrection {
    pub corrected: usize,
    pub errors: usize,
    pub failures: Vec<CorrectionFailure>,
}

/// Re-derives fee breakdowns for stored transactions and repairs drift.
pub struct Auditor {
    payouts: Arc<dyn PayoutStore>,
    calculator: FeeCalculator,
    journal: Arc<Journal>,
    clock: Arc<dyn Clock>,
    batch_guards: KeyedLocks,
    store_timeout: Duration,
}

impl Auditor {
    pub fn new(
        payouts: Arc<dyn PayoutStore>,
        calculator: FeeCalculator,
        journal: Arc<Journal>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            payouts,
            calculator,
            journal,
            clock,
            batch_guards: KeyedLocks::new(),
            store_timeout,
        }
    }

    /// Audit every approved/retained transaction of a user.
    pub async fn audit_user_transactions(&self, user_id: &str) -> Result<AuditReport, PayoutError> {
        let transactions = with_timeout(
            self.store_timeout,
            "transactions_for_user",
            self.payouts
                .transactions_for_user(user_id, &TransactionStatus::CONTRIBUTING),
        )
        .await?;

        let mut summary = AuditSummary::default();
        let mut results = Vec::with_capacity(transactions.len());
        for transaction in &transactions {
            let result = self.audit_transaction(transaction);
            summary.absorb(transaction, &result);
            results.push(result);
        }

        tracing::info!(
            user_id,
            audited = summary.transaction_count,
            correct = summary.correct,
            corrected = summary.corrected,
            divergent = summary.divergent,
            "fee audit finished"
        );

        Ok(AuditReport {
            user_id: user_id.to_string(),
            results,
            summary,
        })
    }

    /// Classify one transaction. Never fails: recomputation errors become a
    /// divergent result carrying the diagnostic.
    pub fn audit_transaction(&self, transaction: &Transaction) -> AuditResult {
        let breakdown = match self.recompute(transaction) {
            Ok(breakdown) => breakdown,
            Err(err) => {
                tracing::debug!(
                    transaction_id = %transaction.id,
                    error = %err,
                    "fee audit could not recompute"
                );
                return AuditResult {
                    transaction_id: transaction.id.clone(),
                    status: AuditStatus::Divergent,
                    breakdown: None,
                    divergences: Vec::new(),
                    error: Some(err.to_string()),
                };
            }
        };

        let divergences = compare_fee_fields(&transaction.fees, &FeeFields::from(&breakdown));
        let status = match (divergences.is_empty(), transaction.fees_corrected_at) {
            (false, _) => AuditStatus::Divergent,
            (true, Some(_)) => AuditStatus::Corrected,
            (true, None) => AuditStatus::Correct,
        };
        tracing::debug!(
            transaction_id = %transaction.id,
            status = ?status,
            divergences = divergences.len(),
            "fee audit classified"
        );

        AuditResult {
            transaction_id: transaction.id.clone(),
            status,
            breakdown: Some(breakdown),
            divergences,
            error: None,
        }
    }

    /// Overwrite the stored fee fields with the recomputed ones.
    ///
    /// Applying a correction twice is a no-op the second time.
    pub async fn apply_correction(
        &self,
        transaction_id: &str,
    ) -> Result<CorrectionOutcome, PayoutError> {
        let transaction = with_timeout(
            self.store_timeout,
            "transaction",
            self.payouts.transaction(transaction_id),
        )
        .await?
        .ok_or_else(|| PayoutError::NotFound(format!("transaction '{transaction_id}'")))?;

        if !transaction.status.contributes() {
            return Err(PayoutError::InvalidInput(format!(
                "transaction '{transaction_id}' is {} and is not audited",
                transaction.status.as_str()
            )));
        }

        let after = FeeFields::from(&self.recompute(&transaction)?);
        let before = transaction.fees;
        if before == after {
            return Ok(CorrectionOutcome::AlreadyCorrect);
        }

        // Journal before writing: a failed write leaves the entry behind and
        // the retry, carrying the same payload, does not append it again.
        let corrected_at = self.clock.now();
        self.journal
            .record_unless_repeated(
                JournalEntryKind::FeeCorrection,
                transaction_id,
                &transaction.user_id,
                corrected_at,
                &serde_json::json!({
                    "before": before,
                    "after": after,
                    "divergences": compare_fee_fields(&before, &after)
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>(),
                }),
            )
            .await?;

        with_timeout(
            self.store_timeout,
            "update_fee_fields",
            self.payouts
                .update_fee_fields(transaction_id, &after, corrected_at),
        )
        .await?;

        tracing::info!(
            transaction_id,
            user_id = %transaction.user_id,
            "fee fields corrected"
        );
        Ok(CorrectionOutcome::Applied { before, after })
    }

    /// Correct every divergent transaction of a user, continuing past
    /// failures. A second concurrent pass for the same user is refused.
    pub async fn correct_all_divergent(&self, user_id: &str) -> Result<BatchCorrection, PayoutError> {
        let _guard = self
            .batch_guards
            .try_lock(user_id)
            .ok_or_else(|| PayoutError::AuditInProgress(user_id.to_string()))?;

        let report = self.audit_user_transactions(user_id).await?;
        let mut batch = BatchCorrection::default();
        for result in report
            .results
            .iter()
            .filter(|result| result.status == AuditStatus::Divergent)
        {
            match self.apply_correction(&result.transaction_id).await {
                Ok(CorrectionOutcome::Applied { .. }) => batch.corrected += 1,
                Ok(CorrectionOutcome::AlreadyCorrect) => {}
                Err(err) => {
                    tracing::warn!(
                        user_id,
                        transaction_id = %result.transaction_id,
                        error = %err,
                        "fee correction failed"
                    );
                    batch.errors += 1;
                    batch.failures.push(CorrectionFailure {
                        transaction_id: result.transaction_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            user_id,
            corrected = batch.corrected,
            errors = batch.errors,
            "batch fee correction finished"
        );
        Ok(batch)
    }

    fn recompute(&self, transaction: &Transaction) -> Result<FeeBreakdown, PayoutError> {
        self.calculator.compute_sale_fee(
            transaction.gross_amount,
            transaction.payment_method,
            transaction.settlement_days,
            transaction.affiliate_commission_percent,
        )
    }
}
