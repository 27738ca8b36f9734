use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use payout_core::{
    AuditStatus, Auditor, BankAccount, BankAccountStatus, FeeCalculator, FeeTable, Journal,
    JournalEntryKind, ManualClock, MemoryStore, Money, PasscodeChannel, PasscodePurpose,
    PaymentMethod, PayoutError, PayoutStore, Stores, Transaction, TransactionStatus,
    WithdrawalOrchestrator, WithdrawalPolicy, WithdrawalStatus,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct StaticCodeChannel;

#[async_trait]
impl PasscodeChannel for StaticCodeChannel {
    fn channel_name(&self) -> &'static str {
        "static"
    }

    async fn send(
        &self,
        destination: &str,
        _purpose: PasscodePurpose,
    ) -> Result<String, PayoutError> {
        Ok(format!("challenge-{destination}-{}", uuid::Uuid::new_v4()))
    }

    async fn verify(&self, _challenge_id: &str, code: &str) -> Result<bool, PayoutError> {
        Ok(code == "135790")
    }
}

#[tokio::test]
async fn drifted_fees_are_repaired_before_a_withdrawal_is_paid_out() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).unwrap(),
    ));
    let calculator = FeeCalculator::new(Arc::new(FeeTable::defaults()));
    let store = MemoryStore::new();
    let journal = Arc::new(Journal::in_memory());

    let pix = calculator
        .compute_sale_fee(Money::from_minor(10_000), PaymentMethod::Pix, 0, None)
        .unwrap();
    let card = calculator
        .compute_sale_fee(
            Money::from_minor(10_000),
            PaymentMethod::CreditCard,
            30,
            Some("10".parse().unwrap()),
        )
        .unwrap();
    assert_eq!(card.net_amount().minor(), 8_302);

    let mut drifted = Transaction::from_breakdown(
        "merchant",
        PaymentMethod::Pix,
        0,
        None,
        TransactionStatus::Approved,
        &pix,
    );
    drifted.fees.net_amount = Money::from_minor(9_000);
    let drifted_id = drifted.id.clone();
    store.insert_transaction(drifted).await;
    store
        .insert_transaction(Transaction::from_breakdown(
            "merchant",
            PaymentMethod::CreditCard,
            30,
            Some("10".parse().unwrap()),
            TransactionStatus::Retained,
            &card,
        ))
        .await;
    store
        .upsert_bank_account(BankAccount {
            id: "acct-77".to_string(),
            user_id: "merchant".to_string(),
            status: BankAccountStatus::Approved,
        })
        .await;

    let auditor = Auditor::new(
        Arc::new(store.clone()),
        calculator.clone(),
        journal.clone(),
        clock.clone(),
        Duration::from_secs(1),
    );
    let orchestrator = WithdrawalOrchestrator::new(
        Stores::memory(store.clone()),
        calculator,
        Arc::new(StaticCodeChannel),
        journal.clone(),
        clock.clone(),
        WithdrawalPolicy::default(),
    )
    .unwrap();

    assert_eq!(
        orchestrator.available_balance("merchant").await.unwrap().minor(),
        17_302
    );

    let report = auditor.audit_user_transactions("merchant").await.unwrap();
    assert_eq!(report.summary.divergent, 1);
    assert_eq!(report.summary.total_net.minor(), 9_352 + 8_302);
    let divergent = report
        .results
        .iter()
        .find(|result| result.status == AuditStatus::Divergent)
        .unwrap();
    assert_eq!(divergent.transaction_id, drifted_id);
    assert_eq!(
        divergent.descriptions(),
        vec!["netAmount: stored=9000, computed=9352".to_string()]
    );

    let batch = auditor.correct_all_divergent("merchant").await.unwrap();
    assert_eq!(batch.corrected, 1);
    assert_eq!(batch.errors, 0);
    assert_eq!(
        orchestrator.available_balance("merchant").await.unwrap().minor(),
        17_654
    );

    let challenge = orchestrator
        .request_withdrawal("merchant", Money::from_minor(5_000), "acct-77")
        .await
        .unwrap();
    assert_eq!(challenge.available_balance.minor(), 17_654);

    let withdrawal = orchestrator
        .confirm_withdrawal("merchant", "135790")
        .await
        .unwrap();
    assert_eq!(withdrawal.fee.minor(), 490);
    assert_eq!(withdrawal.net_amount.minor(), 4_510);

    orchestrator
        .transition_withdrawal(&withdrawal.id, WithdrawalStatus::Approved)
        .await
        .unwrap();
    assert_eq!(
        orchestrator.available_balance("merchant").await.unwrap().minor(),
        12_654
    );
    assert_eq!(store.withdrawals_for_user("merchant").await.unwrap().len(), 1);

    let kinds: Vec<_> = journal.entries().await.iter().map(|entry| entry.kind).collect();
    assert_eq!(
        kinds,
        vec![
            JournalEntryKind::FeeCorrection,
            JournalEntryKind::WithdrawalCommitted,
            JournalEntryKind::WithdrawalStatusChanged,
        ]
    );
    assert!(journal.verify_chain().await);

    let report = auditor.audit_user_transactions("merchant").await.unwrap();
    assert_eq!(report.summary.corrected, 1);
    assert_eq!(report.summary.correct, 1);
}
