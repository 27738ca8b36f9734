use crate::error::PayoutError;
use crate::store::JournalStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// What a journal entry records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEntryKind {
    FeeCorrection,
    WithdrawalCommitted,
    WithdrawalStatusChanged,
}

impl JournalEntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FeeCorrection => "fee_correction",
            Self::WithdrawalCommitted => "withdrawal_committed",
            Self::WithdrawalStatusChanged => "withdrawal_status_changed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, PayoutError> {
        match value {
            "fee_correction" => Ok(Self::FeeCorrection),
            "withdrawal_committed" => Ok(Self::WithdrawalCommitted),
            "withdrawal_status_changed" => Ok(Self::WithdrawalStatusChanged),
            other => Err(PayoutError::Journal(format!(
                "unknown journal entry kind '{other}'"
            ))),
        }
    }
}

/// Hash-chained journal entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub entry_id: String,
    pub index: u64,
    pub kind: JournalEntryKind,
    /// Transaction or withdrawal id the entry is about.
    pub subject_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Append-only chain of money-moving events. No entry is ever rewritten;
/// a later correction is another entry.
#[derive(Debug, Default, Clone)]
pub struct JournalChain {
    entries: Vec<JournalEntry>,
}

impl JournalChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries, refusing gaps or broken hashes.
    pub fn from_entries(entries: Vec<JournalEntry>) -> Result<Self, PayoutError> {
        let chain = Self { entries };

        for (expected_index, entry) in chain.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(PayoutError::Journal(format!(
                    "journal index gap at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !chain.verify_chain() {
            return Err(PayoutError::Journal(
                "persisted journal hash-chain verification failed".to_string(),
            ));
        }

        Ok(chain)
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Most recent entry of `kind` about `subject_id`.
    pub fn latest_for(&self, kind: JournalEntryKind, subject_id: &str) -> Option<&JournalEntry> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.kind == kind && entry.subject_id == subject_id)
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            if entry.previous_hash != previous_hash {
                return false;
            }
            if entry.entry_hash != entry_hash_of(entry) {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }

    /// Build the next entry without touching the chain.
    pub fn build_entry(
        &self,
        kind: JournalEntryKind,
        subject_id: &str,
        user_id: &str,
        timestamp: DateTime<Utc>,
        payload: Value,
    ) -> JournalEntry {
        let mut entry = JournalEntry {
            entry_id: Uuid::new_v4().to_string(),
            index: self.entries.len() as u64,
            kind,
            subject_id: subject_id.to_string(),
            user_id: user_id.to_string(),
            timestamp,
            payload,
            previous_hash: self.entries.last().map(|entry| entry.entry_hash.clone()),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry_hash_of(&entry);
        entry
    }

    /// Commit a pre-built entry once external durability succeeded.
    pub fn commit_entry(&mut self, entry: JournalEntry) -> Result<(), PayoutError> {
        let expected_index = self.entries.len() as u64;
        if entry.index != expected_index {
            return Err(PayoutError::Journal(format!(
                "commit index mismatch: expected {}, got {}",
                expected_index, entry.index
            )));
        }
        if entry.previous_hash.as_ref() != self.entries.last().map(|e| &e.entry_hash) {
            return Err(PayoutError::Journal(
                "commit previous hash mismatch".to_string(),
            ));
        }
        if entry.entry_hash != entry_hash_of(&entry) {
            return Err(PayoutError::Journal(
                "commit hash mismatch for journal entry".to_string(),
            ));
        }

        self.entries.push(entry);
        Ok(())
    }
}

fn entry_hash_of(entry: &JournalEntry) -> String {
    let material = serde_json::json!({
        "index": entry.index,
        "kind": entry.kind,
        "subject_id": entry.subject_id,
        "user_id": entry.user_id,
        "timestamp": entry.timestamp,
        "payload": entry.payload,
        "previous_hash": entry.previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Shared journal: an in-memory authoritative chain, optionally mirrored to
/// a [`JournalStore`]. Entries are persisted before they join the chain.
pub struct Journal {
    chain: Mutex<JournalChain>,
    sink: Option<Arc<dyn JournalStore>>,
}

impl Journal {
    pub fn in_memory() -> Self {
        Self {
            chain: Mutex::new(JournalChain::new()),
            sink: None,
        }
    }

    /// Hydrate from the sink (if any) and verify the persisted chain.
    pub async fn bootstrap(sink: Option<Arc<dyn JournalStore>>) -> Result<Self, PayoutError> {
        let chain = match &sink {
            Some(sink) => JournalChain::from_entries(sink.load_journal().await?)?,
            None => JournalChain::new(),
        };
        tracing::info!(entries = chain.entries().len(), "journal hydrated");
        Ok(Self {
            chain: Mutex::new(chain),
            sink,
        })
    }

    pub async fn record<P: Serialize>(
        &self,
        kind: JournalEntryKind,
        subject_id: &str,
        user_id: &str,
        timestamp: DateTime<Utc>,
        payload: &P,
    ) -> Result<JournalEntry, PayoutError> {
        let entry = self
            .append(kind, subject_id, user_id, timestamp, payload, |_, _| false)
            .await?;
        entry.ok_or_else(|| PayoutError::Journal("journal append was skipped".to_string()))
    }

    /// Append unless an entry of `kind` already exists for `subject_id`.
    /// Returns `None` when nothing was written.
    pub async fn record_once<P: Serialize>(
        &self,
        kind: JournalEntryKind,
        subject_id: &str,
        user_id: &str,
        timestamp: DateTime<Utc>,
        payload: &P,
    ) -> Result<Option<JournalEntry>, PayoutError> {
        self.append(kind, subject_id, user_id, timestamp, payload, |chain, _| {
            chain.latest_for(kind, subject_id).is_some()
        })
        .await
    }

    /// Append unless the latest entry of `kind` for `subject_id` carries the
    /// same payload, so a retried operation is journaled once.
    pub async fn record_unless_repeated<P: Serialize>(
        &self,
        kind: JournalEntryKind,
        subject_id: &str,
        user_id: &str,
        timestamp: DateTime<Utc>,
        payload: &P,
    ) -> Result<Option<JournalEntry>, PayoutError> {
        self.append(kind, subject_id, user_id, timestamp, payload, |chain, payload| {
            chain
                .latest_for(kind, subject_id)
                .is_some_and(|entry| &entry.payload == payload)
        })
        .await
    }

    async fn append<P: Serialize>(
        &self,
        kind: JournalEntryKind,
        subject_id: &str,
        user_id: &str,
        timestamp: DateTime<Utc>,
        payload: &P,
        skip: impl FnOnce(&JournalChain, &Value) -> bool,
    ) -> Result<Option<JournalEntry>, PayoutError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| PayoutError::Journal(format!("payload serialization failed: {e}")))?;

        let mut chain = self.chain.lock().await;
        if skip(&chain, &payload) {
            tracing::debug!(
                kind = kind.as_str(),
                subject_id,
                "journal entry already present"
            );
            return Ok(None);
        }
        let entry = chain.build_entry(kind, subject_id, user_id, timestamp, payload);
        if let Some(sink) = &self.sink {
            sink.append_journal_entry(&entry).await?;
        }
        chain.commit_entry(entry.clone())?;

        tracing::debug!(
            index = entry.index,
            kind = entry.kind.as_str(),
            subject_id = %entry.subject_id,
            "journal entry appended"
        );
        Ok(Some(entry))
    }

    pub async fn entries(&self) -> Vec<JournalEntry> {
        self.chain.lock().await.entries().to_vec()
    }

    pub async fn verify_chain(&self) -> bool {
        self.chain.lock().await.verify_chain()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("persistent", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain_with_two_entries() -> JournalChain {
        let mut chain = JournalChain::new();
        let first = chain.build_entry(
            JournalEntryKind::FeeCorrection,
            "tx-1",
            "merchant",
            Utc::now(),
            json!({"before": {"net_amount": 9000}, "after": {"net_amount": 9100}}),
        );
        chain.commit_entry(first).unwrap();
        let second = chain.build_entry(
            JournalEntryKind::WithdrawalCommitted,
            "wd-1",
            "merchant",
            Utc::now(),
            json!({"requested_amount": 5000}),
        );
        chain.commit_entry(second).unwrap();
        chain
    }

    #[test]
    fn verifies_hash_chain() {
        let chain = chain_with_two_entries();
        assert!(chain.verify_chain());
        assert_eq!(
            chain.entries()[1].previous_hash.as_deref(),
            Some(chain.entries()[0].entry_hash.as_str())
        );
    }

    #[test]
    fn detects_tampered_entries() {
        let chain = chain_with_two_entries();
        let mut entries = chain.entries().to_vec();
        entries[0].payload = json!({"tampered": true});

        assert!(JournalChain::from_entries(entries).is_err());
    }

    #[test]
    fn rejects_out_of_order_commit() {
        let mut chain = JournalChain::new();
        let stale = chain.build_entry(
            JournalEntryKind::FeeCorrection,
            "tx-1",
            "merchant",
            Utc::now(),
            json!({}),
        );
        let fresh = chain.build_entry(
            JournalEntryKind::FeeCorrection,
            "tx-2",
            "merchant",
            Utc::now(),
            json!({}),
        );
        chain.commit_entry(fresh).unwrap();
        assert!(matches!(
            chain.commit_entry(stale),
            Err(PayoutError::Journal(_))
        ));
    }

    #[test]
    fn kind_string_roundtrip() {
        for kind in [
            JournalEntryKind::FeeCorrection,
            JournalEntryKind::WithdrawalCommitted,
            JournalEntryKind::WithdrawalStatusChanged,
        ] {
            assert_eq!(JournalEntryKind::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[tokio::test]
    async fn shared_journal_records_in_order() {
        let journal = Journal::in_memory();
        journal
            .record(
                JournalEntryKind::WithdrawalCommitted,
                "wd-1",
                "merchant",
                Utc::now(),
                &json!({"requested_amount": 5000}),
            )
            .await
            .unwrap();
        let entry = journal
            .record(
                JournalEntryKind::WithdrawalStatusChanged,
                "wd-1",
                "merchant",
                Utc::now(),
                &json!({"from": "pending", "to": "approved"}),
            )
            .await
            .unwrap();

        assert_eq!(entry.index, 1);
        assert_eq!(journal.entries().await.len(), 2);
        assert!(journal.verify_chain().await);
    }

    #[tokio::test]
    async fn record_once_skips_existing_subject() {
        let journal = Journal::in_memory();
        for requested in [5000, 5000, 7000] {
            journal
                .record_once(
                    JournalEntryKind::WithdrawalCommitted,
                    "wd-1",
                    "merchant",
                    Utc::now(),
                    &json!({ "requested_amount": requested }),
                )
                .await
                .unwrap();
        }
        let entries = journal.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["requested_amount"], 5000);
    }

    #[tokio::test]
    async fn repeated_payload_is_journaled_once() {
        let journal = Journal::in_memory();
        let first = json!({"before": {"net_amount": 9000}, "after": {"net_amount": 9352}});
        let later = json!({"before": {"net_amount": 9100}, "after": {"net_amount": 9352}});

        for payload in [&first, &first, &later, &first] {
            journal
                .record_unless_repeated(
                    JournalEntryKind::FeeCorrection,
                    "tx-1",
                    "merchant",
                    Utc::now(),
                    payload,
                )
                .await
                .unwrap();
        }

        let payloads: Vec<Value> = journal
            .entries()
            .await
            .into_iter()
            .map(|entry| entry.payload)
            .collect();
        assert_eq!(payloads, vec![first.clone(), later, first]);
    }
}
