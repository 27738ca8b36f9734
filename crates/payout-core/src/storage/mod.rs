//! Store backends: an in-process [`MemoryStore`] and a sqlx [`PostgresStore`].

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::PayoutError;
use crate::store::{BankAccountStore, ChallengeStore, JournalStore, PayoutStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persistence backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Keep everything in process memory.
    #[default]
    Memory,
    /// Persist in PostgreSQL; schema is created on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// The store handles the auditor and orchestrator run against.
#[derive(Clone)]
pub struct Stores {
    pub payouts: Arc<dyn PayoutStore>,
    pub bank_accounts: Arc<dyn BankAccountStore>,
    pub challenges: Arc<dyn ChallengeStore>,
    /// Durable journal mirror; `None` keeps the journal in memory only.
    pub journal: Option<Arc<dyn JournalStore>>,
}

impl Stores {
    pub fn memory(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            payouts: store.clone(),
            bank_accounts: store.clone(),
            challenges: store,
            journal: None,
        }
    }

    pub fn postgres(store: PostgresStore) -> Self {
        let store = Arc::new(store);
        Self {
            payouts: store.clone(),
            bank_accounts: store.clone(),
            challenges: store.clone(),
            journal: Some(store),
        }
    }

    pub async fn bootstrap(config: StoreConfig) -> Result<Self, PayoutError> {
        match config {
            StoreConfig::Memory => Ok(Self::memory(MemoryStore::new())),
            StoreConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                tracing::info!(max_connections, "postgres store ready");
                Ok(Self::postgres(store))
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        self.payouts.backend_label()
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores")
            .field("backend", &self.backend_label())
            .field("journal_mirror", &self.journal.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_config_bootstraps_memory_backend() {
        let stores = Stores::bootstrap(StoreConfig::memory()).await.unwrap();
        assert_eq!(stores.backend_label(), "memory");
        assert!(stores.journal.is_none());
    }

    #[test]
    fn config_labels() {
        assert_eq!(StoreConfig::default().label(), "memory");
        assert_eq!(
            StoreConfig::postgres("postgres://localhost/payout", 4).label(),
            "postgres"
        );
    }

    #[test]
    fn config_deserializes_tagged_backend() {
        let config: StoreConfig = serde_json::from_value(serde_json::json!({
            "backend": "postgres",
            "database_url": "postgres://localhost/payout",
            "max_connections": 8
        }))
        .unwrap();
        assert_eq!(config, StoreConfig::postgres("postgres://localhost/payout", 8));
    }
}
