use crate::ServiceError;
use payout_core::{FeeConfigRow, FeeTable, StoreConfig, WithdrawalPolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Environment variables with this prefix override file settings, e.g.
/// `PAYOUT__WITHDRAWAL__COOLDOWN_MINUTES=30`.
pub const ENV_PREFIX: &str = "PAYOUT";
pub const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    pub storage: StoreConfig,
    pub withdrawal: WithdrawalPolicy,
    /// Fee rows replacing the built-in table. Empty keeps the defaults.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fee_table: Vec<FeeConfigRow>,
    /// Use the development passcode channel, which logs codes instead of
    /// delivering them. Without it the service has no channel and refuses
    /// to start.
    pub dev_passcodes: bool,
    /// Secret the development passcode channel derives codes from.
    pub passcode_secret: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8092)),
            storage: StoreConfig::Memory,
            withdrawal: WithdrawalPolicy::default(),
            fee_table: Vec::new(),
            dev_passcodes: false,
            passcode_secret: "payout-dev-secret".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Layer defaults, the optional file, then `PAYOUT__*` environment
    /// variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ServiceError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.withdrawal.validate()?;
        Ok(config)
    }

    /// The configured fee table, or the built-in one when none is set.
    pub fn fee_table(&self) -> Result<FeeTable, ServiceError> {
        if self.fee_table.is_empty() {
            return Ok(FeeTable::defaults());
        }
        Ok(FeeTable::new(self.fee_table.iter().copied())?)
    }
}
