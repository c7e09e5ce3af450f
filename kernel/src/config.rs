// Store Configuration
//
// Tunables for the durable backend, the read-after-write budget and the
// status TTLs. Loaded from JSON; every field has a default.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consistency::ConsistencyConfig;
use crate::state::expiry::{ExpiryError, ExpiryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed store config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Expiry(#[from] ExpiryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a connection waits on SQLite's write lock.
    pub busy_timeout_ms: u64,
    pub consistency: ConsistencyConfig,
    pub expiry: ExpiryPolicy,
}

impl StoreConfig {
    pub fn production() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            consistency: ConsistencyConfig::production(),
            expiry: ExpiryPolicy::default_policy(),
        }
    }

    /// Short polling, same TTLs.
    pub fn test_profile() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            consistency: ConsistencyConfig::test_profile(),
            expiry: ExpiryPolicy::default_policy(),
        }
    }

    /// Parse and range-check a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.expiry.validate()?;
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::production()
    }
}
