//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::conflict::ConflictStrategy;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Events requested per provider page.
    pub max_results: u32,
    /// Interval between periodic incremental syncs.
    pub sync_interval_secs: u64,
    /// Renew a webhook channel this long before it expires.
    pub webhook_renewal_buffer_secs: u64,
    /// Updates this close together are treated as concurrent.
    pub conflict_window_minutes: i64,
    /// Attempts per remote call before surfacing the last error.
    pub max_retries: u32,
    /// Base delay for linear backoff on 5xx responses.
    pub retry_delay_ms: u64,
    pub conflict_strategy: ConflictStrategy,
    /// Public base URL the provider posts webhook notifications to.
    /// Unset means push notifications are unavailable and the engine
    /// stays on polling.
    pub webhook_base_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_results: 2500,
            sync_interval_secs: 60,
            webhook_renewal_buffer_secs: 3600,
            conflict_window_minutes: 5,
            max_retries: 3,
            retry_delay_ms: 1000,
            conflict_strategy: ConflictStrategy::Smart,
            webhook_base_url: None,
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> SyncResult<SyncConfig> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| SyncError::Serialization(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 1000);
        assert_eq!(config.conflict_window_minutes, 5);
        assert_eq!(config.conflict_strategy, ConflictStrategy::Smart);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let parsed: SyncConfig = toml::from_str("sync_interval_secs = 120").unwrap();
        assert_eq!(parsed.sync_interval_secs, 120);
        assert_eq!(parsed.max_results, 2500);
    }
}
