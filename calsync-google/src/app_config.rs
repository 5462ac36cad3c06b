//! Installation configuration for the calsync binaries.
//!
//! Lives at `<config dir>/calsync/config.toml`. OAuth client credentials
//! are required; everything else has a sensible default.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use calsync_core::{SyncConfig, SyncError, SyncResult};

pub fn base_dir() -> SyncResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| SyncError::Store("could not determine config directory".into()))?;
    Ok(config_dir.join("calsync"))
}

fn default_scope() -> String {
    "default".to_string()
}

fn default_calendar_id() -> String {
    "primary".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Account key for token storage; usually the Google account email
    /// printed by `calsync-cli auth`.
    #[serde(default = "default_scope")]
    pub owner_id: String,
    /// Sync scope this installation serves.
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
    /// Where the local document store lives; defaults to `<base>/store`.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    /// Engine tuning; every field has a default.
    #[serde(default)]
    pub sync: SyncConfig,
}

impl AppConfig {
    pub fn load() -> SyncResult<AppConfig> {
        Self::load_from(&base_dir()?.join("config.toml"))
    }

    pub fn load_from(path: &Path) -> SyncResult<AppConfig> {
        if !path.exists() {
            return Err(SyncError::Store(format!(
                "no config at {} — create it with your OAuth client_id/client_secret",
                path.display()
            )));
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| SyncError::Serialization(format!("{}: {}", path.display(), e)))
    }

    pub fn store_dir(&self) -> SyncResult<PathBuf> {
        match &self.store_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(base_dir()?.join("store")),
        }
    }

    pub fn token_cache_dir(&self) -> SyncResult<PathBuf> {
        Ok(base_dir()?.join("session"))
    }

    pub fn durable_token_dir(&self) -> SyncResult<PathBuf> {
        Ok(base_dir()?.join("tokens"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            client_id = "id.apps.googleusercontent.com"
            client_secret = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.scope, "default");
        assert_eq!(config.calendar_id, "primary");
        assert_eq!(config.sync.max_retries, 3);
    }

    #[test]
    fn test_sync_overrides_apply() {
        let config: AppConfig = toml::from_str(
            r#"
            client_id = "id"
            client_secret = "secret"
            scope = "family-rivera"

            [sync]
            sync_interval_secs = 300
            conflict_strategy = "local-wins"
            "#,
        )
        .unwrap();
        assert_eq!(config.scope, "family-rivera");
        assert_eq!(config.sync.sync_interval_secs, 300);
    }
}
