//! Per-scope sync state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sync bookkeeping for one scope. Created on first sync, updated after
/// every successful full or incremental sync, never deleted while the
/// scope is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub scope: String,
    /// Opaque provider-issued cursor for incremental fetches.
    pub last_sync_token: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub webhook_channel_id: Option<String>,
    pub webhook_expiry: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(scope: &str) -> SyncState {
        SyncState {
            scope: scope.to_string(),
            last_sync_token: None,
            last_sync_at: None,
            webhook_channel_id: None,
            webhook_expiry: None,
        }
    }
}
