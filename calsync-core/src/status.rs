//! Sync status reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Snapshot of the engine's sync health, emitted to subscribers on change.
///
/// Background failures land in `last_error` instead of being thrown into
/// timer tasks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    /// Whether a usable credential is present.
    pub connected: bool,
    /// Whether a full or incremental sync is currently running.
    pub syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Events created/updated by the most recent sync.
    pub events_synced: usize,
    /// Mutations waiting in the offline queue.
    pub pending_changes: usize,
}
