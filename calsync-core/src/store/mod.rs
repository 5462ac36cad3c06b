//! Local persistence contract.
//!
//! The engine consumes a document-style store through this trait; the
//! concrete backing (document database, SQLite, files) is the host
//! application's concern. Two implementations ship with the crate:
//! [`MemoryEventStore`] for tests and [`JsonFileStore`], a small
//! file-backed document store used by the binaries.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryEventStore;

use async_trait::async_trait;

use crate::conflict::Conflict;
use crate::date_range::DateRange;
use crate::error::SyncResult;
use crate::event::Event;
use crate::queue::OfflineQueueItem;
use crate::state::SyncState;

#[async_trait]
pub trait LocalEventStore: Send + Sync {
    async fn get_event(&self, id: &str) -> SyncResult<Option<Event>>;

    /// Insert or replace an event by local id.
    async fn put_event(&self, event: &Event) -> SyncResult<()>;

    async fn delete_event(&self, id: &str) -> SyncResult<()>;

    /// Events in a scope whose start time falls inside the window.
    async fn events_in_range(&self, scope: &str, range: &DateRange) -> SyncResult<Vec<Event>>;

    async fn find_by_remote_id(&self, scope: &str, remote_id: &str) -> SyncResult<Option<Event>>;

    async fn load_sync_state(&self, scope: &str) -> SyncResult<Option<SyncState>>;

    async fn save_sync_state(&self, state: &SyncState) -> SyncResult<()>;

    async fn store_conflict(&self, conflict: &Conflict) -> SyncResult<()>;

    async fn unresolved_conflicts(&self, scope: &str) -> SyncResult<Vec<Conflict>>;

    /// Pending offline mutations for a scope, in enqueue order.
    async fn load_queue(&self, scope: &str) -> SyncResult<Vec<OfflineQueueItem>>;

    /// Replace the persisted queue for a scope.
    async fn save_queue(&self, scope: &str, items: &[OfflineQueueItem]) -> SyncResult<()>;
}
