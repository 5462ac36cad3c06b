//! In-memory store used by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::conflict::Conflict;
use crate::date_range::DateRange;
use crate::error::SyncResult;
use crate::event::Event;
use crate::queue::OfflineQueueItem;
use crate::state::SyncState;
use crate::store::LocalEventStore;

#[derive(Default)]
struct MemoryState {
    events: HashMap<String, Event>,
    sync_states: HashMap<String, SyncState>,
    conflicts: Vec<Conflict>,
    queues: HashMap<String, Vec<OfflineQueueItem>>,
}

#[derive(Default)]
pub struct MemoryEventStore {
    state: Mutex<MemoryState>,
}

impl MemoryEventStore {
    pub fn new() -> MemoryEventStore {
        MemoryEventStore::default()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().events.len()
    }
}

#[async_trait]
impl LocalEventStore for MemoryEventStore {
    async fn get_event(&self, id: &str) -> SyncResult<Option<Event>> {
        Ok(self.state.lock().events.get(id).cloned())
    }

    async fn put_event(&self, event: &Event) -> SyncResult<()> {
        self.state
            .lock()
            .events
            .insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn delete_event(&self, id: &str) -> SyncResult<()> {
        self.state.lock().events.remove(id);
        Ok(())
    }

    async fn events_in_range(&self, scope: &str, range: &DateRange) -> SyncResult<Vec<Event>> {
        let mut events: Vec<Event> = self
            .state
            .lock()
            .events
            .values()
            .filter(|e| e.scope == scope && range.contains(e.start_time))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.start_time);
        Ok(events)
    }

    async fn find_by_remote_id(&self, scope: &str, remote_id: &str) -> SyncResult<Option<Event>> {
        Ok(self
            .state
            .lock()
            .events
            .values()
            .find(|e| e.scope == scope && e.remote_id.as_deref() == Some(remote_id))
            .cloned())
    }

    async fn load_sync_state(&self, scope: &str) -> SyncResult<Option<SyncState>> {
        Ok(self.state.lock().sync_states.get(scope).cloned())
    }

    async fn save_sync_state(&self, state: &SyncState) -> SyncResult<()> {
        self.state
            .lock()
            .sync_states
            .insert(state.scope.clone(), state.clone());
        Ok(())
    }

    async fn store_conflict(&self, conflict: &Conflict) -> SyncResult<()> {
        self.state.lock().conflicts.push(conflict.clone());
        Ok(())
    }

    async fn unresolved_conflicts(&self, scope: &str) -> SyncResult<Vec<Conflict>> {
        Ok(self
            .state
            .lock()
            .conflicts
            .iter()
            .filter(|c| c.scope == scope && !c.resolved)
            .cloned()
            .collect())
    }

    async fn load_queue(&self, scope: &str) -> SyncResult<Vec<OfflineQueueItem>> {
        Ok(self
            .state
            .lock()
            .queues
            .get(scope)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_queue(&self, scope: &str, items: &[OfflineQueueItem]) -> SyncResult<()> {
        self.state
            .lock()
            .queues
            .insert(scope.to_string(), items.to_vec());
        Ok(())
    }
}
