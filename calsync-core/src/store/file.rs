//! File-backed document store.
//!
//! Each collection lives in one JSON file under the store directory.
//! Writes go through a temp file and rename so a crash mid-write leaves
//! the previous state intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::conflict::Conflict;
use crate::date_range::DateRange;
use crate::error::{SyncError, SyncResult};
use crate::event::Event;
use crate::queue::OfflineQueueItem;
use crate::state::SyncState;
use crate::store::LocalEventStore;

const EVENTS_FILE: &str = "events.json";
const SYNC_STATE_FILE: &str = "sync_state.json";
const CONFLICTS_FILE: &str = "conflicts.json";

#[derive(Default)]
struct FileState {
    events: HashMap<String, Event>,
    sync_states: HashMap<String, SyncState>,
    conflicts: Vec<Conflict>,
    queues: HashMap<String, Vec<OfflineQueueItem>>,
}

pub struct JsonFileStore {
    dir: PathBuf,
    state: Mutex<FileState>,
}

fn read_collection<T: DeserializeOwned + Default>(path: &Path) -> SyncResult<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| SyncError::Serialization(format!("{}: {}", path.display(), e)))
}

fn write_collection<T: Serialize>(path: &Path, value: &T) -> SyncResult<()> {
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| SyncError::Serialization(e.to_string()))?;
    let temp = path.with_extension("json.tmp");
    std::fs::write(&temp, contents)?;
    std::fs::rename(&temp, path)?;
    Ok(())
}

impl JsonFileStore {
    /// Open (or create) a store rooted at `dir`.
    pub fn open(dir: &Path) -> SyncResult<JsonFileStore> {
        std::fs::create_dir_all(dir)?;

        let events: Vec<Event> = read_collection(&dir.join(EVENTS_FILE))?;
        let sync_states: Vec<SyncState> = read_collection(&dir.join(SYNC_STATE_FILE))?;
        let conflicts: Vec<Conflict> = read_collection(&dir.join(CONFLICTS_FILE))?;

        let mut queues = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(scope) = name
                .strip_prefix("queue-")
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                let items: Vec<OfflineQueueItem> = read_collection(&path)?;
                queues.insert(scope.to_string(), items);
            }
        }

        Ok(JsonFileStore {
            dir: dir.to_path_buf(),
            state: Mutex::new(FileState {
                events: events.into_iter().map(|e| (e.id.clone(), e)).collect(),
                sync_states: sync_states
                    .into_iter()
                    .map(|s| (s.scope.clone(), s))
                    .collect(),
                conflicts,
                queues,
            }),
        })
    }

    fn persist_events(&self, state: &FileState) -> SyncResult<()> {
        let mut events: Vec<&Event> = state.events.values().collect();
        events.sort_by(|a, b| a.id.cmp(&b.id));
        write_collection(&self.dir.join(EVENTS_FILE), &events)
    }

    fn persist_sync_states(&self, state: &FileState) -> SyncResult<()> {
        let mut states: Vec<&SyncState> = state.sync_states.values().collect();
        states.sort_by(|a, b| a.scope.cmp(&b.scope));
        write_collection(&self.dir.join(SYNC_STATE_FILE), &states)
    }

    fn persist_conflicts(&self, state: &FileState) -> SyncResult<()> {
        write_collection(&self.dir.join(CONFLICTS_FILE), &state.conflicts)
    }

    fn queue_path(&self, scope: &str) -> PathBuf {
        let slug = scope.replace(['/', '\\', ':'], "_");
        self.dir.join(format!("queue-{}.json", slug))
    }
}

#[async_trait]
impl LocalEventStore for JsonFileStore {
    async fn get_event(&self, id: &str) -> SyncResult<Option<Event>> {
        Ok(self.state.lock().events.get(id).cloned())
    }

    async fn put_event(&self, event: &Event) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.events.insert(event.id.clone(), event.clone());
        self.persist_events(&state)
    }

    async fn delete_event(&self, id: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.events.remove(id);
        self.persist_events(&state)
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

    async fn save_sync_state(&self, sync_state: &SyncState) -> SyncResult<()> {
        let mut state = self.state.lock();
        state
            .sync_states
            .insert(sync_state.scope.clone(), sync_state.clone());
        self.persist_sync_states(&state)
    }

    async fn store_conflict(&self, conflict: &Conflict) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.conflicts.push(conflict.clone());
        self.persist_conflicts(&state)
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
        let mut state = self.state.lock();
        state.queues.insert(scope.to_string(), items.to_vec());
        write_collection(&self.queue_path(scope), &items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_event(scope: &str, title: &str) -> Event {
        let start = Utc.with_ymd_and_hms(2026, 3, 20, 15, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 20, 16, 0, 0).unwrap();
        Event::new_local(scope, title, start, end, start)
    }

    #[tokio::test]
    async fn test_events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let mut event = sample_event("fam-1", "Dentist");
        event.remote_id = Some("r-1".to_string());
        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            store.put_event(&event).await.unwrap();
        }

        let reopened = JsonFileStore::open(dir.path()).unwrap();
        let loaded = reopened.get_event(&event.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Dentist");
        assert_eq!(
            reopened
                .find_by_remote_id("fam-1", "r-1")
                .await
                .unwrap()
                .unwrap()
                .id,
            event.id
        );
    }

    #[tokio::test]
    async fn test_queue_round_trip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        let items: Vec<OfflineQueueItem> = ["a", "b", "c"]
            .iter()
            .map(|name| {
                OfflineQueueItem::create(sample_event("fam-1", name), Utc::now())
            })
            .collect();
        store.save_queue("fam-1", &items).await.unwrap();

        let reopened = JsonFileStore::open(dir.path()).unwrap();
        let loaded = reopened.load_queue("fam-1").await.unwrap();
        let titles: Vec<String> = loaded
            .iter()
            .filter_map(|i| i.payload.as_ref().map(|e| e.title.clone()))
            .collect();
        assert_eq!(titles, vec!["a", "b", "c"]);
    }
}
