//! In-memory fake of the remote provider.
//!
//! Backs the engine tests: events live in a map, every mutation is recorded
//! in a change log so sync tokens behave like the real provider's cursors,
//! and failures can be scripted per operation.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::date_range::DateRange;
use crate::error::{SyncError, SyncResult};
use crate::event::Event;
use crate::remote::{EventPage, RemoteCalendar, RemoteEvent, WatchChannel, WatchRequest};

/// How often each operation was called; used to assert properties such as
/// no-duplication without inspecting provider internals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCallCounts {
    pub lists: usize,
    pub changes: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub watches: usize,
}

#[derive(Default)]
struct RemoteState {
    events: Vec<RemoteEvent>,
    /// (revision, latest payload) per mutation, in order.
    changelog: Vec<(u64, RemoteEvent)>,
    revision: u64,
    next_id: u64,
    fail_insert_titles: Vec<String>,
    fail_watch: bool,
    invalidate_next_sync_token: bool,
    offline: bool,
    counts: RemoteCallCounts,
}

pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> InMemoryRemote {
        InMemoryRemote {
            state: Mutex::new(RemoteState::default()),
        }
    }

    /// Add an event as if it had been created out-of-band on the provider.
    pub fn seed(&self, event: RemoteEvent) {
        let mut state = self.state.lock();
        state.revision += 1;
        let revision = state.revision;
        state.changelog.push((revision, event.clone()));
        state.events.push(event);
    }

    pub fn event(&self, remote_id: &str) -> Option<RemoteEvent> {
        self.state
            .lock()
            .events
            .iter()
            .find(|e| e.id == remote_id)
            .cloned()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn counts(&self) -> RemoteCallCounts {
        self.state.lock().counts
    }

    /// Make `insert_event` fail for events with this title.
    pub fn fail_inserts_titled(&self, title: &str) {
        self.state.lock().fail_insert_titles.push(title.to_string());
    }

    /// Make `watch` fail.
    pub fn fail_watch(&self) {
        self.state.lock().fail_watch = true;
    }

    /// Make the next `changes_since` call report an expired sync token.
    pub fn invalidate_sync_token(&self) {
        self.state.lock().invalidate_next_sync_token = true;
    }

    /// Simulate lost connectivity: every call fails with a network error
    /// until connectivity is restored.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }
}

fn check_online(state: &RemoteState) -> SyncResult<()> {
    if state.offline {
        return Err(SyncError::Network("connection refused".into()));
    }
    Ok(())
}

#[async_trait]
impl RemoteCalendar for InMemoryRemote {
    async fn list_events(&self, range: &DateRange) -> SyncResult<EventPage> {
        let mut state = self.state.lock();
        state.counts.lists += 1;
        check_online(&state)?;

        let mut items: Vec<RemoteEvent> = state
            .events
            .iter()
            .filter(|e| e.start_time.map(|t| range.contains(t)).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by_key(|e| e.start_time);

        Ok(EventPage {
            items,
            next_sync_token: Some(state.revision.to_string()),
        })
    }

    async fn changes_since(&self, sync_token: &str) -> SyncResult<EventPage> {
        let mut state = self.state.lock();
        state.counts.changes += 1;
        check_online(&state)?;

        if state.invalidate_next_sync_token {
            state.invalidate_next_sync_token = false;
            return Err(SyncError::TokenExpired);
        }

        let since: u64 = sync_token
            .parse()
            .map_err(|_| SyncError::TokenExpired)?;

        // Latest payload per id among changes after the cursor.
        let mut items: Vec<RemoteEvent> = Vec::new();
        for (revision, event) in &state.changelog {
            if *revision <= since {
                continue;
            }
            if let Some(existing) = items.iter_mut().find(|e| e.id == event.id) {
                *existing = event.clone();
            } else {
                items.push(event.clone());
            }
        }

        Ok(EventPage {
            items,
            next_sync_token: Some(state.revision.to_string()),
        })
    }

    async fn insert_event(&self, event: &Event) -> SyncResult<RemoteEvent> {
        let mut state = self.state.lock();
        state.counts.inserts += 1;
        check_online(&state)?;

        if state.fail_insert_titles.iter().any(|t| *t == event.title) {
            return Err(SyncError::Server { status: 500 });
        }

        state.next_id += 1;
        let mut remote = RemoteEvent::from_local(event);
        remote.id = format!("remote-{}", state.next_id);
        remote.updated_at = Some(Utc::now());

        state.revision += 1;
        let revision = state.revision;
        state.changelog.push((revision, remote.clone()));
        state.events.push(remote.clone());
        Ok(remote)
    }

    async fn update_event(&self, remote_id: &str, event: &Event) -> SyncResult<RemoteEvent> {
        let mut state = self.state.lock();
        state.counts.updates += 1;
        check_online(&state)?;

        let mut remote = RemoteEvent::from_local(event);
        remote.id = remote_id.to_string();
        remote.updated_at = Some(Utc::now());

        let Some(existing) = state.events.iter_mut().find(|e| e.id == remote_id) else {
            return Err(SyncError::Provider(format!(
                "no such remote event: {remote_id}"
            )));
        };
        *existing = remote.clone();

        state.revision += 1;
        let revision = state.revision;
        state.changelog.push((revision, remote.clone()));
        Ok(remote)
    }

    async fn delete_event(&self, remote_id: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.counts.deletes += 1;
        check_online(&state)?;

        state.events.retain(|e| e.id != remote_id);

        let tombstone = RemoteEvent {
            id: remote_id.to_string(),
            cancelled: true,
            updated_at: Some(Utc::now()),
            ..RemoteEvent::default()
        };
        state.revision += 1;
        let revision = state.revision;
        state.changelog.push((revision, tombstone));
        Ok(())
    }

    async fn watch(&self, request: &WatchRequest) -> SyncResult<WatchChannel> {
        let mut state = self.state.lock();
        state.counts.watches += 1;
        check_online(&state)?;

        if state.fail_watch {
            return Err(SyncError::Provider("push notifications unsupported".into()));
        }

        Ok(WatchChannel {
            id: request.id.clone(),
            resource_id: Some(format!("resource-{}", request.id)),
            expiration: request.expiration,
        })
    }
}
