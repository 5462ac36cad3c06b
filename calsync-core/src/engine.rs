//! Sync orchestration.
//!
//! `SyncEngine` composes the store, the remote client, the conflict
//! resolver, the offline queue and the webhook manager, and exposes the
//! CRUD + sync API the rest of the application consumes. One engine
//! instance serves one sync scope, bound by `initialize`; nothing is
//! process-global, so tests run isolated engines side by side.
//!
//! A single-flight guard keeps at most one full or incremental sync
//! running per engine. A request arriving while one is active is rejected
//! with `AlreadyRunning` rather than queued — callers retry on the next
//! tick, which bounds the backlog.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Subscription};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::conflict::{Conflict, ConflictResolver, Resolution};
use crate::date_range::DateRange;
use crate::error::{SyncError, SyncResult};
use crate::event::{Event, EventStatus};
use crate::queue::{OfflineQueue, OfflineQueueItem, QueueOutcome};
use crate::remote::RemoteCalendar;
use crate::state::SyncState;
use crate::status::SyncStatus;
use crate::store::LocalEventStore;
use crate::webhook::WebhookManager;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Window to reconcile; defaults to 90 days back, one year ahead.
    pub range: Option<DateRange>,
    /// Also push local changes out, not just pull remote ones in.
    pub bidirectional: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            range: None,
            bidirectional: true,
        }
    }
}

/// Remote → local counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub conflicts: usize,
    pub errors: usize,
}

/// Local → remote counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushCounts {
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
}

/// Aggregate result of one sync run. Per-event failures are counted here
/// instead of aborting the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub from_remote: PullCounts,
    pub to_remote: PushCounts,
}

impl SyncReport {
    pub fn events_synced(&self) -> usize {
        self.from_remote.created
            + self.from_remote.updated
            + self.to_remote.created
            + self.to_remote.updated
    }

    /// True when the run changed nothing on either side.
    pub fn is_noop(&self) -> bool {
        self.events_synced() == 0 && self.from_remote.deleted == 0
    }
}

struct Bound {
    scope: String,
    queue: Arc<OfflineQueue>,
}

pub struct SyncEngine {
    store: Arc<dyn LocalEventStore>,
    remote: Arc<dyn RemoteCalendar>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    resolver: ConflictResolver,
    webhooks: Arc<WebhookManager>,
    bound: Mutex<Option<Bound>>,
    status: Mutex<SyncStatus>,
    status_bus: Bus<SyncStatus>,
    sync_in_progress: AtomicBool,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

/// RAII release of the single-flight flag.
struct SyncSlot<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncSlot<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LocalEventStore>,
        remote: Arc<dyn RemoteCalendar>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Arc<SyncEngine> {
        let resolver =
            ConflictResolver::new(config.conflict_strategy, config.conflict_window_minutes);
        let webhooks = WebhookManager::new(
            Arc::clone(&remote),
            Arc::clone(&store),
            Arc::clone(&clock),
            &config,
        );
        Arc::new(SyncEngine {
            store,
            remote,
            clock,
            config,
            resolver,
            webhooks,
            bound: Mutex::new(None),
            status: Mutex::new(SyncStatus::default()),
            status_bus: Bus::new(),
            sync_in_progress: AtomicBool::new(false),
            periodic: Mutex::new(None),
        })
    }

    /// Bind the engine to a sync scope and load its persisted state.
    pub async fn initialize(&self, scope: &str) -> SyncResult<()> {
        let queue = Arc::new(OfflineQueue::open(scope, Arc::clone(&self.store)).await?);
        let pending = queue.len();
        let state = self.store.load_sync_state(scope).await?;

        *self.bound.lock() = Some(Bound {
            scope: scope.to_string(),
            queue,
        });
        self.update_status(|s| {
            s.pending_changes = pending;
            s.last_sync = state.as_ref().and_then(|st| st.last_sync_at);
        });
        Ok(())
    }

    pub fn scope(&self) -> Option<String> {
        self.bound.lock().as_ref().map(|b| b.scope.clone())
    }

    fn bound(&self) -> SyncResult<(String, Arc<OfflineQueue>)> {
        self.bound
            .lock()
            .as_ref()
            .map(|b| (b.scope.clone(), Arc::clone(&b.queue)))
            .ok_or_else(|| SyncError::NotInitialized("call initialize(scope) first".into()))
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().clone()
    }

    /// Subscribe to status changes; dropping the subscription unsubscribes.
    pub fn on_status_change(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Subscription<SyncStatus> {
        self.status_bus.subscribe(listener)
    }

    fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        let snapshot = {
            let mut status = self.status.lock();
            f(&mut status);
            status.clone()
        };
        self.status_bus.emit(&snapshot);
    }

    // ---- CRUD -----------------------------------------------------------

    /// Write an event locally and mirror it to the provider. Connectivity
    /// failures park the mutation in the offline queue; other mirror
    /// failures leave the event unlinked for the next bidirectional sync
    /// to push.
    pub async fn create_event(&self, mut event: Event) -> SyncResult<Event> {
        let (scope, queue) = self.bound()?;
        event.scope = scope;
        event.touch(self.clock.now());
        self.store.put_event(&event).await?;

        if event.local_only {
            return Ok(event);
        }

        match self.remote.insert_event(&event).await {
            Ok(created) => {
                event.remote_id = Some(created.id);
                event.remote_updated_at = created.updated_at;
                self.store.put_event(&event).await?;
            }
            Err(e) if e.is_offline() => {
                queue
                    .enqueue(OfflineQueueItem::create(event.clone(), self.clock.now()))
                    .await?;
                self.update_status(|s| s.pending_changes = queue.len());
            }
            Err(e) => {
                warn!(event = %event.id, error = %e, "remote create failed");
                self.update_status(|s| s.last_error = Some(e.to_string()));
            }
        }
        Ok(event)
    }

    pub async fn update_event(&self, mut event: Event) -> SyncResult<Event> {
        let (scope, queue) = self.bound()?;
        event.scope = scope;
        event.touch(self.clock.now());
        self.store.put_event(&event).await?;

        let Some(remote_id) = event.remote_id.clone() else {
            return Ok(event);
        };
        if event.local_only {
            return Ok(event);
        }

        match self.remote.update_event(&remote_id, &event).await {
            Ok(updated) => {
                event.remote_updated_at = updated.updated_at;
                self.store.put_event(&event).await?;
            }
            Err(e) if e.is_offline() => {
                queue
                    .enqueue(OfflineQueueItem::update(event.clone(), self.clock.now()))
                    .await?;
                self.update_status(|s| s.pending_changes = queue.len());
            }
            Err(e) => {
                warn!(event = %event.id, error = %e, "remote update failed");
                self.update_status(|s| s.last_error = Some(e.to_string()));
            }
        }
        Ok(event)
    }

    pub async fn delete_event(&self, id: &str) -> SyncResult<()> {
        let (_, queue) = self.bound()?;
        let Some(event) = self.store.get_event(id).await? else {
            return Ok(());
        };
        self.store.delete_event(id).await?;

        let Some(remote_id) = event.remote_id.clone() else {
            return Ok(());
        };
        if event.local_only {
            return Ok(());
        }

        match self.remote.delete_event(&remote_id).await {
            Ok(()) => {}
            Err(e) if e.is_offline() => {
                queue
                    .enqueue(OfflineQueueItem::delete(id, &remote_id, self.clock.now()))
                    .await?;
                self.update_status(|s| s.pending_changes = queue.len());
            }
            Err(e) => {
                warn!(event = %id, error = %e, "remote delete failed");
                self.update_status(|s| s.last_error = Some(e.to_string()));
            }
        }
        Ok(())
    }

    /// Local events in the window, regardless of sync state.
    pub async fn query(&self, range: &DateRange) -> SyncResult<Vec<Event>> {
        let (scope, _) = self.bound()?;
        self.store.events_in_range(&scope, range).await
    }

    pub async fn unresolved_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        let (scope, _) = self.bound()?;
        self.store.unresolved_conflicts(&scope).await
    }

    // ---- Sync -----------------------------------------------------------

    fn acquire_sync_slot(&self) -> SyncResult<SyncSlot<'_>> {
        if self
            .sync_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning);
        }
        Ok(SyncSlot {
            flag: &self.sync_in_progress,
        })
    }

    fn finish_sync(&self, result: &SyncResult<SyncReport>) {
        let now = self.clock.now();
        match result {
            Ok(report) => {
                let synced = report.events_synced();
                self.update_status(|s| {
                    s.syncing = false;
                    s.last_sync = Some(now);
                    s.last_error = None;
                    s.events_synced = synced;
                });
            }
            Err(e) => {
                let message = e.to_string();
                self.update_status(|s| {
                    s.syncing = false;
                    s.last_error = Some(message);
                });
            }
        }
    }

    /// Reconcile the full window in both directions.
    pub async fn perform_full_sync(&self, options: &SyncOptions) -> SyncResult<SyncReport> {
        let _slot = self.acquire_sync_slot()?;
        self.update_status(|s| s.syncing = true);
        let result = self.full_sync_inner(options).await;
        self.finish_sync(&result);
        result
    }

    /// Fetch only what changed since the last sync token; falls back to a
    /// full sync when no token exists or the provider invalidated it.
    pub async fn perform_incremental_sync(&self) -> SyncResult<SyncReport> {
        let _slot = self.acquire_sync_slot()?;
        self.update_status(|s| s.syncing = true);
        let result = self.incremental_inner().await;
        self.finish_sync(&result);
        result
    }

    async fn full_sync_inner(&self, options: &SyncOptions) -> SyncResult<SyncReport> {
        let (scope, _) = self.bound()?;
        let now = self.clock.now();
        let range = options
            .range
            .clone()
            .unwrap_or_else(|| DateRange::around(now));

        let page = self.remote.list_events(&range).await?;
        let local_events = self.store.events_in_range(&scope, &range).await?;
        debug!(
            scope = %scope,
            remote = page.items.len(),
            local = local_events.len(),
            "full sync window fetched"
        );

        let mut report = SyncReport::default();

        let remote_ids: HashSet<&str> = page.items.iter().map(|e| e.id.as_str()).collect();
        let mut local_by_remote: HashMap<String, Event> = HashMap::new();
        let mut local_unlinked: Vec<Event> = Vec::new();
        for event in local_events {
            match event.remote_id.clone() {
                Some(remote_id) => {
                    local_by_remote.insert(remote_id, event);
                }
                None => local_unlinked.push(event),
            }
        }

        // Remote → local.
        for remote_event in &page.items {
            if remote_event.cancelled {
                continue;
            }
            let incoming = match Event::from_remote(remote_event, &scope, now) {
                Ok(event) => event,
                Err(e) => {
                    warn!(remote_id = %remote_event.id, error = %e, "skipping malformed remote event");
                    report.from_remote.errors += 1;
                    continue;
                }
            };

            let cached = match local_by_remote.get(&remote_event.id) {
                Some(event) => Some(event.clone()),
                // The windowed query can miss an event that moved out of
                // range; never re-create something already linked.
                None => self.store.find_by_remote_id(&scope, &remote_event.id).await?,
            };

            match cached {
                None => match self.store.put_event(&incoming).await {
                    Ok(()) => report.from_remote.created += 1,
                    Err(e) => {
                        warn!(remote_id = %remote_event.id, error = %e, "failed to create local event");
                        report.from_remote.errors += 1;
                    }
                },
                Some(mut local) => {
                    let Some(detected) = self.resolver.detect(&local, &incoming) else {
                        continue;
                    };
                    report.from_remote.conflicts += 1;
                    debug!(
                        remote_id = %remote_event.id,
                        kind = ?detected.kind,
                        fields = ?detected.fields,
                        "conflict detected"
                    );

                    match self.resolver.resolve(&local, &incoming) {
                        Resolution::UpdateLocal => {
                            local.apply_remote(&incoming);
                            match self.store.put_event(&local).await {
                                Ok(()) => report.from_remote.updated += 1,
                                Err(e) => {
                                    warn!(event = %local.id, error = %e, "failed to apply remote copy");
                                    report.from_remote.errors += 1;
                                }
                            }
                        }
                        Resolution::UpdateRemote => {
                            if !options.bidirectional {
                                continue;
                            }
                            match self.remote.update_event(&remote_event.id, &local).await {
                                Ok(updated) => {
                                    local.remote_updated_at = updated.updated_at;
                                    if let Err(e) = self.store.put_event(&local).await {
                                        warn!(event = %local.id, error = %e, "failed to record pushed copy");
                                    }
                                    report.to_remote.updated += 1;
                                }
                                Err(e) => {
                                    warn!(event = %local.id, error = %e, "failed to push local copy");
                                    report.to_remote.errors += 1;
                                }
                            }
                        }
                        Resolution::Manual => {
                            let conflict = Conflict::new(&scope, &local, &incoming, now);
                            if let Err(e) = self.store.store_conflict(&conflict).await {
                                warn!(event = %local.id, error = %e, "failed to persist conflict");
                            }
                        }
                    }
                }
            }
        }

        if options.bidirectional {
            // Unlinked local events → create remotely.
            for mut event in local_unlinked {
                if event.local_only || event.status == EventStatus::Cancelled {
                    continue;
                }
                match self.remote.insert_event(&event).await {
                    Ok(created) => {
                        event.remote_id = Some(created.id);
                        event.remote_updated_at = created.updated_at;
                        match self.store.put_event(&event).await {
                            Ok(()) => report.to_remote.created += 1,
                            Err(e) => {
                                warn!(event = %event.id, error = %e, "failed to link pushed event");
                                report.to_remote.errors += 1;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(event = %event.id, error = %e, "failed to push local event");
                        report.to_remote.errors += 1;
                    }
                }
            }

            // Remote deletion wins for linked events that vanished, unless
            // the event is flagged to be preserved.
            for (remote_id, event) in &local_by_remote {
                if remote_ids.contains(remote_id.as_str()) || event.local_only {
                    continue;
                }
                match self.store.delete_event(&event.id).await {
                    Ok(()) => report.from_remote.deleted += 1,
                    Err(e) => {
                        warn!(event = %event.id, error = %e, "failed to delete local event");
                        report.from_remote.errors += 1;
                    }
                }
            }
        }

        let mut state = self
            .store
            .load_sync_state(&scope)
            .await?
            .unwrap_or_else(|| SyncState::new(&scope));
        state.last_sync_at = Some(self.clock.now());
        if let Some(token) = page.next_sync_token {
            state.last_sync_token = Some(token);
        }
        self.store.save_sync_state(&state).await?;

        info!(scope = %scope, report = ?report, "full sync completed");
        Ok(report)
    }

    async fn incremental_inner(&self) -> SyncResult<SyncReport> {
        let (scope, _) = self.bound()?;
        let state = self.store.load_sync_state(&scope).await?;
        let Some(token) = state.as_ref().and_then(|s| s.last_sync_token.clone()) else {
            debug!(scope = %scope, "no sync token, performing full sync");
            return self.full_sync_inner(&SyncOptions::default()).await;
        };

        let page = match self.remote.changes_since(&token).await {
            Ok(page) => page,
            Err(SyncError::TokenExpired) => {
                // Clear the cursor and fall back to a full sync exactly
                // once. full_sync_inner never re-enters the incremental
                // path, so this cannot loop.
                info!(scope = %scope, "sync token expired, falling back to full sync");
                let mut state = state.unwrap_or_else(|| SyncState::new(&scope));
                state.last_sync_token = None;
                self.store.save_sync_state(&state).await?;
                return self.full_sync_inner(&SyncOptions::default()).await;
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let mut report = SyncReport::default();

        for item in &page.items {
            if item.cancelled {
                match self.store.find_by_remote_id(&scope, &item.id).await {
                    Ok(Some(event)) => match self.store.delete_event(&event.id).await {
                        Ok(()) => report.from_remote.deleted += 1,
                        Err(e) => {
                            warn!(event = %event.id, error = %e, "failed to delete local event");
                            report.from_remote.errors += 1;
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        warn!(remote_id = %item.id, error = %e, "lookup failed");
                        report.from_remote.errors += 1;
                    }
                }
                continue;
            }

            let incoming = match Event::from_remote(item, &scope, now) {
                Ok(event) => event,
                Err(e) => {
                    warn!(remote_id = %item.id, error = %e, "skipping malformed remote event");
                    report.from_remote.errors += 1;
                    continue;
                }
            };

            match self.store.find_by_remote_id(&scope, &item.id).await {
                Ok(Some(mut local)) => {
                    local.apply_remote(&incoming);
                    match self.store.put_event(&local).await {
                        Ok(()) => report.from_remote.updated += 1,
                        Err(e) => {
                            warn!(event = %local.id, error = %e, "failed to apply remote change");
                            report.from_remote.errors += 1;
                        }
                    }
                }
                Ok(None) => match self.store.put_event(&incoming).await {
                    Ok(()) => report.from_remote.created += 1,
                    Err(e) => {
                        warn!(remote_id = %item.id, error = %e, "failed to create local event");
                        report.from_remote.errors += 1;
                    }
                },
                Err(e) => {
                    warn!(remote_id = %item.id, error = %e, "lookup failed");
                    report.from_remote.errors += 1;
                }
            }
        }

        if let Some(token) = page.next_sync_token {
            let mut state = self
                .store
                .load_sync_state(&scope)
                .await?
                .unwrap_or_else(|| SyncState::new(&scope));
            state.last_sync_token = Some(token);
            state.last_sync_at = Some(now);
            self.store.save_sync_state(&state).await?;
        }

        info!(scope = %scope, report = ?report, "incremental sync completed");
        Ok(report)
    }

    // ---- Background tasks ----------------------------------------------

    /// Start polling the provider with incremental syncs. Idempotent: an
    /// already-running poller is left in place.
    pub fn start_periodic_sync(self: &Arc<Self>) {
        let mut periodic = self.periodic.lock();
        if periodic.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let engine = Arc::clone(self);
        let interval = std::time::Duration::from_secs(self.config.sync_interval_secs);
        *periodic = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the interval
            // starts counting from now.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                // Replay queued mutations opportunistically before syncing.
                if let Err(e) = engine.process_offline_queue().await {
                    debug!(error = %e, "offline queue replay failed");
                }
                match engine.perform_incremental_sync().await {
                    Ok(_) | Err(SyncError::AlreadyRunning) => {}
                    Err(e) => warn!(error = %e, "periodic sync failed"),
                }
            }
        }));
    }

    pub fn stop_periodic_sync(&self) {
        if let Some(task) = self.periodic.lock().take() {
            task.abort();
        }
    }

    pub fn periodic_sync_running(&self) -> bool {
        self.periodic
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Register a push channel for near-real-time sync. Registration
    /// failure is not fatal: the engine falls back to polling.
    pub async fn enable_push_notifications(self: &Arc<Self>) -> SyncResult<bool> {
        let (scope, _) = self.bound()?;
        match self.webhooks.setup(&scope).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.start_periodic_sync();
                Ok(false)
            }
            Err(e) => {
                warn!(scope = %scope, error = %e, "webhook setup failed");
                self.start_periodic_sync();
                Ok(false)
            }
        }
    }

    /// Wire-up point for auth events: polling runs while a credential is
    /// live and stops when it goes away.
    pub fn handle_auth_change(self: &Arc<Self>, authenticated: bool) {
        self.update_status(|s| s.connected = authenticated);
        if authenticated {
            self.start_periodic_sync();
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = engine.process_offline_queue().await {
                    debug!(error = %e, "offline queue replay failed");
                }
            });
        } else {
            self.stop_periodic_sync();
        }
    }

    /// Drain the offline queue against the provider.
    pub async fn process_offline_queue(&self) -> SyncResult<QueueOutcome> {
        let (_, queue) = self.bound()?;
        let outcome = queue.process(self.remote.as_ref()).await?;
        if outcome.processed > 0 || outcome.failed > 0 {
            self.update_status(|s| s.pending_changes = queue.len());
        }
        Ok(outcome)
    }

    /// Cancel background tasks. In-flight syncs are not aborted; they
    /// finish and release the single-flight slot on their own.
    pub fn shutdown(&self) {
        self.stop_periodic_sync();
        self.webhooks.cancel_renewal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::conflict::ConflictStrategy;
    use crate::remote::{InMemoryRemote, RemoteEvent};
    use crate::store::MemoryEventStore;
    use chrono::{DateTime, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn remote_event(id: &str, title: &str, start_secs: i64) -> RemoteEvent {
        RemoteEvent {
            id: id.to_string(),
            title: Some(title.to_string()),
            start_time: Some(t(start_secs)),
            end_time: Some(t(start_secs + 3600)),
            updated_at: Some(t(0)),
            ..RemoteEvent::default()
        }
    }

    struct Fixture {
        engine: Arc<SyncEngine>,
        store: Arc<MemoryEventStore>,
        remote: Arc<InMemoryRemote>,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        fixture_with(SyncConfig::default()).await
    }

    async fn fixture_with(config: SyncConfig) -> Fixture {
        let store = Arc::new(MemoryEventStore::new());
        let remote = Arc::new(InMemoryRemote::new());
        let clock = ManualClock::new(t(0));
        let engine = SyncEngine::new(
            Arc::clone(&store) as Arc<dyn LocalEventStore>,
            Arc::clone(&remote) as Arc<dyn RemoteCalendar>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            config,
        );
        engine.initialize("fam-1").await.unwrap();
        Fixture {
            engine,
            store,
            remote,
            clock,
        }
    }

    #[tokio::test]
    async fn test_full_sync_is_idempotent() {
        let f = fixture().await;
        for i in 0..3 {
            f.remote
                .seed(remote_event(&format!("r-{i}"), &format!("Event {i}"), i * 60));
        }

        let first = f
            .engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(first.from_remote.created, 3);

        let second = f
            .engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();
        assert!(second.is_noop(), "second run must change nothing: {second:?}");
        assert_eq!(second.from_remote.conflicts, 0);
        assert_eq!(f.store.event_count(), 3);
    }

    #[tokio::test]
    async fn test_linked_event_is_never_recreated() {
        let f = fixture().await;
        f.remote.seed(remote_event("r-1", "Swim practice", 120));

        f.engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();
        f.engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();
        f.engine.perform_incremental_sync().await.unwrap();

        assert_eq!(f.store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_abort_the_batch() {
        let f = fixture().await;
        for i in 0..10 {
            let mut event = remote_event(&format!("r-{i}"), &format!("Event {i}"), i * 60);
            if i == 5 {
                // Missing start time makes the payload malformed.
                event.start_time = None;
                event.end_time = None;
            }
            f.remote.seed(event);
        }

        let report = f
            .engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.from_remote.created, 9);
        assert_eq!(report.from_remote.errors, 1);
    }

    #[tokio::test]
    async fn test_second_sync_request_is_rejected_not_queued() {
        let f = fixture().await;
        f.engine.sync_in_progress.store(true, Ordering::SeqCst);

        let err = f
            .engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning));

        f.engine.sync_in_progress.store(false, Ordering::SeqCst);
        assert!(f
            .engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_bidirectional_pushes_unlinked_local_events() {
        let f = fixture().await;
        let event = Event::new_local("fam-1", "Homework club", t(300), t(3900), t(0));
        f.store.put_event(&event).await.unwrap();

        let report = f
            .engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.to_remote.created, 1);

        let linked = f.store.get_event(&event.id).await.unwrap().unwrap();
        assert!(linked.remote_id.is_some());
        assert_eq!(f.remote.event_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_deletion_wins_but_preserved_events_survive() {
        let f = fixture().await;
        f.remote.seed(remote_event("r-1", "Book fair", 60));
        f.remote.seed(remote_event("r-2", "Karate", 120));
        f.engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();

        // Flag one copy as preserved, then delete both remotely.
        let mut preserved = f.store.find_by_remote_id("fam-1", "r-2").await.unwrap().unwrap();
        preserved.local_only = true;
        f.store.put_event(&preserved).await.unwrap();
        f.remote.delete_event("r-1").await.unwrap();
        f.remote.delete_event("r-2").await.unwrap();

        let report = f
            .engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.from_remote.deleted, 1);
        assert!(f.store.find_by_remote_id("fam-1", "r-1").await.unwrap().is_none());
        assert!(f.store.find_by_remote_id("fam-1", "r-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_incremental_applies_changes_and_tombstones() {
        let f = fixture().await;
        f.remote.seed(remote_event("r-1", "Violin", 60));
        f.engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();

        // A new event and a deletion arrive through the change feed.
        f.remote.seed(remote_event("r-2", "Chess", 120));
        f.remote.delete_event("r-1").await.unwrap();

        let report = f.engine.perform_incremental_sync().await.unwrap();
        assert_eq!(report.from_remote.created, 1);
        assert_eq!(report.from_remote.deleted, 1);
        assert_eq!(f.store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_sync_token_falls_back_to_full_sync_once() {
        let f = fixture().await;
        f.remote.seed(remote_event("r-1", "Recital", 60));
        f.engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();

        f.remote.invalidate_sync_token();
        let report = f.engine.perform_incremental_sync().await.unwrap();
        assert!(report.is_noop());

        let counts = f.remote.counts();
        assert_eq!(counts.changes, 1, "change feed consulted once");
        assert_eq!(counts.lists, 2, "exactly one full-sync fallback");

        // The fallback stored a fresh token, so the next incremental uses
        // the change feed again.
        f.engine.perform_incremental_sync().await.unwrap();
        assert_eq!(f.remote.counts().changes, 2);
    }

    #[tokio::test]
    async fn test_incremental_without_token_delegates_to_full_sync() {
        let f = fixture().await;
        f.remote.seed(remote_event("r-1", "Scouts", 60));

        let report = f.engine.perform_incremental_sync().await.unwrap();
        assert_eq!(report.from_remote.created, 1);
        assert_eq!(f.remote.counts().lists, 1);
    }

    #[tokio::test]
    async fn test_create_event_queues_while_offline_and_replays() {
        let f = fixture().await;
        f.remote.set_offline(true);

        let event = Event::new_local("fam-1", "Bake sale", t(300), t(3900), t(0));
        let created = f.engine.create_event(event).await.unwrap();
        assert!(created.remote_id.is_none());
        assert_eq!(f.engine.status().pending_changes, 1);

        f.remote.set_offline(false);
        let outcome = f.engine.process_offline_queue().await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(f.engine.status().pending_changes, 0);

        let linked = f.store.get_event(&created.id).await.unwrap().unwrap();
        assert!(linked.remote_id.is_some());
        assert_eq!(f.remote.event_count(), 1);
    }

    #[tokio::test]
    async fn test_webhook_failure_falls_back_to_polling() {
        let config = SyncConfig {
            webhook_base_url: Some("https://app.example.com".to_string()),
            ..SyncConfig::default()
        };
        let f = fixture_with(config).await;
        f.remote.fail_watch();

        let push = f.engine.enable_push_notifications().await.unwrap();
        assert!(!push);
        assert!(f.engine.periodic_sync_running());

        // A second enable leaves the existing poller in place.
        f.engine.enable_push_notifications().await.unwrap();
        assert!(f.engine.periodic_sync_running());
        f.engine.shutdown();
    }

    #[tokio::test]
    async fn test_smart_conflict_applies_newer_local_side() {
        let f = fixture().await;
        f.remote.seed(remote_event("r-1", "Parents evening", 60));
        f.engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();

        // Edit locally well after the remote copy's timestamp.
        f.clock.set(t(7200));
        let mut local = f.store.find_by_remote_id("fam-1", "r-1").await.unwrap().unwrap();
        local.title = "Parents evening (moved)".to_string();
        local.touch(t(7200));
        f.store.put_event(&local).await.unwrap();

        let report = f
            .engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.from_remote.conflicts, 1);
        assert_eq!(report.to_remote.updated, 1);
        assert_eq!(
            f.remote.event("r-1").unwrap().title.as_deref(),
            Some("Parents evening (moved)")
        );
    }

    #[tokio::test]
    async fn test_manual_strategy_persists_conflict_for_later() {
        let config = SyncConfig {
            conflict_strategy: ConflictStrategy::Manual,
            ..SyncConfig::default()
        };
        let f = fixture_with(config).await;
        f.remote.seed(remote_event("r-1", "Field trip", 60));
        f.engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();

        let mut local = f.store.find_by_remote_id("fam-1", "r-1").await.unwrap().unwrap();
        local.title = "Field trip (changed)".to_string();
        local.touch(t(60));
        f.store.put_event(&local).await.unwrap();

        let report = f
            .engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.from_remote.conflicts, 1);
        assert_eq!(report.from_remote.updated, 0);
        assert_eq!(report.to_remote.updated, 0);

        let conflicts = f.engine.unresolved_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(!conflicts[0].resolved);
    }

    #[tokio::test]
    async fn test_status_stream_reports_sync_lifecycle() {
        let f = fixture().await;
        f.remote.seed(remote_event("r-1", "Swim", 60));

        let observed: Arc<parking_lot::Mutex<Vec<bool>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let observed2 = Arc::clone(&observed);
        let _sub = f
            .engine
            .on_status_change(move |s| observed2.lock().push(s.syncing));

        f.engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap();

        let seen = observed.lock().clone();
        assert_eq!(seen, vec![true, false]);
        let status = f.engine.status();
        assert!(status.last_sync.is_some());
        assert_eq!(status.last_error, None);
        assert_eq!(status.events_synced, 1);
    }

    #[tokio::test]
    async fn test_uninitialized_engine_refuses_work() {
        let store = Arc::new(MemoryEventStore::new());
        let remote = Arc::new(InMemoryRemote::new());
        let clock = ManualClock::new(t(0));
        let engine = SyncEngine::new(store, remote, clock, SyncConfig::default());

        let err = engine
            .perform_full_sync(&SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotInitialized(_)));
    }
}
