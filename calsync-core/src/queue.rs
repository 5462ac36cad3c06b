//! Durable FIFO of pending remote-side mutations.
//!
//! Mutations that fail with a connectivity error are parked here and
//! replayed once the provider is reachable again. The queue is the only
//! structure whose ordering must survive restarts: items are applied
//! strictly in enqueue order, and items that fail during a drain keep
//! their original relative position.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::event::Event;
use crate::remote::RemoteCalendar;
use crate::store::LocalEventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueItem {
    pub action: QueueAction,
    pub event_local_id: String,
    /// Required for update/delete; absent for creates still awaiting an id.
    pub remote_id: Option<String>,
    /// The event snapshot to apply; absent for deletes.
    pub payload: Option<Event>,
    pub enqueued_at: DateTime<Utc>,
}

impl OfflineQueueItem {
    pub fn create(event: Event, enqueued_at: DateTime<Utc>) -> OfflineQueueItem {
        OfflineQueueItem {
            action: QueueAction::Create,
            event_local_id: event.id.clone(),
            remote_id: None,
            payload: Some(event),
            enqueued_at,
        }
    }

    pub fn update(event: Event, enqueued_at: DateTime<Utc>) -> OfflineQueueItem {
        OfflineQueueItem {
            action: QueueAction::Update,
            event_local_id: event.id.clone(),
            remote_id: event.remote_id.clone(),
            payload: Some(event),
            enqueued_at,
        }
    }

    pub fn delete(
        event_local_id: &str,
        remote_id: &str,
        enqueued_at: DateTime<Utc>,
    ) -> OfflineQueueItem {
        OfflineQueueItem {
            action: QueueAction::Delete,
            event_local_id: event_local_id.to_string(),
            remote_id: Some(remote_id.to_string()),
            payload: None,
            enqueued_at,
        }
    }
}

/// Outcome of one queue drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOutcome {
    pub processed: usize,
    pub failed: usize,
}

pub struct OfflineQueue {
    scope: String,
    store: Arc<dyn LocalEventStore>,
    items: Mutex<Vec<OfflineQueueItem>>,
}

impl OfflineQueue {
    /// Load the persisted queue for a scope.
    pub async fn open(scope: &str, store: Arc<dyn LocalEventStore>) -> SyncResult<OfflineQueue> {
        let items = store.load_queue(scope).await?;
        Ok(OfflineQueue {
            scope: scope.to_string(),
            store,
            items: Mutex::new(items),
        })
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Append an item and persist immediately.
    pub async fn enqueue(&self, item: OfflineQueueItem) -> SyncResult<()> {
        let snapshot = {
            let mut items = self.items.lock();
            items.push(item);
            items.clone()
        };
        self.store.save_queue(&self.scope, &snapshot).await
    }

    /// Drain the queue in FIFO order, applying each item against the remote
    /// provider. Failed items are retained in their original relative order
    /// ahead of anything enqueued during the drain.
    pub async fn process(&self, remote: &dyn RemoteCalendar) -> SyncResult<QueueOutcome> {
        let pending = {
            let mut items = self.items.lock();
            std::mem::take(&mut *items)
        };
        if pending.is_empty() {
            return Ok(QueueOutcome::default());
        }

        debug!(scope = %self.scope, pending = pending.len(), "processing offline queue");

        let mut outcome = QueueOutcome::default();
        let mut failed = Vec::new();

        for item in pending {
            match self.apply(remote, &item).await {
                Ok(()) => outcome.processed += 1,
                Err(e) => {
                    warn!(
                        scope = %self.scope,
                        event = %item.event_local_id,
                        error = %e,
                        "offline item failed, keeping in queue"
                    );
                    outcome.failed += 1;
                    failed.push(item);
                }
            }
        }

        let snapshot = {
            let mut items = self.items.lock();
            let enqueued_during_drain = std::mem::take(&mut *items);
            failed.extend(enqueued_during_drain);
            *items = failed;
            items.clone()
        };
        self.store.save_queue(&self.scope, &snapshot).await?;

        Ok(outcome)
    }

    async fn apply(&self, remote: &dyn RemoteCalendar, item: &OfflineQueueItem) -> SyncResult<()> {
        match item.action {
            QueueAction::Create => {
                let Some(payload) = &item.payload else {
                    // Malformed persisted item; dropping it is the only option.
                    return Ok(());
                };
                let created = remote.insert_event(payload).await?;
                // Link the provider id back onto the local event.
                if let Some(mut event) = self.store.get_event(&item.event_local_id).await? {
                    event.remote_id = Some(created.id);
                    event.remote_updated_at = created.updated_at;
                    self.store.put_event(&event).await?;
                }
                Ok(())
            }
            QueueAction::Update => {
                let (Some(payload), Some(remote_id)) = (&item.payload, &item.remote_id) else {
                    return Ok(());
                };
                let updated = remote.update_event(remote_id, payload).await?;
                if let Some(mut event) = self.store.get_event(&item.event_local_id).await? {
                    event.remote_updated_at = updated.updated_at;
                    self.store.put_event(&event).await?;
                }
                Ok(())
            }
            QueueAction::Delete => {
                let Some(remote_id) = &item.remote_id else {
                    return Ok(());
                };
                remote.delete_event(remote_id).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::remote::InMemoryRemote;
    use crate::store::MemoryEventStore;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn event(title: &str) -> Event {
        Event::new_local("fam-1", title, t(0), t(3600), t(0))
    }

    #[tokio::test]
    async fn test_failed_item_keeps_position_without_reordering() {
        let store: Arc<dyn LocalEventStore> = Arc::new(MemoryEventStore::new());
        let remote = InMemoryRemote::new();
        remote.fail_inserts_titled("B");

        let queue = OfflineQueue::open("fam-1", Arc::clone(&store)).await.unwrap();
        for title in ["A", "B", "C"] {
            let ev = event(title);
            store.put_event(&ev).await.unwrap();
            queue.enqueue(OfflineQueueItem::create(ev, t(1))).await.unwrap();
        }

        let outcome = queue.process(&remote).await.unwrap();
        assert_eq!(outcome, QueueOutcome { processed: 2, failed: 1 });

        // Only B remains, and it is persisted for the next drain.
        assert_eq!(queue.len(), 1);
        let persisted = store.load_queue("fam-1").await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(
            persisted[0].payload.as_ref().map(|e| e.title.as_str()),
            Some("B")
        );

        // A and C made it out and were linked back to their local copies.
        assert_eq!(remote.event_count(), 2);
    }

    #[tokio::test]
    async fn test_create_links_remote_id_back_to_local_event() {
        let store: Arc<dyn LocalEventStore> = Arc::new(MemoryEventStore::new());
        let remote = InMemoryRemote::new();

        let ev = event("Piano lesson");
        let local_id = ev.id.clone();
        store.put_event(&ev).await.unwrap();

        let queue = OfflineQueue::open("fam-1", Arc::clone(&store)).await.unwrap();
        queue.enqueue(OfflineQueueItem::create(ev, t(1))).await.unwrap();
        queue.process(&remote).await.unwrap();

        let linked = store.get_event(&local_id).await.unwrap().unwrap();
        assert!(linked.remote_id.is_some());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_survives_restart_in_order() {
        let store: Arc<dyn LocalEventStore> = Arc::new(MemoryEventStore::new());
        {
            let queue = OfflineQueue::open("fam-1", Arc::clone(&store)).await.unwrap();
            queue.enqueue(OfflineQueueItem::create(event("first"), t(1))).await.unwrap();
            queue
                .enqueue(OfflineQueueItem::delete("local-2", "remote-2", t(2)))
                .await
                .unwrap();
        }

        let reopened = OfflineQueue::open("fam-1", Arc::clone(&store)).await.unwrap();
        assert_eq!(reopened.len(), 2);
        let items = store.load_queue("fam-1").await.unwrap();
        assert_eq!(items[0].action, QueueAction::Create);
        assert_eq!(items[1].action, QueueAction::Delete);
    }
}
