//! Remote calendar provider contract.
//!
//! The engine talks to the provider exclusively through [`RemoteCalendar`].
//! `calsync-google` ships the production adapter over the Google Calendar
//! REST API; [`InMemoryRemote`] is the in-memory fake used by tests and
//! offline demos.

mod memory;

pub use memory::{InMemoryRemote, RemoteCallCounts};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::date_range::DateRange;
use crate::error::SyncResult;
use crate::event::{Attendee, Event};

/// Loosely-typed event payload as the provider returns it. All content
/// fields are optional; conversion into a local [`Event`] is where
/// malformed items are rejected per item instead of aborting the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Provider-assigned id.
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub all_day: bool,
    pub attendees: Vec<Attendee>,
    pub recurrence_rule: Option<Vec<String>>,
    /// Provider's last-modified timestamp.
    pub updated_at: Option<DateTime<Utc>>,
    /// Deleted/cancelled on the provider side. Incremental feeds carry
    /// these as tombstones.
    pub cancelled: bool,
}

/// One page-merged fetch result. Adapters handle provider-side pagination
/// internally and return the full window.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub items: Vec<RemoteEvent>,
    /// Cursor for the next incremental fetch, when the provider issued one.
    pub next_sync_token: Option<String>,
}

/// Push-channel registration request.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub id: String,
    /// URL the provider will POST notifications to.
    pub address: String,
    pub expiration: DateTime<Utc>,
}

/// An active push channel.
#[derive(Debug, Clone)]
pub struct WatchChannel {
    pub id: String,
    pub resource_id: Option<String>,
    pub expiration: DateTime<Utc>,
}

#[async_trait]
pub trait RemoteCalendar: Send + Sync {
    /// Fetch all events in the window, ordered by start time.
    async fn list_events(&self, range: &DateRange) -> SyncResult<EventPage>;

    /// Fetch only events changed or deleted since the sync token.
    /// Fails with [`crate::SyncError::TokenExpired`] when the provider has
    /// invalidated the cursor.
    async fn changes_since(&self, sync_token: &str) -> SyncResult<EventPage>;

    /// Create the event remotely; the returned payload carries the
    /// provider-assigned id.
    async fn insert_event(&self, event: &Event) -> SyncResult<RemoteEvent>;

    async fn update_event(&self, remote_id: &str, event: &Event) -> SyncResult<RemoteEvent>;

    /// Delete the event remotely. Already-gone events are not an error.
    async fn delete_event(&self, remote_id: &str) -> SyncResult<()>;

    /// Register a push-notification channel.
    async fn watch(&self, request: &WatchRequest) -> SyncResult<WatchChannel>;
}

impl RemoteEvent {
    /// Build the provider payload for a local event being pushed out.
    pub fn from_local(event: &Event) -> RemoteEvent {
        RemoteEvent {
            id: event.remote_id.clone().unwrap_or_default(),
            title: Some(event.title.clone()),
            description: event.description.clone(),
            location: event.location.clone(),
            start_time: Some(event.start_time),
            end_time: Some(event.end_time),
            all_day: event.all_day,
            attendees: event.attendees.clone(),
            recurrence_rule: event.recurrence_rule.clone(),
            updated_at: None,
            cancelled: false,
        }
    }
}
