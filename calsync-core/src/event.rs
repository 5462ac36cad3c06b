//! Provider-neutral calendar event types.
//!
//! These types represent calendar events as the local store holds them.
//! The remote adapter converts provider API payloads into [`RemoteEvent`]
//! (see [`crate::remote`]); conversion into a local [`Event`] happens in the
//! engine, where malformed payloads are counted and skipped per item.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteEvent;

/// A calendar event as stored locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Local identity, assigned once and never reused.
    pub id: String,
    /// Provider-assigned id, set once the event has been mirrored remotely.
    /// Unique per (scope, remote_id).
    pub remote_id: Option<String>,
    /// Sync scope (account, household) this event belongs to.
    pub scope: String,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub all_day: bool,
    pub attendees: Vec<Attendee>,
    /// RRULE/EXDATE lines for recurring events.
    pub recurrence_rule: Option<Vec<String>>,
    /// The provider's last-modified timestamp for the mirrored copy.
    pub remote_updated_at: Option<DateTime<Utc>>,
    /// Bumped on every local mutation; strictly monotonic.
    pub local_updated_at: DateTime<Utc>,
    pub source: EventSource,
    pub status: EventStatus,
    /// Never pushed to the remote side; survives remote deletion.
    pub local_only: bool,
}

/// An event attendee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
    pub display_name: Option<String>,
    pub response_status: Option<ParticipationStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParticipationStatus {
    Accepted,
    Declined,
    Tentative,
    NeedsAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Active,
    Cancelled,
}

impl Event {
    /// Create a locally-authored event in the given scope.
    pub fn new_local(
        scope: &str,
        title: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Event {
        Event {
            id: Uuid::new_v4().to_string(),
            remote_id: None,
            scope: scope.to_string(),
            title: title.to_string(),
            description: None,
            location: None,
            start_time,
            end_time,
            all_day: false,
            attendees: Vec::new(),
            recurrence_rule: None,
            remote_updated_at: None,
            local_updated_at: now,
            source: EventSource::Local,
            status: EventStatus::Active,
            local_only: false,
        }
    }

    /// Convert a provider payload into a local event.
    ///
    /// A payload without a start time is malformed; the end time falls back
    /// to the start time when absent, matching what providers accept on the
    /// way back out.
    pub fn from_remote(remote: &RemoteEvent, scope: &str, now: DateTime<Utc>) -> SyncResult<Event> {
        if remote.id.is_empty() {
            return Err(SyncError::Validation("event has no remote id".into()));
        }
        let start_time = remote
            .start_time
            .ok_or_else(|| SyncError::Validation(format!("event {} has no start time", remote.id)))?;
        let end_time = remote.end_time.unwrap_or(start_time);

        Ok(Event {
            id: Uuid::new_v4().to_string(),
            remote_id: Some(remote.id.clone()),
            scope: scope.to_string(),
            title: remote
                .title
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "(No title)".to_string()),
            description: remote.description.clone(),
            location: remote.location.clone(),
            start_time,
            end_time,
            all_day: remote.all_day,
            attendees: remote.attendees.clone(),
            recurrence_rule: remote.recurrence_rule.clone(),
            remote_updated_at: remote.updated_at,
            // Mirror the provider's timestamp so a freshly pulled copy never
            // looks locally edited.
            local_updated_at: remote.updated_at.unwrap_or(now),
            source: EventSource::Remote,
            status: if remote.cancelled {
                EventStatus::Cancelled
            } else {
                EventStatus::Active
            },
            local_only: false,
        })
    }

    /// Bump `local_updated_at`, keeping the monotonic invariant even when
    /// the clock is coarse or has stepped backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let floor = self.local_updated_at + Duration::milliseconds(1);
        self.local_updated_at = now.max(floor);
    }

    /// Overwrite content fields with an incoming remote copy, preserving the
    /// local identity and flags.
    pub fn apply_remote(&mut self, incoming: &Event) {
        self.title = incoming.title.clone();
        self.description = incoming.description.clone();
        self.location = incoming.location.clone();
        self.start_time = incoming.start_time;
        self.end_time = incoming.end_time;
        self.all_day = incoming.all_day;
        self.attendees = incoming.attendees.clone();
        self.recurrence_rule = incoming.recurrence_rule.clone();
        self.remote_updated_at = incoming.remote_updated_at;
        self.status = incoming.status;
        self.local_updated_at = incoming.local_updated_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut event = Event::new_local("fam-1", "Dentist", t(0), t(3600), t(0));
        let before = event.local_updated_at;

        // Clock stepped backwards; the timestamp must still advance.
        event.touch(t(-100));
        assert!(event.local_updated_at > before);

        let mid = event.local_updated_at;
        event.touch(t(500));
        assert!(event.local_updated_at > mid);
    }

    #[test]
    fn test_from_remote_requires_start_time() {
        let remote = RemoteEvent {
            id: "r-1".to_string(),
            title: Some("Broken".to_string()),
            ..RemoteEvent::default()
        };
        let err = Event::from_remote(&remote, "fam-1", t(0)).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_from_remote_defaults_end_to_start() {
        let remote = RemoteEvent {
            id: "r-2".to_string(),
            title: Some("Point in time".to_string()),
            start_time: Some(t(60)),
            ..RemoteEvent::default()
        };
        let event = Event::from_remote(&remote, "fam-1", t(0)).unwrap();
        assert_eq!(event.end_time, event.start_time);
        assert_eq!(event.source, EventSource::Remote);
        assert_eq!(event.remote_id.as_deref(), Some("r-2"));
    }
}
