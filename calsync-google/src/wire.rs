//! Google Calendar API wire types and conversions.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use calsync_core::{Attendee, Event, EventStatus, ParticipationStatus, RemoteEvent};

/// Convert Google's response status to ParticipationStatus
fn parse_response_status(status: &str) -> Option<ParticipationStatus> {
    match status {
        "accepted" => Some(ParticipationStatus::Accepted),
        "declined" => Some(ParticipationStatus::Declined),
        "tentative" => Some(ParticipationStatus::Tentative),
        "needsAction" => Some(ParticipationStatus::NeedsAction),
        _ => None,
    }
}

/// Convert ParticipationStatus to Google's response status format
fn response_status_str(status: ParticipationStatus) -> &'static str {
    match status {
        ParticipationStatus::Accepted => "accepted",
        ParticipationStatus::Declined => "declined",
        ParticipationStatus::Tentative => "tentative",
        ParticipationStatus::NeedsAction => "needsAction",
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoogleEventTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoogleAttendee {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoogleEvent {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<GoogleEventTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<GoogleEventTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<GoogleAttendee>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recurrence: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventsListResponse {
    pub items: Vec<GoogleEvent>,
    pub next_page_token: Option<String>,
    pub next_sync_token: Option<String>,
}

/// `events.watch` request body.
#[derive(Debug, Clone, Serialize)]
pub struct WatchRequestBody {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    /// Milliseconds since epoch.
    pub expiration: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchResponse {
    pub id: String,
    pub resource_id: Option<String>,
    /// Milliseconds since epoch, returned as a string.
    pub expiration: Option<String>,
}

fn time_of(value: &GoogleEventTime) -> Option<DateTime<Utc>> {
    value
        .date_time
        .or_else(|| value.date.and_then(|d| d.and_hms_opt(0, 0, 0)).map(|n| n.and_utc()))
}

impl GoogleEvent {
    /// Map the provider payload into the engine's neutral representation.
    pub fn into_remote(self) -> RemoteEvent {
        let all_day = self
            .start
            .as_ref()
            .map(|s| s.date_time.is_none() && s.date.is_some())
            .unwrap_or(false);

        let attendees = self
            .attendees
            .iter()
            .map(|a| Attendee {
                email: a.email.clone(),
                display_name: a.display_name.clone().filter(|n| !n.is_empty()),
                response_status: a
                    .response_status
                    .as_deref()
                    .and_then(parse_response_status),
            })
            .collect();

        RemoteEvent {
            id: self.id,
            title: self.summary,
            description: self.description.filter(|d| !d.is_empty()),
            location: self.location.filter(|l| !l.is_empty()),
            start_time: self.start.as_ref().and_then(time_of),
            end_time: self.end.as_ref().and_then(time_of),
            all_day,
            attendees,
            recurrence_rule: if self.recurrence.is_empty() {
                None
            } else {
                Some(self.recurrence)
            },
            updated_at: self.updated,
            cancelled: self.status.as_deref() == Some("cancelled"),
        }
    }

    /// Build the insert/update payload for a local event.
    pub fn from_local(event: &Event) -> GoogleEvent {
        let (start, end) = if event.all_day {
            (
                GoogleEventTime {
                    date: Some(event.start_time.date_naive()),
                    ..GoogleEventTime::default()
                },
                GoogleEventTime {
                    date: Some(event.end_time.date_naive()),
                    ..GoogleEventTime::default()
                },
            )
        } else {
            (
                GoogleEventTime {
                    date_time: Some(event.start_time),
                    ..GoogleEventTime::default()
                },
                GoogleEventTime {
                    date_time: Some(event.end_time),
                    ..GoogleEventTime::default()
                },
            )
        };

        let attendees = event
            .attendees
            .iter()
            .map(|a| GoogleAttendee {
                email: a.email.clone(),
                display_name: a.display_name.clone(),
                response_status: a
                    .response_status
                    .map(|s| response_status_str(s).to_string()),
            })
            .collect();

        GoogleEvent {
            id: event.remote_id.clone().unwrap_or_default(),
            summary: Some(event.title.clone()),
            description: event.description.clone(),
            location: event.location.clone(),
            start: Some(start),
            end: Some(end),
            status: Some(
                match event.status {
                    EventStatus::Active => "confirmed",
                    EventStatus::Cancelled => "cancelled",
                }
                .to_string(),
            ),
            updated: None,
            attendees,
            recurrence: event.recurrence_rule.clone().unwrap_or_default(),
        }
    }
}
