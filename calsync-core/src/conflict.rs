//! Conflict detection and resolution between local and remote event copies.
//!
//! The `smart` strategy is last-writer-wins keyed on modification
//! timestamps. It is not a field-level merge: whichever side was edited
//! more recently replaces the other wholesale. Equal timestamps resolve to
//! the remote side.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    Smart,
    /// Never auto-applies; conflicts are persisted for external resolution.
    Manual,
}

/// How a detected divergence was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides were modified within the conflict window.
    ConcurrentUpdate,
    /// The cached local copy and the incoming remote copy disagree.
    ContentMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedConflict {
    pub kind: ConflictKind,
    pub fields: Vec<&'static str>,
}

/// Which side a resolution applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Apply the remote copy to the local store.
    UpdateLocal,
    /// Push the local copy to the remote side.
    UpdateRemote,
    /// Defer to external resolution.
    Manual,
}

/// A recorded divergence, persisted when resolution is deferred and kept
/// for audit when the smart strategy decides automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub scope: String,
    pub local_event: Event,
    pub remote_event: Event,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolution: Option<Resolution>,
}

impl Conflict {
    pub fn new(scope: &str, local: &Event, remote: &Event, detected_at: DateTime<Utc>) -> Conflict {
        Conflict {
            id: Uuid::new_v4().to_string(),
            scope: scope.to_string(),
            local_event: local.clone(),
            remote_event: remote.clone(),
            detected_at,
            resolved: false,
            resolution: None,
        }
    }
}

pub struct ConflictResolver {
    strategy: ConflictStrategy,
    window: Duration,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy, window_minutes: i64) -> ConflictResolver {
        ConflictResolver {
            strategy,
            window: Duration::minutes(window_minutes),
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Content fields that differ between the two copies.
    pub fn changed_fields(local: &Event, remote: &Event) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if local.title != remote.title {
            fields.push("title");
        }
        if local.description != remote.description {
            fields.push("description");
        }
        if local.location != remote.location {
            fields.push("location");
        }
        if local.start_time != remote.start_time {
            fields.push("start_time");
        }
        if local.end_time != remote.end_time {
            fields.push("end_time");
        }
        fields
    }

    /// Detect a divergence between the cached local copy and an incoming
    /// remote copy. Identical content is never a conflict, however close
    /// the timestamps — there is nothing to resolve.
    pub fn detect(&self, local: &Event, remote: &Event) -> Option<DetectedConflict> {
        let fields = Self::changed_fields(local, remote);
        if fields.is_empty() {
            return None;
        }

        let local_updated = local.local_updated_at;
        let remote_updated = remote
            .remote_updated_at
            .unwrap_or(remote.local_updated_at);

        let gap = (local_updated - remote_updated).abs();
        let kind = if gap < self.window {
            ConflictKind::ConcurrentUpdate
        } else {
            ConflictKind::ContentMismatch
        };

        Some(DetectedConflict { kind, fields })
    }

    /// Decide which side wins. `Smart` compares modification timestamps;
    /// a tie goes to the remote side so that both replicas of the same
    /// engine converge on the provider's copy.
    pub fn resolve(&self, local: &Event, remote: &Event) -> Resolution {
        match self.strategy {
            ConflictStrategy::LocalWins => Resolution::UpdateRemote,
            ConflictStrategy::RemoteWins => Resolution::UpdateLocal,
            ConflictStrategy::Smart => {
                let remote_updated = remote
                    .remote_updated_at
                    .unwrap_or(remote.local_updated_at);
                if local.local_updated_at > remote_updated {
                    Resolution::UpdateRemote
                } else {
                    Resolution::UpdateLocal
                }
            }
            ConflictStrategy::Manual => Resolution::Manual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn pair(local_updated: DateTime<Utc>, remote_updated: DateTime<Utc>) -> (Event, Event) {
        let mut local = Event::new_local("fam-1", "Dinner", t(0), t(3600), local_updated);
        local.remote_id = Some("r-1".to_string());

        let mut remote = local.clone();
        remote.title = "Dinner (moved)".to_string();
        remote.remote_updated_at = Some(remote_updated);
        remote.local_updated_at = remote_updated;
        (local, remote)
    }

    #[test]
    fn test_identical_content_is_not_a_conflict() {
        let resolver = ConflictResolver::new(ConflictStrategy::Smart, 5);
        let (local, mut remote) = pair(t(0), t(10));
        remote.title = local.title.clone();
        assert_eq!(resolver.detect(&local, &remote), None);
    }

    #[test]
    fn test_concurrent_window_classification() {
        let resolver = ConflictResolver::new(ConflictStrategy::Smart, 5);

        let (local, remote) = pair(t(0), t(120));
        let detected = resolver.detect(&local, &remote).unwrap();
        assert_eq!(detected.kind, ConflictKind::ConcurrentUpdate);
        assert_eq!(detected.fields, vec!["title"]);

        let (local, remote) = pair(t(0), t(3600));
        let detected = resolver.detect(&local, &remote).unwrap();
        assert_eq!(detected.kind, ConflictKind::ContentMismatch);
    }

    #[test]
    fn test_smart_is_last_writer_wins_both_directions() {
        let resolver = ConflictResolver::new(ConflictStrategy::Smart, 5);

        // Local edited at T+10, remote at T+5: local wins.
        let (local, remote) = pair(t(10), t(5));
        assert_eq!(resolver.resolve(&local, &remote), Resolution::UpdateRemote);

        // Reverse timestamps: remote wins.
        let (local, remote) = pair(t(5), t(10));
        assert_eq!(resolver.resolve(&local, &remote), Resolution::UpdateLocal);
    }

    #[test]
    fn test_smart_tie_prefers_remote() {
        let resolver = ConflictResolver::new(ConflictStrategy::Smart, 5);
        let (local, remote) = pair(t(7), t(7));
        assert_eq!(resolver.resolve(&local, &remote), Resolution::UpdateLocal);
    }

    #[test]
    fn test_fixed_strategies() {
        let (local, remote) = pair(t(0), t(9999));
        let local_wins = ConflictResolver::new(ConflictStrategy::LocalWins, 5);
        assert_eq!(local_wins.resolve(&local, &remote), Resolution::UpdateRemote);

        let remote_wins = ConflictResolver::new(ConflictStrategy::RemoteWins, 5);
        assert_eq!(remote_wins.resolve(&local, &remote), Resolution::UpdateLocal);

        let manual = ConflictResolver::new(ConflictStrategy::Manual, 5);
        assert_eq!(manual.resolve(&local, &remote), Resolution::Manual);
    }
}
