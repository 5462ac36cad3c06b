//! Provider push-notification endpoint.
//!
//! Google posts here when calendar data changes. The notification carries
//! only headers (channel id + resource state), no body; the handler kicks
//! off an incremental sync and always answers 200 — the provider disables
//! the channel on any non-2xx response, so even a failed sync must not
//! leak into the status code.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use tracing::{debug, warn};

use calsync_core::SyncError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/calendar-webhook/{scope}", post(receive))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// POST /calendar-webhook/{scope}
async fn receive(
    State(state): State<AppState>,
    Path(scope): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    let channel = header(&headers, "x-goog-channel-id").unwrap_or("-");
    let resource_state = header(&headers, "x-goog-resource-state").unwrap_or("-");
    debug!(scope = %scope, channel = %channel, resource_state = %resource_state, "webhook notification");

    // The initial "sync" ping on channel creation carries no changes.
    if resource_state == "sync" {
        return StatusCode::OK;
    }

    if state.engine.scope().as_deref() != Some(scope.as_str()) {
        warn!(scope = %scope, "notification for a scope this engine does not serve");
        return StatusCode::OK;
    }

    let engine = state.engine.clone();
    tokio::spawn(async move {
        match engine.perform_incremental_sync().await {
            Ok(_) | Err(SyncError::AlreadyRunning) => {}
            Err(e) => warn!(error = %e, "webhook-triggered sync failed"),
        }
    });

    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::{
        InMemoryRemote, ManualClock, MemoryEventStore, SyncConfig, SyncEngine,
    };
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    async fn app_state() -> AppState {
        let engine = SyncEngine::new(
            Arc::new(MemoryEventStore::new()),
            Arc::new(InMemoryRemote::new()),
            ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            SyncConfig::default(),
        );
        engine.initialize("fam-1").await.unwrap();
        AppState::new(engine)
    }

    #[tokio::test]
    async fn test_notification_returns_ok_and_triggers_sync() {
        let state = app_state().await;
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-channel-id", "chan-1".parse().unwrap());
        headers.insert("x-goog-resource-state", "exists".parse().unwrap());

        let status = receive(State(state), Path("fam-1".to_string()), headers).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_scope_still_returns_ok() {
        let state = app_state().await;
        let status = receive(
            State(state),
            Path("someone-else".to_string()),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_initial_sync_ping_is_acknowledged_without_syncing() {
        let state = app_state().await;
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-resource-state", "sync".parse().unwrap());

        let status = receive(State(state), Path("fam-1".to_string()), headers).await;
        assert_eq!(status, StatusCode::OK);
    }
}
