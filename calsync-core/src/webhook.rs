//! Push-notification channel management.
//!
//! Registers a watch channel with the provider so changes arrive as HTTP
//! notifications instead of being discovered by polling. Channels expire;
//! a renewal task re-registers ahead of expiry. Registration failure is
//! reported, not raised: the caller falls back to periodic sync, which
//! stays armed as the safety net regardless of webhook health.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::remote::{RemoteCalendar, WatchRequest};
use crate::state::SyncState;
use crate::store::LocalEventStore;

/// Channel lifetime requested at registration. The provider may assign a
/// shorter one; the renewal task follows whatever came back.
const CHANNEL_TTL_DAYS: i64 = 7;

pub struct WebhookManager {
    remote: Arc<dyn RemoteCalendar>,
    store: Arc<dyn LocalEventStore>,
    clock: Arc<dyn Clock>,
    base_url: Option<String>,
    renewal_buffer: Duration,
    renewal: Mutex<Option<JoinHandle<()>>>,
    weak: Weak<WebhookManager>,
}

impl WebhookManager {
    pub fn new(
        remote: Arc<dyn RemoteCalendar>,
        store: Arc<dyn LocalEventStore>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Arc<WebhookManager> {
        Arc::new_cyclic(|weak| WebhookManager {
            remote,
            store,
            clock,
            base_url: config.webhook_base_url.clone(),
            renewal_buffer: Duration::seconds(config.webhook_renewal_buffer_secs as i64),
            renewal: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Register a push channel for the scope. Returns `Ok(false)` — never
    /// an error — when no webhook URL is configured or the provider rejects
    /// the registration, so callers can fall back to polling.
    pub async fn setup(&self, scope: &str) -> SyncResult<bool> {
        let Some(base) = &self.base_url else {
            return Ok(false);
        };
        let address = format!("{}/calendar-webhook/{}", base.trim_end_matches('/'), scope);
        let request = WatchRequest {
            id: format!("watch-{}-{}", scope, Uuid::new_v4()),
            address,
            expiration: self.clock.now() + Duration::days(CHANNEL_TTL_DAYS),
        };

        let channel = match self.remote.watch(&request).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(scope = %scope, error = %e, "webhook registration failed");
                return Ok(false);
            }
        };

        let mut state = self
            .store
            .load_sync_state(scope)
            .await?
            .unwrap_or_else(|| SyncState::new(scope));
        state.webhook_channel_id = Some(channel.id.clone());
        state.webhook_expiry = Some(channel.expiration);
        self.store.save_sync_state(&state).await?;

        info!(scope = %scope, channel = %channel.id, "webhook channel registered");
        self.schedule_renewal(scope, channel.expiration);
        Ok(true)
    }

    /// Arm a one-shot renewal ahead of channel expiry.
    fn schedule_renewal(&self, scope: &str, expiry: DateTime<Utc>) {
        let delay = expiry - self.renewal_buffer - self.clock.now();
        let Ok(delay) = delay.to_std() else {
            // Already inside the renewal window; the next setup call will
            // re-register.
            return;
        };
        let Some(manager) = self.weak.upgrade() else {
            return;
        };

        let scope = scope.to_string();
        let mut renewal = self.renewal.lock();
        if let Some(task) = renewal.take() {
            task.abort();
        }
        *renewal = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match manager.setup(&scope).await {
                Ok(true) => {}
                Ok(false) => warn!(scope = %scope, "webhook renewal was rejected"),
                Err(e) => warn!(scope = %scope, error = %e, "webhook renewal failed"),
            }
        }));
    }

    pub fn cancel_renewal(&self) {
        if let Some(task) = self.renewal.lock().take() {
            task.abort();
        }
    }

    pub fn renewal_armed(&self) -> bool {
        self.renewal
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::InMemoryRemote;
    use crate::store::MemoryEventStore;
    use chrono::TimeZone;

    fn config_with_base() -> SyncConfig {
        SyncConfig {
            webhook_base_url: Some("https://app.example.com/api".to_string()),
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_setup_persists_channel_and_arms_renewal() {
        let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let remote = Arc::new(InMemoryRemote::new());
        let store = Arc::new(MemoryEventStore::new());
        let manager = WebhookManager::new(
            remote.clone(),
            store.clone(),
            clock,
            &config_with_base(),
        );

        assert!(manager.setup("fam-1").await.unwrap());
        assert!(manager.renewal_armed());

        let state = store.load_sync_state("fam-1").await.unwrap().unwrap();
        assert!(state.webhook_channel_id.is_some());
        assert!(state.webhook_expiry.is_some());

        manager.cancel_renewal();
        assert!(!manager.renewal_armed());
    }

    #[tokio::test]
    async fn test_setup_reports_failure_instead_of_erroring() {
        let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let remote = Arc::new(InMemoryRemote::new());
        remote.fail_watch();
        let store = Arc::new(MemoryEventStore::new());
        let manager = WebhookManager::new(
            remote.clone(),
            store.clone(),
            clock,
            &config_with_base(),
        );

        assert!(!manager.setup("fam-1").await.unwrap());
        assert!(!manager.renewal_armed());
    }

    #[tokio::test]
    async fn test_setup_without_base_url_is_unavailable() {
        let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let remote = Arc::new(InMemoryRemote::new());
        let store = Arc::new(MemoryEventStore::new());
        let manager =
            WebhookManager::new(remote, store, clock, &SyncConfig::default());

        assert!(!manager.setup("fam-1").await.unwrap());
        assert_eq!(manager.renewal_armed(), false);
    }
}
