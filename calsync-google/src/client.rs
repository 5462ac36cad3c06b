//! Google Calendar REST adapter.
//!
//! Implements [`RemoteCalendar`] over the v3 REST API. Every call goes
//! through `execute_with_retry`, which keeps the credential fresh and
//! absorbs transient provider failures: 401 buys at most one forced token
//! refresh per call, 429 backs off exponentially (capped at 30s), 5xx
//! retries linearly, anything else fails immediately. Retries are
//! sequential, never parallel, to respect provider rate limits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeZone;
use tracing::debug;

use calsync_core::{
    DateRange, Event, EventPage, RemoteCalendar, SyncConfig, SyncError, SyncResult, WatchChannel,
    WatchRequest,
};

use crate::token::TokenSource;
use crate::wire;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";
const MAX_BACKOFF_MS: u64 = 30_000;

/// Classify a reqwest transport failure.
pub(crate) fn transport_error(error: reqwest::Error) -> SyncError {
    if error.is_connect() || error.is_timeout() {
        SyncError::Network(error.to_string())
    } else {
        SyncError::Provider(error.to_string())
    }
}

/// Turn a non-success response into the matching error.
async fn response_error(response: reqwest::Response) -> SyncError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    // Google signals per-user rate limiting as 403 with a reason code.
    if status == 403 && (body.contains("rateLimitExceeded") || body.contains("usageLimits")) {
        return SyncError::RateLimited;
    }
    SyncError::from_status(status, body)
}

async fn check_status(response: reqwest::Response) -> SyncResult<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(response_error(response).await)
    }
}

pub struct GoogleCalendarClient {
    http: reqwest::Client,
    auth: Arc<dyn TokenSource>,
    base_url: String,
    calendar_id: String,
    max_retries: u32,
    retry_delay: Duration,
    max_results: u32,
}

impl GoogleCalendarClient {
    pub fn new(auth: Arc<dyn TokenSource>, config: &SyncConfig) -> GoogleCalendarClient {
        GoogleCalendarClient {
            http: reqwest::Client::new(),
            auth,
            base_url: DEFAULT_BASE_URL.to_string(),
            calendar_id: "primary".to_string(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_results: config.max_results,
        }
    }

    pub fn with_calendar_id(mut self, calendar_id: &str) -> Self {
        self.calendar_id = calendar_id.to_string();
        self
    }

    fn events_url(&self) -> String {
        format!("{}/calendars/{}/events", self.base_url, self.calendar_id)
    }

    /// Run one remote call with authentication-aware retry.
    ///
    /// Before each attempt the token is validated (and silently renewed if
    /// needed). A 401 forces at most ONE token refresh per call — an
    /// explicit bound independent of the generic retry budget, so an
    /// auth loop can never chain with transport retries.
    pub(crate) async fn execute_with_retry<T, F, Fut>(&self, call: F) -> SyncResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut refreshed = false;
        let mut last_error: Option<SyncError> = None;

        for attempt in 0..self.max_retries {
            let access_token = self.auth.ensure_valid().await?;

            match call(access_token).await {
                Ok(value) => return Ok(value),
                Err(SyncError::Auth(message)) => {
                    if refreshed || self.auth.force_refresh().await.is_err() {
                        return Err(SyncError::Auth("authentication required".into()));
                    }
                    refreshed = true;
                    last_error = Some(SyncError::Auth(message));
                }
                Err(SyncError::RateLimited) => {
                    let delay = Duration::from_millis((1000u64 << attempt).min(MAX_BACKOFF_MS));
                    debug!(attempt, ?delay, "rate limited, backing off");
                    tokio::time::sleep(delay).await;
                    last_error = Some(SyncError::RateLimited);
                }
                Err(e @ SyncError::Server { .. }) => {
                    let delay = self.retry_delay * (attempt + 1);
                    debug!(attempt, ?delay, "server error, retrying");
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::Provider("retries exhausted".into())))
    }

    async fn fetch_page(
        &self,
        access_token: &str,
        range: Option<&DateRange>,
        sync_token: Option<&str>,
        page_token: Option<&str>,
    ) -> SyncResult<wire::EventsListResponse> {
        let mut request = self
            .http
            .get(self.events_url())
            .bearer_auth(access_token)
            .query(&[("maxResults", self.max_results.to_string())]);

        if let Some(range) = range {
            request = request.query(&[
                ("timeMin", range.start.to_rfc3339()),
                ("timeMax", range.end.to_rfc3339()),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
            ]);
        }
        if let Some(token) = sync_token {
            request = request.query(&[("syncToken", token), ("showDeleted", "true")]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request.send().await.map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Follow `nextPageToken` until the provider window is exhausted.
    async fn fetch_all(
        &self,
        range: Option<&DateRange>,
        sync_token: Option<&str>,
    ) -> SyncResult<EventPage> {
        let mut items = Vec::new();
        let mut next_sync_token = None;
        let mut page_token: Option<String> = None;

        loop {
            let current = page_token.clone();
            let page = self
                .execute_with_retry(|access_token| {
                    let current = current.clone();
                    async move {
                        self.fetch_page(&access_token, range, sync_token, current.as_deref())
                            .await
                    }
                })
                .await?;

            items.extend(page.items.into_iter().map(wire::GoogleEvent::into_remote));
            if page.next_sync_token.is_some() {
                next_sync_token = page.next_sync_token;
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(EventPage {
            items,
            next_sync_token,
        })
    }
}

#[async_trait]
impl RemoteCalendar for GoogleCalendarClient {
    async fn list_events(&self, range: &DateRange) -> SyncResult<EventPage> {
        self.fetch_all(Some(range), None).await
    }

    async fn changes_since(&self, sync_token: &str) -> SyncResult<EventPage> {
        self.fetch_all(None, Some(sync_token)).await
    }

    async fn insert_event(&self, event: &Event) -> SyncResult<calsync_core::RemoteEvent> {
        let mut body = wire::GoogleEvent::from_local(event);
        body.id = String::new(); // Let the provider assign the id

        let created: wire::GoogleEvent = self
            .execute_with_retry(|access_token| {
                let body = body.clone();
                async move {
                    let response = self
                        .http
                        .post(self.events_url())
                        .bearer_auth(&access_token)
                        .json(&body)
                        .send()
                        .await
                        .map_err(transport_error)?;
                    let response = check_status(response).await?;
                    response
                        .json()
                        .await
                        .map_err(|e| SyncError::Serialization(e.to_string()))
                }
            })
            .await?;
        Ok(created.into_remote())
    }

    async fn update_event(
        &self,
        remote_id: &str,
        event: &Event,
    ) -> SyncResult<calsync_core::RemoteEvent> {
        let body = wire::GoogleEvent::from_local(event);
        let url = format!("{}/{}", self.events_url(), remote_id);

        let updated: wire::GoogleEvent = self
            .execute_with_retry(|access_token| {
                let body = body.clone();
                let url = url.clone();
                async move {
                    let response = self
                        .http
                        .put(&url)
                        .bearer_auth(&access_token)
                        .json(&body)
                        .send()
                        .await
                        .map_err(transport_error)?;
                    let response = check_status(response).await?;
                    response
                        .json()
                        .await
                        .map_err(|e| SyncError::Serialization(e.to_string()))
                }
            })
            .await?;
        Ok(updated.into_remote())
    }

    async fn delete_event(&self, remote_id: &str) -> SyncResult<()> {
        let url = format!("{}/{}", self.events_url(), remote_id);

        self.execute_with_retry(|access_token| {
            let url = url.clone();
            async move {
                let response = self
                    .http
                    .delete(&url)
                    .bearer_auth(&access_token)
                    .send()
                    .await
                    .map_err(transport_error)?;
                let status = response.status().as_u16();
                // Already deleted on the provider side is success.
                if response.status().is_success() || status == 404 || status == 410 {
                    return Ok(());
                }
                Err(response_error(response).await)
            }
        })
        .await
    }

    async fn watch(&self, request: &WatchRequest) -> SyncResult<WatchChannel> {
        let body = wire::WatchRequestBody {
            id: request.id.clone(),
            kind: "web_hook".to_string(),
            address: request.address.clone(),
            expiration: request.expiration.timestamp_millis(),
        };
        let url = format!("{}/watch", self.events_url());

        let registered: wire::WatchResponse = self
            .execute_with_retry(|access_token| {
                let body = body.clone();
                let url = url.clone();
                async move {
                    let response = self
                        .http
                        .post(&url)
                        .bearer_auth(&access_token)
                        .json(&body)
                        .send()
                        .await
                        .map_err(transport_error)?;
                    let response = check_status(response).await?;
                    response
                        .json()
                        .await
                        .map_err(|e| SyncError::Serialization(e.to_string()))
                }
            })
            .await?;

        let expiration = registered
            .expiration
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| chrono::Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(request.expiration);

        Ok(WatchChannel {
            id: registered.id,
            resource_id: registered.resource_id,
            expiration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    struct StubAuth {
        refreshes: AtomicUsize,
        fail_refresh: bool,
    }

    impl StubAuth {
        fn new(fail_refresh: bool) -> Arc<StubAuth> {
            Arc::new(StubAuth {
                refreshes: AtomicUsize::new(0),
                fail_refresh,
            })
        }
    }

    #[async_trait]
    impl TokenSource for StubAuth {
        fn is_valid(&self) -> bool {
            true
        }

        async fn ensure_valid(&self) -> SyncResult<String> {
            Ok("access-token".to_string())
        }

        async fn force_refresh(&self) -> SyncResult<String> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.fail_refresh {
                Err(SyncError::Auth("refresh rejected".into()))
            } else {
                Ok("fresh-token".to_string())
            }
        }
    }

    fn client(auth: Arc<StubAuth>) -> GoogleCalendarClient {
        GoogleCalendarClient::new(auth, &SyncConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backoff_is_exponential() {
        let client = client(StubAuth::new(false));
        let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

        let attempts2 = Arc::clone(&attempts);
        let result: SyncResult<()> = client
            .execute_with_retry(move |_| {
                let attempts = Arc::clone(&attempts2);
                async move {
                    attempts.lock().push(Instant::now());
                    Err(SyncError::RateLimited)
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::RateLimited)));
        let attempts = attempts.lock();
        assert_eq!(attempts.len(), 3);
        // 1000ms before the second attempt, 2000ms more before the third.
        assert_eq!((attempts[1] - attempts[0]).as_millis(), 1000);
        assert_eq!((attempts[2] - attempts[1]).as_millis(), 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_retry_linearly_then_succeed() {
        let client = client(StubAuth::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = Arc::clone(&calls);
        let started = Instant::now();
        let result = client
            .execute_with_retry(move |_| {
                let calls = Arc::clone(&calls2);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::Server { status: 503 })
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // retry_delay * 1 + retry_delay * 2.
        assert_eq!(started.elapsed().as_millis(), 3000);
    }

    #[tokio::test]
    async fn test_single_forced_refresh_per_call() {
        let auth = StubAuth::new(false);
        let client = client(Arc::clone(&auth));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = Arc::clone(&calls);
        let result: SyncResult<()> = client
            .execute_with_retry(move |_| {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::Auth("401".into()))
                }
            })
            .await;

        // Second 401 after the one allowed refresh fails the call.
        assert!(matches!(result, Err(SyncError::Auth(_))));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_surfaces_auth_error_immediately() {
        let auth = StubAuth::new(true);
        let client = client(Arc::clone(&auth));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = Arc::clone(&calls);
        let result: SyncResult<()> = client
            .execute_with_retry(move |_| {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::Auth("401".into()))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, SyncError::Auth(message) if message == "authentication required"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_fast() {
        let client = client(StubAuth::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = Arc::clone(&calls);
        let result: SyncResult<()> = client
            .execute_with_retry(move |_| {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::Validation("bad payload".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
