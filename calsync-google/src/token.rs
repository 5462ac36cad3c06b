//! OAuth2 access-token lifecycle.
//!
//! `TokenManager` owns acquisition (interactive and silent), refresh
//! scheduling, encrypted-at-rest persistence and revocation. Every
//! successful authenticate/refresh notifies subscribers; a failed
//! scheduled refresh emits `needs_reauth` instead of throwing into the
//! background task.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use calsync_core::bus::{Bus, Subscription};
use calsync_core::{Clock, SyncError, SyncResult};

use crate::oauth;
use crate::vault::{DurableTokenStore, TokenVault};

/// `is_valid` reports false this long before actual expiry, so calls never
/// start with a token about to die mid-flight.
const VALIDITY_BUFFER_SECS: i64 = 60;

/// Scheduled refresh fires this long before expiry.
const REFRESH_BUFFER_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub auth_url: String,
    pub token_url: String,
    pub tokeninfo_url: String,
    pub revoke_url: String,
    pub redirect_port: u16,
}

impl AuthConfig {
    pub fn new(client_id: &str, client_secret: &str) -> AuthConfig {
        AuthConfig {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scopes: vec!["https://www.googleapis.com/auth/calendar".to_string()],
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            tokeninfo_url: "https://oauth2.googleapis.com/tokeninfo".to_string(),
            revoke_url: "https://oauth2.googleapis.com/revoke".to_string(),
            redirect_port: 8085,
        }
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/callback", self.redirect_port)
    }
}

/// A live credential. Superseded atomically on refresh: the whole value is
/// swapped, so expiry and token text never disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
    pub owner_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    /// Consent-screen prompt for the interactive flow (e.g. "select_account").
    pub prompt: Option<String>,
    /// Refresh even when the current token is still valid.
    pub force_refresh: bool,
    /// Never open the interactive flow; fail if silent refresh cannot work.
    pub silent: bool,
}

/// Notification payload for auth listeners.
#[derive(Debug, Clone, Default)]
pub struct AuthEvent {
    pub authenticated: bool,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Silent refresh is no longer possible; interactive re-consent needed.
    pub needs_reauth: bool,
    pub owner_email: Option<String>,
}

/// Token operations the retry loop depends on. Lets tests drive the retry
/// policy without a live OAuth session.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn is_valid(&self) -> bool;
    /// Return a usable access token, silently authenticating if needed.
    async fn ensure_valid(&self) -> SyncResult<String>;
    /// Force a refresh and return the new access token.
    async fn force_refresh(&self) -> SyncResult<String>;
}

pub struct TokenManager {
    config: AuthConfig,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    cache: TokenVault,
    durable: Arc<dyn DurableTokenStore>,
    owner_id: String,
    token: Mutex<Option<Token>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    bus: Bus<AuthEvent>,
    weak: Weak<TokenManager>,
}

impl TokenManager {
    pub fn new(
        config: AuthConfig,
        clock: Arc<dyn Clock>,
        cache: TokenVault,
        durable: Arc<dyn DurableTokenStore>,
        owner_id: &str,
    ) -> Arc<TokenManager> {
        Arc::new_cyclic(|weak| TokenManager {
            config,
            http: reqwest::Client::new(),
            clock,
            cache,
            durable,
            owner_id: owner_id.to_string(),
            token: Mutex::new(None),
            refresh_task: Mutex::new(None),
            bus: Bus::new(),
            weak: weak.clone(),
        })
    }

    /// Restore a persisted session: fast cache first, durable store as
    /// fallback, discarding anything already expired.
    pub async fn load_stored(&self) -> SyncResult<bool> {
        match self.cache.load() {
            Ok(Some(token)) if !self.expired(&token) => {
                debug!(owner = %self.owner_id, "restored token from local cache");
                self.restore(token);
                return Ok(true);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "token cache unreadable, trying durable store"),
        }

        if let Some(token) = self.durable.load(&self.owner_id).await? {
            if !self.expired(&token) {
                debug!(owner = %self.owner_id, "restored token from durable store");
                if let Err(e) = self.cache.save(&token) {
                    warn!(error = %e, "failed to refill token cache");
                }
                self.restore(token);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Adopt an already-issued token (restored from storage) and arm the
    /// refresh timer. Emits no auth event.
    pub fn restore(&self, token: Token) {
        *self.token.lock() = Some(token);
        self.schedule_refresh();
    }

    fn expired(&self, token: &Token) -> bool {
        self.clock.now() >= token.expires_at
    }

    fn valid_token(&self) -> Option<Token> {
        let token = self.token.lock().clone()?;
        let safe_until = token.expires_at - Duration::seconds(VALIDITY_BUFFER_SECS);
        (self.clock.now() < safe_until).then_some(token)
    }

    /// True iff a token exists and expiry is more than the safety buffer
    /// away.
    pub fn is_valid(&self) -> bool {
        self.valid_token().is_some()
    }

    pub fn current(&self) -> Option<Token> {
        self.token.lock().clone()
    }

    pub fn on_auth_change(
        &self,
        listener: impl Fn(&AuthEvent) + Send + Sync + 'static,
    ) -> Subscription<AuthEvent> {
        self.bus.subscribe(listener)
    }

    /// Return a valid token. A live token is returned without any network
    /// traffic unless `force_refresh` is set. With `silent`, only the
    /// refresh grant is attempted; the interactive browser flow runs only
    /// when `silent` is false.
    pub async fn authenticate(&self, options: &AuthOptions) -> SyncResult<Token> {
        if !options.force_refresh {
            if let Some(token) = self.valid_token() {
                return Ok(token);
            }
        }

        let refresh_token = self
            .token
            .lock()
            .as_ref()
            .and_then(|t| t.refresh_token.clone());

        if let Some(refresh_token) = refresh_token {
            match self.refresh(&refresh_token).await {
                Ok(token) => return Ok(token),
                Err(e) if options.silent => {
                    return Err(SyncError::Auth(format!("silent refresh failed: {e}")));
                }
                Err(e) => {
                    warn!(error = %e, "refresh failed, falling back to interactive flow");
                }
            }
        } else if options.silent {
            return Err(SyncError::Auth(
                "no refresh token available for silent authentication".into(),
            ));
        }

        let response =
            oauth::interactive_flow(&self.config, &self.http, options.prompt.as_deref()).await?;
        self.install(response).await
    }

    async fn refresh(&self, refresh_token: &str) -> SyncResult<Token> {
        let mut response =
            oauth::refresh_access_token(&self.http, &self.config, refresh_token).await?;
        // Google typically doesn't return a new refresh_token on refresh.
        if response.refresh_token.is_none() {
            response.refresh_token = Some(refresh_token.to_string());
        }
        self.install(response).await
    }

    async fn install(&self, response: oauth::TokenResponse) -> SyncResult<Token> {
        let now = self.clock.now();
        let expires_at = now + Duration::seconds(response.expires_in.max(0));

        // Discover the authenticated account; best-effort.
        let owner_email = oauth::fetch_token_info(&self.http, &self.config, &response.access_token)
            .await
            .map(|info| info.email)
            .unwrap_or_else(|e| {
                debug!(error = %e, "tokeninfo lookup failed");
                None
            });

        let previous_refresh = self
            .token
            .lock()
            .as_ref()
            .and_then(|t| t.refresh_token.clone());

        let token = Token {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(previous_refresh),
            expires_at,
            scope: response
                .scope
                .unwrap_or_else(|| self.config.scopes.join(" ")),
            owner_id: self.owner_id.clone(),
        };

        // One atomic swap: value and expiry never change independently.
        *self.token.lock() = Some(token.clone());

        if let Err(e) = self.cache.save(&token) {
            warn!(error = %e, "failed to persist token to local cache");
        }
        if let Err(e) = self.durable.save(&self.owner_id, &token).await {
            warn!(error = %e, "failed to persist token to durable store");
        }

        self.schedule_refresh();
        info!(owner = %self.owner_id, expires_at = %token.expires_at, "token installed");

        self.bus.emit(&AuthEvent {
            authenticated: true,
            access_token: Some(token.access_token.clone()),
            expires_at: Some(token.expires_at),
            needs_reauth: false,
            owner_email,
        });

        Ok(token)
    }

    /// Arm a one-shot refresh ahead of expiry. Failure is reported through
    /// the auth bus as `needs_reauth`, never raised into the task.
    pub fn schedule_refresh(&self) {
        let Some(expires_at) = self.token.lock().as_ref().map(|t| t.expires_at) else {
            return;
        };
        let fire_at = expires_at - Duration::seconds(REFRESH_BUFFER_SECS);
        let delay = (fire_at - self.clock.now()).to_std().unwrap_or_default();

        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        let mut task = self.refresh_task.lock();
        if let Some(task) = task.take() {
            task.abort();
        }
        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let options = AuthOptions {
                silent: true,
                force_refresh: true,
                ..AuthOptions::default()
            };
            if let Err(e) = manager.authenticate(&options).await {
                warn!(error = %e, "scheduled token refresh failed");
                manager.bus.emit(&AuthEvent {
                    authenticated: false,
                    needs_reauth: true,
                    ..AuthEvent::default()
                });
            }
        }));
    }

    /// Invalidate the credential: best-effort provider revocation, both
    /// storage tiers cleared, refresh timer cancelled.
    pub async fn revoke(&self) -> SyncResult<()> {
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }

        let token = self.token.lock().take();
        if let Some(token) = &token {
            if let Err(e) = oauth::revoke_token(&self.http, &self.config, &token.access_token).await
            {
                debug!(error = %e, "provider-side revocation failed");
            }
        }

        self.cache.clear()?;
        self.durable.delete(&self.owner_id).await?;

        self.bus.emit(&AuthEvent {
            authenticated: false,
            ..AuthEvent::default()
        });
        info!(owner = %self.owner_id, "credential revoked");
        Ok(())
    }
}

#[async_trait]
impl TokenSource for TokenManager {
    fn is_valid(&self) -> bool {
        TokenManager::is_valid(self)
    }

    async fn ensure_valid(&self) -> SyncResult<String> {
        if let Some(token) = self.valid_token() {
            return Ok(token.access_token);
        }
        let token = self
            .authenticate(&AuthOptions {
                silent: true,
                ..AuthOptions::default()
            })
            .await?;
        Ok(token.access_token)
    }

    async fn force_refresh(&self) -> SyncResult<String> {
        let token = self
            .authenticate(&AuthOptions {
                silent: true,
                force_refresh: true,
                ..AuthOptions::default()
            })
            .await?;
        Ok(token.access_token)
    }
}
