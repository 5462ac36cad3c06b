mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use calsync_core::{system_clock, JsonFileStore, SyncEngine};
use calsync_google::{
    AppConfig, AuthConfig, FileTokenStore, GoogleCalendarClient, TokenManager, TokenVault,
};

use crate::state::AppState;

const DEFAULT_PORT: u16 = 4280;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;
    let clock = system_clock();

    let tokens = TokenManager::new(
        AuthConfig::new(&config.client_id, &config.client_secret),
        Arc::clone(&clock),
        TokenVault::new(&config.token_cache_dir()?, &config.owner_id)?,
        Arc::new(FileTokenStore::new(&config.durable_token_dir()?)?),
        &config.owner_id,
    );
    if !tokens.load_stored().await? {
        warn!("no stored credential; run `calsync-cli auth` first");
    }

    let store = Arc::new(JsonFileStore::open(&config.store_dir()?)?);
    let remote = Arc::new(
        GoogleCalendarClient::new(tokens.clone(), &config.sync)
            .with_calendar_id(&config.calendar_id),
    );
    let engine = SyncEngine::new(store, remote, clock, config.sync.clone());
    engine.initialize(&config.scope).await?;

    // Polling keeps running as the safety net even when the webhook
    // registration succeeds.
    engine.start_periodic_sync();
    let push = engine.enable_push_notifications().await?;
    info!(scope = %config.scope, push, "sync engine ready");

    // Held for the lifetime of the process so auth changes keep steering
    // the poller.
    let engine_for_auth = Arc::clone(&engine);
    let _auth_sub = tokens.on_auth_change(move |event| {
        engine_for_auth.handle_auth_change(event.authenticated);
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(routes::webhook::router())
        .merge(routes::status::router())
        .with_state(AppState::new(engine))
        .layer(cors);

    let addr = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT));
    info!("calsync-server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
