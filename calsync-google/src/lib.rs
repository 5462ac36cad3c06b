//! Google Calendar provider for calsync.
//!
//! Supplies the two provider-specific pieces the engine depends on:
//! [`TokenManager`], which owns the OAuth2 access-token lifecycle, and
//! [`GoogleCalendarClient`], the production [`calsync_core::RemoteCalendar`]
//! adapter with authentication-aware retry around every REST call.

pub mod app_config;
pub mod client;
pub mod token;
pub mod vault;

mod oauth;
mod wire;

pub use app_config::AppConfig;
pub use client::GoogleCalendarClient;
pub use token::{AuthConfig, AuthEvent, AuthOptions, Token, TokenManager, TokenSource};
pub use vault::{DurableTokenStore, FileTokenStore, MemoryTokenStore, TokenVault};
