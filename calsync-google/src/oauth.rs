//! OAuth2 authorization-code flow against Google's endpoints.
//!
//! The interactive flow opens the system browser and receives the
//! authorization code on a localhost listener; the silent path exchanges a
//! refresh token at the token endpoint. Both hand back a [`TokenResponse`]
//! for the token manager to install.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;

use serde::Deserialize;
use uuid::Uuid;

use calsync_core::{SyncError, SyncResult};

use crate::client::transport_error;
use crate::token::AuthConfig;

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenInfo {
    #[serde(default)]
    pub email: Option<String>,
}

fn consent_url(config: &AuthConfig, state: &str, prompt: Option<&str>) -> SyncResult<String> {
    let mut url = url::Url::parse(&config.auth_url)
        .map_err(|e| SyncError::Provider(format!("bad auth url: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &config.redirect_uri())
            .append_pair("response_type", "code")
            .append_pair("scope", &config.scopes.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("state", state);
        if let Some(prompt) = prompt {
            query.append_pair("prompt", prompt);
        }
    }
    Ok(url.to_string())
}

/// Start a local HTTP server to receive the OAuth callback.
fn wait_for_callback(port: u16) -> SyncResult<(String, String)> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .map_err(|e| SyncError::Provider(format!("failed to bind to port {port}: {e}")))?;

    eprintln!("Waiting for OAuth callback on port {}...", port);

    let (mut stream, _) = listener.accept()?;

    let mut reader = BufReader::new(&stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    // Parse the request to get the code and state
    let url_part = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| SyncError::Auth("invalid callback request".into()))?;

    let url = url::Url::parse(&format!("http://localhost{url_part}"))
        .map_err(|e| SyncError::Auth(format!("invalid callback url: {e}")))?;

    let code = url
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.to_string())
        .ok_or_else(|| SyncError::Auth("no code in callback".into()))?;

    let state = url
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.to_string())
        .ok_or_else(|| SyncError::Auth("no state in callback".into()))?;

    // Send a response to the browser
    let response = "HTTP/1.1 200 OK\r\n\
        Content-Type: text/html\r\n\
        Connection: close\r\n\
        \r\n\
        <html><body>\
        <h1>Authentication successful!</h1>\
        <p>You can close this window and return to the terminal.</p>\
        </body></html>";

    stream.write_all(response.as_bytes())?;
    stream.flush()?;

    Ok((code, state))
}

/// Run the full browser-based authorization-code flow.
pub(crate) async fn interactive_flow(
    config: &AuthConfig,
    http: &reqwest::Client,
    prompt: Option<&str>,
) -> SyncResult<TokenResponse> {
    let state = Uuid::new_v4().to_string();
    let auth_url = consent_url(config, &state, prompt)?;

    eprintln!("\nOpen this URL in your browser to authenticate:\n");
    eprintln!("{}\n", auth_url);

    // Try to open the browser automatically
    if open::that(&auth_url).is_err() {
        eprintln!("(Could not open browser automatically, please copy the URL above)");
    }

    let port = config.redirect_port;
    let joined = tokio::task::spawn_blocking(move || wait_for_callback(port))
        .await
        .map_err(|e| SyncError::Provider(format!("callback listener failed: {e}")))?;
    let (code, returned_state) = joined?;

    if returned_state != state {
        return Err(SyncError::Auth("OAuth state mismatch in callback".into()));
    }

    eprintln!("\nReceived authorization code, exchanging for tokens...");
    exchange_code(http, config, &code).await
}

pub(crate) async fn exchange_code(
    http: &reqwest::Client,
    config: &AuthConfig,
    code: &str,
) -> SyncResult<TokenResponse> {
    let redirect_uri = config.redirect_uri();
    let params = [
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
        ("code", code),
        ("grant_type", "authorization_code"),
        ("redirect_uri", redirect_uri.as_str()),
    ];
    post_token(http, config, &params).await
}

pub(crate) async fn refresh_access_token(
    http: &reqwest::Client,
    config: &AuthConfig,
    refresh_token: &str,
) -> SyncResult<TokenResponse> {
    let params = [
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];
    post_token(http, config, &params).await
}

async fn post_token(
    http: &reqwest::Client,
    config: &AuthConfig,
    params: &[(&str, &str)],
) -> SyncResult<TokenResponse> {
    let response = http
        .post(&config.token_url)
        .form(params)
        .send()
        .await
        .map_err(transport_error)?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(SyncError::Auth(format!(
            "token endpoint returned HTTP {status}: {body}"
        )));
    }

    response
        .json()
        .await
        .map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Introspect an access token to discover the authenticated account.
pub(crate) async fn fetch_token_info(
    http: &reqwest::Client,
    config: &AuthConfig,
    access_token: &str,
) -> SyncResult<TokenInfo> {
    let response = http
        .get(&config.tokeninfo_url)
        .query(&[("access_token", access_token)])
        .send()
        .await
        .map_err(transport_error)?;

    if !response.status().is_success() {
        return Ok(TokenInfo::default());
    }

    response
        .json()
        .await
        .map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Best-effort provider-side token revocation.
pub(crate) async fn revoke_token(
    http: &reqwest::Client,
    config: &AuthConfig,
    access_token: &str,
) -> SyncResult<()> {
    let response = http
        .post(&config.revoke_url)
        .form(&[("token", access_token)])
        .send()
        .await
        .map_err(transport_error)?;

    if !response.status().is_success() {
        return Err(SyncError::Provider(format!(
            "revocation returned HTTP {}",
            response.status().as_u16()
        )));
    }
    Ok(())
}
