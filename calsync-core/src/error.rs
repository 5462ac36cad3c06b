//! Error types for the calsync engine.

use thiserror::Error;

/// Errors that can occur during calendar synchronization.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid, expired or revoked credential. Requires interactive re-consent.
    #[error("authentication required: {0}")]
    Auth(String),

    /// Provider rate limit (HTTP 429). Retried with exponential backoff.
    #[error("rate limited by provider")]
    RateLimited,

    /// Provider-side failure (HTTP 5xx). Retried with linear backoff.
    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    /// No connectivity. Pending mutations go to the offline queue.
    #[error("network unavailable: {0}")]
    Network(String),

    /// The incremental sync token was invalidated by the provider (HTTP 410).
    #[error("sync token expired")]
    TokenExpired,

    /// Malformed event payload. Logged and skipped, never aborts a batch.
    #[error("invalid event payload: {0}")]
    Validation(String),

    /// A sync is already running for this scope. Callers retry on the next tick.
    #[error("sync already in progress")]
    AlreadyRunning,

    /// The engine was used before `initialize` bound it to a scope.
    #[error("engine not initialized: {0}")]
    NotInitialized(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Classify an HTTP status code returned by the provider.
    pub fn from_status(status: u16, body: impl Into<String>) -> SyncError {
        match status {
            401 => SyncError::Auth(body.into()),
            410 => SyncError::TokenExpired,
            429 => SyncError::RateLimited,
            s if s >= 500 => SyncError::Server { status: s },
            _ => SyncError::Provider(format!("HTTP {}: {}", status, body.into())),
        }
    }

    /// Whether the offline queue should absorb this failure instead of
    /// surfacing it to the caller.
    pub fn is_offline(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

/// Result type alias for calsync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(SyncError::from_status(401, ""), SyncError::Auth(_)));
        assert!(matches!(
            SyncError::from_status(410, ""),
            SyncError::TokenExpired
        ));
        assert!(matches!(
            SyncError::from_status(429, ""),
            SyncError::RateLimited
        ));
        assert!(matches!(
            SyncError::from_status(503, ""),
            SyncError::Server { status: 503 }
        ));
        assert!(matches!(
            SyncError::from_status(404, "missing"),
            SyncError::Provider(_)
        ));
    }
}
