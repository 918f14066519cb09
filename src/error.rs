//! Error taxonomy for the sync engine.
//!
//! Adapter-level transient failures are retried internally and only surface
//! here once the retry policy is exhausted. OAuth-flow errors are returned
//! directly to the caller and never mutate job or integration state.

use thiserror::Error;

/// Errors surfaced by the OAuth flow, provider adapters, and persistence
/// layers.
#[derive(Debug, Error)]
pub enum SyncError {
    /// State token failed decryption, is missing required fields, or is
    /// older than the 5-minute TTL. The caller must restart the flow.
    #[error("invalid OAuth state token: {0}")]
    InvalidState(String),

    /// The upstream token endpoint returned a non-2xx response during code
    /// exchange. The caller must restart the flow.
    #[error("token exchange failed: {0}")]
    OAuthExchangeFailed(String),

    /// The provider returned an empty ad-account list for this login.
    #[error("no ad accounts available for this login")]
    NoAccountsAvailable,

    /// 429/5xx persisted past the retry limit.
    #[error("provider unavailable after retries: {0}")]
    UpstreamUnavailable(String),

    /// 401/403 from the provider. The job runner refreshes once and retries
    /// the request exactly once before letting this escape.
    #[error("provider rejected the access token")]
    UpstreamAuthExpired,

    /// The metric store could not be reached or refused the write. Fails
    /// the job; integration status is left untouched.
    #[error("metric store unavailable: {0}")]
    PersistenceUnavailable(String),

    /// App credentials or developer token absent for the provider. Fails
    /// fast, never retried.
    #[error("missing configuration: {0}")]
    ConfigurationMissing(&'static str),
}

impl SyncError {
    /// True for errors the retry policy may spend attempts on.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::UpstreamUnavailable(_))
    }
}
