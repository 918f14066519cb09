//! Engine configuration.
//!
//! Everything is read from the environment at startup: per-provider OAuth
//! app credentials, the Google developer token, the shared secret that
//! authorizes scheduler/cron calls, and the credential encryption key.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::SyncError;
use crate::providers::ProviderKind;

/// Retry constants, named so behavior stays auditable.
pub mod retry {
    use std::time::Duration;

    /// Long-lived token extension: total attempts.
    pub const OAUTH_EXTEND_ATTEMPTS: u32 = 3;
    /// Long-lived token extension: backoff base.
    pub const OAUTH_BACKOFF_BASE: Duration = Duration::from_millis(500);
    /// Long-lived token extension: backoff cap.
    pub const OAUTH_BACKOFF_CAP: Duration = Duration::from_millis(5000);
    /// Long-lived token extension: jitter fraction (±20%).
    pub const OAUTH_BACKOFF_JITTER: f64 = 0.2;

    /// Provider fetch: extra attempts after the first.
    pub const FETCH_EXTRA_ATTEMPTS: u32 = 2;
    /// Provider fetch: backoff base, doubled per attempt.
    pub const FETCH_BACKOFF_BASE: Duration = Duration::from_millis(200);

    /// Pages fetched per job before the loop self-limits.
    pub const MAX_PAGES_PER_JOB: u32 = 10;

    /// A job left `running` longer than this is returned to the queue.
    pub const JOB_RECLAIM_TIMEOUT: Duration = Duration::from_secs(600);
}

/// OAuth app registration plus API endpoints for one provider.
///
/// Endpoint fields default per provider and are overridable so tests can
/// point adapters at a mock server.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderApp {
    pub client_id: String,
    pub client_secret: String,
    /// Google only: developer token sent on every Ads API request.
    pub developer_token: Option<String>,
    /// Base URL for the provider's data API.
    pub api_base_url: String,
    /// OAuth authorization endpoint (user-facing redirect target).
    pub auth_url: String,
    /// OAuth token endpoint (code exchange, refresh, long-lived extension).
    pub token_url: String,
    pub scopes: Vec<String>,
}

impl ProviderApp {
    /// App registration with the provider's production endpoints.
    pub fn new(kind: ProviderKind, client_id: String, client_secret: String) -> Self {
        let (api_base_url, auth_url, token_url, scopes) = match kind {
            ProviderKind::Google => (
                "https://googleads.googleapis.com",
                "https://accounts.google.com/o/oauth2/v2/auth",
                "https://oauth2.googleapis.com/token",
                vec!["https://www.googleapis.com/auth/adwords"],
            ),
            ProviderKind::Meta => (
                "https://graph.facebook.com/v19.0",
                "https://www.facebook.com/v19.0/dialog/oauth",
                "https://graph.facebook.com/v19.0/oauth/access_token",
                vec!["ads_read", "ads_management"],
            ),
            ProviderKind::TikTok => (
                "https://business-api.tiktok.com/open_api/v1.3",
                "https://business-api.tiktok.com/portal/auth",
                "https://business-api.tiktok.com/open_api/v1.3/oauth2/access_token/",
                vec!["ad.read", "report.read"],
            ),
            ProviderKind::LinkedIn => (
                "https://api.linkedin.com",
                "https://www.linkedin.com/oauth/v2/authorization",
                "https://www.linkedin.com/oauth/v2/accessToken",
                vec!["r_ads", "r_ads_reporting"],
            ),
        };
        Self {
            client_id,
            client_secret,
            developer_token: None,
            api_base_url: api_base_url.to_string(),
            auth_url: auth_url.to_string(),
            token_url: token_url.to_string(),
            scopes: scopes.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Build the provider authorization URL with state and redirect_uri.
    pub fn build_auth_url(&self, state: &str, redirect_uri: &str) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        )
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Base64-encoded 32-byte master key for at-rest token encryption.
    pub encryption_key: String,
    /// Shared secret authorizing /api/sync/* and /api/scheduler/* calls.
    pub scheduler_secret: String,
    pub integrations_db: String,
    pub jobs_db: String,
    pub metrics_db: String,
    pub api_port: u16,
    pub google: Option<ProviderApp>,
    pub meta: Option<ProviderApp>,
    pub tiktok: Option<ProviderApp>,
    pub linkedin: Option<ProviderApp>,
}

impl AppConfig {
    /// Read configuration from the environment.
    ///
    /// Provider app registrations are optional: a provider with no
    /// `ADSYNC_<PROVIDER>_CLIENT_ID` simply cannot be connected, and any
    /// attempt surfaces `ConfigurationMissing`.
    pub fn from_env() -> Result<Self> {
        let encryption_key = std::env::var("ADSYNC_ENCRYPTION_KEY")
            .context("ADSYNC_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;
        let scheduler_secret = std::env::var("ADSYNC_SCHEDULER_SECRET")
            .context("ADSYNC_SCHEDULER_SECRET is required")?;

        let api_port: u16 = std::env::var("ADSYNC_API_PORT")
            .unwrap_or_else(|_| "3002".to_string())
            .parse()
            .context("ADSYNC_API_PORT must be a valid port number")?;

        let mut google = provider_from_env(ProviderKind::Google);
        if let Some(app) = google.as_mut() {
            app.developer_token = std::env::var("ADSYNC_GOOGLE_DEVELOPER_TOKEN").ok();
        }

        Ok(Self {
            encryption_key,
            scheduler_secret,
            integrations_db: std::env::var("ADSYNC_INTEGRATIONS_DB")
                .unwrap_or_else(|_| "integrations.db".to_string()),
            jobs_db: std::env::var("ADSYNC_JOBS_DB")
                .unwrap_or_else(|_| "sync_jobs.db".to_string()),
            metrics_db: std::env::var("ADSYNC_METRICS_DB")
                .unwrap_or_else(|_| "metrics.db".to_string()),
            api_port,
            google,
            meta: provider_from_env(ProviderKind::Meta),
            tiktok: provider_from_env(ProviderKind::TikTok),
            linkedin: provider_from_env(ProviderKind::LinkedIn),
        })
    }

    /// App registration for a provider, or `ConfigurationMissing`.
    pub fn provider_app(&self, kind: ProviderKind) -> Result<&ProviderApp, SyncError> {
        let app = match kind {
            ProviderKind::Google => self.google.as_ref(),
            ProviderKind::Meta => self.meta.as_ref(),
            ProviderKind::TikTok => self.tiktok.as_ref(),
            ProviderKind::LinkedIn => self.linkedin.as_ref(),
        };
        app.ok_or(SyncError::ConfigurationMissing(match kind {
            ProviderKind::Google => "google app credentials",
            ProviderKind::Meta => "meta app credentials",
            ProviderKind::TikTok => "tiktok app credentials",
            ProviderKind::LinkedIn => "linkedin app credentials",
        }))
    }
}

fn provider_from_env(kind: ProviderKind) -> Option<ProviderApp> {
    let prefix = kind.as_str().to_uppercase();
    let client_id = std::env::var(format!("ADSYNC_{}_CLIENT_ID", prefix)).ok()?;
    let client_secret = std::env::var(format!("ADSYNC_{}_CLIENT_SECRET", prefix)).ok()?;
    Some(ProviderApp::new(kind, client_id, client_secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_defaults() {
        let app = ProviderApp::new(ProviderKind::Meta, "id".into(), "secret".into());
        assert!(app.api_base_url.contains("graph.facebook.com"));
        assert!(app.token_url.contains("oauth/access_token"));
        assert!(app.scopes.contains(&"ads_read".to_string()));
        assert!(app.developer_token.is_none());
    }

    #[test]
    fn test_build_auth_url() {
        let app = ProviderApp::new(ProviderKind::LinkedIn, "client-1".into(), "s".into());
        let url = app.build_auth_url("tok123", "http://localhost:3002/callback");
        assert!(url.starts_with("https://www.linkedin.com/oauth/v2/authorization?"));
        assert!(url.contains("client_id=client-1"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3002%2Fcallback"));
        assert!(url.contains("scope=r_ads%20r_ads_reporting"));
        assert!(url.contains("state=tok123"));
        assert!(url.contains("response_type=code"));
    }

    #[test]
    fn test_provider_app_missing() {
        let config = AppConfig {
            encryption_key: String::new(),
            scheduler_secret: String::new(),
            integrations_db: String::new(),
            jobs_db: String::new(),
            metrics_db: String::new(),
            api_port: 0,
            google: None,
            meta: Some(ProviderApp::new(ProviderKind::Meta, "i".into(), "s".into())),
            tiktok: None,
            linkedin: None,
        };
        assert!(config.provider_app(ProviderKind::Meta).is_ok());
        assert!(matches!(
            config.provider_app(ProviderKind::Google),
            Err(SyncError::ConfigurationMissing(_))
        ));
    }
}
