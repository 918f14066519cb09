//! Provider adapters for the four ad platforms.
//!
//! One uniform [`ProviderAdapter`] interface over divergent per-provider
//! auth headers, pagination schemes, and error shapes. Adapters are
//! constructed per call (or injected explicitly); there is no module-scope
//! client.
//!
//! Retry discipline lives in [`http`]: 429/5xx retried with exponential
//! backoff inside the adapter, 401/403 surfaced as `UpstreamAuthExpired`
//! for the job runner's single refresh-and-retry.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ProviderApp;
use crate::error::SyncError;

pub mod google;
pub mod http;
pub mod linkedin;
pub mod meta;
pub mod tiktok;

pub use google::GoogleAdapter;
pub use linkedin::LinkedInAdapter;
pub use meta::MetaAdapter;
pub use tiktok::TikTokAdapter;

/// The four supported ad platforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Meta,
    TikTok,
    LinkedIn,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Meta => "meta",
            ProviderKind::TikTok => "tiktok",
            ProviderKind::LinkedIn => "linkedin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "google" => Some(ProviderKind::Google),
            "meta" => Some(ProviderKind::Meta),
            "tiktok" => Some(ProviderKind::TikTok),
            "linkedin" => Some(ProviderKind::LinkedIn),
            _ => None,
        }
    }

    pub fn all() -> [ProviderKind; 4] {
        [
            ProviderKind::Google,
            ProviderKind::Meta,
            ProviderKind::TikTok,
            ProviderKind::LinkedIn,
        ]
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive reporting window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl TimeRange {
    /// The trailing `days`-day window ending today (UTC).
    pub fn last_days(days: i64) -> Self {
        let until = Utc::now().date_naive();
        Self {
            since: until - Duration::days(days.max(1)),
            until,
        }
    }
}

/// Ad account as reported by the provider's account-listing endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct AccountSummary {
    pub id: String,
    pub name: Option<String>,
    pub active: bool,
}

/// Result of a token refresh / long-lived exchange.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenRefresh {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// One raw reporting row, tagged by the adapter that produced it.
///
/// Dispatch is by adapter identity, never by inspecting the payload shape.
/// The payload is the provider's row untouched (Meta rows additionally carry
/// the creatives merged in by the enrichment pass).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RawMetricRow {
    Google(serde_json::Value),
    Meta(serde_json::Value),
    TikTok(serde_json::Value),
    LinkedIn(serde_json::Value),
}

impl RawMetricRow {
    pub fn provider(&self) -> ProviderKind {
        match self {
            RawMetricRow::Google(_) => ProviderKind::Google,
            RawMetricRow::Meta(_) => ProviderKind::Meta,
            RawMetricRow::TikTok(_) => ProviderKind::TikTok,
            RawMetricRow::LinkedIn(_) => ProviderKind::LinkedIn,
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        match self {
            RawMetricRow::Google(v)
            | RawMetricRow::Meta(v)
            | RawMetricRow::TikTok(v)
            | RawMetricRow::LinkedIn(v) => v,
        }
    }
}

/// One page of raw rows. The caller loops while `next_cursor` is present,
/// capped at `config::retry::MAX_PAGES_PER_JOB`.
#[derive(Clone, Debug)]
pub struct MetricsPage {
    pub rows: Vec<RawMetricRow>,
    pub next_cursor: Option<String>,
}

/// Target state for a creative/campaign mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreativeStatus {
    Active,
    Paused,
}

/// Uniform interface over the four platforms.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Fetch one page of campaign-level daily metrics.
    async fn fetch_metrics(
        &self,
        access_token: &str,
        account_id: &str,
        range: &TimeRange,
        cursor: Option<&str>,
    ) -> Result<MetricsPage, SyncError>;

    /// Exchange a refresh token (or provider equivalent) for a new access
    /// token.
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenRefresh, SyncError>;

    /// List ad accounts visible to this login.
    async fn list_accounts(&self, access_token: &str) -> Result<Vec<AccountSummary>, SyncError>;

    /// Enable or pause a creative (campaign for Google). Shares the fetch
    /// retry policy.
    async fn update_creative_status(
        &self,
        access_token: &str,
        account_id: &str,
        creative_id: &str,
        status: CreativeStatus,
    ) -> Result<(), SyncError>;
}

/// Build the adapter for a provider from its app registration.
///
/// `login_customer_id` is the Google manager-account header; ignored by the
/// other providers.
pub fn adapter_for(
    kind: ProviderKind,
    app: &ProviderApp,
    login_customer_id: Option<&str>,
) -> Result<Box<dyn ProviderAdapter>, SyncError> {
    Ok(match kind {
        ProviderKind::Google => {
            let developer_token = app
                .developer_token
                .clone()
                .ok_or(SyncError::ConfigurationMissing("google developer token"))?;
            Box::new(GoogleAdapter::new(
                app.clone(),
                developer_token,
                login_customer_id.map(|s| s.to_string()),
            ))
        }
        ProviderKind::Meta => Box::new(MetaAdapter::new(app.clone())),
        ProviderKind::TikTok => Box::new(TikTokAdapter::new(app.clone())),
        ProviderKind::LinkedIn => Box::new(LinkedInAdapter::new(app.clone())),
    })
}
