//! LinkedIn Marketing API adapter.
//!
//! Rest.li conventions: versioned `LinkedIn-Version` header, protocol-2.0
//! header, and offset pagination (`start`/`count` against `paging.total`).

use async_trait::async_trait;
use reqwest::Client;

use super::http::send_with_retry;
use super::{
    AccountSummary, CreativeStatus, MetricsPage, ProviderAdapter, ProviderKind, RawMetricRow,
    TimeRange, TokenRefresh,
};
use crate::config::ProviderApp;
use crate::error::SyncError;

const LINKEDIN_VERSION: &str = "202401";
const PAGE_SIZE: u32 = 100;

pub struct LinkedInAdapter {
    app: ProviderApp,
    http: Client,
}

impl LinkedInAdapter {
    pub fn new(app: ProviderApp) -> Self {
        Self {
            app,
            http: Client::new(),
        }
    }

    fn request(&self, url: String, access_token: &str) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .bearer_auth(access_token)
            .header("LinkedIn-Version", LINKEDIN_VERSION)
            .header("X-Restli-Protocol-Version", "2.0.0")
    }
}

/// Rest.li date-range literal, e.g.
/// `(start:(year:2024,month:1,day:1),end:(year:2024,month:1,day:3))`.
fn date_range_param(range: &TimeRange) -> String {
    use chrono::Datelike;
    format!(
        "(start:(year:{},month:{},day:{}),end:(year:{},month:{},day:{}))",
        range.since.year(),
        range.since.month(),
        range.since.day(),
        range.until.year(),
        range.until.month(),
        range.until.day()
    )
}

#[async_trait]
impl ProviderAdapter for LinkedInAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::LinkedIn
    }

    async fn fetch_metrics(
        &self,
        access_token: &str,
        account_id: &str,
        range: &TimeRange,
        cursor: Option<&str>,
    ) -> Result<MetricsPage, SyncError> {
        let start: u32 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let url = format!("{}/rest/adAnalytics", self.app.api_base_url);

        let response = send_with_retry(self.request(url, access_token).query(&[
            ("q", "analytics"),
            ("pivot", "CAMPAIGN"),
            ("timeGranularity", "DAILY"),
            ("dateRange", &date_range_param(range)),
            (
                "accounts",
                &format!("urn:li:sponsoredAccount:{}", account_id),
            ),
            (
                "fields",
                "pivotValues,dateRange,costInLocalCurrency,impressions,clicks,\
                 externalWebsiteConversions,conversionValueInLocalCurrency",
            ),
            ("start", &start.to_string()),
            ("count", &PAGE_SIZE.to_string()),
        ]))
        .await?;

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("bad analytics response: {}", e)))?;

        let rows = payload["elements"]
            .as_array()
            .map(|elements| {
                elements
                    .iter()
                    .cloned()
                    .map(RawMetricRow::LinkedIn)
                    .collect()
            })
            .unwrap_or_default();

        let total = payload["paging"]["total"].as_u64().unwrap_or(0);
        let next_start = start as u64 + PAGE_SIZE as u64;
        let next_cursor = (next_start < total).then(|| next_start.to_string());

        Ok(MetricsPage { rows, next_cursor })
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenRefresh, SyncError> {
        let response = send_with_retry(self.http.post(&self.app.token_url).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.as_str()),
        ]))
        .await?;

        response
            .json::<TokenRefresh>()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("bad refresh response: {}", e)))
    }

    async fn list_accounts(&self, access_token: &str) -> Result<Vec<AccountSummary>, SyncError> {
        let url = format!("{}/rest/adAccounts", self.app.api_base_url);
        let response = send_with_retry(
            self.request(url, access_token)
                .query(&[("q", "search"), ("pageSize", "100")]),
        )
        .await?;

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("bad accounts response: {}", e)))?;

        let accounts = payload["elements"]
            .as_array()
            .map(|elements| {
                elements
                    .iter()
                    .filter_map(|entry| {
                        let id = match &entry["id"] {
                            serde_json::Value::Number(n) => n.to_string(),
                            serde_json::Value::String(s) => s.clone(),
                            _ => return None,
                        };
                        Some(AccountSummary {
                            id,
                            name: entry["name"].as_str().map(|s| s.to_string()),
                            active: entry["status"].as_str() == Some("ACTIVE"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(accounts)
    }

    async fn update_creative_status(
        &self,
        access_token: &str,
        _account_id: &str,
        creative_id: &str,
        status: CreativeStatus,
    ) -> Result<(), SyncError> {
        let url = format!(
            "{}/rest/creatives/{}",
            self.app.api_base_url,
            urlencoding::encode(&format!("urn:li:sponsoredCreative:{}", creative_id))
        );
        let target = match status {
            CreativeStatus::Active => "ACTIVE",
            CreativeStatus::Paused => "PAUSED",
        };

        send_with_retry(
            self.http
                .post(url)
                .bearer_auth(access_token)
                .header("LinkedIn-Version", LINKEDIN_VERSION)
                .header("X-Restli-Protocol-Version", "2.0.0")
                .header("X-RestLi-Method", "PARTIAL_UPDATE")
                .json(&serde_json::json!({
                    "patch": {"$set": {"intendedStatus": target}}
                })),
        )
        .await?;
        Ok(())
    }
}
