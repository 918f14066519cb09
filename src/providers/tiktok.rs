//! TikTok Business API adapter.
//!
//! TikTok authenticates with an `Access-Token` header and reports errors
//! inside a 200 body: every response carries a `code` field, `0` meaning
//! success. Reporting pagination is page-numbered (`page`/`total_page`).

use async_trait::async_trait;
use reqwest::Client;

use super::http::send_with_retry;
use super::{
    AccountSummary, CreativeStatus, MetricsPage, ProviderAdapter, ProviderKind, RawMetricRow,
    TimeRange, TokenRefresh,
};
use crate::config::ProviderApp;
use crate::error::SyncError;

/// Body code for an invalid/expired access token.
const CODE_AUTH_EXPIRED: i64 = 40105;

const REPORT_METRICS: &str =
    r#"["spend","impressions","clicks","conversion","total_complete_payment","campaign_name"]"#;
const REPORT_DIMENSIONS: &str = r#"["campaign_id","stat_time_day"]"#;

pub struct TikTokAdapter {
    app: ProviderApp,
    http: Client,
}

impl TikTokAdapter {
    pub fn new(app: ProviderApp) -> Self {
        Self {
            app,
            http: Client::new(),
        }
    }

    /// Parse a TikTok envelope, translating body-level error codes.
    async fn open_envelope(response: reqwest::Response) -> Result<serde_json::Value, SyncError> {
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("bad tiktok response: {}", e)))?;

        match payload["code"].as_i64() {
            Some(0) => Ok(payload),
            Some(CODE_AUTH_EXPIRED) => Err(SyncError::UpstreamAuthExpired),
            code => Err(SyncError::UpstreamUnavailable(format!(
                "tiktok error code {:?}: {}",
                code,
                payload["message"].as_str().unwrap_or("unknown")
            ))),
        }
    }
}

#[async_trait]
impl ProviderAdapter for TikTokAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::TikTok
    }

    async fn fetch_metrics(
        &self,
        access_token: &str,
        account_id: &str,
        range: &TimeRange,
        cursor: Option<&str>,
    ) -> Result<MetricsPage, SyncError> {
        let page: u32 = cursor.and_then(|c| c.parse().ok()).unwrap_or(1);
        let url = format!("{}/report/integrated/get/", self.app.api_base_url);

        let response = send_with_retry(
            self.http
                .get(url)
                .header("Access-Token", access_token)
                .query(&[
                    ("advertiser_id", account_id),
                    ("report_type", "BASIC"),
                    ("data_level", "AUCTION_CAMPAIGN"),
                    ("dimensions", REPORT_DIMENSIONS),
                    ("metrics", REPORT_METRICS),
                    ("start_date", &range.since.to_string()),
                    ("end_date", &range.until.to_string()),
                    ("page", &page.to_string()),
                    ("page_size", "100"),
                ]),
        )
        .await?;

        let payload = Self::open_envelope(response).await?;

        let rows = payload["data"]["list"]
            .as_array()
            .map(|list| list.iter().cloned().map(RawMetricRow::TikTok).collect())
            .unwrap_or_default();

        let total_page = payload["data"]["page_info"]["total_page"]
            .as_i64()
            .unwrap_or(1);
        let next_cursor = ((page as i64) < total_page).then(|| (page + 1).to_string());

        Ok(MetricsPage { rows, next_cursor })
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenRefresh, SyncError> {
        let url = format!("{}/oauth2/refresh_token/", self.app.api_base_url);
        let response = send_with_retry(self.http.post(url).json(&serde_json::json!({
            "app_id": self.app.client_id,
            "secret": self.app.client_secret,
            "refresh_token": refresh_token,
        })))
        .await?;

        let payload = Self::open_envelope(response).await?;
        let data = &payload["data"];
        let access_token = data["access_token"]
            .as_str()
            .ok_or_else(|| {
                SyncError::UpstreamUnavailable("refresh response missing access_token".to_string())
            })?
            .to_string();

        Ok(TokenRefresh {
            access_token,
            refresh_token: data["refresh_token"].as_str().map(|s| s.to_string()),
            expires_in: data["expires_in"].as_i64(),
        })
    }

    async fn list_accounts(&self, access_token: &str) -> Result<Vec<AccountSummary>, SyncError> {
        let url = format!("{}/oauth2/advertiser/get/", self.app.api_base_url);
        let response = send_with_retry(
            self.http
                .get(url)
                .header("Access-Token", access_token)
                .query(&[
                    ("app_id", self.app.client_id.as_str()),
                    ("secret", self.app.client_secret.as_str()),
                ]),
        )
        .await?;

        let payload = Self::open_envelope(response).await?;
        let accounts = payload["data"]["list"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|entry| {
                        let id = entry["advertiser_id"].as_str()?.to_string();
                        Some(AccountSummary {
                            id,
                            name: entry["advertiser_name"].as_str().map(|s| s.to_string()),
                            // The advertiser listing only returns authorized
                            // accounts; absent a status field they count as
                            // active.
                            active: true,
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
        account_id: &str,
        creative_id: &str,
        status: CreativeStatus,
    ) -> Result<(), SyncError> {
        let url = format!("{}/ad/status/update/", self.app.api_base_url);
        let operation = match status {
            CreativeStatus::Active => "ENABLE",
            CreativeStatus::Paused => "DISABLE",
        };

        let response = send_with_retry(
            self.http
                .post(url)
                .header("Access-Token", access_token)
                .json(&serde_json::json!({
                    "advertiser_id": account_id,
                    "ad_ids": [creative_id],
                    "operation_status": operation,
                })),
        )
        .await?;

        Self::open_envelope(response).await?;
        Ok(())
    }
}
