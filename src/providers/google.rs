//! Google Ads adapter.
//!
//! Every Ads API request carries the developer token header and, for
//! manager-account hierarchies, a login-customer-id header. Reporting uses
//! the `googleAds:search` endpoint with a GAQL query; pagination is by
//! `nextPageToken`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::http::send_with_retry;
use super::{
    AccountSummary, CreativeStatus, MetricsPage, ProviderAdapter, ProviderKind, RawMetricRow,
    TimeRange, TokenRefresh,
};
use crate::config::ProviderApp;
use crate::error::SyncError;

const API_VERSION: &str = "v17";

pub struct GoogleAdapter {
    app: ProviderApp,
    developer_token: String,
    login_customer_id: Option<String>,
    http: Client,
}

impl GoogleAdapter {
    pub fn new(app: ProviderApp, developer_token: String, login_customer_id: Option<String>) -> Self {
        Self {
            app,
            developer_token,
            login_customer_id,
            http: Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, url: String, access_token: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(access_token)
            .header("developer-token", &self.developer_token);
        if let Some(manager) = &self.login_customer_id {
            req = req.header("login-customer-id", manager);
        }
        req
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn fetch_metrics(
        &self,
        access_token: &str,
        account_id: &str,
        range: &TimeRange,
        cursor: Option<&str>,
    ) -> Result<MetricsPage, SyncError> {
        let url = format!(
            "{}/{}/customers/{}/googleAds:search",
            self.app.api_base_url, API_VERSION, account_id
        );
        let query = format!(
            "SELECT campaign.id, campaign.name, segments.date, metrics.cost_micros, \
             metrics.impressions, metrics.clicks, metrics.conversions, \
             metrics.conversions_value \
             FROM campaign WHERE segments.date BETWEEN '{}' AND '{}'",
            range.since, range.until
        );

        let mut body = json!({ "query": query, "pageSize": 1000 });
        if let Some(token) = cursor {
            body["pageToken"] = json!(token);
        }

        let response = send_with_retry(
            self.request(reqwest::Method::POST, url, access_token)
                .json(&body),
        )
        .await?;

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("bad search response: {}", e)))?;

        let rows = payload["results"]
            .as_array()
            .map(|results| {
                results
                    .iter()
                    .cloned()
                    .map(RawMetricRow::Google)
                    .collect()
            })
            .unwrap_or_default();

        let next_cursor = payload["nextPageToken"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string());

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
        let url = format!(
            "{}/{}/customers:listAccessibleCustomers",
            self.app.api_base_url, API_VERSION
        );
        let response =
            send_with_retry(self.request(reqwest::Method::GET, url, access_token)).await?;

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("bad customers response: {}", e)))?;

        let accounts = payload["resourceNames"]
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str())
                    .map(|resource| AccountSummary {
                        // "customers/1234567890" → "1234567890"
                        id: resource.rsplit('/').next().unwrap_or(resource).to_string(),
                        name: None,
                        active: true,
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
        let url = format!(
            "{}/{}/customers/{}/campaigns:mutate",
            self.app.api_base_url, API_VERSION, account_id
        );
        let target = match status {
            CreativeStatus::Active => "ENABLED",
            CreativeStatus::Paused => "PAUSED",
        };
        let body = json!({
            "operations": [{
                "update": {
                    "resourceName": format!("customers/{}/campaigns/{}", account_id, creative_id),
                    "status": target,
                },
                "updateMask": "status",
            }]
        });

        send_with_retry(
            self.request(reqwest::Method::POST, url, access_token)
                .json(&body),
        )
        .await?;
        Ok(())
    }
}
