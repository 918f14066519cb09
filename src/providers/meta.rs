//! Meta (Facebook/Instagram) Graph API adapter.
//!
//! When an app secret is configured, every request carries an
//! `appsecret_proof` (HMAC-SHA256 of the access token under the app
//! secret), so a leaked token is useless outside the registered app.
//!
//! Insights pagination is cursor-based (`paging.cursors.after`). Campaign
//! rows are enriched with creative detail via a secondary per-campaign
//! call, fanned out up to [`CREATIVE_FANOUT_LIMIT`] at a time; individual
//! enrichment failures are logged and non-fatal.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::warn;

use super::http::send_with_retry;
use super::{
    AccountSummary, CreativeStatus, MetricsPage, ProviderAdapter, ProviderKind, RawMetricRow,
    TimeRange, TokenRefresh,
};
use crate::config::ProviderApp;
use crate::error::SyncError;

type HmacSha256 = Hmac<Sha256>;

/// Campaigns enriched concurrently per page.
pub const CREATIVE_FANOUT_LIMIT: usize = 20;

const INSIGHTS_FIELDS: &str =
    "campaign_id,campaign_name,date_start,spend,impressions,clicks,actions,action_values";

pub struct MetaAdapter {
    app: ProviderApp,
    http: Client,
}

impl MetaAdapter {
    pub fn new(app: ProviderApp) -> Self {
        Self {
            app,
            http: Client::new(),
        }
    }

    /// HMAC-SHA256 of the access token under the app secret, hex-encoded.
    fn appsecret_proof(&self, access_token: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.app.client_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(access_token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Auth query parameters appended to every Graph call.
    fn auth_params(&self, access_token: &str) -> Vec<(String, String)> {
        let mut params = vec![("access_token".to_string(), access_token.to_string())];
        if !self.app.client_secret.is_empty() {
            params.push(("appsecret_proof".to_string(), self.appsecret_proof(access_token)));
        }
        params
    }

    /// Fetch creative detail for one campaign's ads.
    async fn fetch_campaign_creatives(
        &self,
        access_token: &str,
        campaign_id: &str,
    ) -> Result<Vec<serde_json::Value>, SyncError> {
        let url = format!("{}/{}/ads", self.app.api_base_url, campaign_id);
        let mut params = self.auth_params(access_token);
        params.push((
            "fields".to_string(),
            "creative{id,name,object_type,thumbnail_url}".to_string(),
        ));

        let response = send_with_retry(self.http.get(url).query(&params)).await?;
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("bad ads response: {}", e)))?;

        Ok(payload["data"]
            .as_array()
            .map(|ads| {
                ads.iter()
                    .filter_map(|ad| ad.get("creative").cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Merge creative detail into each row that names a campaign.
    async fn enrich_with_creatives(
        &self,
        access_token: &str,
        rows: &mut [serde_json::Value],
    ) {
        let campaign_ids: Vec<(usize, String)> = rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| {
                row["campaign_id"]
                    .as_str()
                    .map(|id| (i, id.to_string()))
            })
            .collect();

        let fetched: Vec<(usize, Result<Vec<serde_json::Value>, SyncError>)> =
            stream::iter(campaign_ids)
                .map(|(i, campaign_id)| async move {
                    let result = self
                        .fetch_campaign_creatives(access_token, &campaign_id)
                        .await;
                    if let Err(e) = &result {
                        warn!(campaign_id = %campaign_id, error = %e,
                              "Creative enrichment failed, continuing without it");
                    }
                    (i, result)
                })
                .buffer_unordered(CREATIVE_FANOUT_LIMIT)
                .collect()
                .await;

        for (i, result) in fetched {
            if let Ok(creatives) = result {
                if !creatives.is_empty() {
                    rows[i]["creatives"] = serde_json::Value::Array(creatives);
                }
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for MetaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Meta
    }

    async fn fetch_metrics(
        &self,
        access_token: &str,
        account_id: &str,
        range: &TimeRange,
        cursor: Option<&str>,
    ) -> Result<MetricsPage, SyncError> {
        let url = format!("{}/{}/insights", self.app.api_base_url, account_id);
        let mut params = self.auth_params(access_token);
        params.push(("level".to_string(), "campaign".to_string()));
        params.push(("fields".to_string(), INSIGHTS_FIELDS.to_string()));
        params.push(("time_increment".to_string(), "1".to_string()));
        params.push((
            "time_range".to_string(),
            format!(r#"{{"since":"{}","until":"{}"}}"#, range.since, range.until),
        ));
        params.push(("limit".to_string(), "100".to_string()));
        if let Some(after) = cursor {
            params.push(("after".to_string(), after.to_string()));
        }

        let response = send_with_retry(self.http.get(url).query(&params)).await?;
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("bad insights response: {}", e)))?;

        let mut rows: Vec<serde_json::Value> = payload["data"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        self.enrich_with_creatives(access_token, &mut rows).await;

        // Graph includes `paging.next` only when another page exists.
        let next_cursor = if payload["paging"]["next"].is_string() {
            payload["paging"]["cursors"]["after"]
                .as_str()
                .map(|s| s.to_string())
        } else {
            None
        };

        Ok(MetricsPage {
            rows: rows.into_iter().map(RawMetricRow::Meta).collect(),
            next_cursor,
        })
    }

    /// Meta has no separate refresh token; the stored token itself is
    /// exchanged for a fresh long-lived one.
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenRefresh, SyncError> {
        let response = send_with_retry(self.http.get(&self.app.token_url).query(&[
            ("grant_type", "fb_exchange_token"),
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.as_str()),
            ("fb_exchange_token", refresh_token),
        ]))
        .await?;

        response
            .json::<TokenRefresh>()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("bad exchange response: {}", e)))
    }

    async fn list_accounts(&self, access_token: &str) -> Result<Vec<AccountSummary>, SyncError> {
        let url = format!("{}/me/adaccounts", self.app.api_base_url);
        let mut params = self.auth_params(access_token);
        params.push(("fields".to_string(), "id,name,account_status".to_string()));

        let response = send_with_retry(self.http.get(url).query(&params)).await?;
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("bad adaccounts response: {}", e)))?;

        let accounts = payload["data"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let id = entry["id"].as_str()?.to_string();
                        Some(AccountSummary {
                            id,
                            name: entry["name"].as_str().map(|s| s.to_string()),
                            // 1 = ACTIVE in the Graph account_status enum.
                            active: entry["account_status"].as_i64() == Some(1),
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
        let url = format!("{}/{}", self.app.api_base_url, creative_id);
        let target = match status {
            CreativeStatus::Active => "ACTIVE",
            CreativeStatus::Paused => "PAUSED",
        };
        let mut params = self.auth_params(access_token);
        params.push(("status".to_string(), target.to_string()));

        send_with_retry(self.http.post(url).form(&params)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn adapter(server: &Server) -> MetaAdapter {
        let mut app = ProviderApp::new(ProviderKind::Meta, "app-id".into(), "app-secret".into());
        app.api_base_url = server.url();
        app.token_url = format!("{}/oauth/access_token", server.url());
        MetaAdapter::new(app)
    }

    fn range() -> TimeRange {
        TimeRange {
            since: "2024-01-01".parse().unwrap(),
            until: "2024-01-03".parse().unwrap(),
        }
    }

    #[test]
    fn test_appsecret_proof_is_deterministic_hmac() {
        let app = ProviderApp::new(ProviderKind::Meta, "id".into(), "top-secret".into());
        let adapter = MetaAdapter::new(app);
        let proof = adapter.appsecret_proof("token-abc");

        // Independently computed HMAC-SHA256("token-abc", "top-secret").
        let mut mac = HmacSha256::new_from_slice(b"top-secret").unwrap();
        mac.update(b"token-abc");
        assert_eq!(proof, hex::encode(mac.finalize().into_bytes()));
        assert_eq!(proof.len(), 64);
        assert_eq!(adapter.appsecret_proof("token-abc"), proof);
    }

    #[tokio::test]
    async fn test_fetch_sends_proof_and_parses_rows() {
        let mut server = Server::new_async().await;
        let insights = server
            .mock("GET", "/act_1/insights")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("access_token".into(), "tok".into()),
                Matcher::UrlEncoded("level".into(), "campaign".into()),
                Matcher::Regex("appsecret_proof=[0-9a-f]{64}".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": [{"campaign_id": "c1", "campaign_name": "Launch",
                              "date_start": "2024-01-01", "spend": "12.50",
                              "impressions": "340", "clicks": "12"}],
                    "paging": {"cursors": {"before": "a", "after": "b"}}}"#,
            )
            .create_async()
            .await;
        let ads = server
            .mock("GET", "/c1/ads")
            .match_query(Matcher::Regex("fields=creative".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": [{"creative": {"id": "cr9", "name": "Video A",
                               "object_type": "VIDEO",
                               "thumbnail_url": "https://cdn.example/v.jpg"}}]}"#,
            )
            .create_async()
            .await;

        let page = adapter(&server)
            .fetch_metrics("tok", "act_1", &range(), None)
            .await
            .unwrap();

        assert_eq!(page.rows.len(), 1);
        // No paging.next → last page even though cursors are present.
        assert!(page.next_cursor.is_none());

        let row = page.rows[0].payload();
        assert_eq!(row["spend"], "12.50");
        assert_eq!(row["creatives"][0]["id"], "cr9");
        insights.assert_async().await;
        ads.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_reports_next_cursor() {
        let mut server = Server::new_async().await;
        let _insights = server
            .mock("GET", "/act_1/insights")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": [],
                    "paging": {"cursors": {"after": "cursor-2"},
                               "next": "https://graph.facebook.com/next"}}"#,
            )
            .create_async()
            .await;

        let page = adapter(&server)
            .fetch_metrics("tok", "act_1", &range(), None)
            .await
            .unwrap();
        assert_eq!(page.next_cursor.as_deref(), Some("cursor-2"));
    }

    #[tokio::test]
    async fn test_creative_enrichment_failure_is_non_fatal() {
        let mut server = Server::new_async().await;
        let _insights = server
            .mock("GET", "/act_1/insights")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": [{"campaign_id": "c1", "date_start": "2024-01-01",
                              "spend": "5.00"},
                             {"campaign_id": "c2", "date_start": "2024-01-01",
                              "spend": "6.00"}],
                    "paging": {}}"#,
            )
            .create_async()
            .await;
        let _c1_ads = server
            .mock("GET", "/c1/ads")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error": {"message": "unsupported"}}"#)
            .create_async()
            .await;
        let _c2_ads = server
            .mock("GET", "/c2/ads")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": [{"creative": {"id": "cr2", "name": "B"}}]}"#)
            .create_async()
            .await;

        let page = adapter(&server)
            .fetch_metrics("tok", "act_1", &range(), None)
            .await
            .unwrap();

        // Both rows survive; only c2 carries creatives.
        assert_eq!(page.rows.len(), 2);
        let c1 = page
            .rows
            .iter()
            .find(|r| r.payload()["campaign_id"] == "c1")
            .unwrap();
        let c2 = page
            .rows
            .iter()
            .find(|r| r.payload()["campaign_id"] == "c2")
            .unwrap();
        assert!(c1.payload().get("creatives").is_none());
        assert_eq!(c2.payload()["creatives"][0]["id"], "cr2");
    }

    #[tokio::test]
    async fn test_list_accounts_flags_active() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/me/adaccounts")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": [{"id": "act_1", "name": "Closed", "account_status": 2},
                             {"id": "act_2", "name": "Open", "account_status": 1}]}"#,
            )
            .create_async()
            .await;

        let accounts = adapter(&server).list_accounts("tok").await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert!(!accounts[0].active);
        assert!(accounts[1].active);
    }

    #[tokio::test]
    async fn test_refresh_is_long_lived_exchange() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/oauth/access_token")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "fb_exchange_token".into()),
                Matcher::UrlEncoded("fb_exchange_token".into(), "short-tok".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "long-tok", "expires_in": 5184000}"#)
            .create_async()
            .await;

        let refreshed = adapter(&server)
            .refresh_access_token("short-tok")
            .await
            .unwrap();
        assert_eq!(refreshed.access_token, "long-tok");
        assert_eq!(refreshed.expires_in, Some(5184000));
        mock.assert_async().await;
    }
}
