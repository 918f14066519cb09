//! Job runner: claims one job and drives it to a terminal state.
//!
//! Worker invocations are short-lived: claim, fetch, normalize, write,
//! stamp. Every wait (provider calls, refresh, backoff, persistence) is a
//! non-blocking suspension point. Jobs for different keys have no
//! ordering guarantee; jobs sharing a key are serialized by the queue's
//! claim invariant alone.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{SyncJob, SyncJobQueue};
use crate::config::retry::MAX_PAGES_PER_JOB;
use crate::config::AppConfig;
use crate::credentials::{Integration, IntegrationStore, SyncStatus};
use crate::error::SyncError;
use crate::metrics::{MetricsWriter, NormalizedMetric};
use crate::normalize::normalize_row;
use crate::providers::{adapter_for, ProviderAdapter, TimeRange};

/// Refresh ahead of expiry by this margin.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

pub struct JobRunner {
    config: Arc<AppConfig>,
    integrations: Arc<IntegrationStore>,
    queue: Arc<SyncJobQueue>,
    writer: MetricsWriter,
    /// Per-integration refresh locks: two jobs racing on one key refresh
    /// once, not twice.
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl JobRunner {
    pub fn new(
        config: Arc<AppConfig>,
        integrations: Arc<IntegrationStore>,
        queue: Arc<SyncJobQueue>,
        writer: MetricsWriter,
    ) -> Self {
        Self {
            config,
            integrations,
            queue,
            writer,
            refresh_locks: DashMap::new(),
        }
    }

    /// Claim and run the next queued job for a workspace.
    ///
    /// Returns the job in its terminal state, or `None` when nothing was
    /// queued. Job failures are recorded on both the job and the
    /// integration before returning.
    pub async fn run_next_job(&self, workspace_id: &str) -> Result<Option<SyncJob>> {
        let Some(job) = self.queue.claim_next(workspace_id)? else {
            return Ok(None);
        };

        info!(
            job_id = %job.id,
            workspace_id,
            provider = %job.provider,
            job_type = job.job_type.as_str(),
            timeframe_days = job.timeframe_days,
            "Running sync job"
        );

        let key = job.integration_key();
        match self.execute(&job).await {
            Ok(rows) => {
                self.queue.complete(&job.id)?;
                self.integrations
                    .set_sync_status(
                        &key,
                        SyncStatus::Success,
                        Some(&format!("synced {} metric rows", rows)),
                    )
                    .context("failed to stamp success status")?;
                info!(job_id = %job.id, rows, "Sync job completed");
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Sync job failed");
                // fail() also stamps the integration's error status.
                self.queue.fail(&job.id, &e.to_string())?;
            }
        }

        self.queue
            .get(&job.id)
            .context("failed to reload terminal job")
    }

    async fn execute(&self, job: &SyncJob) -> Result<usize> {
        let key = job.integration_key();
        let mut integration = self
            .integrations
            .get(&key)?
            .ok_or_else(|| anyhow!("integration not found for {}", key.lock_key()))?;

        self.integrations
            .set_sync_status(&key, SyncStatus::Pending, None)?;

        // The integration's own manager-hierarchy credentials win over the
        // app-level defaults.
        let mut app = self.config.provider_app(job.provider)?.clone();
        if integration.developer_token.is_some() {
            app.developer_token = integration.developer_token.clone();
        }
        let adapter = adapter_for(job.provider, &app, integration.login_customer_id.as_deref())?;

        // Proactive refresh when the token is at (or near) expiry.
        if integration.token_expires_within(chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS))
            && integration.refresh_token.is_some()
        {
            self.refresh_token_locked(&mut integration, adapter.as_ref())
                .await?;
        }

        let range = TimeRange::last_days(job.timeframe_days);
        let mut raw_rows = Vec::new();
        let mut cursor: Option<String> = None;
        let mut refreshed_once = false;

        for page_index in 0..MAX_PAGES_PER_JOB {
            let fetched = adapter
                .fetch_metrics(
                    &integration.access_token,
                    &integration.account_id,
                    &range,
                    cursor.as_deref(),
                )
                .await;

            let page = match fetched {
                Err(SyncError::UpstreamAuthExpired)
                    if !refreshed_once && integration.refresh_token.is_some() =>
                {
                    // One refresh, then the same request exactly once more.
                    refreshed_once = true;
                    self.refresh_token_locked(&mut integration, adapter.as_ref())
                        .await?;
                    adapter
                        .fetch_metrics(
                            &integration.access_token,
                            &integration.account_id,
                            &range,
                            cursor.as_deref(),
                        )
                        .await?
                }
                other => other?,
            };

            raw_rows.extend(page.rows);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
            if page_index + 1 == MAX_PAGES_PER_JOB {
                warn!(
                    job_id = %job.id,
                    pages = MAX_PAGES_PER_JOB,
                    "Page cap reached with more data upstream, truncating"
                );
            }
        }

        let metrics: Vec<NormalizedMetric> = raw_rows
            .iter()
            .map(|row| {
                let mut metric = normalize_row(row);
                metric.account_id = Some(integration.account_id.clone());
                metric.client_id = integration.client_id.clone();
                metric
            })
            .collect();

        let written = self.writer.write_batch(&job.workspace_id, &metrics)?;
        Ok(written)
    }

    /// Refresh the integration's access token under the per-key lock.
    ///
    /// The record is re-read inside the lock: if a concurrent job already
    /// refreshed, its token is adopted and no upstream call is made.
    async fn refresh_token_locked(
        &self,
        integration: &mut Integration,
        adapter: &dyn ProviderAdapter,
    ) -> Result<(), SyncError> {
        let key = integration.key();
        let lock = self
            .refresh_locks
            .entry(key.lock_key())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let current = self
            .integrations
            .get(&key)
            .map_err(|e| SyncError::PersistenceUnavailable(e.to_string()))?
            .ok_or_else(|| SyncError::PersistenceUnavailable("integration deleted".to_string()))?;

        if current.access_token != integration.access_token {
            info!(key = %key.lock_key(), "Adopting token refreshed by a concurrent job");
            *integration = current;
            return Ok(());
        }

        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or(SyncError::UpstreamAuthExpired)?;

        let refreshed = adapter.refresh_access_token(&refresh_token).await?;
        let expires_at = refreshed
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        self.integrations
            .update_tokens(
                &key,
                &refreshed.access_token,
                expires_at,
                refreshed.refresh_token.as_deref(),
                None,
            )
            .map_err(|e| SyncError::PersistenceUnavailable(e.to_string()))?;

        info!(key = %key.lock_key(), "Access token refreshed");

        integration.access_token = refreshed.access_token;
        if refreshed.refresh_token.is_some() {
            integration.refresh_token = refreshed.refresh_token;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderApp;
    use crate::jobs::{JobStatus, JobType};
    use crate::metrics::{MetricFilter, MetricStore};
    use crate::providers::ProviderKind;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use mockito::{Matcher, Server, ServerGuard};

    struct Harness {
        _dir: tempfile::TempDir,
        runner: JobRunner,
        integrations: Arc<IntegrationStore>,
        queue: Arc<SyncJobQueue>,
        metrics: Arc<MetricStore>,
    }

    fn harness(server: &ServerGuard) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let key = BASE64.encode([0u8; 32]);

        let mut meta = ProviderApp::new(ProviderKind::Meta, "app-id".into(), "app-secret".into());
        meta.api_base_url = server.url();
        meta.token_url = format!("{}/oauth/access_token", server.url());

        let config = Arc::new(AppConfig {
            encryption_key: key.clone(),
            scheduler_secret: "s".into(),
            integrations_db: String::new(),
            jobs_db: String::new(),
            metrics_db: String::new(),
            api_port: 0,
            google: None,
            meta: Some(meta),
            tiktok: None,
            linkedin: None,
        });

        let integrations = Arc::new(
            IntegrationStore::new(dir.path().join("integrations.db"), &key).unwrap(),
        );
        let queue = Arc::new(
            SyncJobQueue::new(dir.path().join("jobs.db"), Arc::clone(&integrations)).unwrap(),
        );
        let metrics = Arc::new(MetricStore::new(dir.path().join("metrics.db")).unwrap());
        let runner = JobRunner::new(
            config,
            Arc::clone(&integrations),
            Arc::clone(&queue),
            MetricsWriter::new(Arc::clone(&metrics)),
        );

        Harness {
            _dir: dir,
            runner,
            integrations,
            queue,
            metrics,
        }
    }

    fn seed_integration(h: &Harness, access_token: &str, refresh_token: Option<&str>) {
        let integration = Integration {
            workspace_id: "w1".into(),
            provider: ProviderKind::Meta,
            client_id: None,
            access_token: access_token.into(),
            refresh_token: refresh_token.map(|s| s.to_string()),
            id_token: None,
            scopes: vec!["ads_read".into()],
            account_id: "act_1".into(),
            account_name: None,
            developer_token: None,
            login_customer_id: None,
            access_token_expires_at: Some(Utc::now() + chrono::Duration::days(30)),
            refresh_token_expires_at: None,
            last_sync_status: SyncStatus::Never,
            last_sync_message: None,
            last_synced_at: None,
            last_sync_requested_at: None,
            linked_at: Utc::now(),
            auto_sync_enabled: true,
            sync_frequency_minutes: 1440,
            scheduled_timeframe_days: 30,
        };
        h.integrations.upsert(&integration).unwrap();
    }

    fn insights_body(campaign: &str, spend: &str) -> String {
        format!(
            r#"{{"data": [{{"campaign_id": "{}", "campaign_name": "Launch",
                 "date_start": "2024-01-01", "spend": "{}", "impressions": "100",
                 "clicks": "5"}}],
                "paging": {{}}}}"#,
            campaign, spend
        )
    }

    #[tokio::test]
    async fn test_run_next_job_happy_path() {
        let mut server = Server::new_async().await;
        let _insights = server
            .mock("GET", "/act_1/insights")
            .match_query(Matcher::UrlEncoded("access_token".into(), "tok".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(insights_body("c1", "12.50"))
            .create_async()
            .await;

        let h = harness(&server);
        seed_integration(&h, "tok", None);
        h.queue
            .enqueue(
                &crate::credentials::IntegrationKey::new("w1", ProviderKind::Meta, None),
                JobType::ScheduledSync,
                30,
            )
            .unwrap()
            .unwrap();

        let job = h.runner.run_next_job("w1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.processed_at.is_some());

        // Metrics landed with identity stamped from the integration.
        let rows = h.metrics.list("w1", &MetricFilter::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].spend, 12.5);
        assert_eq!(rows[0].account_id.as_deref(), Some("act_1"));

        // Integration health reflects the outcome.
        let integration = h
            .integrations
            .get(&job.integration_key())
            .unwrap()
            .unwrap();
        assert_eq!(integration.last_sync_status, SyncStatus::Success);
        assert!(integration.last_synced_at.is_some());
        assert!(integration
            .last_sync_message
            .as_deref()
            .unwrap()
            .contains("1 metric rows"));
    }

    #[tokio::test]
    async fn test_no_queued_job_returns_none() {
        let server = Server::new_async().await;
        let h = harness(&server);
        assert!(h.runner.run_next_job("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auth_expiry_refreshes_once_and_retries() {
        let mut server = Server::new_async().await;
        // Stale token → 401; fresh token → data.
        let _stale = server
            .mock("GET", "/act_1/insights")
            .match_query(Matcher::UrlEncoded("access_token".into(), "stale".into()))
            .with_status(401)
            .create_async()
            .await;
        let _refresh = server
            .mock("GET", "/oauth/access_token")
            .match_query(Matcher::UrlEncoded(
                "fb_exchange_token".into(),
                "r-tok".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "fresh", "expires_in": 5184000}"#)
            .create_async()
            .await;
        let _fresh = server
            .mock("GET", "/act_1/insights")
            .match_query(Matcher::UrlEncoded("access_token".into(), "fresh".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(insights_body("c1", "7.00"))
            .create_async()
            .await;

        let h = harness(&server);
        seed_integration(&h, "stale", Some("r-tok"));
        h.queue
            .enqueue(
                &crate::credentials::IntegrationKey::new("w1", ProviderKind::Meta, None),
                JobType::ScheduledSync,
                30,
            )
            .unwrap()
            .unwrap();

        let job = h.runner.run_next_job("w1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        // New token persisted.
        let integration = h
            .integrations
            .get(&job.integration_key())
            .unwrap()
            .unwrap();
        assert_eq!(integration.access_token, "fresh");
        assert_eq!(integration.last_sync_status, SyncStatus::Success);
    }

    #[tokio::test]
    async fn test_auth_expiry_without_refresh_token_fails_job() {
        let mut server = Server::new_async().await;
        let _insights = server
            .mock("GET", "/act_1/insights")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let h = harness(&server);
        seed_integration(&h, "stale", None);
        let key = crate::credentials::IntegrationKey::new("w1", ProviderKind::Meta, None);
        h.queue
            .enqueue(&key, JobType::ScheduledSync, 30)
            .unwrap()
            .unwrap();

        let job = h.runner.run_next_job("w1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        let integration = h.integrations.get(&key).unwrap().unwrap();
        assert_eq!(integration.last_sync_status, SyncStatus::Error);
        assert!(integration.last_sync_message.is_some());
    }

    #[tokio::test]
    async fn test_persistent_upstream_failure_fails_job() {
        let mut server = Server::new_async().await;
        let _insights = server
            .mock("GET", "/act_1/insights")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let h = harness(&server);
        seed_integration(&h, "tok", None);
        let key = crate::credentials::IntegrationKey::new("w1", ProviderKind::Meta, None);
        h.queue
            .enqueue(&key, JobType::ScheduledSync, 30)
            .unwrap()
            .unwrap();

        let job = h.runner.run_next_job("w1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job
            .error_message
            .as_deref()
            .unwrap()
            .contains("unavailable"));
    }

    #[tokio::test]
    async fn test_missing_integration_fails_job() {
        let server = Server::new_async().await;
        let h = harness(&server);
        // Job enqueued but no integration record exists.
        h.queue
            .enqueue(
                &crate::credentials::IntegrationKey::new("w1", ProviderKind::Meta, None),
                JobType::ScheduledSync,
                30,
            )
            .unwrap()
            .unwrap();

        let job = h.runner.run_next_job("w1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job
            .error_message
            .as_deref()
            .unwrap()
            .contains("integration not found"));
    }

    #[tokio::test]
    async fn test_pagination_follows_cursor() {
        let mut server = Server::new_async().await;
        // Page 1 advertises a next cursor; page 2 is terminal.
        let _page1 = server
            .mock("GET", "/act_1/insights")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("access_token".into(), "tok".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": [{"campaign_id": "c1", "date_start": "2024-01-01",
                              "spend": "1.00"}],
                    "paging": {"cursors": {"after": "page-2"},
                               "next": "https://graph/next"}}"#,
            )
            .create_async()
            .await;
        let _page2 = server
            .mock("GET", "/act_1/insights")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("after".into(), "page-2".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": [{"campaign_id": "c2", "date_start": "2024-01-01",
                              "spend": "2.00"}],
                    "paging": {}}"#,
            )
            .create_async()
            .await;

        let h = harness(&server);
        seed_integration(&h, "tok", None);
        h.queue
            .enqueue(
                &crate::credentials::IntegrationKey::new("w1", ProviderKind::Meta, None),
                JobType::InitialBackfill,
                90,
            )
            .unwrap()
            .unwrap();

        let job = h.runner.run_next_job("w1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.metrics.count("w1").unwrap(), 2);
    }
}
