//! HTTP surface for the sync engine.
//!
//! Routes:
//! - `GET    /api/integrations/:provider/connect`: authorization URL + state
//! - `GET    /api/integrations/:provider/callback`: complete the OAuth flow
//! - `GET    /api/integrations`: list a workspace's integrations
//! - `DELETE /api/integrations/:provider`: disconnect (cascades to queued jobs)
//! - `POST   /api/sync/trigger`: manual sync
//! - `POST   /api/sync/run`: claim and run the next job (scheduler secret)
//! - `POST   /api/scheduler/tick`: due-ness scan + stuck-job reclaim (secret)
//! - `GET    /api/metrics`: normalized metrics with filters
//!
//! Handlers stay thin; business logic lives in `handle_*` functions so unit
//! tests can call it without a server.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::credentials::{Integration, IntegrationKey, IntegrationStore, SyncStatus};
use crate::error::SyncError;
use crate::jobs::{JobRunner, Scheduler, SyncJob, SyncJobQueue};
use crate::metrics::{MetricFilter, MetricStore, NormalizedMetric};
use crate::oauth::{OAuthFlow, StatePayload};
use crate::providers::ProviderKind;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<AppConfig>,
    pub flow: Arc<OAuthFlow>,
    pub integrations: Arc<IntegrationStore>,
    pub queue: Arc<SyncJobQueue>,
    pub scheduler: Arc<Scheduler>,
    pub runner: Arc<JobRunner>,
    pub metrics: Arc<MetricStore>,
}

/// Integration as exposed to callers. Never includes token material.
#[derive(Serialize)]
pub struct IntegrationSummary {
    pub workspace_id: String,
    pub provider: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    pub last_sync_status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    pub linked_at: DateTime<Utc>,
    pub auto_sync_enabled: bool,
    pub sync_frequency_minutes: i64,
    pub scheduled_timeframe_days: i64,
}

impl From<Integration> for IntegrationSummary {
    fn from(i: Integration) -> Self {
        Self {
            workspace_id: i.workspace_id,
            provider: i.provider,
            client_id: i.client_id,
            account_id: i.account_id,
            account_name: i.account_name,
            last_sync_status: i.last_sync_status,
            last_sync_message: i.last_sync_message,
            last_synced_at: i.last_synced_at,
            linked_at: i.linked_at,
            auto_sync_enabled: i.auto_sync_enabled,
            sync_frequency_minutes: i.sync_frequency_minutes,
            scheduled_timeframe_days: i.scheduled_timeframe_days,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Map the error taxonomy onto HTTP statuses.
fn error_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::InvalidState(_) | SyncError::OAuthExchangeFailed(_) => StatusCode::BAD_REQUEST,
        SyncError::NoAccountsAvailable => StatusCode::NOT_FOUND,
        SyncError::UpstreamAuthExpired => StatusCode::UNAUTHORIZED,
        SyncError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        SyncError::PersistenceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::ConfigurationMissing(_) => StatusCode::NOT_IMPLEMENTED,
    }
}

fn sync_error_response(err: SyncError) -> Response {
    (
        error_status(&err),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn internal_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// Check the shared secret that authorizes scheduler/cron calls.
fn check_scheduler_secret(state: &ApiState, headers: &HeaderMap) -> Result<(), Response> {
    let provided = headers
        .get("x-scheduler-secret")
        .and_then(|v| v.to_str().ok());
    if provided != Some(state.config.scheduler_secret.as_str()) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "missing or invalid scheduler secret".to_string(),
            }),
        )
            .into_response());
    }
    Ok(())
}

fn parse_provider(provider: &str) -> Result<ProviderKind, Response> {
    ProviderKind::parse(provider).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("unknown provider: {}", provider),
            }),
        )
            .into_response()
    })
}

// ---------------------------------------------------------------------------
// Business logic (called from HTTP handlers and unit tests)
// ---------------------------------------------------------------------------

/// Disconnect an integration: delete the credential record and cascade to
/// its queued jobs.
pub fn handle_disconnect(state: &ApiState, key: &IntegrationKey) -> anyhow::Result<bool> {
    let deleted = state.integrations.delete(key)?;
    if deleted {
        let dropped = state.queue.delete_pending_for_key(key)?;
        info!(
            key = %key.lock_key(),
            dropped_jobs = dropped,
            "Integration disconnected"
        );
    }
    Ok(deleted)
}

/// Manual sync trigger.
pub fn handle_trigger(
    state: &ApiState,
    key: &IntegrationKey,
    timeframe_days: Option<i64>,
) -> anyhow::Result<Option<SyncJob>> {
    state.scheduler.trigger_manual(key, timeframe_days)
}

/// List normalized metrics for a workspace.
pub fn handle_list_metrics(
    state: &ApiState,
    workspace_id: &str,
    filter: &MetricFilter,
) -> anyhow::Result<Vec<NormalizedMetric>> {
    state.metrics.list(workspace_id, filter)
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ConnectQuery {
    workspace_id: String,
    client_id: Option<String>,
    redirect: Option<String>,
    redirect_uri: String,
}

#[derive(Serialize)]
struct ConnectResponse {
    authorize_url: String,
    state: String,
}

async fn connect(
    State(state): State<ApiState>,
    Path(provider): Path<String>,
    Query(query): Query<ConnectQuery>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let mut payload = StatePayload::new(query.workspace_id);
    payload.client_id = query.client_id;
    payload.redirect = query.redirect;

    match state
        .flow
        .connect_url(provider, &payload, &query.redirect_uri)
    {
        Ok((authorize_url, state_token)) => Json(ConnectResponse {
            authorize_url,
            state: state_token,
        })
        .into_response(),
        Err(e) => sync_error_response(e),
    }
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: String,
    state: String,
    redirect_uri: String,
}

async fn callback(
    State(state): State<ApiState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match state
        .flow
        .complete_connection(provider, &query.code, &query.state, &query.redirect_uri)
        .await
    {
        Ok(integration) => Json(IntegrationSummary::from(integration)).into_response(),
        Err(e) => sync_error_response(e),
    }
}

#[derive(Deserialize)]
struct WorkspaceQuery {
    workspace_id: String,
    client_id: Option<String>,
}

async fn list_integrations(
    State(state): State<ApiState>,
    Query(query): Query<WorkspaceQuery>,
) -> Response {
    match state.integrations.list_by_workspace(&query.workspace_id) {
        Ok(integrations) => Json(
            integrations
                .into_iter()
                .map(IntegrationSummary::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn disconnect(
    State(state): State<ApiState>,
    Path(provider): Path<String>,
    Query(query): Query<WorkspaceQuery>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let key = IntegrationKey::new(query.workspace_id, provider, query.client_id);

    match handle_disconnect(&state, &key) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "integration not found".to_string(),
            }),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct TriggerRequest {
    workspace_id: String,
    provider: ProviderKind,
    client_id: Option<String>,
    timeframe_days: Option<i64>,
}

#[derive(Serialize)]
struct TriggerResponse {
    scheduled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    job: Option<SyncJob>,
}

async fn trigger_sync(
    State(state): State<ApiState>,
    Json(request): Json<TriggerRequest>,
) -> Response {
    let key = IntegrationKey::new(request.workspace_id, request.provider, request.client_id);
    match handle_trigger(&state, &key, request.timeframe_days) {
        Ok(job) => Json(TriggerResponse {
            scheduled: job.is_some(),
            job,
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct RunRequest {
    workspace_id: String,
}

async fn run_next_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<RunRequest>,
) -> Response {
    if let Err(resp) = check_scheduler_secret(&state, &headers) {
        return resp;
    }
    match state.runner.run_next_job(&request.workspace_id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn scheduler_tick(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_scheduler_secret(&state, &headers) {
        return resp;
    }
    match state.scheduler.tick() {
        Ok(summary) => Json(serde_json::json!({
            "reclaimed": summary.reclaimed,
            "enqueued": summary.enqueued,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct MetricsQuery {
    workspace_id: String,
    provider: Option<ProviderKind>,
    client_id: Option<String>,
    account_id: Option<String>,
    campaign_id: Option<String>,
    since: Option<String>,
    until: Option<String>,
}

async fn list_metrics(
    State(state): State<ApiState>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let filter = MetricFilter {
        provider: query.provider,
        client_id: query.client_id,
        account_id: query.account_id,
        campaign_id: query.campaign_id,
        since: query.since,
        until: query.until,
    };
    match handle_list_metrics(&state, &query.workspace_id, &filter) {
        Ok(metrics) => Json(metrics).into_response(),
        Err(e) => internal_error(e),
    }
}

/// Build the engine's router.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/integrations/:provider/connect", get(connect))
        .route("/api/integrations/:provider/callback", get(callback))
        .route("/api/integrations", get(list_integrations))
        .route("/api/integrations/:provider", delete(disconnect))
        .route("/api/sync/trigger", post(trigger_sync))
        .route("/api/sync/run", post(run_next_job))
        .route("/api/scheduler/tick", post(scheduler_tick))
        .route("/api/metrics", get(list_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderApp;
    use crate::jobs::JobType;
    use crate::metrics::MetricsWriter;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn api_state() -> (tempfile::TempDir, ApiState) {
        let dir = tempfile::tempdir().unwrap();
        let key = BASE64.encode([0u8; 32]);

        let config = Arc::new(AppConfig {
            encryption_key: key.clone(),
            scheduler_secret: "hush".into(),
            integrations_db: String::new(),
            jobs_db: String::new(),
            metrics_db: String::new(),
            api_port: 0,
            google: None,
            meta: Some(ProviderApp::new(
                ProviderKind::Meta,
                "app-id".into(),
                "app-secret".into(),
            )),
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
        let flow = Arc::new(
            OAuthFlow::new(
                Arc::clone(&config),
                Arc::clone(&integrations),
                Arc::clone(&queue),
            )
            .unwrap(),
        );
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&integrations),
            Arc::clone(&queue),
        ));
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&config),
            Arc::clone(&integrations),
            Arc::clone(&queue),
            MetricsWriter::new(Arc::clone(&metrics)),
        ));

        (
            dir,
            ApiState {
                config,
                flow,
                integrations,
                queue,
                scheduler,
                runner,
                metrics,
            },
        )
    }

    fn seed_integration(state: &ApiState) -> IntegrationKey {
        let integration = Integration {
            workspace_id: "w1".into(),
            provider: ProviderKind::Meta,
            client_id: None,
            access_token: "tok".into(),
            refresh_token: None,
            id_token: None,
            scopes: vec![],
            account_id: "act_1".into(),
            account_name: Some("Main".into()),
            developer_token: None,
            login_customer_id: None,
            access_token_expires_at: None,
            refresh_token_expires_at: None,
            last_sync_status: SyncStatus::Success,
            last_sync_message: None,
            last_synced_at: Some(Utc::now()),
            last_sync_requested_at: None,
            linked_at: Utc::now(),
            auto_sync_enabled: true,
            sync_frequency_minutes: 1440,
            scheduled_timeframe_days: 30,
        };
        state.integrations.upsert(&integration).unwrap();
        integration.key()
    }

    #[test]
    fn test_handle_disconnect_cascades_to_queued_jobs() {
        let (_dir, state) = api_state();
        let key = seed_integration(&state);
        state
            .queue
            .enqueue(&key, JobType::ScheduledSync, 30)
            .unwrap()
            .unwrap();

        assert!(handle_disconnect(&state, &key).unwrap());
        assert!(state.integrations.get(&key).unwrap().is_none());
        assert!(!state.queue.has_pending_sync_job(&key).unwrap());

        // Second disconnect reports not-found.
        assert!(!handle_disconnect(&state, &key).unwrap());
    }

    #[test]
    fn test_handle_trigger_dedups() {
        let (_dir, state) = api_state();
        let key = seed_integration(&state);

        let job = handle_trigger(&state, &key, Some(7)).unwrap().unwrap();
        assert_eq!(job.job_type, JobType::ManualSync);
        assert!(handle_trigger(&state, &key, Some(7)).unwrap().is_none());
    }

    #[test]
    fn test_integration_summary_hides_tokens() {
        let (_dir, state) = api_state();
        let key = seed_integration(&state);
        let integration = state.integrations.get(&key).unwrap().unwrap();

        let body = serde_json::to_string(&IntegrationSummary::from(integration)).unwrap();
        assert!(!body.contains("\"tok\""));
        assert!(!body.contains("access_token"));
        assert!(body.contains("act_1"));
        assert!(body.contains("\"last_sync_status\":\"success\""));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&SyncError::InvalidState("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&SyncError::NoAccountsAvailable),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&SyncError::UpstreamUnavailable("x".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_status(&SyncError::PersistenceUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_scheduler_secret_check() {
        let (_dir, state) = api_state();

        let mut headers = HeaderMap::new();
        assert!(check_scheduler_secret(&state, &headers).is_err());

        headers.insert("x-scheduler-secret", "wrong".parse().unwrap());
        assert!(check_scheduler_secret(&state, &headers).is_err());

        headers.insert("x-scheduler-secret", "hush".parse().unwrap());
        assert!(check_scheduler_secret(&state, &headers).is_ok());
    }

    #[test]
    fn test_handle_list_metrics_applies_filter() {
        let (_dir, state) = api_state();
        let writer = MetricsWriter::new(Arc::clone(&state.metrics));
        writer
            .write_batch(
                "w1",
                &[NormalizedMetric {
                    provider: ProviderKind::Meta,
                    client_id: None,
                    account_id: Some("act_1".into()),
                    date: "2024-01-01".into(),
                    spend: 1.0,
                    impressions: 1,
                    clicks: 1,
                    conversions: 0.0,
                    revenue: None,
                    campaign_id: Some("c1".into()),
                    campaign_name: None,
                    creatives: vec![],
                    raw_payload: serde_json::json!({}),
                }],
            )
            .unwrap();

        let all = handle_list_metrics(&state, "w1", &MetricFilter::default()).unwrap();
        assert_eq!(all.len(), 1);

        let none = handle_list_metrics(
            &state,
            "w1",
            &MetricFilter {
                provider: Some(ProviderKind::Google),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(none.is_empty());
    }
}
