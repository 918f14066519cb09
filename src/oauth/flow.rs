//! OAuth flow controller.
//!
//! Drives the connect sequence end to end: authorization URL with a sealed
//! state token, code exchange, optional long-lived extension, preferred-
//! account resolution, then the success side effects: integration upsert
//! and an initial-backfill job.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::state::{self, StatePayload};
use crate::config::retry::{
    OAUTH_BACKOFF_BASE, OAUTH_BACKOFF_CAP, OAUTH_BACKOFF_JITTER, OAUTH_EXTEND_ATTEMPTS,
};
use crate::config::AppConfig;
use crate::credentials::{decode_key, Integration, IntegrationStore, SyncStatus};
use crate::error::SyncError;
use crate::jobs::{JobType, SyncJobQueue};
use crate::providers::{adapter_for, AccountSummary, ProviderKind};

/// Timeframe for the first sync after connecting.
pub const INITIAL_BACKFILL_TIMEFRAME_DAYS: i64 = 90;

const DEFAULT_SYNC_FREQUENCY_MINUTES: i64 = 1440;
const DEFAULT_SCHEDULED_TIMEFRAME_DAYS: i64 = 30;

/// Token endpoint response (code exchange and long-lived extension).
#[derive(Clone, Debug, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

pub struct OAuthFlow {
    config: Arc<AppConfig>,
    integrations: Arc<IntegrationStore>,
    queue: Arc<SyncJobQueue>,
    http: reqwest::Client,
    state_key: Vec<u8>,
}

impl OAuthFlow {
    pub fn new(
        config: Arc<AppConfig>,
        integrations: Arc<IntegrationStore>,
        queue: Arc<SyncJobQueue>,
    ) -> anyhow::Result<Self> {
        let state_key = decode_key(&config.encryption_key)?;
        Ok(Self {
            config,
            integrations,
            queue,
            http: reqwest::Client::new(),
            state_key,
        })
    }

    /// Authorization URL plus the sealed state token embedded in it.
    pub fn connect_url(
        &self,
        provider: ProviderKind,
        payload: &StatePayload,
        redirect_uri: &str,
    ) -> Result<(String, String), SyncError> {
        let app = self.config.provider_app(provider)?;
        let state = state::create_state(payload, &self.state_key)?;
        let url = app.build_auth_url(&state, redirect_uri);
        Ok((url, state))
    }

    pub fn validate_state(&self, token: &str) -> Result<StatePayload, SyncError> {
        state::validate_state(token, &self.state_key)
    }

    /// Exchange an authorization code at the provider's token endpoint.
    pub async fn exchange_code_for_token(
        &self,
        provider: ProviderKind,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, SyncError> {
        let app = self.config.provider_app(provider)?;

        let response = self
            .http
            .post(&app.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", app.client_id.as_str()),
                ("client_secret", app.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SyncError::OAuthExchangeFailed(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            return Err(SyncError::OAuthExchangeFailed(format!(
                "status {}: {}",
                status, body
            )));
        }

        response
            .json::<TokenGrant>()
            .await
            .map_err(|e| SyncError::OAuthExchangeFailed(format!("bad token response: {}", e)))
    }

    /// Trade a short-lived token for a long-lived one.
    ///
    /// Up to [`OAUTH_EXTEND_ATTEMPTS`] attempts with jittered exponential
    /// backoff, retrying only on 429/5xx (and connection failures). On
    /// exhaustion the short-lived token is returned; extension failure
    /// never aborts a connect flow.
    pub async fn extend_to_long_lived_token(
        &self,
        provider: ProviderKind,
        short_lived: &str,
    ) -> (String, Option<i64>) {
        let Ok(app) = self.config.provider_app(provider) else {
            return (short_lived.to_string(), None);
        };

        for attempt in 0..OAUTH_EXTEND_ATTEMPTS {
            let result = self
                .http
                .get(&app.token_url)
                .query(&[
                    ("grant_type", "fb_exchange_token"),
                    ("client_id", app.client_id.as_str()),
                    ("client_secret", app.client_secret.as_str()),
                    ("fb_exchange_token", short_lived),
                ])
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    match response.json::<TokenGrant>().await {
                        Ok(grant) => {
                            info!(provider = %provider, "Extended to long-lived token");
                            return (grant.access_token, grant.expires_in);
                        }
                        Err(e) => {
                            warn!(provider = %provider, error = %e,
                                  "Unparseable extension response, keeping short-lived token");
                            return (short_lived.to_string(), None);
                        }
                    }
                }
                Ok(response) => {
                    let status = response.status();
                    let retryable =
                        status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if !retryable {
                        warn!(provider = %provider, %status,
                              "Token extension rejected, keeping short-lived token");
                        return (short_lived.to_string(), None);
                    }
                    warn!(provider = %provider, %status, attempt, "Token extension failed");
                }
                Err(e) => {
                    warn!(provider = %provider, error = %e, attempt, "Token extension unreachable");
                }
            }

            if attempt + 1 < OAUTH_EXTEND_ATTEMPTS {
                tokio::time::sleep(extension_backoff(attempt)).await;
            }
        }

        warn!(provider = %provider, "Token extension exhausted retries, keeping short-lived token");
        (short_lived.to_string(), None)
    }

    /// Pick the account to bind: the one flagged active, else the first.
    pub fn resolve_preferred_account(
        accounts: Vec<AccountSummary>,
    ) -> Result<AccountSummary, SyncError> {
        if accounts.is_empty() {
            return Err(SyncError::NoAccountsAvailable);
        }
        Ok(accounts
            .iter()
            .find(|a| a.active)
            .cloned()
            .unwrap_or_else(|| accounts[0].clone()))
    }

    /// Complete a callback: validate state, exchange the code, extend the
    /// token (Meta), bind the preferred account, persist the integration,
    /// and enqueue the initial backfill.
    pub async fn complete_connection(
        &self,
        provider: ProviderKind,
        code: &str,
        state_token: &str,
        redirect_uri: &str,
    ) -> Result<Integration, SyncError> {
        let payload = self.validate_state(state_token)?;
        let app = self.config.provider_app(provider)?.clone();

        let grant = self
            .exchange_code_for_token(provider, code, redirect_uri)
            .await?;

        let (access_token, expires_in) = if provider == ProviderKind::Meta {
            let (token, extended_expiry) = self
                .extend_to_long_lived_token(provider, &grant.access_token)
                .await;
            (token, extended_expiry.or(grant.expires_in))
        } else {
            (grant.access_token.clone(), grant.expires_in)
        };

        let adapter = adapter_for(provider, &app, None)?;
        let accounts = adapter.list_accounts(&access_token).await?;
        let account = Self::resolve_preferred_account(accounts)?;

        let now = Utc::now();
        let integration = Integration {
            workspace_id: payload.workspace_id.clone(),
            provider,
            client_id: payload.client_id.clone(),
            access_token,
            refresh_token: grant.refresh_token,
            id_token: grant.id_token,
            scopes: app.scopes.clone(),
            account_id: account.id,
            account_name: account.name,
            developer_token: app.developer_token.clone(),
            login_customer_id: None,
            access_token_expires_at: expires_in.map(|s| now + ChronoDuration::seconds(s)),
            refresh_token_expires_at: None,
            last_sync_status: SyncStatus::Never,
            last_sync_message: None,
            last_synced_at: None,
            last_sync_requested_at: None,
            linked_at: now,
            auto_sync_enabled: true,
            sync_frequency_minutes: DEFAULT_SYNC_FREQUENCY_MINUTES,
            scheduled_timeframe_days: DEFAULT_SCHEDULED_TIMEFRAME_DAYS,
        };

        self.integrations
            .upsert(&integration)
            .map_err(|e| SyncError::PersistenceUnavailable(e.to_string()))?;

        self.queue
            .enqueue(
                &integration.key(),
                JobType::InitialBackfill,
                INITIAL_BACKFILL_TIMEFRAME_DAYS,
            )
            .map_err(|e| SyncError::PersistenceUnavailable(e.to_string()))?;

        info!(
            workspace_id = %integration.workspace_id,
            provider = %provider,
            account_id = %integration.account_id,
            "Integration connected"
        );

        Ok(integration)
    }
}

/// Jittered exponential backoff for the extension retries.
fn extension_backoff(attempt: u32) -> Duration {
    let base = OAUTH_BACKOFF_BASE * 2u32.pow(attempt);
    let capped = base.min(OAUTH_BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(1.0 - OAUTH_BACKOFF_JITTER..=1.0 + OAUTH_BACKOFF_JITTER);
    Duration::from_millis((capped.as_millis() as f64 * jitter) as u64)
}
