//! Encrypted credential storage for connected ad accounts.
//!
//! One [`Integration`] record per (workspace, provider, optional sub-client)
//! holds the OAuth tokens for that connection (AES-256-GCM sealed at rest)
//! together with the bound ad account, Google manager-hierarchy fields, sync
//! preferences, and the last-sync health fields the UI renders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::ProviderKind;

mod encryption;
mod store;

pub use encryption::{decode_key, open, open_url_safe, seal, seal_url_safe};
pub use store::IntegrationStore;

/// Outcome of the most recent sync attempt for an integration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Never,
    Pending,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Never => "never",
            SyncStatus::Pending => "pending",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never" => Some(SyncStatus::Never),
            "pending" => Some(SyncStatus::Pending),
            "success" => Some(SyncStatus::Success),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// Composite key identifying one connected account.
///
/// `client_id` distinguishes sub-clients under one workspace/provider pair
/// (agency setups); `None` for a direct connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IntegrationKey {
    pub workspace_id: String,
    pub provider: ProviderKind,
    pub client_id: Option<String>,
}

impl IntegrationKey {
    pub fn new(
        workspace_id: impl Into<String>,
        provider: ProviderKind,
        client_id: Option<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            provider,
            client_id,
        }
    }

    /// Stable string form for lock maps and log fields.
    pub fn lock_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.workspace_id,
            self.provider.as_str(),
            self.client_id.as_deref().unwrap_or("")
        )
    }
}

/// Stored OAuth credential plus sync preferences for one connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Integration {
    pub workspace_id: String,
    pub provider: ProviderKind,
    pub client_id: Option<String>,

    /// Decrypted in memory; sealed at rest.
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub scopes: Vec<String>,

    /// Provider-side ad account this connection is bound to.
    pub account_id: String,
    pub account_name: Option<String>,

    /// Google manager-hierarchy fields.
    pub developer_token: Option<String>,
    pub login_customer_id: Option<String>,

    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,

    pub last_sync_status: SyncStatus,
    pub last_sync_message: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_requested_at: Option<DateTime<Utc>>,
    pub linked_at: DateTime<Utc>,

    pub auto_sync_enabled: bool,
    pub sync_frequency_minutes: i64,
    pub scheduled_timeframe_days: i64,
}

impl Integration {
    pub fn key(&self) -> IntegrationKey {
        IntegrationKey {
            workspace_id: self.workspace_id.clone(),
            provider: self.provider,
            client_id: self.client_id.clone(),
        }
    }

    /// True when the access token expires within `margin` (or already has).
    /// Tokens without a recorded expiry are assumed valid.
    pub fn token_expires_within(&self, margin: chrono::Duration) -> bool {
        match self.access_token_expires_at {
            Some(expires_at) => expires_at <= Utc::now() + margin,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_round_trip() {
        for status in [
            SyncStatus::Never,
            SyncStatus::Pending,
            SyncStatus::Success,
            SyncStatus::Error,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SyncStatus::parse("bogus"), None);
    }

    #[test]
    fn test_lock_key_includes_client() {
        let direct = IntegrationKey::new("w1", ProviderKind::Meta, None);
        let agency = IntegrationKey::new("w1", ProviderKind::Meta, Some("c9".into()));
        assert_eq!(direct.lock_key(), "w1:meta:");
        assert_eq!(agency.lock_key(), "w1:meta:c9");
        assert_ne!(direct.lock_key(), agency.lock_key());
    }

    #[test]
    fn test_token_expiry_margin() {
        let mut integration = Integration {
            workspace_id: "w1".into(),
            provider: ProviderKind::Google,
            client_id: None,
            access_token: "tok".into(),
            refresh_token: None,
            id_token: None,
            scopes: vec![],
            account_id: "123".into(),
            account_name: None,
            developer_token: None,
            login_customer_id: None,
            access_token_expires_at: None,
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
        assert!(!integration.token_expires_within(chrono::Duration::seconds(60)));

        integration.access_token_expires_at = Some(Utc::now() + chrono::Duration::seconds(30));
        assert!(integration.token_expires_within(chrono::Duration::seconds(60)));

        integration.access_token_expires_at = Some(Utc::now() + chrono::Duration::hours(2));
        assert!(!integration.token_expires_within(chrono::Duration::seconds(60)));
    }
}
