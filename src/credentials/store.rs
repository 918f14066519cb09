//! SQLite-backed store for [`Integration`] records.
//!
//! Tokens (and the Google developer token) are sealed with AES-256-GCM
//! before they touch disk. One row per (workspace_id, provider, client_id);
//! the optional sub-client is keyed as `''` so the UNIQUE constraint holds.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::{encryption, Integration, IntegrationKey, SyncStatus};
use crate::providers::ProviderKind;

pub struct IntegrationStore {
    conn: Mutex<Connection>,
    key: Vec<u8>,
}

/// Column set shared by every SELECT; keep in sync with `from_row`.
const COLUMNS: &str = "workspace_id, provider, client_id, access_token, refresh_token, \
     id_token, scopes, account_id, account_name, developer_token, login_customer_id, \
     access_token_expires_at, refresh_token_expires_at, last_sync_status, last_sync_message, \
     last_synced_at, last_sync_requested_at, linked_at, auto_sync_enabled, \
     sync_frequency_minutes, scheduled_timeframe_days";

impl IntegrationStore {
    /// Create or open the store.
    ///
    /// `encryption_key` is the base64-encoded 32-byte master key.
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let key = encryption::decode_key(encryption_key).context("invalid encryption key")?;
        let conn = Connection::open(db_path).context("failed to open integrations database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS integrations (
                id INTEGER PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                client_id TEXT NOT NULL DEFAULT '',
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                id_token TEXT,
                scopes TEXT NOT NULL DEFAULT '[]',
                account_id TEXT NOT NULL,
                account_name TEXT,
                developer_token TEXT,
                login_customer_id TEXT,
                access_token_expires_at TEXT,
                refresh_token_expires_at TEXT,
                last_sync_status TEXT NOT NULL DEFAULT 'never',
                last_sync_message TEXT,
                last_synced_at TEXT,
                last_sync_requested_at TEXT,
                linked_at TEXT NOT NULL,
                auto_sync_enabled INTEGER NOT NULL DEFAULT 1,
                sync_frequency_minutes INTEGER NOT NULL DEFAULT 1440,
                scheduled_timeframe_days INTEGER NOT NULL DEFAULT 30,
                UNIQUE(workspace_id, provider, client_id)
            )
            "#,
            [],
        )
        .context("failed to create integrations table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_integrations_workspace
             ON integrations(workspace_id, provider, client_id)",
            [],
        )
        .context("failed to create integrations index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    /// Insert or replace the record for this integration's key.
    pub fn upsert(&self, integration: &Integration) -> Result<()> {
        let access_token = encryption::seal(&integration.access_token, &self.key)?;
        let refresh_token = integration
            .refresh_token
            .as_deref()
            .map(|t| encryption::seal(t, &self.key))
            .transpose()?;
        let id_token = integration
            .id_token
            .as_deref()
            .map(|t| encryption::seal(t, &self.key))
            .transpose()?;
        let developer_token = integration
            .developer_token
            .as_deref()
            .map(|t| encryption::seal(t, &self.key))
            .transpose()?;
        let scopes = serde_json::to_string(&integration.scopes)?;

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO integrations (
                    workspace_id, provider, client_id,
                    access_token, refresh_token, id_token, scopes,
                    account_id, account_name, developer_token, login_customer_id,
                    access_token_expires_at, refresh_token_expires_at,
                    last_sync_status, last_sync_message,
                    last_synced_at, last_sync_requested_at, linked_at,
                    auto_sync_enabled, sync_frequency_minutes, scheduled_timeframe_days
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                        ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
                ON CONFLICT(workspace_id, provider, client_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    id_token = excluded.id_token,
                    scopes = excluded.scopes,
                    account_id = excluded.account_id,
                    account_name = excluded.account_name,
                    developer_token = excluded.developer_token,
                    login_customer_id = excluded.login_customer_id,
                    access_token_expires_at = excluded.access_token_expires_at,
                    refresh_token_expires_at = excluded.refresh_token_expires_at,
                    last_sync_status = excluded.last_sync_status,
                    last_sync_message = excluded.last_sync_message,
                    linked_at = excluded.linked_at,
                    auto_sync_enabled = excluded.auto_sync_enabled,
                    sync_frequency_minutes = excluded.sync_frequency_minutes,
                    scheduled_timeframe_days = excluded.scheduled_timeframe_days
                "#,
                params![
                    integration.workspace_id,
                    integration.provider.as_str(),
                    integration.client_id.as_deref().unwrap_or(""),
                    access_token,
                    refresh_token,
                    id_token,
                    scopes,
                    integration.account_id,
                    integration.account_name,
                    developer_token,
                    integration.login_customer_id,
                    integration.access_token_expires_at.map(|t| t.to_rfc3339()),
                    integration.refresh_token_expires_at.map(|t| t.to_rfc3339()),
                    integration.last_sync_status.as_str(),
                    integration.last_sync_message,
                    integration.last_synced_at.map(|t| t.to_rfc3339()),
                    integration.last_sync_requested_at.map(|t| t.to_rfc3339()),
                    integration.linked_at.to_rfc3339(),
                    integration.auto_sync_enabled,
                    integration.sync_frequency_minutes,
                    integration.scheduled_timeframe_days,
                ],
            )
            .context("failed to upsert integration")?;

        Ok(())
    }

    pub fn get(&self, key: &IntegrationKey) -> Result<Option<Integration>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM integrations
                     WHERE workspace_id = ?1 AND provider = ?2 AND client_id = ?3"
                ),
                params![
                    key.workspace_id,
                    key.provider.as_str(),
                    key.client_id.as_deref().unwrap_or("")
                ],
                RawIntegrationRow::read,
            )
            .optional()
            .context("failed to query integration")?;

        raw.map(|r| r.decrypt(&self.key)).transpose()
    }

    /// Delete the record; true when a row was removed.
    pub fn delete(&self, key: &IntegrationKey) -> Result<bool> {
        let n = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM integrations
                 WHERE workspace_id = ?1 AND provider = ?2 AND client_id = ?3",
                params![
                    key.workspace_id,
                    key.provider.as_str(),
                    key.client_id.as_deref().unwrap_or("")
                ],
            )
            .context("failed to delete integration")?;
        Ok(n > 0)
    }

    pub fn list_by_workspace(&self, workspace_id: &str) -> Result<Vec<Integration>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM integrations
             WHERE workspace_id = ?1 ORDER BY provider, client_id"
        ))?;
        let raws = stmt
            .query_map(params![workspace_id], RawIntegrationRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read integrations")?;
        drop(stmt);
        drop(conn);
        raws.into_iter().map(|r| r.decrypt(&self.key)).collect()
    }

    /// All integrations with auto-sync enabled, across workspaces. The
    /// scheduler scans this to compute due-ness.
    pub fn list_auto_sync_enabled(&self) -> Result<Vec<Integration>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM integrations
             WHERE auto_sync_enabled = 1 ORDER BY workspace_id, provider, client_id"
        ))?;
        let raws = stmt
            .query_map([], RawIntegrationRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read integrations")?;
        drop(stmt);
        drop(conn);
        raws.into_iter().map(|r| r.decrypt(&self.key)).collect()
    }

    /// Persist refreshed tokens.
    ///
    /// Expiry timestamps never move backward: a refresh response carrying an
    /// earlier (or absent) expiry keeps the stored one.
    pub fn update_tokens(
        &self,
        key: &IntegrationKey,
        access_token: &str,
        access_token_expires_at: Option<DateTime<Utc>>,
        refresh_token: Option<&str>,
        refresh_token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let current = self
            .get(key)?
            .ok_or_else(|| anyhow!("integration not found: {}", key.lock_key()))?;

        let access_expiry = forward_only(current.access_token_expires_at, access_token_expires_at);
        let refresh_expiry =
            forward_only(current.refresh_token_expires_at, refresh_token_expires_at);
        // Providers that don't rotate refresh tokens omit them from the
        // refresh response; keep the stored one.
        let refresh_token = refresh_token.or(current.refresh_token.as_deref());

        let sealed_access = encryption::seal(access_token, &self.key)?;
        let sealed_refresh = refresh_token
            .map(|t| encryption::seal(t, &self.key))
            .transpose()?;

        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE integrations SET
                     access_token = ?1,
                     refresh_token = ?2,
                     access_token_expires_at = ?3,
                     refresh_token_expires_at = ?4
                 WHERE workspace_id = ?5 AND provider = ?6 AND client_id = ?7",
                params![
                    sealed_access,
                    sealed_refresh,
                    access_expiry.map(|t| t.to_rfc3339()),
                    refresh_expiry.map(|t| t.to_rfc3339()),
                    key.workspace_id,
                    key.provider.as_str(),
                    key.client_id.as_deref().unwrap_or("")
                ],
            )
            .context("failed to update tokens")?;

        Ok(())
    }

    /// Record a sync outcome. `Success` stamps `last_synced_at`; `Pending`
    /// stamps `last_sync_requested_at`.
    pub fn set_sync_status(
        &self,
        key: &IntegrationKey,
        status: SyncStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let synced_at_update = matches!(status, SyncStatus::Success);
        let requested_at_update = matches!(status, SyncStatus::Pending);

        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE integrations SET
                     last_sync_status = ?1,
                     last_sync_message = ?2,
                     last_synced_at = CASE WHEN ?3 THEN ?4 ELSE last_synced_at END,
                     last_sync_requested_at = CASE WHEN ?5 THEN ?4 ELSE last_sync_requested_at END
                 WHERE workspace_id = ?6 AND provider = ?7 AND client_id = ?8",
                params![
                    status.as_str(),
                    message,
                    synced_at_update,
                    now,
                    requested_at_update,
                    key.workspace_id,
                    key.provider.as_str(),
                    key.client_id.as_deref().unwrap_or("")
                ],
            )
            .context("failed to update sync status")?;

        Ok(())
    }

    /// Update sync preferences without touching tokens or status.
    pub fn set_preferences(
        &self,
        key: &IntegrationKey,
        auto_sync_enabled: bool,
        sync_frequency_minutes: i64,
        scheduled_timeframe_days: i64,
    ) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE integrations SET
                     auto_sync_enabled = ?1,
                     sync_frequency_minutes = ?2,
                     scheduled_timeframe_days = ?3
                 WHERE workspace_id = ?4 AND provider = ?5 AND client_id = ?6",
                params![
                    auto_sync_enabled,
                    sync_frequency_minutes,
                    scheduled_timeframe_days,
                    key.workspace_id,
                    key.provider.as_str(),
                    key.client_id.as_deref().unwrap_or("")
                ],
            )
            .context("failed to update preferences")?;
        Ok(())
    }
}

/// Later of the stored and proposed expiry; absent proposal keeps stored.
fn forward_only(
    current: Option<DateTime<Utc>>,
    proposed: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (current, proposed) {
        (Some(c), Some(p)) => Some(c.max(p)),
        (Some(c), None) => Some(c),
        (None, p) => p,
    }
}

/// Row as stored, tokens still sealed.
struct RawIntegrationRow {
    workspace_id: String,
    provider: String,
    client_id: String,
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
    scopes: String,
    account_id: String,
    account_name: Option<String>,
    developer_token: Option<String>,
    login_customer_id: Option<String>,
    access_token_expires_at: Option<String>,
    refresh_token_expires_at: Option<String>,
    last_sync_status: String,
    last_sync_message: Option<String>,
    last_synced_at: Option<String>,
    last_sync_requested_at: Option<String>,
    linked_at: String,
    auto_sync_enabled: bool,
    sync_frequency_minutes: i64,
    scheduled_timeframe_days: i64,
}

impl RawIntegrationRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            workspace_id: row.get(0)?,
            provider: row.get(1)?,
            client_id: row.get(2)?,
            access_token: row.get(3)?,
            refresh_token: row.get(4)?,
            id_token: row.get(5)?,
            scopes: row.get(6)?,
            account_id: row.get(7)?,
            account_name: row.get(8)?,
            developer_token: row.get(9)?,
            login_customer_id: row.get(10)?,
            access_token_expires_at: row.get(11)?,
            refresh_token_expires_at: row.get(12)?,
            last_sync_status: row.get(13)?,
            last_sync_message: row.get(14)?,
            last_synced_at: row.get(15)?,
            last_sync_requested_at: row.get(16)?,
            linked_at: row.get(17)?,
            auto_sync_enabled: row.get(18)?,
            sync_frequency_minutes: row.get(19)?,
            scheduled_timeframe_days: row.get(20)?,
        })
    }

    fn decrypt(self, key: &[u8]) -> Result<Integration> {
        let provider = ProviderKind::parse(&self.provider)
            .ok_or_else(|| anyhow!("unknown provider in store: {}", self.provider))?;
        let status = SyncStatus::parse(&self.last_sync_status)
            .ok_or_else(|| anyhow!("unknown sync status: {}", self.last_sync_status))?;

        Ok(Integration {
            workspace_id: self.workspace_id,
            provider,
            client_id: (!self.client_id.is_empty()).then_some(self.client_id),
            access_token: encryption::open(&self.access_token, key)
                .context("failed to decrypt access token")?,
            refresh_token: self
                .refresh_token
                .as_deref()
                .map(|t| encryption::open(t, key))
                .transpose()
                .context("failed to decrypt refresh token")?,
            id_token: self
                .id_token
                .as_deref()
                .map(|t| encryption::open(t, key))
                .transpose()
                .context("failed to decrypt id token")?,
            scopes: serde_json::from_str(&self.scopes).context("bad scopes column")?,
            account_id: self.account_id,
            account_name: self.account_name,
            developer_token: self
                .developer_token
                .as_deref()
                .map(|t| encryption::open(t, key))
                .transpose()
                .context("failed to decrypt developer token")?,
            login_customer_id: self.login_customer_id,
            access_token_expires_at: parse_ts(self.access_token_expires_at)?,
            refresh_token_expires_at: parse_ts(self.refresh_token_expires_at)?,
            last_sync_status: status,
            last_sync_message: self.last_sync_message,
            last_synced_at: parse_ts(self.last_synced_at)?,
            last_sync_requested_at: parse_ts(self.last_sync_requested_at)?,
            linked_at: parse_ts(Some(self.linked_at))?
                .ok_or_else(|| anyhow!("missing linked_at"))?,
            auto_sync_enabled: self.auto_sync_enabled,
            sync_frequency_minutes: self.sync_frequency_minutes,
            scheduled_timeframe_days: self.scheduled_timeframe_days,
        })
    }
}

fn parse_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .context("bad timestamp in store")
        })
        .transpose()
}
