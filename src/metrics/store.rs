//! SQLite-backed metric storage.
//!
//! Rows are keyed by (workspace_id, provider, client_id, account_id,
//! campaign_id, date) with upsert-only writes, so overlapping re-syncs
//! overwrite rather than duplicate.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, ToSql};
use std::path::Path;
use std::sync::Mutex;

use super::NormalizedMetric;
use crate::providers::ProviderKind;

/// Filters for [`MetricStore::list`]. Empty filter returns the workspace's
/// full history.
#[derive(Clone, Debug, Default)]
pub struct MetricFilter {
    pub provider: Option<ProviderKind>,
    pub client_id: Option<String>,
    pub account_id: Option<String>,
    pub campaign_id: Option<String>,
    /// Inclusive YYYY-MM-DD bounds.
    pub since: Option<String>,
    pub until: Option<String>,
}

pub struct MetricStore {
    conn: Mutex<Connection>,
}

impl MetricStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("failed to open metrics database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                client_id TEXT NOT NULL DEFAULT '',
                account_id TEXT NOT NULL DEFAULT '',
                campaign_id TEXT NOT NULL DEFAULT '',
                date TEXT NOT NULL,
                spend REAL NOT NULL,
                impressions INTEGER NOT NULL,
                clicks INTEGER NOT NULL,
                conversions REAL NOT NULL,
                revenue REAL,
                campaign_name TEXT,
                creatives TEXT NOT NULL DEFAULT '[]',
                raw_payload TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(workspace_id, provider, client_id, account_id, campaign_id, date)
            )
            "#,
            [],
        )
        .context("failed to create metrics table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_metrics_workspace_date
             ON metrics(workspace_id, provider, date)",
            [],
        )
        .context("failed to create metrics index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert one chunk inside a single transaction.
    pub fn upsert_chunk(&self, workspace_id: &str, metrics: &[NormalizedMetric]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("failed to begin metric write")?;
        let now = Utc::now().to_rfc3339();

        for metric in metrics {
            let creatives =
                serde_json::to_string(&metric.creatives).context("failed to encode creatives")?;
            let raw_payload = serde_json::to_string(&metric.raw_payload)
                .context("failed to encode raw payload")?;

            tx.execute(
                r#"
                INSERT INTO metrics (
                    workspace_id, provider, client_id, account_id, campaign_id, date,
                    spend, impressions, clicks, conversions, revenue,
                    campaign_name, creatives, raw_payload, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                ON CONFLICT(workspace_id, provider, client_id, account_id, campaign_id, date)
                DO UPDATE SET
                    spend = excluded.spend,
                    impressions = excluded.impressions,
                    clicks = excluded.clicks,
                    conversions = excluded.conversions,
                    revenue = excluded.revenue,
                    campaign_name = excluded.campaign_name,
                    creatives = excluded.creatives,
                    raw_payload = excluded.raw_payload,
                    updated_at = excluded.updated_at
                "#,
                params![
                    workspace_id,
                    metric.provider.as_str(),
                    metric.client_id.as_deref().unwrap_or(""),
                    metric.account_id.as_deref().unwrap_or(""),
                    metric.campaign_id.as_deref().unwrap_or(""),
                    metric.date,
                    metric.spend,
                    metric.impressions,
                    metric.clicks,
                    metric.conversions,
                    metric.revenue,
                    metric.campaign_name,
                    creatives,
                    raw_payload,
                    now,
                ],
            )
            .context("failed to upsert metric row")?;
        }

        tx.commit().context("failed to commit metric write")
    }

    /// Metrics for a workspace, filtered, ordered by date then campaign.
    pub fn list(&self, workspace_id: &str, filter: &MetricFilter) -> Result<Vec<NormalizedMetric>> {
        let mut sql = String::from(
            "SELECT provider, client_id, account_id, campaign_id, date,
                    spend, impressions, clicks, conversions, revenue,
                    campaign_name, creatives, raw_payload
             FROM metrics WHERE workspace_id = ?1",
        );
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(workspace_id.to_string())];

        if let Some(provider) = filter.provider {
            args.push(Box::new(provider.as_str().to_string()));
            sql.push_str(&format!(" AND provider = ?{}", args.len()));
        }
        if let Some(client_id) = &filter.client_id {
            args.push(Box::new(client_id.clone()));
            sql.push_str(&format!(" AND client_id = ?{}", args.len()));
        }
        if let Some(account_id) = &filter.account_id {
            args.push(Box::new(account_id.clone()));
            sql.push_str(&format!(" AND account_id = ?{}", args.len()));
        }
        if let Some(campaign_id) = &filter.campaign_id {
            args.push(Box::new(campaign_id.clone()));
            sql.push_str(&format!(" AND campaign_id = ?{}", args.len()));
        }
        if let Some(since) = &filter.since {
            args.push(Box::new(since.clone()));
            sql.push_str(&format!(" AND date >= ?{}", args.len()));
        }
        if let Some(until) = &filter.until {
            args.push(Box::new(until.clone()));
            sql.push_str(&format!(" AND date <= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY date, provider, campaign_id");

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), read_metric)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read metrics")?;
        Ok(rows)
    }

    /// Total stored rows for a workspace (status endpoints, tests).
    pub fn count(&self, workspace_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM metrics WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )
        .context("failed to count metrics")
    }
}

fn read_metric(row: &rusqlite::Row<'_>) -> rusqlite::Result<NormalizedMetric> {
    let provider: String = row.get(0)?;
    let client_id: String = row.get(1)?;
    let account_id: String = row.get(2)?;
    let campaign_id: String = row.get(3)?;
    let creatives: String = row.get(11)?;
    let raw_payload: String = row.get(12)?;

    let provider = ProviderKind::parse(&provider).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unrecognized provider: {}", provider).into(),
        )
    })?;

    Ok(NormalizedMetric {
        provider,
        client_id: (!client_id.is_empty()).then_some(client_id),
        account_id: (!account_id.is_empty()).then_some(account_id),
        campaign_id: (!campaign_id.is_empty()).then_some(campaign_id),
        date: row.get(4)?,
        spend: row.get(5)?,
        impressions: row.get(6)?,
        clicks: row.get(7)?,
        conversions: row.get(8)?,
        revenue: row.get(9)?,
        campaign_name: row.get(10)?,
        creatives: serde_json::from_str(&creatives).unwrap_or_default(),
        raw_payload: serde_json::from_str(&raw_payload)
            .unwrap_or(serde_json::Value::Null),
    })
}
