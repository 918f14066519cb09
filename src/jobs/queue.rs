//! Durable sync-job queue.
//!
//! Enforces at most one in-flight job per (workspace, provider, client) key:
//! `enqueue` suppresses duplicates while a queued/running job exists, and
//! `claim_next` hands each queued job to exactly one caller. The claim is a
//! storage-level compare-and-set (an IMMEDIATE transaction selects the
//! oldest queued job and flips it to running under a `status = 'queued'`
//! guard), never an application-level lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use super::{JobStatus, JobType, SyncJob};
use crate::credentials::{IntegrationKey, IntegrationStore, SyncStatus};
use crate::providers::ProviderKind;

pub struct SyncJobQueue {
    conn: Mutex<Connection>,
    integrations: Arc<IntegrationStore>,
}

const COLUMNS: &str = "id, workspace_id, provider, client_id, job_type, timeframe_days, \
     status, created_at, started_at, processed_at, error_message";

impl SyncJobQueue {
    pub fn new<P: AsRef<Path>>(db_path: P, integrations: Arc<IntegrationStore>) -> Result<Self> {
        let conn = Connection::open(db_path).context("failed to open jobs database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS sync_jobs (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                client_id TEXT NOT NULL DEFAULT '',
                job_type TEXT NOT NULL,
                timeframe_days INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                created_at TEXT NOT NULL,
                started_at TEXT,
                processed_at TEXT,
                error_message TEXT
            )
            "#,
            [],
        )
        .context("failed to create sync_jobs table")?;

        // Supports the one-running-per-key existence check and the claim scan.
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sync_jobs_key_status
             ON sync_jobs(workspace_id, provider, client_id, status)",
            [],
        )
        .context("failed to create sync_jobs index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            integrations,
        })
    }

    /// True while a queued or running job exists for the key.
    pub fn has_pending_sync_job(&self, key: &IntegrationKey) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let pending: bool = conn
            .query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM sync_jobs
                     WHERE workspace_id = ?1 AND provider = ?2 AND client_id = ?3
                       AND status IN ('queued', 'running'))",
                params![
                    key.workspace_id,
                    key.provider.as_str(),
                    key.client_id.as_deref().unwrap_or("")
                ],
                |row| row.get(0),
            )
            .context("failed to check pending jobs")?;
        Ok(pending)
    }

    /// Enqueue a job unless the key already has one queued or running.
    ///
    /// Returns the created job, or `None` when suppressed ("not scheduled").
    pub fn enqueue(
        &self,
        key: &IntegrationKey,
        job_type: JobType,
        timeframe_days: i64,
    ) -> Result<Option<SyncJob>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin enqueue transaction")?;

        let pending: bool = tx.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM sync_jobs
                 WHERE workspace_id = ?1 AND provider = ?2 AND client_id = ?3
                   AND status IN ('queued', 'running'))",
            params![
                key.workspace_id,
                key.provider.as_str(),
                key.client_id.as_deref().unwrap_or("")
            ],
            |row| row.get(0),
        )?;

        if pending {
            info!(
                key = %key.lock_key(),
                job_type = job_type.as_str(),
                "Sync not scheduled: job already queued or running"
            );
            return Ok(None);
        }

        let job = SyncJob {
            id: Uuid::new_v4().to_string(),
            workspace_id: key.workspace_id.clone(),
            provider: key.provider,
            client_id: key.client_id.clone(),
            job_type,
            timeframe_days,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            processed_at: None,
            error_message: None,
        };

        tx.execute(
            "INSERT INTO sync_jobs (
                 id, workspace_id, provider, client_id, job_type,
                 timeframe_days, status, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7)",
            params![
                job.id,
                job.workspace_id,
                job.provider.as_str(),
                job.client_id.as_deref().unwrap_or(""),
                job.job_type.as_str(),
                job.timeframe_days,
                job.created_at.to_rfc3339(),
            ],
        )
        .context("failed to insert job")?;

        tx.commit().context("failed to commit enqueue")?;

        info!(
            job_id = %job.id,
            key = %key.lock_key(),
            job_type = job_type.as_str(),
            timeframe_days,
            "Sync job enqueued"
        );

        Ok(Some(job))
    }

    /// Atomically claim the oldest queued job for a workspace.
    ///
    /// The select-and-flip runs inside an IMMEDIATE transaction with a
    /// `status = 'queued'` guard on the UPDATE, so of N concurrent callers
    /// exactly one receives a given job. Returns `None` when nothing is
    /// queued.
    pub fn claim_next(&self, workspace_id: &str) -> Result<Option<SyncJob>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin claim transaction")?;

        let candidate = tx
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM sync_jobs
                     WHERE workspace_id = ?1 AND status = 'queued'
                     ORDER BY created_at, id LIMIT 1"
                ),
                params![workspace_id],
                read_job,
            )
            .optional()
            .context("failed to scan queued jobs")?;

        let Some(mut job) = candidate else {
            return Ok(None);
        };

        let started_at = Utc::now();
        let updated = tx.execute(
            "UPDATE sync_jobs SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'queued'",
            params![started_at.to_rfc3339(), job.id],
        )?;
        if updated != 1 {
            // Lost the compare-and-set; caller can try again.
            return Ok(None);
        }

        tx.commit().context("failed to commit claim")?;

        job.status = JobStatus::Running;
        job.started_at = Some(started_at);
        Ok(Some(job))
    }

    /// running → completed.
    pub fn complete(&self, job_id: &str) -> Result<()> {
        let n = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE sync_jobs SET status = 'completed', processed_at = ?1
                 WHERE id = ?2 AND status = 'running'",
                params![Utc::now().to_rfc3339(), job_id],
            )
            .context("failed to complete job")?;
        if n == 0 {
            warn!(job_id, "Complete called on a job that was not running");
        }
        Ok(())
    }

    /// running → failed. Also stamps the integration's last_sync_status so
    /// observers never need to poll job history.
    pub fn fail(&self, job_id: &str, message: &str) -> Result<()> {
        let key = {
            let conn = self.conn.lock().unwrap();
            let job = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM sync_jobs WHERE id = ?1"),
                    params![job_id],
                    read_job,
                )
                .optional()
                .context("failed to load job for failure")?;

            conn.execute(
                "UPDATE sync_jobs SET status = 'failed', processed_at = ?1, error_message = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![Utc::now().to_rfc3339(), message, job_id],
            )
            .context("failed to mark job failed")?;

            job.map(|j| j.integration_key())
        };

        if let Some(key) = key {
            if let Err(e) = self
                .integrations
                .set_sync_status(&key, SyncStatus::Error, Some(message))
            {
                warn!(job_id, error = %e, "Failed to stamp integration error status");
            }
        }

        Ok(())
    }

    /// Disconnect cascade: drop queued jobs for the key. Running jobs are
    /// left to reach their terminal state.
    pub fn delete_pending_for_key(&self, key: &IntegrationKey) -> Result<usize> {
        let n = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM sync_jobs
                 WHERE workspace_id = ?1 AND provider = ?2 AND client_id = ?3
                   AND status = 'queued'",
                params![
                    key.workspace_id,
                    key.provider.as_str(),
                    key.client_id.as_deref().unwrap_or("")
                ],
            )
            .context("failed to delete pending jobs")?;
        Ok(n)
    }

    /// Return jobs stuck in `running` longer than `timeout` to the queue.
    /// Covers workers that died without reaching a terminal state.
    pub fn reclaim_stuck(&self, timeout: std::time::Duration) -> Result<usize> {
        let cutoff: DateTime<Utc> =
            Utc::now() - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let n = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE sync_jobs SET status = 'queued', started_at = NULL
                 WHERE status = 'running' AND started_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .context("failed to reclaim stuck jobs")?;
        if n > 0 {
            warn!(reclaimed = n, "Requeued jobs stuck in running state");
        }
        Ok(n)
    }

    /// Job by id, mainly for status endpoints and tests.
    pub fn get(&self, job_id: &str) -> Result<Option<SyncJob>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM sync_jobs WHERE id = ?1"),
            params![job_id],
            read_job,
        )
        .optional()
        .context("failed to load job")
    }

    /// Backdate a running job's claim time (reclaim tests).
    #[cfg(test)]
    pub(crate) fn backdate_started_at(&self, job_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE sync_jobs SET started_at = ?1 WHERE id = ?2",
                params![started_at.to_rfc3339(), job_id],
            )
            .context("failed to backdate job")?;
        Ok(())
    }

    /// All jobs for a workspace, newest first.
    pub fn list_by_workspace(&self, workspace_id: &str) -> Result<Vec<SyncJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sync_jobs
             WHERE workspace_id = ?1 ORDER BY created_at DESC, id DESC"
        ))?;
        let jobs = stmt
            .query_map(params![workspace_id], read_job)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read jobs")?;
        Ok(jobs)
    }
}

fn read_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncJob> {
    let provider: String = row.get(2)?;
    let client_id: String = row.get(3)?;
    let job_type: String = row.get(4)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let started_at: Option<String> = row.get(8)?;
    let processed_at: Option<String> = row.get(9)?;

    let bad_column = |what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unrecognized {}", what).into(),
        )
    };
    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
            })
    };

    Ok(SyncJob {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        provider: ProviderKind::parse(&provider).ok_or_else(|| bad_column("provider"))?,
        client_id: (!client_id.is_empty()).then_some(client_id),
        job_type: JobType::parse(&job_type).ok_or_else(|| bad_column("job type"))?,
        timeframe_days: row.get(5)?,
        status: JobStatus::parse(&status).ok_or_else(|| bad_column("job status"))?,
        created_at: parse(&created_at)?,
        started_at: started_at.as_deref().map(parse).transpose()?,
        processed_at: processed_at.as_deref().map(parse).transpose()?,
        error_message: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    fn stores() -> (tempfile::TempDir, Arc<IntegrationStore>, SyncJobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let integrations = Arc::new(
            IntegrationStore::new(dir.path().join("integrations.db"), &BASE64.encode([0u8; 32]))
                .unwrap(),
        );
        let queue =
            SyncJobQueue::new(dir.path().join("jobs.db"), Arc::clone(&integrations)).unwrap();
        (dir, integrations, queue)
    }

    fn meta_key(workspace: &str) -> IntegrationKey {
        IntegrationKey::new(workspace, ProviderKind::Meta, None)
    }

    #[test]
    fn test_enqueue_and_claim() {
        let (_dir, _integrations, queue) = stores();
        let key = meta_key("w1");

        let job = queue
            .enqueue(&key, JobType::InitialBackfill, 90)
            .unwrap()
            .expect("job should be scheduled");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.timeframe_days, 90);

        let claimed = queue.claim_next("w1").unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        // Nothing else queued.
        assert!(queue.claim_next("w1").unwrap().is_none());
    }

    #[test]
    fn test_enqueue_dedup() {
        let (_dir, _integrations, queue) = stores();
        let key = meta_key("w1");

        assert!(queue
            .enqueue(&key, JobType::ScheduledSync, 30)
            .unwrap()
            .is_some());
        assert!(queue.has_pending_sync_job(&key).unwrap());

        // Second enqueue for the same key is suppressed.
        assert!(queue
            .enqueue(&key, JobType::ManualSync, 7)
            .unwrap()
            .is_none());

        let jobs = queue.list_by_workspace("w1").unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn test_dedup_also_covers_running() {
        let (_dir, _integrations, queue) = stores();
        let key = meta_key("w1");

        queue.enqueue(&key, JobType::ScheduledSync, 30).unwrap();
        queue.claim_next("w1").unwrap().unwrap();

        // Job is running now; still no duplicate.
        assert!(queue.has_pending_sync_job(&key).unwrap());
        assert!(queue
            .enqueue(&key, JobType::ManualSync, 7)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_different_keys_do_not_dedup() {
        let (_dir, _integrations, queue) = stores();

        queue
            .enqueue(&meta_key("w1"), JobType::ScheduledSync, 30)
            .unwrap()
            .unwrap();
        queue
            .enqueue(
                &IntegrationKey::new("w1", ProviderKind::Google, None),
                JobType::ScheduledSync,
                30,
            )
            .unwrap()
            .unwrap();
        queue
            .enqueue(
                &IntegrationKey::new("w1", ProviderKind::Meta, Some("client-2".into())),
                JobType::ScheduledSync,
                30,
            )
            .unwrap()
            .unwrap();

        assert_eq!(queue.list_by_workspace("w1").unwrap().len(), 3);
    }

    #[test]
    fn test_claim_oldest_first() {
        let (_dir, _integrations, queue) = stores();

        let first = queue
            .enqueue(&meta_key("w1"), JobType::ScheduledSync, 30)
            .unwrap()
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = queue
            .enqueue(
                &IntegrationKey::new("w1", ProviderKind::Google, None),
                JobType::ScheduledSync,
                30,
            )
            .unwrap()
            .unwrap();

        assert_eq!(queue.claim_next("w1").unwrap().unwrap().id, first.id);
        assert_eq!(queue.claim_next("w1").unwrap().unwrap().id, second.id);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let integrations = Arc::new(
            IntegrationStore::new(dir.path().join("integrations.db"), &BASE64.encode([0u8; 32]))
                .unwrap(),
        );
        let queue = Arc::new(
            SyncJobQueue::new(dir.path().join("jobs.db"), Arc::clone(&integrations)).unwrap(),
        );

        queue
            .enqueue(&meta_key("w1"), JobType::ManualSync, 7)
            .unwrap()
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || queue.claim_next("w1").unwrap())
            })
            .collect();

        let winners: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .flatten()
            .collect();

        // Exactly one caller received the job.
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].status, JobStatus::Running);
    }

    #[test]
    fn test_complete_stamps_processed_at() {
        let (_dir, _integrations, queue) = stores();
        queue
            .enqueue(&meta_key("w1"), JobType::ScheduledSync, 30)
            .unwrap()
            .unwrap();
        let job = queue.claim_next("w1").unwrap().unwrap();

        queue.complete(&job.id).unwrap();
        let done = queue.get(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.processed_at.is_some());
        assert!(done.error_message.is_none());
    }

    #[test]
    fn test_fail_updates_job_and_integration() {
        let (_dir, integrations, queue) = stores();
        let key = meta_key("w1");

        // Seed the integration so fail() has a record to stamp.
        let mut integration = crate::credentials::Integration {
            workspace_id: "w1".into(),
            provider: ProviderKind::Meta,
            client_id: None,
            access_token: "tok".into(),
            refresh_token: None,
            id_token: None,
            scopes: vec![],
            account_id: "act_1".into(),
            account_name: None,
            developer_token: None,
            login_customer_id: None,
            access_token_expires_at: None,
            refresh_token_expires_at: None,
            last_sync_status: SyncStatus::Pending,
            last_sync_message: None,
            last_synced_at: None,
            last_sync_requested_at: None,
            linked_at: Utc::now(),
            auto_sync_enabled: true,
            sync_frequency_minutes: 1440,
            scheduled_timeframe_days: 30,
        };
        integrations.upsert(&integration).unwrap();

        queue.enqueue(&key, JobType::ScheduledSync, 30).unwrap();
        let job = queue.claim_next("w1").unwrap().unwrap();
        queue.fail(&job.id, "meta: rate limited").unwrap();

        let failed = queue.get(&job.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("meta: rate limited"));
        assert!(failed.processed_at.is_some());

        integration = integrations.get(&key).unwrap().unwrap();
        assert_eq!(integration.last_sync_status, SyncStatus::Error);
        assert_eq!(
            integration.last_sync_message.as_deref(),
            Some("meta: rate limited")
        );
    }

    #[test]
    fn test_terminal_jobs_allow_new_enqueue() {
        let (_dir, _integrations, queue) = stores();
        let key = meta_key("w1");

        queue.enqueue(&key, JobType::ScheduledSync, 30).unwrap();
        let job = queue.claim_next("w1").unwrap().unwrap();
        queue.complete(&job.id).unwrap();

        // Terminal state frees the key.
        assert!(!queue.has_pending_sync_job(&key).unwrap());
        assert!(queue
            .enqueue(&key, JobType::ScheduledSync, 30)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_delete_pending_for_key() {
        let (_dir, _integrations, queue) = stores();
        let key = meta_key("w1");

        queue.enqueue(&key, JobType::ScheduledSync, 30).unwrap();
        assert_eq!(queue.delete_pending_for_key(&key).unwrap(), 1);
        assert!(!queue.has_pending_sync_job(&key).unwrap());
    }

    #[test]
    fn test_reclaim_stuck_requeues_old_running_jobs() {
        let (_dir, _integrations, queue) = stores();
        let key = meta_key("w1");

        queue.enqueue(&key, JobType::ScheduledSync, 30).unwrap();
        let job = queue.claim_next("w1").unwrap().unwrap();

        // Backdate started_at past the reclaim cutoff.
        queue
            .backdate_started_at(&job.id, Utc::now() - Duration::minutes(20))
            .unwrap();

        let reclaimed = queue
            .reclaim_stuck(std::time::Duration::from_secs(600))
            .unwrap();
        assert_eq!(reclaimed, 1);

        let requeued = queue.get(&job.id).unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert!(requeued.started_at.is_none());
    }

    #[test]
    fn test_reclaim_ignores_fresh_running_jobs() {
        let (_dir, _integrations, queue) = stores();
        queue
            .enqueue(&meta_key("w1"), JobType::ScheduledSync, 30)
            .unwrap();
        queue.claim_next("w1").unwrap().unwrap();

        let reclaimed = queue
            .reclaim_stuck(std::time::Duration::from_secs(600))
            .unwrap();
        assert_eq!(reclaimed, 0);
    }
}
