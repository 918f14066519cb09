//! Durable sync jobs: the work queue, the job runner, and the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::IntegrationKey;
use crate::providers::ProviderKind;

pub mod queue;
pub mod runner;
pub mod scheduler;

pub use queue::SyncJobQueue;
pub use runner::JobRunner;
pub use scheduler::Scheduler;

/// Why a job was enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// First sync right after an account is connected.
    InitialBackfill,
    /// Enqueued by the due-ness scan.
    ScheduledSync,
    /// User-requested, bypasses the due-ness check.
    ManualSync,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::InitialBackfill => "initial-backfill",
            JobType::ScheduledSync => "scheduled-sync",
            JobType::ManualSync => "manual-sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial-backfill" => Some(JobType::InitialBackfill),
            "scheduled-sync" => Some(JobType::ScheduledSync),
            "manual-sync" => Some(JobType::ManualSync),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One queued unit of work: fetch metrics for an integration over a
/// timeframe. Never auto-resurrected after reaching a terminal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub workspace_id: String,
    pub provider: ProviderKind,
    pub client_id: Option<String>,
    pub job_type: JobType,
    pub timeframe_days: i64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl SyncJob {
    pub fn integration_key(&self) -> IntegrationKey {
        IntegrationKey {
            workspace_id: self.workspace_id.clone(),
            provider: self.provider,
            client_id: self.client_id.clone(),
        }
    }
}
