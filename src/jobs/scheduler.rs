//! Due-ness scan and manual triggers.
//!
//! Invoked by an external cron collaborator (the scheduler tick endpoint);
//! there is no resident polling loop. Each tick also runs the stuck-job
//! reclaim so crashed workers cannot strand a key forever.

use anyhow::Result;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::info;

use super::{JobType, SyncJob, SyncJobQueue};
use crate::config::retry::JOB_RECLAIM_TIMEOUT;
use crate::credentials::{IntegrationKey, IntegrationStore};

/// Outcome of one scheduler tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reclaimed: usize,
    pub enqueued: usize,
}

pub struct Scheduler {
    integrations: Arc<IntegrationStore>,
    queue: Arc<SyncJobQueue>,
}

impl Scheduler {
    pub fn new(integrations: Arc<IntegrationStore>, queue: Arc<SyncJobQueue>) -> Self {
        Self {
            integrations,
            queue,
        }
    }

    /// Enqueue a `scheduled-sync` for every auto-sync integration that is
    /// due: `now − last_synced_at ≥ sync_frequency_minutes`. Integrations
    /// that never synced are immediately due. The one-in-flight-per-key
    /// rule still applies via the queue's dedup.
    pub fn enqueue_due_jobs(&self) -> Result<usize> {
        let now = Utc::now();
        let mut enqueued = 0;

        for integration in self.integrations.list_auto_sync_enabled()? {
            let due = match integration.last_synced_at {
                None => true,
                Some(last) => {
                    now - last >= Duration::minutes(integration.sync_frequency_minutes)
                }
            };
            if !due {
                continue;
            }

            if self
                .queue
                .enqueue(
                    &integration.key(),
                    JobType::ScheduledSync,
                    integration.scheduled_timeframe_days,
                )?
                .is_some()
            {
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            info!(enqueued, "Scheduled due sync jobs");
        }
        Ok(enqueued)
    }

    /// Manual trigger: bypasses due-ness, still deduped per key.
    ///
    /// `timeframe_days` falls back to the integration's configured
    /// scheduled timeframe.
    pub fn trigger_manual(
        &self,
        key: &IntegrationKey,
        timeframe_days: Option<i64>,
    ) -> Result<Option<SyncJob>> {
        let timeframe = match timeframe_days {
            Some(days) => days,
            None => self
                .integrations
                .get(key)?
                .map(|i| i.scheduled_timeframe_days)
                .unwrap_or(30),
        };
        self.queue.enqueue(key, JobType::ManualSync, timeframe)
    }

    /// One scheduler tick: reclaim stuck jobs, then enqueue due ones.
    pub fn tick(&self) -> Result<TickSummary> {
        let reclaimed = self.queue.reclaim_stuck(JOB_RECLAIM_TIMEOUT)?;
        let enqueued = self.enqueue_due_jobs()?;
        Ok(TickSummary {
            reclaimed,
            enqueued,
        })
    }
}
