//! Idempotent, chunked metric persistence.

use std::sync::Arc;
use tracing::{debug, error};

use super::{MetricStore, NormalizedMetric};
use crate::error::SyncError;

/// Rows per persistence call.
const CHUNK_SIZE: usize = 100;

pub struct MetricsWriter {
    store: Arc<MetricStore>,
}

impl MetricsWriter {
    pub fn new(store: Arc<MetricStore>) -> Self {
        Self { store }
    }

    /// Write a batch in chunks of at most [`CHUNK_SIZE`] rows.
    ///
    /// Each chunk commits independently; a later chunk's failure does not
    /// roll back earlier ones; the next re-sync overwrites cleanly because
    /// writes are upserts. Store
    /// failures surface as `PersistenceUnavailable` and fail the job.
    pub fn write_batch(
        &self,
        workspace_id: &str,
        metrics: &[NormalizedMetric],
    ) -> Result<usize, SyncError> {
        for (i, chunk) in metrics.chunks(CHUNK_SIZE).enumerate() {
            self.store.upsert_chunk(workspace_id, chunk).map_err(|e| {
                error!(
                    workspace_id,
                    chunk = i,
                    written_so_far = i * CHUNK_SIZE,
                    error = %e,
                    "Metric chunk write failed"
                );
                SyncError::PersistenceUnavailable(e.to_string())
            })?;
            debug!(workspace_id, chunk = i, rows = chunk.len(), "Metric chunk written");
        }
        Ok(metrics.len())
    }
}
