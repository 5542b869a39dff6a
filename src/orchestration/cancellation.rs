//! Cooperative cancellation of running tasks.
//!
//! The orchestrator writes an empty marker object per task; external
//! executors check for it before starting and before publishing their
//! output. Nothing is preempted.

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::ContainerStorage;

#[derive(Clone)]
pub struct CancellationChannel {
    storage: Arc<dyn ContainerStorage>,
    prefix: String,
}

impl std::fmt::Debug for CancellationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationChannel")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Marker location for one task: `{prefix}/{job_id}_{task_id}`.
pub fn marker_uri(prefix: &str, job_id: Uuid, task_id: Uuid) -> String {
    format!("{}/{job_id}_{task_id}", prefix.trim_end_matches('/'))
}

impl CancellationChannel {
    pub fn new(storage: Arc<dyn ContainerStorage>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn request(&self, job_id: Uuid, task_id: Uuid) -> Result<()> {
        let uri = marker_uri(&self.prefix, job_id, task_id);
        self.storage.write(&uri, &[]).await?;
        debug!(job_id = %job_id, task_id = %task_id, uri = %uri, "🛑 Cancellation requested");
        Ok(())
    }

    pub async fn is_requested(&self, job_id: Uuid, task_id: Uuid) -> Result<bool> {
        Ok(self
            .storage
            .exists(&marker_uri(&self.prefix, job_id, task_id))
            .await?)
    }

    /// Removes the marker. Missing markers are ignored.
    pub async fn clear(&self, job_id: Uuid, task_id: Uuid) -> Result<()> {
        Ok(self
            .storage
            .delete(&marker_uri(&self.prefix, job_id, task_id))
            .await?)
    }
}
