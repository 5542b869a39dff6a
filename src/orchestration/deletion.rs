//! # Deletion Entry Actions
//!
//! | state | action | success / failure |
//! |---|---|---|
//! | Created | hide datasets | DeletionReady / DeletionNotReady |
//! | DeletionInProgress | remove from catalog | DeletionEffective / DeletionFailed |
//! | DeletionEffective | remove physically | RemovalDone / RemovalFailed |
//! | Aborted | restore datasets | RollbackDone / RollbackFailed |
//!
//! The catalog side runs in one transaction: datasets and emptied containers
//! disappear together with the creation of the removal tasks. Physical
//! removal only touches containers the catalog no longer references.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::dispatcher::EventDispatcher;
use crate::database::DatasetFilter;
use crate::error::{CatalogError, Result};
use crate::models::{DatasetStatus, Job, LockFlag, LogSeverity};
use crate::state_machine::{JobEvent, JobStatus, TaskStatus};

/// Container uri carried by a removal task.
fn removal_uri(payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|e| CatalogError::should_never_happen(format!("removal task payload: {e}")))
}

impl EventDispatcher {
    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_deletion_created(&self, job: &mut Job) -> Result<()> {
        let result = self.hide_datasets(job).await;
        let event = Self::outcome(
            job.id(),
            result,
            JobStatus::DeletionReady,
            JobStatus::DeletionNotReady,
        )?;
        self.emit(job, event).await
    }

    async fn hide_datasets(&self, job: &mut Job) -> Result<()> {
        let tx = self.backend.start_transaction().await?;
        let hidden = tx
            .change_datasets_status(
                job.id(),
                LockFlag::ToDelete,
                DatasetStatus::Active,
                DatasetStatus::ToDelete,
            )
            .await?;
        job.log(LogSeverity::Info, format!("{hidden} dataset(s) hidden"));
        self.persister.save_job_in(&*tx, job).await?;
        tx.commit().await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_deletion_in_progress(&self, job: &mut Job) -> Result<()> {
        let result = self.unindex_datasets(job).await;
        let event = Self::outcome(
            job.id(),
            result,
            JobStatus::DeletionEffective,
            JobStatus::DeletionFailed,
        )?;
        self.emit(job, event).await
    }

    /// Removes the hidden datasets from the catalog, drops the containers
    /// they leave empty and creates one removal task per managed one.
    async fn unindex_datasets(&self, job: &mut Job) -> Result<()> {
        let filter = DatasetFilter::locked_by(job.id(), LockFlag::ToDelete)
            .with_statuses([DatasetStatus::ToDelete]);

        let tx = self.backend.start_transaction().await?;
        let datasets = tx.find_datasets(&filter).await?;
        let mut by_container: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for dataset in &datasets {
            by_container
                .entry(dataset.container_uri.clone())
                .or_default()
                .push(dataset.id);
        }

        let mut removals = Vec::new();
        let mut dropped = 0usize;
        for (uri, ids) in &by_container {
            let mut container = tx.read_container(uri).await?;
            for id in ids {
                container.remove_dataset(*id)?;
            }
            if container.is_empty() {
                if container.managed {
                    container.set_managed(false);
                    removals.push(uri.clone());
                }
                container.to_delete()?;
                dropped += 1;
            }
            self.persister.save_container_in(&*tx, &mut container).await?;
        }

        job.release_datasets(LockFlag::ToDelete);
        let scheduled: BTreeSet<String> = job
            .live_tasks()
            .filter_map(|t| removal_uri(t.payload()).ok())
            .collect();
        for uri in removals.iter().filter(|uri| !scheduled.contains(*uri)) {
            job.create_deletion_task(uri);
        }
        job.log(
            LogSeverity::Info,
            format!(
                "{} dataset(s) removed, {dropped} container(s) dropped, {} to remove physically",
                datasets.len(),
                removals.len()
            ),
        );
        self.persister.save_job_in(&*tx, job).await?;
        tx.commit().await
    }

    /// Deletes the files of the dropped containers. Failed removals are
    /// retried on re-entry.
    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_deletion_effective(&self, job: &mut Job) -> Result<()> {
        let event = match self.remove_containers(job).await {
            Ok(status) => JobEvent::new(job.id(), status),
            Err(error) => Self::failure(job.id(), error, JobStatus::RemovalFailed)?,
        };
        self.emit(job, event).await
    }

    /// Runs the removal tasks. Storage failures fail their task only.
    async fn remove_containers(&self, job: &mut Job) -> Result<JobStatus> {
        job.reset_failed_tasks();
        let pending: Vec<(Uuid, Vec<u8>)> = job
            .live_tasks()
            .filter(|t| t.state().is_active())
            .map(|t| (t.id(), t.payload().to_vec()))
            .collect();

        let storage = &self.storage;
        let outcomes: Vec<(Uuid, Result<String>)> = stream::iter(pending)
            .map(|(task_id, payload)| async move {
                let outcome = match removal_uri(&payload) {
                    Ok(uri) => storage.delete(&uri).await.map(|()| uri).map_err(Into::into),
                    Err(error) => Err(error),
                };
                (task_id, outcome)
            })
            .buffer_unordered(self.config.max_concurrent_removals.max(1))
            .collect()
            .await;

        for (task_id, outcome) in outcomes {
            match outcome {
                Ok(uri) => {
                    info!(uri = %uri, "🗑️ Container removed");
                    job.update_task(task_id, TaskStatus::Successful, None)?;
                }
                Err(error) => {
                    warn!(task_id = %task_id, error = %error, "❌ Container removal failed");
                    let message = error.to_string();
                    job.update_task(task_id, TaskStatus::Failed, Some(&message))?;
                }
            }
        }
        self.persister.save_job(job).await?;

        Ok(if job.failed_tasks() == 0 {
            JobStatus::RemovalDone
        } else {
            JobStatus::RemovalFailed
        })
    }

    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_deletion_aborted(&self, job: &mut Job) -> Result<()> {
        let result = self.restore_datasets(job).await;
        let event = Self::outcome(
            job.id(),
            result,
            JobStatus::RollbackDone,
            JobStatus::RollbackFailed,
        )?;
        self.emit(job, event).await
    }

    /// Makes the datasets still held visible again. Datasets already removed
    /// from the catalog stay removed.
    async fn restore_datasets(&self, job: &mut Job) -> Result<()> {
        let tx = self.backend.start_transaction().await?;
        let restored = tx
            .change_datasets_status(
                job.id(),
                LockFlag::ToDelete,
                DatasetStatus::ToDelete,
                DatasetStatus::Active,
            )
            .await?;
        job.release_datasets(LockFlag::ToDelete);
        job.delete_all_tasks(true)?;
        job.log(
            LogSeverity::Warning,
            format!("rolled back, {restored} dataset(s) restored"),
        );
        self.persister.save_job_in(&*tx, job).await?;
        tx.commit().await
    }
}
