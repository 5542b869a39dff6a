//! # Consolidation Entry Actions
//!
//! One action per consolidation state, each reporting its outcome as the
//! next job event:
//!
//! | state | action | success / failure |
//! |---|---|---|
//! | Created | prepare orders | OrdersPrepared / PrepareOrdersFailed |
//! | ConsolidationInProgress | publish orders | (task events) / ConsolidationFailed |
//! | ConsolidationRetrying | reset failed tasks | OrdersPrepared / ConsolidationFailed |
//! | ConsolidationCancelling | cancel tasks | CancellationDone / CancellationFailed |
//! | ConsolidationDone | index containers | ConsolidationIndexed / ConsolidationIndexingFailed |
//! | ConsolidationIndexed | swap datasets | ConsolidationEffective / SwapDatasetsFailed |
//! | ConsolidationEffective | start deletion | DeletionStarted / DeletionNotStarted |
//! | Aborted | roll back | RollbackDone / RollbackFailed |
//!
//! Every action can be replayed: re-entering a state after a crash or a
//! forced retry finds the work already done and reports success.

use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::dispatcher::EventDispatcher;
use crate::database::{DatasetFilter, JobFilter};
use crate::error::{CatalogError, Result};
use crate::models::{
    unmarshal_consolidation_event, BBox, ConsolidationContainer, Container, Dataset,
    DatasetStatus, Job, JobPayload, LockFlag, LogSeverity, TaskState,
};
use crate::state_machine::{ExecutionLevel, JobEvent, JobState, JobStatus, JobType, TaskStatus};

/// Longest prefix of the parent name kept in a child deletion job name.
const CHILD_NAME_PREFIX: usize = 100;

/// Footprint of an output container, from its geotransform and size.
pub(crate) fn container_footprint(container: &ConsolidationContainer) -> BBox {
    let [min_x, res_x, _, max_y, _, res_y] = container.geotransform;
    BBox::new(
        min_x,
        max_y + res_y * f64::from(container.height),
        min_x + res_x * f64::from(container.width),
        max_y,
    )
}

fn instance_of(job: &Job) -> Result<Uuid> {
    match job.payload() {
        JobPayload::Consolidation { instance_id, .. } => Ok(*instance_id),
        other => Err(CatalogError::should_never_happen(format!(
            "consolidation action on a {} payload",
            other.job_type()
        ))),
    }
}

impl EventDispatcher {
    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_consolidation_created(&self, job: &mut Job) -> Result<()> {
        let result = self.prepare_orders(job).await;
        let event = Self::outcome(
            job.id(),
            result,
            JobStatus::OrdersPrepared,
            JobStatus::PrepareOrdersFailed,
        )?;
        self.emit(job, event).await
    }

    /// Publishes the order of every task not yet finished. Task events
    /// drive the job on from here.
    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_consolidation_in_progress(&self, job: &mut Job) -> Result<()> {
        let next = match self.send_orders(job).await {
            Ok(next) => next,
            Err(error) => Some(Self::failure(job.id(), error, JobStatus::ConsolidationFailed)?),
        };
        match next {
            Some(event) => self.emit(job, event).await,
            None => Ok(()),
        }
    }

    /// Tasks are marked Pending and saved before publishing, so a fast
    /// executor never reports on a task still recorded as New. Returns the
    /// next event when there is nothing left to send.
    async fn send_orders(&self, job: &mut Job) -> Result<Option<JobEvent>> {
        let orders: Vec<(Uuid, Vec<u8>)> = job
            .live_tasks()
            .filter(|t| t.state().is_active())
            .map(|t| (t.id(), t.payload().to_vec()))
            .collect();

        if orders.is_empty() {
            let status = if job.failed_tasks() > 0 {
                JobStatus::ConsolidationFailed
            } else {
                JobStatus::ConsolidationDone
            };
            info!(status = %status, "No orders to send");
            return Ok(Some(JobEvent::new(job.id(), status)));
        }

        for (task_id, _) in &orders {
            job.update_task(*task_id, TaskStatus::Pending, None)?;
        }
        job.log(
            LogSeverity::Info,
            format!("{} order(s) sent", orders.len()),
        );
        self.persister.save_job(job).await?;

        let payloads: Vec<Vec<u8>> = orders.into_iter().map(|(_, payload)| payload).collect();
        self.publish(self.orders.as_ref(), &payloads).await?;
        info!(orders = payloads.len(), "📤 Orders published");
        Ok(None)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_consolidation_retrying(&self, job: &mut Job) -> Result<()> {
        let result = self.reset_tasks(job).await;
        let event = Self::outcome(
            job.id(),
            result,
            JobStatus::OrdersPrepared,
            JobStatus::ConsolidationFailed,
        )?;
        self.emit(job, event).await
    }

    async fn reset_tasks(&self, job: &mut Job) -> Result<()> {
        let reset = job.reset_failed_tasks();
        self.persister.save_job(job).await?;
        debug!(reset, "failed tasks reset");
        Ok(())
    }

    /// Writes a cancellation marker for every running task and accounts the
    /// unfinished tasks as cancelled. Executors still running may report a
    /// late success afterwards.
    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_consolidation_cancelling(&self, job: &mut Job) -> Result<()> {
        let result = self.cancel_tasks(job).await;
        let event = Self::outcome(
            job.id(),
            result,
            JobStatus::CancellationDone,
            JobStatus::CancellationFailed,
        )?;
        self.emit(job, event).await
    }

    async fn cancel_tasks(&self, job: &mut Job) -> Result<()> {
        let running: Vec<(Uuid, TaskState)> = job
            .live_tasks()
            .filter(|t| t.state().is_active())
            .map(|t| (t.id(), t.state()))
            .collect();
        for (task_id, state) in &running {
            if *state == TaskState::Pending {
                self.cancellation.request(job.id(), *task_id).await?;
            }
        }
        for (task_id, _) in &running {
            job.update_task(*task_id, TaskStatus::Cancelled, None)?;
        }
        job.log(
            LogSeverity::Warning,
            format!("{} task(s) cancelled", running.len()),
        );
        self.persister.save_job(job).await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_consolidation_done(&self, job: &mut Job) -> Result<()> {
        let result = self.index_containers(job).await;
        let event = Self::outcome(
            job.id(),
            result,
            JobStatus::ConsolidationIndexed,
            JobStatus::ConsolidationIndexingFailed,
        )?;
        self.emit(job, event).await
    }

    /// Registers every produced container with one Inactive dataset per
    /// record, all locked under `New`.
    async fn index_containers(&self, job: &mut Job) -> Result<()> {
        let already = self
            .db()
            .find_datasets(&DatasetFilter::locked_by(job.id(), LockFlag::New))
            .await?;
        if !already.is_empty() {
            info!(datasets = already.len(), "Containers already indexed");
            return Ok(());
        }

        let instance_id = instance_of(job)?;
        let mut containers = Vec::new();
        for task in job.live_tasks().filter(|t| t.state() == TaskState::Done) {
            let order = unmarshal_consolidation_event(task.payload())?;
            let target = &order.container;
            let footprint = container_footprint(target);
            let mut container = Container::new(&target.uri, true, &target.storage_class);
            for (position, record) in order.records.iter().enumerate() {
                let mut dataset = Dataset::new(
                    record.id,
                    instance_id,
                    &target.uri,
                    format!("GTIFF_DIR:{}", position + 1),
                    (1..=target.bands_count as i64).collect(),
                    target.dformat,
                    footprint,
                    record.valid_shape,
                );
                dataset.overviews = target.overviews_min_size >= 0;
                dataset.status = DatasetStatus::Inactive;
                container.add_dataset(dataset);
            }
            containers.push(container);
        }

        let new_ids: Vec<Uuid> = containers
            .iter()
            .flat_map(|c| c.datasets.iter().map(|d| d.id))
            .collect();
        job.lock_datasets(new_ids.iter().copied(), LockFlag::New);
        job.log(
            LogSeverity::Info,
            format!(
                "{} container(s) indexed with {} dataset(s)",
                containers.len(),
                new_ids.len()
            ),
        );

        let tx = self.backend.start_transaction().await?;
        for container in &mut containers {
            self.persister.save_container_in(&*tx, container).await?;
        }
        self.persister.save_job_in(&*tx, job).await?;
        tx.commit().await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_consolidation_indexed(&self, job: &mut Job) -> Result<()> {
        let result = self.swap_datasets(job).await;
        let event = Self::outcome(
            job.id(),
            result,
            JobStatus::ConsolidationEffective,
            JobStatus::SwapDatasetsFailed,
        )?;
        self.emit(job, event).await
    }

    /// Hides the superseded datasets and publishes the new ones atomically.
    async fn swap_datasets(&self, job: &mut Job) -> Result<()> {
        let tx = self.backend.start_transaction().await?;
        let hidden = tx
            .change_datasets_status(
                job.id(),
                LockFlag::ToDelete,
                DatasetStatus::Active,
                DatasetStatus::ToDelete,
            )
            .await?;
        let published = tx
            .change_datasets_status(
                job.id(),
                LockFlag::New,
                DatasetStatus::Inactive,
                DatasetStatus::Active,
            )
            .await?;
        job.log(
            LogSeverity::Info,
            format!("{published} dataset(s) published, {hidden} superseded"),
        );
        self.persister.save_job_in(&*tx, job).await?;
        tx.commit().await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_consolidation_effective(&self, job: &mut Job) -> Result<()> {
        let result = self.start_deletion(job).await;
        let event = Self::outcome(
            job.id(),
            result,
            JobStatus::DeletionStarted,
            JobStatus::DeletionNotStarted,
        )?;
        self.emit(job, event).await
    }

    /// Hands the superseded datasets over to a child deletion job.
    async fn start_deletion(&self, job: &mut Job) -> Result<()> {
        let superseded: Vec<Uuid> = self
            .db()
            .find_datasets(&DatasetFilter::locked_by(job.id(), LockFlag::ToDelete))
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();

        let mut child = None;
        if !superseded.is_empty() {
            let level = match job.execution_level() {
                ExecutionLevel::Synchronous => ExecutionLevel::Synchronous,
                _ => ExecutionLevel::Asynchronous,
            };
            let name: String = job.name().chars().take(CHILD_NAME_PREFIX).collect();
            let mut deletion = Job::new_deletion(
                format!("{} cleanup", name.trim_end()),
                vec![instance_of(job)?],
                Vec::new(),
                Some(job.id()),
                level,
            )?;
            deletion.lock_datasets(superseded.iter().copied(), LockFlag::ToDelete);
            job.log(
                LogSeverity::Info,
                format!(
                    "deletion job {} started for {} dataset(s)",
                    deletion.id(),
                    superseded.len()
                ),
            );
            child = Some(deletion);
        }
        job.release_datasets(LockFlag::ToDelete);
        job.release_datasets(LockFlag::New);

        // The parent must give up its claims before the child takes them.
        let tx = self.backend.start_transaction().await?;
        self.persister.save_job_in(&*tx, job).await?;
        if let Some(deletion) = child.as_mut() {
            self.persister.save_job_in(&*tx, deletion).await?;
        }
        tx.commit().await?;

        let mut to_start: Vec<(ExecutionLevel, Uuid)> = Vec::new();
        if let Some(deletion) = &child {
            to_start.push((deletion.execution_level(), deletion.id()));
        } else {
            // A previous run may have created the child without starting it.
            to_start.extend(self.unstarted_children(job.id()).await?);
        }
        for (level, child_id) in to_start {
            self.emit_at(level, JobEvent::new(child_id, JobStatus::JobCreated))
                .await?;
        }
        Ok(())
    }

    async fn unstarted_children(&self, parent_id: Uuid) -> Result<Vec<(ExecutionLevel, Uuid)>> {
        let filter = JobFilter {
            job_type: Some(JobType::Deletion),
            states: vec![JobState::New],
            ..JobFilter::default()
        };
        Ok(self
            .db()
            .find_jobs(&filter)
            .await?
            .into_iter()
            .filter(|record| {
                matches!(
                    record.payload,
                    JobPayload::Deletion { parent_job_id: Some(parent), .. } if parent == parent_id
                )
            })
            .map(|record| (record.execution_level, record.id))
            .collect())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn on_consolidation_aborted(&self, job: &mut Job) -> Result<()> {
        let result = self.rollback_consolidation(job).await;
        let event = Self::outcome(
            job.id(),
            result,
            JobStatus::RollbackDone,
            JobStatus::RollbackFailed,
        )?;
        self.emit(job, event).await
    }

    /// Undoes whatever the pipeline did so far. Swapping is atomic, so at
    /// most the indexing has to be reverted.
    async fn rollback_consolidation(&self, job: &mut Job) -> Result<()> {
        for task in job.live_tasks().filter(|t| t.state().is_active()) {
            if let Err(error) = self.cancellation.request(job.id(), task.id()).await {
                warn!(task_id = %task.id(), error = %error, "cancellation marker not written");
            }
        }

        self.unindex_containers(job).await?;

        // Containers uploaded by tasks but unknown to the catalog.
        let mut produced = BTreeSet::new();
        for task in job.live_tasks() {
            if let Ok(order) = unmarshal_consolidation_event(task.payload()) {
                produced.insert(order.container.uri);
            }
        }
        let mut removed = 0usize;
        for uri in &produced {
            match self.db().read_container(uri).await {
                Ok(_) => {}
                Err(error) if error.is_not_found() => {
                    self.storage.delete(uri).await?;
                    removed += 1;
                }
                Err(error) => return Err(error),
            }
        }

        job.delete_all_tasks(true)?;
        for flag in [LockFlag::New, LockFlag::ToDelete, LockFlag::Init] {
            job.release_datasets(flag);
        }
        job.log(
            LogSeverity::Warning,
            format!("rolled back, {removed} orphan container(s) removed"),
        );
        self.persister.save_job(job).await
    }

    /// Removes the Inactive datasets indexed by the job and the containers
    /// left empty.
    async fn unindex_containers(&self, job: &Job) -> Result<()> {
        let filter = DatasetFilter::locked_by(job.id(), LockFlag::New)
            .with_statuses([DatasetStatus::Inactive]);
        let datasets = self.db().find_datasets(&filter).await?;
        if datasets.is_empty() {
            return Ok(());
        }

        let uris: BTreeSet<String> = datasets.iter().map(|d| d.container_uri.clone()).collect();
        let tx = self.backend.start_transaction().await?;
        for uri in &uris {
            let mut container = tx.read_container(uri).await?;
            for dataset in datasets.iter().filter(|d| &d.container_uri == uri) {
                container.remove_dataset(dataset.id)?;
            }
            if container.is_empty() {
                container.set_managed(false);
                container.to_delete()?;
            }
            self.persister.save_container_in(&*tx, &mut container).await?;
        }
        tx.commit().await?;
        debug!(containers = uris.len(), "indexing reverted");
        Ok(())
    }
}
