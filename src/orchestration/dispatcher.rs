//! # Event Dispatcher
//!
//! Single entry point for every [`Event`]: task outcomes reported by the
//! executors, user commands and the job's own step events.
//!
//! ## Job Events
//!
//! 1. Reload the job, apply [`Job::trigger`], save it under OCC. A lost race
//!    reloads and re-applies the event.
//! 2. Unless the job now waits (or the event was a no-op `Continue`), run the
//!    entry action of the new state.
//!
//! Entry actions turn their own failures into failure events. Only
//! publishing errors, and temporary errors once the bounded retry here is
//! exhausted, reach the caller, which must redeliver the event. Publishing
//! is itself retried with backoff before giving up.
//!
//! A redelivered event that no longer applies, but whose transition already
//! put the job in its current state, replays that state's entry action. The
//! actions are idempotent, so this resumes a step whose publish was lost.
//!
//! ## Task Events
//!
//! Outcomes are recorded idempotently. The update that drains the last
//! active task of a running consolidation synthesizes the job event that
//! moves it on.
//!
//! ## Continuation
//!
//! [`EventDispatcher::emit`] hands the next event to the same dispatcher
//! in-process for `Synchronous` jobs and publishes it on the events channel
//! otherwise. Action-emitted edges are acyclic per job kind, so the
//! in-process recursion is bounded by the table depth.

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::cancellation::CancellationChannel;
use super::persister::Persister;
use crate::config::ExecutionConfig;
use crate::database::{Backend, TransactionalBackend};
use crate::error::{CatalogError, Result};
use crate::logging::{log_job_transition, log_task_outcome};
use crate::messaging::Publisher;
use crate::models::Job;
use crate::state_machine::{
    is_retry_forced, leads_to, marshal_event, Event, ExecutionLevel, JobEvent, JobState,
    JobStatus, JobType, TaskEvent, TaskStatus,
};
use crate::storage::ContainerStorage;

pub struct EventDispatcher {
    pub(super) backend: Arc<dyn TransactionalBackend>,
    pub(super) persister: Persister,
    pub(super) events: Arc<dyn Publisher>,
    pub(super) orders: Arc<dyn Publisher>,
    pub(super) storage: Arc<dyn ContainerStorage>,
    pub(super) cancellation: CancellationChannel,
    pub(super) config: ExecutionConfig,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("config", &self.config)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Dispatcher with default execution settings. Cancellation markers are
    /// written under `cancellation_prefix` in `storage`.
    pub fn new(
        backend: Arc<dyn TransactionalBackend>,
        events: Arc<dyn Publisher>,
        orders: Arc<dyn Publisher>,
        storage: Arc<dyn ContainerStorage>,
        cancellation_prefix: impl Into<String>,
    ) -> Self {
        Self {
            persister: Persister::new(backend.clone()),
            cancellation: CancellationChannel::new(storage.clone(), cancellation_prefix),
            backend,
            events,
            orders,
            storage,
            config: ExecutionConfig::default(),
        }
    }

    pub fn with_execution_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn persister(&self) -> &Persister {
        &self.persister
    }

    pub fn cancellation(&self) -> &CancellationChannel {
        &self.cancellation
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub(super) fn db(&self) -> &dyn Backend {
        self.backend.backend()
    }

    pub async fn handle_event(&self, event: Event) -> Result<()> {
        match event {
            Event::Job(event) => self.handle_job_event(event).await,
            Event::Task(event) => self.handle_task_event(event).await,
        }
    }

    /// Boxed so synchronous jobs can recurse through [`Self::emit`].
    pub fn handle_job_event(&self, event: JobEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(mut job) = self.transition(&event).await? else {
                return Ok(());
            };
            let state = job.state();

            let mut attempt = 0;
            loop {
                match self.on_enter_state(&mut job).await {
                    Err(error) if error.is_temporary() && attempt < self.config.max_retries => {
                        job = self.persister.load_job(job.id()).await?;
                        if job.state() != state {
                            // Raised by a later step run in-process, which
                            // already spent its own retries.
                            warn!(
                                job_id = %job.id(),
                                state = %job.state(),
                                error = %error,
                                "⚠️ Later step failed, handing the error back"
                            );
                            return Err(error);
                        }
                        if job.waiting() {
                            debug!(job_id = %job.id(), "job paused while retrying");
                            return Ok(());
                        }
                        warn!(
                            job_id = %job.id(),
                            state = %state,
                            attempt,
                            error = %error,
                            "⚠️ Entry action hit a temporary error, retrying"
                        );
                        tokio::time::sleep(self.config.backoff(attempt)).await;
                        attempt += 1;
                    }
                    other => return other,
                }
            }
        })
    }

    /// Applies `event` and persists it. `None` when there is nothing to run:
    /// a no-op `Continue`, or a job that now waits.
    #[instrument(skip(self, event), fields(job_id = %event.job_id, status = %event.status))]
    async fn transition(&self, event: &JobEvent) -> Result<Option<Job>> {
        let mut attempt = 0;
        loop {
            let mut job = self.persister.load_job(event.job_id).await?;
            let from = job.state();
            let applied = match job.trigger(event) {
                Ok(applied) => applied,
                Err(error) if error.is_unhandled() && Self::replays(&job, event) => {
                    info!(state = %from, "🔁 Event already applied, replaying");
                    return Ok(Some(job));
                }
                Err(error) => return Err(error),
            };
            if !applied {
                debug!("Continue on a job that was not waiting");
                return Ok(None);
            }
            match self.persister.save_job(&mut job).await {
                Ok(()) => {
                    log_job_transition(
                        job.id(),
                        job.job_type().as_str(),
                        from.as_str(),
                        job.state().as_str(),
                        event.status.as_str(),
                        job.waiting(),
                    );
                    if job.waiting() {
                        info!(state = %job.state(), "⏸️ Job waiting for Continue");
                        return Ok(None);
                    }
                    return Ok(Some(job));
                }
                Err(error) if error.is_temporary() && attempt < self.config.max_occ_retries => {
                    debug!(attempt, error = %error, "lost a save race, reloading");
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Whether `event` is a redelivery of the event that put `job` in its
    /// current state. User commands are never replayed.
    fn replays(job: &Job, event: &JobEvent) -> bool {
        !event.status.is_user_command()
            && !job.waiting()
            && is_retry_forced(job.state())
            && leads_to(job.job_type(), event.status, job.state())
    }

    #[instrument(
        skip(self, event),
        fields(job_id = %event.job_id, task_id = %event.task_id, status = %event.status)
    )]
    async fn handle_task_event(&self, event: TaskEvent) -> Result<()> {
        if matches!(event.status, TaskStatus::Cancelled | TaskStatus::Ignored) {
            debug!("task outcome already accounted for");
            return Ok(());
        }

        let mut attempt = 0;
        let follow_up = loop {
            match self.record_task_outcome(&event).await {
                Err(error) if error.is_temporary() && attempt < self.config.max_occ_retries => {
                    debug!(attempt, error = %error, "lost a save race, reloading");
                    attempt += 1;
                }
                other => break other?,
            }
        };

        match follow_up {
            Some((level, next)) => self.emit_at(level, next).await,
            None => Ok(()),
        }
    }

    async fn record_task_outcome(
        &self,
        event: &TaskEvent,
    ) -> Result<Option<(ExecutionLevel, JobEvent)>> {
        let rolled_back = |state: JobState| {
            matches!(state, JobState::Aborted | JobState::Failed | JobState::RollbackFailed)
        };

        let mut job = match self
            .persister
            .load_job_with_task(event.job_id, event.task_id)
            .await
        {
            Ok(job) => job,
            // Rollback deletes the tasks of an aborted job.
            Err(error) if error.is_not_found() && !error.is_temporary() => {
                let record = self.db().read_job(event.job_id).await?;
                if rolled_back(record.state) {
                    info!(state = %record.state, "Outcome of a rolled back task dropped");
                    return Ok(None);
                }
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        if event.status == TaskStatus::Successful && rolled_back(job.state()) {
            info!(state = %job.state(), "Late task success dropped");
            return Ok(None);
        }

        let active_before = job.active_tasks();
        if !job.update_task(event.task_id, event.status, event.error.as_deref())? {
            debug!("task outcome already recorded");
            return Ok(None);
        }
        self.persister.save_job(&mut job).await?;
        log_task_outcome(
            &job,
            event.task_id,
            &event.status.to_string(),
            event.error.as_deref(),
        );

        if active_before == 0 || job.active_tasks() > 0 {
            return Ok(None);
        }
        let status = match job.state() {
            JobState::ConsolidationCancelling => JobStatus::CancellationDone,
            JobState::ConsolidationInProgress if job.failed_tasks() > 0 => {
                JobStatus::ConsolidationFailed
            }
            JobState::ConsolidationInProgress => JobStatus::ConsolidationDone,
            _ => return Ok(None),
        };
        Ok(Some((job.execution_level(), JobEvent::new(job.id(), status))))
    }

    /// Hands the next step of `job` on according to its execution level.
    pub(super) async fn emit(&self, job: &Job, event: JobEvent) -> Result<()> {
        self.emit_at(job.execution_level(), event).await
    }

    pub(super) async fn emit_at(&self, level: ExecutionLevel, event: JobEvent) -> Result<()> {
        if level == ExecutionLevel::Synchronous {
            return self.handle_job_event(event).await;
        }
        let payload = marshal_event(&Event::Job(event))?;
        self.publish(self.events.as_ref(), &[payload]).await
    }

    /// Publishes `payloads`, retrying with backoff while the bus fails.
    pub(super) async fn publish(
        &self,
        publisher: &dyn Publisher,
        payloads: &[Vec<u8>],
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match publisher.publish(payloads).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < self.config.max_retries => {
                    warn!(attempt, error = %error, "⚠️ Publishing failed, retrying");
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Turns the outcome of an action into the event that reports it.
    /// Publishing and temporary errors are returned as is.
    pub(super) fn outcome(
        job_id: Uuid,
        result: Result<()>,
        success: JobStatus,
        failure: JobStatus,
    ) -> Result<JobEvent> {
        match result {
            Ok(()) => Ok(JobEvent::new(job_id, success)),
            Err(error) => Self::failure(job_id, error, failure),
        }
    }

    /// The `failure` event reporting `error`, unless the error must reach
    /// the caller.
    pub(super) fn failure(
        job_id: Uuid,
        error: CatalogError,
        failure: JobStatus,
    ) -> Result<JobEvent> {
        if error.is_publishing() || error.is_temporary() {
            return Err(error);
        }
        warn!(job_id = %job_id, status = %failure, error = %error, "❌ Step failed");
        Ok(JobEvent::failed(job_id, failure, error))
    }

    async fn on_enter_state(&self, job: &mut Job) -> Result<()> {
        match (job.job_type(), job.state()) {
            (JobType::Consolidation, JobState::Created) => self.on_consolidation_created(job).await,
            (JobType::Consolidation, JobState::ConsolidationInProgress) => {
                self.on_consolidation_in_progress(job).await
            }
            (JobType::Consolidation, JobState::ConsolidationRetrying) => {
                self.on_consolidation_retrying(job).await
            }
            (JobType::Consolidation, JobState::ConsolidationCancelling) => {
                self.on_consolidation_cancelling(job).await
            }
            (JobType::Consolidation, JobState::ConsolidationDone) => {
                self.on_consolidation_done(job).await
            }
            (JobType::Consolidation, JobState::ConsolidationIndexed) => {
                self.on_consolidation_indexed(job).await
            }
            (JobType::Consolidation, JobState::ConsolidationEffective) => {
                self.on_consolidation_effective(job).await
            }
            (JobType::Consolidation, JobState::Aborted) => {
                self.on_consolidation_aborted(job).await
            }
            (JobType::Deletion, JobState::Created) => self.on_deletion_created(job).await,
            (JobType::Deletion, JobState::DeletionInProgress) => {
                self.on_deletion_in_progress(job).await
            }
            (JobType::Deletion, JobState::DeletionEffective) => {
                self.on_deletion_effective(job).await
            }
            (JobType::Deletion, JobState::Aborted) => self.on_deletion_aborted(job).await,
            (job_type, state) => {
                debug!(job_id = %job.id(), %job_type, %state, "no entry action");
                Ok(())
            }
        }
    }
}
