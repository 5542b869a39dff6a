//! # Job Service
//!
//! Operator-facing surface: creating consolidation and deletion jobs,
//! sending user commands and reading jobs back.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use catalog_orchestrator::orchestration::{ConsolidationRequest, JobService};
//! # use std::sync::Arc;
//! # async fn example(service: JobService, variable_id: uuid::Uuid, instance_id: uuid::Uuid)
//! #     -> catalog_orchestrator::error::Result<()> {
//! let request = ConsolidationRequest::new(
//!     "ndvi over tile 31UDQ",
//!     variable_id,
//!     instance_id,
//!     "utm-31n",
//!     "s3://cubes/ndvi",
//! );
//! let job_id = service.consolidate(request).await?;
//! service.cancel(job_id, false).await?;
//! # Ok(())
//! # }
//! ```
//!
//! A new job claims its datasets before it is announced, so two jobs never
//! work on the same dataset. Commands are applied immediately by the
//! dispatcher; an event the job's state does not accept is reported as
//! `UnhandledEvent` and leaves the job unchanged.

use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::dispatcher::EventDispatcher;
use crate::database::{DatasetFilter, JobFilter};
use crate::error::{CatalogError, Result};
use crate::logging::log_job_created;
use crate::models::{
    ConsolidationParams, DatasetStatus, Job, JobLog, JobRecord, LockFlag, LogSeverity,
};
use crate::state_machine::{ExecutionLevel, JobEvent, JobStatus};

/// Largest page [`JobService::job_logs`] returns.
pub const MAX_LOG_PAGE: usize = 1000;

/// Consolidation of the Active datasets of one variable instance.
#[derive(Debug, Clone)]
pub struct ConsolidationRequest {
    pub name: String,
    pub variable_id: Uuid,
    pub instance_id: Uuid,
    pub layout_name: String,
    pub storage_uri: String,
    /// Restricts the job to these records. Empty means every record.
    pub record_ids: Vec<Uuid>,
    /// Overrides the variable parameters for this job only.
    pub params: Option<ConsolidationParams>,
    pub execution_level: ExecutionLevel,
}

impl ConsolidationRequest {
    pub fn new(
        name: impl Into<String>,
        variable_id: Uuid,
        instance_id: Uuid,
        layout_name: impl Into<String>,
        storage_uri: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            variable_id,
            instance_id,
            layout_name: layout_name.into(),
            storage_uri: storage_uri.into(),
            record_ids: Vec::new(),
            params: None,
            execution_level: ExecutionLevel::default(),
        }
    }

    pub fn with_records(mut self, record_ids: Vec<Uuid>) -> Self {
        self.record_ids = record_ids;
        self
    }

    pub fn with_params(mut self, params: ConsolidationParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_execution_level(mut self, level: ExecutionLevel) -> Self {
        self.execution_level = level;
        self
    }
}

/// Removal of the Active datasets matching the instances and records.
#[derive(Debug, Clone)]
pub struct DeletionRequest {
    pub name: String,
    pub instance_ids: Vec<Uuid>,
    pub record_ids: Vec<Uuid>,
    pub execution_level: ExecutionLevel,
}

impl DeletionRequest {
    pub fn new(name: impl Into<String>, instance_ids: Vec<Uuid>, record_ids: Vec<Uuid>) -> Self {
        Self {
            name: name.into(),
            instance_ids,
            record_ids,
            execution_level: ExecutionLevel::default(),
        }
    }

    pub fn with_execution_level(mut self, level: ExecutionLevel) -> Self {
        self.execution_level = level;
        self
    }
}

#[derive(Debug, Clone)]
pub struct JobService {
    dispatcher: Arc<EventDispatcher>,
}

impl JobService {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Creates a consolidation job holding the matching datasets under
    /// `Init` and starts it.
    #[instrument(
        skip(self, request),
        fields(name = %request.name, instance_id = %request.instance_id)
    )]
    pub async fn consolidate(&self, request: ConsolidationRequest) -> Result<Uuid> {
        let db = self.dispatcher.db();
        let variable = db.read_variable(request.variable_id).await?;
        if variable.instance(request.instance_id).is_none() {
            return Err(CatalogError::not_found("variable instance", request.instance_id));
        }
        db.read_layout(&request.layout_name).await?;

        let filter = DatasetFilter {
            instance_ids: vec![request.instance_id],
            record_ids: request.record_ids.clone(),
            statuses: vec![DatasetStatus::Active],
            ..DatasetFilter::default()
        };
        let datasets = db.find_datasets(&filter).await?;
        if datasets.is_empty() {
            return Err(CatalogError::validation(format!(
                "no active dataset of instance {} to consolidate",
                request.instance_id
            )));
        }

        let mut job = Job::new_consolidation(
            request.name,
            request.variable_id,
            request.instance_id,
            request.layout_name,
            request.storage_uri,
            request.execution_level,
        )?;
        let params = request
            .params
            .or_else(|| variable.consolidation_params.clone())
            .unwrap_or_else(|| variable.default_consolidation_params());
        job.set_params(params)?;
        job.lock_datasets(datasets.iter().map(|d| d.id), LockFlag::Init);
        job.log(
            LogSeverity::Info,
            format!("{} dataset(s) to consolidate", datasets.len()),
        );
        self.start(job).await
    }

    /// Creates a deletion job holding the matching datasets under
    /// `ToDelete` and starts it.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn delete_datasets(&self, request: DeletionRequest) -> Result<Uuid> {
        if request.instance_ids.is_empty() && request.record_ids.is_empty() {
            return Err(CatalogError::validation(
                "deletion job: at least one instance or record is required",
            ));
        }
        let filter = DatasetFilter {
            instance_ids: request.instance_ids.clone(),
            record_ids: request.record_ids.clone(),
            statuses: vec![DatasetStatus::Active],
            ..DatasetFilter::default()
        };
        let datasets = self.dispatcher.db().find_datasets(&filter).await?;
        if datasets.is_empty() {
            return Err(CatalogError::validation("no active dataset to delete"));
        }

        let mut job = Job::new_deletion(
            request.name,
            request.instance_ids,
            request.record_ids,
            None,
            request.execution_level,
        )?;
        job.lock_datasets(datasets.iter().map(|d| d.id), LockFlag::ToDelete);
        job.log(
            LogSeverity::Info,
            format!("{} dataset(s) to delete", datasets.len()),
        );
        self.start(job).await
    }

    /// Saves a new job, claims included, then announces it.
    async fn start(&self, mut job: Job) -> Result<Uuid> {
        self.dispatcher.persister().save_job(&mut job).await?;
        log_job_created(&job);
        self.dispatcher
            .emit_at(
                job.execution_level(),
                JobEvent::new(job.id(), JobStatus::JobCreated),
            )
            .await?;
        Ok(job.id())
    }

    async fn command(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        info!(job_id = %job_id, status = %status, "📨 User command");
        self.dispatcher
            .handle_job_event(JobEvent::new(job_id, status))
            .await
    }

    /// Retries the failed step. `forced` also re-runs a step whose failure
    /// left the catalog in doubt.
    pub async fn retry(&self, job_id: Uuid, forced: bool) -> Result<()> {
        let status = if forced {
            JobStatus::RetryForced
        } else {
            JobStatus::Retry
        };
        self.command(job_id, status).await
    }

    /// Cancels the job. `forced` also aborts a job stuck in a failure state.
    pub async fn cancel(&self, job_id: Uuid, forced: bool) -> Result<()> {
        let status = if forced {
            JobStatus::CancelledByUserForced
        } else {
            JobStatus::CancelledByUser
        };
        self.command(job_id, status).await
    }

    /// Resumes a job paused by its step-by-step execution level.
    pub async fn continue_job(&self, job_id: Uuid) -> Result<()> {
        self.command(job_id, JobStatus::Continue).await
    }

    /// Changes how often the job pauses. Takes effect at the next transition.
    pub async fn set_execution_level(&self, job_id: Uuid, level: ExecutionLevel) -> Result<()> {
        let mut job = self.get_job(job_id).await?;
        job.set_execution_level(level);
        self.dispatcher.persister().save_job(&mut job).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.dispatcher.persister().load_job(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.dispatcher.db().find_jobs(filter).await
    }

    /// One page of the job log, oldest first, at most [`MAX_LOG_PAGE`] entries.
    pub async fn job_logs(&self, job_id: Uuid, page: usize, limit: usize) -> Result<Vec<JobLog>> {
        let job = self.get_job(job_id).await?;
        Ok(job.logs_page(page, limit.min(MAX_LOG_PAGE)).to_vec())
    }

    /// Deletes a finished job. Unfinished jobs require `force`, which also
    /// drops their tasks and releases their claims.
    #[instrument(skip(self))]
    pub async fn delete_job(&self, job_id: Uuid, force: bool) -> Result<()> {
        let mut job = self.get_job(job_id).await?;
        if !force && !job.state().is_terminal() {
            return Err(CatalogError::dependency_still_exists(
                "job",
                job_id,
                format!("job is still {}", job.state()),
            ));
        }
        job.to_delete(force)?;
        self.dispatcher.persister().save_job(&mut job).await?;
        info!("🗑️ Job deleted");
        Ok(())
    }
}
