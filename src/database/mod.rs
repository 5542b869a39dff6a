//! # Database Operations
//!
//! The orchestrator reaches the catalog store only through the [`Backend`]
//! trait. Two implementations ship with the crate:
//!
//! - [`postgres::PgBackend`] over a sqlx pool (runtime queries, embedded
//!   migrations from `migrations/`)
//! - [`memory::InMemoryBackend`], a faithful in-process store used by tests
//!   and embedded setups
//!
//! ## Transactions
//!
//! [`TransactionalBackend::start_transaction`] returns a
//! [`BackendTransaction`], itself a `Backend`. Every multi-row mutation of a
//! single orchestration step runs inside one. Dropping a transaction without
//! committing rolls it back; rolling back twice is harmless.
//!
//! ## Errors
//!
//! Backends return [`CatalogError`](crate::error::CatalogError): missing rows
//! are `EntityNotFound`, unique conflicts `EntityAlreadyExists`, rows still
//! referenced `DependencyStillExists`. A conditional job update matching no
//! row returns `EntityNotFound` wrapped as temporary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    BBox, ConsolidationParams, Container, Dataset, DatasetStatus, JobRecord, Layout, LockFlag,
    Record, Task, Variable, VariableInstance,
};
use crate::state_machine::{JobState, JobType};

pub mod connection;
pub mod memory;
pub mod postgres;
mod queries;

pub use connection::DatabaseConnection;
pub use memory::InMemoryBackend;
pub use postgres::PgBackend;

/// Dataset selection. Empty lists and `None` do not filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetFilter {
    pub ids: Vec<Uuid>,
    pub instance_ids: Vec<Uuid>,
    pub record_ids: Vec<Uuid>,
    pub statuses: Vec<DatasetStatus>,
    /// Only datasets locked by this job under this flag.
    pub locked_by: Option<(Uuid, LockFlag)>,
    /// Only datasets whose footprint interior overlaps this box.
    pub intersecting: Option<BBox>,
    pub container_uris: Vec<String>,
}

impl DatasetFilter {
    pub fn locked_by(job_id: Uuid, flag: LockFlag) -> Self {
        Self {
            locked_by: Some((job_id, flag)),
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = DatasetStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn intersecting(mut self, bbox: BBox) -> Self {
        self.intersecting = Some(bbox);
        self
    }

    /// Whether `dataset` passes every criterion but `locked_by`.
    pub fn matches(&self, dataset: &Dataset) -> bool {
        (self.ids.is_empty() || self.ids.contains(&dataset.id))
            && (self.instance_ids.is_empty() || self.instance_ids.contains(&dataset.instance_id))
            && (self.record_ids.is_empty() || self.record_ids.contains(&dataset.record_id))
            && (self.statuses.is_empty() || self.statuses.contains(&dataset.status))
            && (self.container_uris.is_empty()
                || self.container_uris.contains(&dataset.container_uri))
            && self
                .intersecting
                .as_ref()
                .map_or(true, |bbox| bbox.intersects(&dataset.geometry))
    }
}

/// Job selection for listings. Results are ordered newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    /// Case-insensitive substring of the job name.
    pub name_contains: Option<String>,
    pub job_type: Option<JobType>,
    pub states: Vec<JobState>,
    pub limit: Option<i64>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    // Records
    async fn create_record(&self, record: &Record) -> Result<()>;
    async fn read_records(&self, ids: &[Uuid]) -> Result<Vec<Record>>;

    // Variables, with their instances and consolidation parameters
    async fn create_variable(&self, variable: &Variable) -> Result<()>;
    async fn read_variable(&self, id: Uuid) -> Result<Variable>;
    async fn update_variable(&self, variable: &Variable) -> Result<()>;
    async fn delete_variable(&self, id: Uuid) -> Result<()>;

    async fn create_instance(&self, instance: &VariableInstance) -> Result<()>;
    async fn update_instance(&self, instance: &VariableInstance) -> Result<()>;
    async fn delete_instance(&self, id: Uuid) -> Result<()>;

    /// Consolidation parameters are owned by a variable or by a job.
    async fn create_consolidation_params(
        &self,
        owner_id: Uuid,
        params: &ConsolidationParams,
    ) -> Result<()>;
    async fn read_consolidation_params(&self, owner_id: Uuid)
        -> Result<Option<ConsolidationParams>>;
    async fn update_consolidation_params(
        &self,
        owner_id: Uuid,
        params: &ConsolidationParams,
    ) -> Result<()>;
    async fn delete_consolidation_params(&self, owner_id: Uuid) -> Result<()>;

    // Layouts
    async fn create_layout(&self, layout: &Layout) -> Result<()>;
    async fn read_layout(&self, name: &str) -> Result<Layout>;

    // Containers
    /// Inserts the container row only; datasets are created separately.
    async fn create_container(&self, container: &Container) -> Result<()>;
    /// The container and every dataset it holds.
    async fn read_container(&self, uri: &str) -> Result<Container>;
    async fn update_container(&self, container: &Container) -> Result<()>;
    async fn delete_container(&self, uri: &str) -> Result<()>;
    /// Uris starting with `prefix`, sorted.
    async fn find_container_uris(&self, prefix: &str) -> Result<Vec<String>>;

    // Datasets
    async fn create_dataset(&self, dataset: &Dataset) -> Result<()>;
    async fn update_dataset(&self, dataset: &Dataset) -> Result<()>;
    async fn delete_dataset(&self, id: Uuid) -> Result<()>;
    async fn find_datasets(&self, filter: &DatasetFilter) -> Result<Vec<Dataset>>;
    /// Moves the datasets locked by `(job_id, flag)` from `from` to `to`.
    /// Returns how many changed.
    async fn change_datasets_status(
        &self,
        job_id: Uuid,
        flag: LockFlag,
        from: DatasetStatus,
        to: DatasetStatus,
    ) -> Result<u64>;
    /// Union of the footprints of the datasets locked by `(job_id, flag)`.
    async fn datasets_geometry_union(&self, job_id: Uuid, flag: LockFlag) -> Result<Option<BBox>>;

    // Jobs
    async fn create_job(&self, job: &JobRecord) -> Result<()>;
    async fn read_job(&self, id: Uuid) -> Result<JobRecord>;
    /// Writes `job` if its row still carries `job.last_update`, then stamps
    /// the row with `new_occ`.
    async fn update_job(&self, job: &JobRecord, new_occ: DateTime<Utc>) -> Result<()>;
    async fn delete_job(&self, id: Uuid) -> Result<()>;
    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>>;

    // Tasks
    async fn create_task(&self, job_id: Uuid, task: &Task) -> Result<()>;
    async fn update_task(&self, job_id: Uuid, task: &Task) -> Result<()>;
    async fn delete_task(&self, job_id: Uuid, task_id: Uuid) -> Result<()>;
    /// Every task of the job, or only `task_id` when given.
    async fn read_tasks(&self, job_id: Uuid, task_id: Option<Uuid>) -> Result<Vec<Task>>;

    // Locks
    /// Claims `dataset_ids` for `job_id` under `flag`. Claims already held by
    /// the same job are kept; a claim held by another job fails the whole
    /// call with `EntityAlreadyExists`.
    async fn lock_datasets(&self, job_id: Uuid, dataset_ids: &[Uuid], flag: LockFlag)
        -> Result<()>;
    async fn release_datasets(&self, job_id: Uuid, flag: LockFlag) -> Result<()>;
}

#[async_trait]
pub trait TransactionalBackend: Backend {
    async fn start_transaction(&self) -> Result<Box<dyn BackendTransaction>>;

    fn backend(&self) -> &dyn Backend;
}

#[async_trait]
pub trait BackendTransaction: Backend {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    fn backend(&self) -> &dyn Backend;
}
