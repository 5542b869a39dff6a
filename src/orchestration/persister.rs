//! # Persister
//!
//! Translates the persistence states carried by an aggregate into backend
//! calls, in one transaction.
//!
//! ## Save Order
//!
//! Children first (deleted, then created, then updated), the aggregate last.
//! For jobs the final write is the conditional update keyed by the OCC
//! timestamp captured at load, so a lost race rolls back every child write
//! with it and surfaces as a temporary `EntityNotFound`.
//!
//! In-memory states only advance once the write succeeded. When the caller
//! supplies its own transaction, they advance before that transaction
//! commits; a caller that rolls back must reload the aggregate.

use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::database::{Backend, TransactionalBackend};
use crate::error::Result;
use crate::models::{Container, Job, PersistenceState, Variable};

#[derive(Clone)]
pub struct Persister {
    backend: Arc<dyn TransactionalBackend>,
}

impl std::fmt::Debug for Persister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister").finish_non_exhaustive()
    }
}

/// Runs `$body` against a fresh transaction bound to `$db`, committing on
/// success and rolling back on error.
macro_rules! in_transaction {
    ($self:ident, $db:ident => $body:expr) => {{
        let tx = $self.backend.start_transaction().await?;
        let result = {
            let $db = &*tx;
            $body.await
        };
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    debug!(error = %rollback_error, "rollback after failed save also failed");
                }
                Err(error)
            }
        }
    }};
}

impl Persister {
    pub fn new(backend: Arc<dyn TransactionalBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn TransactionalBackend> {
        &self.backend
    }

    /// The job, its tasks and its own consolidation parameters.
    pub async fn load_job(&self, job_id: Uuid) -> Result<Job> {
        let db = self.backend.backend();
        let record = db.read_job(job_id).await?;
        let tasks = db.read_tasks(job_id, None).await?;
        let params = db.read_consolidation_params(job_id).await?;
        Ok(Job::from_record(record, tasks, params))
    }

    /// The job with only `task_id` loaded. Fails with `EntityNotFound` when
    /// the task does not belong to the job.
    pub async fn load_job_with_task(&self, job_id: Uuid, task_id: Uuid) -> Result<Job> {
        let db = self.backend.backend();
        let record = db.read_job(job_id).await?;
        let tasks = db.read_tasks(job_id, Some(task_id)).await?;
        let params = db.read_consolidation_params(job_id).await?;
        Ok(Job::from_record(record, tasks, params))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id(), state = %job.state()))]
    pub async fn save_job(&self, job: &mut Job) -> Result<()> {
        if job.persistence().is_clean() {
            return Ok(());
        }
        let occ = job.next_occ();
        in_transaction!(self, db => write_job(db, job, occ))?;
        advance_job(job, occ);
        Ok(())
    }

    /// Saves `job` inside a transaction owned by the caller.
    pub async fn save_job_in<B>(&self, db: &B, job: &mut Job) -> Result<()>
    where
        B: Backend + ?Sized,
    {
        if job.persistence().is_clean() {
            return Ok(());
        }
        let occ = job.next_occ();
        write_job(db, job, occ).await?;
        advance_job(job, occ);
        Ok(())
    }

    #[instrument(skip(self, container), fields(uri = %container.uri))]
    pub async fn save_container(&self, container: &mut Container) -> Result<()> {
        in_transaction!(self, db => write_container(db, container))?;
        container.mark_persisted();
        Ok(())
    }

    pub async fn save_container_in<B>(&self, db: &B, container: &mut Container) -> Result<()>
    where
        B: Backend + ?Sized,
    {
        write_container(db, container).await?;
        container.mark_persisted();
        Ok(())
    }

    #[instrument(skip(self, variable), fields(variable_id = %variable.id))]
    pub async fn save_variable(&self, variable: &mut Variable) -> Result<()> {
        in_transaction!(self, db => write_variable(db, variable))?;
        variable.mark_persisted();
        Ok(())
    }
}

fn advance_job(job: &mut Job, occ: chrono::DateTime<chrono::Utc>) {
    let updated = job.persistence().is_dirty();
    job.mark_persisted();
    if updated {
        job.set_occ(occ);
    }
}

async fn write_job<B>(db: &B, job: &Job, occ: chrono::DateTime<chrono::Utc>) -> Result<()>
where
    B: Backend + ?Sized,
{
    let job_id = job.id();
    let record = job.to_record();

    if job.persistence().is_to_delete() {
        // Tasks, locks and the job's parameters go with the row.
        db.delete_job(job_id).await?;
        debug!(job_id = %job_id, "🗑️ Job deleted");
        return Ok(());
    }
    if job.persistence().is_new() {
        db.create_job(&record).await?;
    }

    for task in job.tasks() {
        if task.persistence().is_to_delete() {
            db.delete_task(job_id, task.id()).await?;
        }
    }
    for task in job.tasks() {
        match task.persistence() {
            PersistenceState::New => db.create_task(job_id, task).await?,
            PersistenceState::Dirty => db.update_task(job_id, task).await?,
            _ => {}
        }
    }

    if let Some(params) = job.params() {
        match params.persistence {
            PersistenceState::New => db.create_consolidation_params(job_id, params).await?,
            PersistenceState::Dirty => db.update_consolidation_params(job_id, params).await?,
            _ => {}
        }
    }

    for set in job.locked_sets() {
        if set.release_requested() {
            db.release_datasets(job_id, set.flag()).await?;
        }
        if !set.new_ids().is_empty() {
            let ids: Vec<Uuid> = set.new_ids().iter().copied().collect();
            db.lock_datasets(job_id, &ids, set.flag()).await?;
        }
    }

    if job.persistence().is_dirty() {
        db.update_job(&record, occ).await?;
    }
    Ok(())
}

async fn write_container<B>(db: &B, container: &Container) -> Result<()>
where
    B: Backend + ?Sized,
{
    if container.persistence.is_new() {
        db.create_container(container).await?;
    }
    for dataset in &container.datasets {
        if dataset.persistence.is_to_delete() {
            db.delete_dataset(dataset.id).await?;
        }
    }
    for dataset in &container.datasets {
        match dataset.persistence {
            PersistenceState::New => db.create_dataset(dataset).await?,
            PersistenceState::Dirty => db.update_dataset(dataset).await?,
            _ => {}
        }
    }
    match container.persistence {
        PersistenceState::Dirty => db.update_container(container).await?,
        PersistenceState::ToDelete => db.delete_container(&container.uri).await?,
        _ => {}
    }
    Ok(())
}

async fn write_variable<B>(db: &B, variable: &Variable) -> Result<()>
where
    B: Backend + ?Sized,
{
    if variable.persistence.is_to_delete() {
        return db.delete_variable(variable.id).await;
    }
    if variable.persistence.is_new() {
        db.create_variable(variable).await?;
    }
    for instance in &variable.instances {
        if instance.persistence.is_to_delete() {
            db.delete_instance(instance.id).await?;
        }
    }
    for instance in &variable.instances {
        match instance.persistence {
            PersistenceState::New => db.create_instance(instance).await?,
            PersistenceState::Dirty => db.update_instance(instance).await?,
            _ => {}
        }
    }
    if let Some(params) = &variable.consolidation_params {
        match params.persistence {
            PersistenceState::New => db.create_consolidation_params(variable.id, params).await?,
            PersistenceState::Dirty => {
                db.update_consolidation_params(variable.id, params).await?
            }
            _ => {}
        }
    }
    if variable.persistence.is_dirty() {
        db.update_variable(variable).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryBackend;
    use crate::models::{BBox, DType, DataFormat, Dataset, LockFlag, Record, Resampling};
    use crate::state_machine::{ExecutionLevel, JobEvent, JobStatus};
    use chrono::Utc;

    fn dformat() -> DataFormat {
        DataFormat {
            dtype: DType::Float32,
            no_data: -9999.0,
            min_value: -1.0,
            max_value: 1.0,
        }
    }

    /// Stores `count` datasets in one raw container and returns their ids.
    async fn seed_datasets(persister: &Persister, count: usize) -> Vec<Uuid> {
        let mut variable =
            Variable::new("ndvi", "", vec!["ndvi".to_string()], dformat(), Resampling::Bilinear)
                .unwrap();
        let instance_id = variable.add_instance("sentinel2").unwrap();
        persister.save_variable(&mut variable).await.unwrap();

        let mut container = Container::new("file:///raw/scene.tif", false, "STANDARD");
        for i in 0..count {
            let record = Record::new(format!("scene {i}"), Utc::now());
            persister.backend().create_record(&record).await.unwrap();
            let bbox = BBox::new(0.0, 0.0, 10.0, 10.0);
            container.add_dataset(Dataset::new(
                record.id,
                instance_id,
                "",
                "",
                vec![1],
                dformat(),
                bbox,
                bbox,
            ));
        }
        persister.save_container(&mut container).await.unwrap();
        container.datasets.iter().map(|d| d.id).collect()
    }

    fn persister() -> (InMemoryBackend, Persister) {
        let backend = InMemoryBackend::new();
        let persister = Persister::new(Arc::new(backend.clone()));
        (backend, persister)
    }

    fn deletion_job() -> Job {
        Job::new_deletion(
            "purge",
            vec![Uuid::new_v4()],
            Vec::new(),
            None,
            ExecutionLevel::Asynchronous,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load_job_with_tasks() {
        let (_, persister) = persister();
        let mut job = deletion_job();
        job.create_deletion_task("file:///data/a.tif");
        job.create_deletion_task("file:///data/b.tif");
        persister.save_job(&mut job).await.unwrap();
        assert!(job.persistence().is_clean());
        assert!(job.tasks().iter().all(|t| t.persistence().is_clean()));

        let loaded = persister.load_job(job.id()).await.unwrap();
        assert_eq!(loaded.tasks().len(), 2);
        assert_eq!(loaded.active_tasks(), 2);
        assert_eq!(loaded.occ(), job.occ());
    }

    #[tokio::test]
    async fn test_stale_save_is_temporary_not_found() {
        let (_, persister) = persister();
        let mut job = deletion_job();
        persister.save_job(&mut job).await.unwrap();

        let mut first = persister.load_job(job.id()).await.unwrap();
        let mut second = persister.load_job(job.id()).await.unwrap();
        first
            .trigger(&JobEvent::new(job.id(), JobStatus::JobCreated))
            .unwrap();
        second
            .trigger(&JobEvent::new(job.id(), JobStatus::CancelledByUser))
            .unwrap();

        persister.save_job(&mut first).await.unwrap();
        let err = persister.save_job(&mut second).await.unwrap_err();
        assert!(err.is_temporary());
        assert!(err.is_not_found());
        assert!(second.persistence().is_dirty());
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_children() {
        let (backend, persister) = persister();
        let mut job = deletion_job();
        persister.save_job(&mut job).await.unwrap();

        let mut stale = persister.load_job(job.id()).await.unwrap();
        let mut fresh = persister.load_job(job.id()).await.unwrap();
        fresh.log(crate::models::LogSeverity::Info, "touch");
        persister.save_job(&mut fresh).await.unwrap();

        stale.create_deletion_task("file:///data/c.tif");
        assert!(persister.save_job(&mut stale).await.is_err());
        assert_eq!(backend.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_locks_are_released_then_claimed() {
        let (backend, persister) = persister();
        let ids = seed_datasets(&persister, 2).await;
        let mut job = deletion_job();
        job.lock_datasets(ids.clone(), LockFlag::ToDelete);
        persister.save_job(&mut job).await.unwrap();
        assert_eq!(backend.lock_count().await, 2);

        job.release_datasets(LockFlag::ToDelete);
        job.lock_datasets([ids[0]], LockFlag::ToDelete);
        persister.save_job(&mut job).await.unwrap();
        assert_eq!(backend.lock_count().await, 1);
    }

    #[tokio::test]
    async fn test_deleted_job_leaves_nothing_behind() {
        let (backend, persister) = persister();
        let ids = seed_datasets(&persister, 1).await;
        let mut job = deletion_job();
        job.create_deletion_task("file:///data/a.tif");
        job.lock_datasets(ids, LockFlag::ToDelete);
        persister.save_job(&mut job).await.unwrap();

        job.to_delete(true).unwrap();
        persister.save_job(&mut job).await.unwrap();
        assert!(job.persistence().is_deleted());
        assert!(persister.load_job(job.id()).await.unwrap_err().is_not_found());
        assert_eq!(backend.task_count().await, 0);
        assert_eq!(backend.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_save_variable_with_instances() {
        let (backend, persister) = persister();
        let mut variable =
            Variable::new("ndvi", "", vec!["ndvi".to_string()], dformat(), Resampling::Bilinear)
                .unwrap();
        let instance = variable.add_instance("sentinel2").unwrap();
        let params = variable.default_consolidation_params();
        variable.set_consolidation_params(params).unwrap();
        persister.save_variable(&mut variable).await.unwrap();

        let loaded = backend.read_variable(variable.id).await.unwrap();
        assert!(loaded.instance(instance).is_some());
        assert!(loaded.consolidation_params.is_some());
    }
}
