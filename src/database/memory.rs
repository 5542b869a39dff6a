//! In-process catalog store.
//!
//! Mirrors the constraints of the Postgres schema (unique keys, foreign keys,
//! conditional job updates) so orchestration behaves the same against both.
//! A transaction takes the store lock for its whole lifetime and keeps a
//! snapshot to restore on rollback: transactions are serialized, and code
//! holding one must only go through it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::DerefMut;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use uuid::Uuid;

use super::{Backend, BackendTransaction, DatasetFilter, JobFilter, TransactionalBackend};
use crate::error::{CatalogError, Result};
use crate::models::{
    BBox, ConsolidationParams, Container, Dataset, DatasetStatus, JobRecord, Layout, LockFlag,
    PersistenceState, Record, Task, Variable, VariableInstance,
};

#[derive(Debug, Clone)]
struct ContainerRow {
    managed: bool,
    storage_class: String,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    records: HashMap<Uuid, Record>,
    variables: HashMap<Uuid, Variable>,
    instances: HashMap<Uuid, VariableInstance>,
    params: HashMap<Uuid, ConsolidationParams>,
    layouts: HashMap<String, Layout>,
    containers: BTreeMap<String, ContainerRow>,
    datasets: HashMap<Uuid, Dataset>,
    jobs: HashMap<Uuid, JobRecord>,
    /// task id -> (job id, task)
    tasks: HashMap<Uuid, (Uuid, Task)>,
    /// (dataset id, flag) -> job id
    locks: BTreeMap<(Uuid, LockFlag), Uuid>,
}

fn stored<T: Clone>(value: &T) -> T {
    value.clone()
}

impl MemoryState {
    fn create_record(&mut self, record: &Record) -> Result<()> {
        if self.records.contains_key(&record.id) {
            return Err(CatalogError::already_exists("record", record.id));
        }
        self.records.insert(record.id, stored(record));
        Ok(())
    }

    fn read_records(&self, ids: &[Uuid]) -> Result<Vec<Record>> {
        let mut records: Vec<Record> = ids
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect();
        records.sort_by(|a, b| a.datetime.cmp(&b.datetime).then(a.id.cmp(&b.id)));
        records.dedup_by_key(|r| r.id);
        Ok(records)
    }

    fn create_variable(&mut self, variable: &Variable) -> Result<()> {
        if self.variables.contains_key(&variable.id)
            || self.variables.values().any(|v| v.name == variable.name)
        {
            return Err(CatalogError::already_exists("variable", &variable.name));
        }
        let mut row = stored(variable);
        row.instances.clear();
        row.consolidation_params = None;
        row.persistence = PersistenceState::Clean;
        self.variables.insert(variable.id, row);
        Ok(())
    }

    fn read_variable(&self, id: Uuid) -> Result<Variable> {
        let mut variable = self
            .variables
            .get(&id)
            .cloned()
            .ok_or_else(|| CatalogError::not_found("variable", id))?;
        let mut instances: Vec<VariableInstance> = self
            .instances
            .values()
            .filter(|i| i.variable_id == id)
            .cloned()
            .map(|mut i| {
                i.persistence = PersistenceState::Clean;
                i
            })
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        variable.instances = instances;
        variable.consolidation_params = self.read_consolidation_params(id)?;
        variable.persistence = PersistenceState::Clean;
        Ok(variable)
    }

    fn update_variable(&mut self, variable: &Variable) -> Result<()> {
        let row = self
            .variables
            .get_mut(&variable.id)
            .ok_or_else(|| CatalogError::not_found("variable", variable.id))?;
        row.name = variable.name.clone();
        row.unit = variable.unit.clone();
        row.description = variable.description.clone();
        row.bands = variable.bands.clone();
        row.dformat = variable.dformat;
        row.resampling_alg = variable.resampling_alg;
        Ok(())
    }

    fn delete_variable(&mut self, id: Uuid) -> Result<()> {
        if self.instances.values().any(|i| i.variable_id == id) {
            return Err(CatalogError::dependency_still_exists(
                "variable",
                id,
                "variable still has instances",
            ));
        }
        self.variables
            .remove(&id)
            .ok_or_else(|| CatalogError::not_found("variable", id))?;
        self.params.remove(&id);
        Ok(())
    }

    fn create_instance(&mut self, instance: &VariableInstance) -> Result<()> {
        if !self.variables.contains_key(&instance.variable_id) {
            return Err(CatalogError::not_found("variable", instance.variable_id));
        }
        let taken = |i: &VariableInstance| {
            i.id == instance.id
                || (i.variable_id == instance.variable_id && i.name == instance.name)
        };
        if self.instances.values().any(taken) {
            return Err(CatalogError::already_exists("instance", &instance.name));
        }
        self.instances.insert(instance.id, stored(instance));
        Ok(())
    }

    fn update_instance(&mut self, instance: &VariableInstance) -> Result<()> {
        let row = self
            .instances
            .get_mut(&instance.id)
            .ok_or_else(|| CatalogError::not_found("instance", instance.id))?;
        row.name = instance.name.clone();
        row.metadata = instance.metadata.clone();
        Ok(())
    }

    fn delete_instance(&mut self, id: Uuid) -> Result<()> {
        if self.datasets.values().any(|d| d.instance_id == id) {
            return Err(CatalogError::dependency_still_exists(
                "instance",
                id,
                "instance still has datasets",
            ));
        }
        self.instances
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CatalogError::not_found("instance", id))
    }

    fn create_consolidation_params(
        &mut self,
        owner_id: Uuid,
        params: &ConsolidationParams,
    ) -> Result<()> {
        if self.params.contains_key(&owner_id) {
            return Err(CatalogError::already_exists("consolidation_params", owner_id));
        }
        self.params.insert(owner_id, stored(params));
        Ok(())
    }

    fn read_consolidation_params(&self, owner_id: Uuid) -> Result<Option<ConsolidationParams>> {
        Ok(self.params.get(&owner_id).cloned().map(|mut p| {
            p.persistence = PersistenceState::Clean;
            p
        }))
    }

    fn update_consolidation_params(
        &mut self,
        owner_id: Uuid,
        params: &ConsolidationParams,
    ) -> Result<()> {
        let row = self
            .params
            .get_mut(&owner_id)
            .ok_or_else(|| CatalogError::not_found("consolidation_params", owner_id))?;
        *row = stored(params);
        Ok(())
    }

    fn delete_consolidation_params(&mut self, owner_id: Uuid) -> Result<()> {
        self.params.remove(&owner_id);
        Ok(())
    }

    fn create_layout(&mut self, layout: &Layout) -> Result<()> {
        layout.validate()?;
        if self.layouts.contains_key(&layout.name) {
            return Err(CatalogError::already_exists("layout", &layout.name));
        }
        self.layouts.insert(layout.name.clone(), stored(layout));
        Ok(())
    }

    fn read_layout(&self, name: &str) -> Result<Layout> {
        self.layouts
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::not_found("layout", name))
    }

    fn create_container(&mut self, container: &Container) -> Result<()> {
        if self.containers.contains_key(&container.uri) {
            return Err(CatalogError::already_exists("container", &container.uri));
        }
        self.containers.insert(
            container.uri.clone(),
            ContainerRow {
                managed: container.managed,
                storage_class: container.storage_class.clone(),
            },
        );
        Ok(())
    }

    fn read_container(&self, uri: &str) -> Result<Container> {
        let row = self
            .containers
            .get(uri)
            .ok_or_else(|| CatalogError::not_found("container", uri))?;
        let mut datasets: Vec<Dataset> = self
            .datasets
            .values()
            .filter(|d| d.container_uri == uri)
            .cloned()
            .map(|mut d| {
                d.persistence = PersistenceState::Clean;
                d
            })
            .collect();
        datasets.sort_by(|a, b| a.container_subdir.cmp(&b.container_subdir).then(a.id.cmp(&b.id)));
        Ok(Container::restore(
            uri.to_string(),
            row.managed,
            row.storage_class.clone(),
            datasets,
        ))
    }

    fn update_container(&mut self, container: &Container) -> Result<()> {
        let row = self
            .containers
            .get_mut(&container.uri)
            .ok_or_else(|| CatalogError::not_found("container", &container.uri))?;
        row.managed = container.managed;
        row.storage_class = container.storage_class.clone();
        Ok(())
    }

    fn delete_container(&mut self, uri: &str) -> Result<()> {
        if self.datasets.values().any(|d| d.container_uri == uri) {
            return Err(CatalogError::dependency_still_exists(
                "container",
                uri,
                "container still holds datasets",
            ));
        }
        self.containers
            .remove(uri)
            .map(|_| ())
            .ok_or_else(|| CatalogError::not_found("container", uri))
    }

    fn find_container_uris(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .containers
            .range(prefix.to_string()..)
            .take_while(|(uri, _)| uri.starts_with(prefix))
            .map(|(uri, _)| uri.clone())
            .collect())
    }

    fn create_dataset(&mut self, dataset: &Dataset) -> Result<()> {
        if self.datasets.contains_key(&dataset.id) {
            return Err(CatalogError::already_exists("dataset", dataset.id));
        }
        if !self.containers.contains_key(&dataset.container_uri) {
            return Err(CatalogError::not_found("container", &dataset.container_uri));
        }
        if !self.records.contains_key(&dataset.record_id) {
            return Err(CatalogError::not_found("record", dataset.record_id));
        }
        if !self.instances.contains_key(&dataset.instance_id) {
            return Err(CatalogError::not_found("instance", dataset.instance_id));
        }
        if self.datasets.values().any(|d| {
            d.container_uri == dataset.container_uri
                && d.container_subdir == dataset.container_subdir
                && d.instance_id == dataset.instance_id
                && d.record_id == dataset.record_id
        }) {
            return Err(CatalogError::already_exists("dataset", dataset.gdal_uri()));
        }
        let mut row = stored(dataset);
        row.persistence = PersistenceState::Clean;
        self.datasets.insert(dataset.id, row);
        Ok(())
    }

    fn update_dataset(&mut self, dataset: &Dataset) -> Result<()> {
        let row = self
            .datasets
            .get_mut(&dataset.id)
            .ok_or_else(|| CatalogError::not_found("dataset", dataset.id))?;
        *row = stored(dataset);
        row.persistence = PersistenceState::Clean;
        Ok(())
    }

    fn delete_dataset(&mut self, id: Uuid) -> Result<()> {
        self.datasets
            .remove(&id)
            .ok_or_else(|| CatalogError::not_found("dataset", id))?;
        self.locks.retain(|(dataset_id, _), _| *dataset_id != id);
        Ok(())
    }

    fn is_locked_by(&self, dataset_id: Uuid, job_id: Uuid, flag: LockFlag) -> bool {
        self.locks.get(&(dataset_id, flag)) == Some(&job_id)
    }

    fn find_datasets(&self, filter: &DatasetFilter) -> Result<Vec<Dataset>> {
        let mut datasets: Vec<Dataset> = self
            .datasets
            .values()
            .filter(|d| filter.matches(d))
            .filter(|d| {
                filter
                    .locked_by
                    .map_or(true, |(job_id, flag)| self.is_locked_by(d.id, job_id, flag))
            })
            .cloned()
            .collect();
        datasets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(datasets)
    }

    fn change_datasets_status(
        &mut self,
        job_id: Uuid,
        flag: LockFlag,
        from: DatasetStatus,
        to: DatasetStatus,
    ) -> Result<u64> {
        let ids: Vec<Uuid> = self
            .locks
            .iter()
            .filter(|((_, f), job)| *f == flag && **job == job_id)
            .map(|((id, _), _)| *id)
            .collect();
        let mut changed = 0;
        for id in ids {
            if let Some(dataset) = self.datasets.get_mut(&id) {
                if dataset.status == from {
                    dataset.status = to;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    fn datasets_geometry_union(&self, job_id: Uuid, flag: LockFlag) -> Result<Option<BBox>> {
        let geometries: Vec<BBox> = self
            .locks
            .iter()
            .filter(|((_, f), job)| *f == flag && **job == job_id)
            .filter_map(|((id, _), _)| self.datasets.get(id).map(|d| d.geometry))
            .collect();
        Ok(BBox::union_all(&geometries))
    }

    fn create_job(&mut self, job: &JobRecord) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(CatalogError::already_exists("job", job.id));
        }
        self.jobs.insert(job.id, stored(job));
        Ok(())
    }

    fn read_job(&self, id: Uuid) -> Result<JobRecord> {
        self.jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| CatalogError::not_found("job", id))
    }

    fn update_job(&mut self, job: &JobRecord, new_occ: DateTime<Utc>) -> Result<()> {
        match self.jobs.get_mut(&job.id) {
            Some(row) if row.last_update == job.last_update => {
                *row = stored(job);
                row.last_update = new_occ;
                Ok(())
            }
            _ => Err(CatalogError::not_found("job", job.id).temporary()),
        }
    }

    fn delete_job(&mut self, id: Uuid) -> Result<()> {
        self.jobs
            .remove(&id)
            .ok_or_else(|| CatalogError::not_found("job", id))?;
        self.tasks.retain(|_, (job_id, _)| *job_id != id);
        self.locks.retain(|_, job_id| *job_id != id);
        self.params.remove(&id);
        Ok(())
    }

    fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let needle = filter.name_contains.as_ref().map(|n| n.to_lowercase());
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .values()
            .filter(|j| {
                needle
                    .as_ref()
                    .map_or(true, |n| j.name.to_lowercase().contains(n))
            })
            .filter(|j| filter.job_type.map_or(true, |t| j.job_type == t))
            .filter(|j| filter.states.is_empty() || filter.states.contains(&j.state))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        }
        Ok(jobs)
    }

    fn create_task(&mut self, job_id: Uuid, task: &Task) -> Result<()> {
        if !self.jobs.contains_key(&job_id) {
            return Err(CatalogError::not_found("job", job_id));
        }
        if self.tasks.contains_key(&task.id()) {
            return Err(CatalogError::already_exists("task", task.id()));
        }
        self.tasks.insert(task.id(), (job_id, stored(task)));
        Ok(())
    }

    fn update_task(&mut self, job_id: Uuid, task: &Task) -> Result<()> {
        match self.tasks.get_mut(&task.id()) {
            Some((owner, row)) if *owner == job_id => {
                *row = stored(task);
                Ok(())
            }
            _ => Err(CatalogError::not_found("task", task.id())),
        }
    }

    fn delete_task(&mut self, job_id: Uuid, task_id: Uuid) -> Result<()> {
        match self.tasks.get(&task_id) {
            Some((owner, _)) if *owner == job_id => {
                self.tasks.remove(&task_id);
                Ok(())
            }
            _ => Err(CatalogError::not_found("task", task_id)),
        }
    }

    fn read_tasks(&self, job_id: Uuid, task_id: Option<Uuid>) -> Result<Vec<Task>> {
        if let Some(task_id) = task_id {
            return match self.tasks.get(&task_id) {
                Some((owner, task)) if *owner == job_id => Ok(vec![Task::restore(
                    task.id(),
                    task.state(),
                    task.payload().to_vec(),
                )]),
                _ => Err(CatalogError::not_found("task", task_id)),
            };
        }
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|(owner, _)| *owner == job_id)
            .map(|(_, t)| Task::restore(t.id(), t.state(), t.payload().to_vec()))
            .collect();
        tasks.sort_by_key(|t| t.id());
        Ok(tasks)
    }

    fn lock_datasets(&mut self, job_id: Uuid, dataset_ids: &[Uuid], flag: LockFlag) -> Result<()> {
        if !self.jobs.contains_key(&job_id) {
            return Err(CatalogError::not_found("job", job_id));
        }
        for id in dataset_ids {
            if !self.datasets.contains_key(id) {
                return Err(CatalogError::not_found("dataset", id));
            }
            match self.locks.get(&(*id, flag)) {
                Some(owner) if *owner != job_id => {
                    return Err(CatalogError::already_exists(
                        "locked_dataset",
                        format!("{id}/{flag}"),
                    ))
                }
                _ => {}
            }
        }
        for id in dataset_ids {
            self.locks.insert((*id, flag), job_id);
        }
        Ok(())
    }

    fn release_datasets(&mut self, job_id: Uuid, flag: LockFlag) -> Result<()> {
        self.locks
            .retain(|(_, f), owner| !(*f == flag && *owner == job_id));
        Ok(())
    }
}

/// Failures injected into named backend operations. Shared by the backend
/// and its transactions, and kept out of `MemoryState` so that rolling a
/// transaction back does not re-arm them.
#[derive(Debug, Default)]
pub struct FaultInjector {
    /// operation -> (remaining failures, temporary)
    pending: parking_lot::Mutex<HashMap<&'static str, (u32, bool)>>,
}

impl FaultInjector {
    fn arm(&self, operation: &'static str, count: u32, temporary: bool) {
        self.pending.lock().insert(operation, (count, temporary));
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        let mut pending = self.pending.lock();
        let Some((remaining, temporary)) = pending.get_mut(operation) else {
            return Ok(());
        };
        let temporary = *temporary;
        *remaining -= 1;
        if *remaining == 0 {
            pending.remove(operation);
        }
        let error = CatalogError::Database(format!("injected {operation} failure"));
        Err(if temporary { error.temporary() } else { error })
    }
}

/// Generates a `Backend` implementation delegating every call to the
/// `MemoryState` returned by `self.lock_state()`, after the fault check.
macro_rules! delegate_backend {
    ($ty:ty) => {
        #[async_trait]
        impl Backend for $ty {
            async fn create_record(&self, record: &Record) -> Result<()> {
                self.faults.check("create_record")?;
                self.lock_state().await.create_record(record)
            }
            async fn read_records(&self, ids: &[Uuid]) -> Result<Vec<Record>> {
                self.faults.check("read_records")?;
                self.lock_state().await.read_records(ids)
            }
            async fn create_variable(&self, variable: &Variable) -> Result<()> {
                self.faults.check("create_variable")?;
                self.lock_state().await.create_variable(variable)
            }
            async fn read_variable(&self, id: Uuid) -> Result<Variable> {
                self.faults.check("read_variable")?;
                self.lock_state().await.read_variable(id)
            }
            async fn update_variable(&self, variable: &Variable) -> Result<()> {
                self.faults.check("update_variable")?;
                self.lock_state().await.update_variable(variable)
            }
            async fn delete_variable(&self, id: Uuid) -> Result<()> {
                self.faults.check("delete_variable")?;
                self.lock_state().await.delete_variable(id)
            }
            async fn create_instance(&self, instance: &VariableInstance) -> Result<()> {
                self.faults.check("create_instance")?;
                self.lock_state().await.create_instance(instance)
            }
            async fn update_instance(&self, instance: &VariableInstance) -> Result<()> {
                self.faults.check("update_instance")?;
                self.lock_state().await.update_instance(instance)
            }
            async fn delete_instance(&self, id: Uuid) -> Result<()> {
                self.faults.check("delete_instance")?;
                self.lock_state().await.delete_instance(id)
            }
            async fn create_consolidation_params(
                &self,
                owner_id: Uuid,
                params: &ConsolidationParams,
            ) -> Result<()> {
                self.faults.check("create_consolidation_params")?;
                self.lock_state()
                    .await
                    .create_consolidation_params(owner_id, params)
            }
            async fn read_consolidation_params(
                &self,
                owner_id: Uuid,
            ) -> Result<Option<ConsolidationParams>> {
                self.faults.check("read_consolidation_params")?;
                self.lock_state().await.read_consolidation_params(owner_id)
            }
            async fn update_consolidation_params(
                &self,
                owner_id: Uuid,
                params: &ConsolidationParams,
            ) -> Result<()> {
                self.faults.check("update_consolidation_params")?;
                self.lock_state()
                    .await
                    .update_consolidation_params(owner_id, params)
            }
            async fn delete_consolidation_params(&self, owner_id: Uuid) -> Result<()> {
                self.faults.check("delete_consolidation_params")?;
                self.lock_state().await.delete_consolidation_params(owner_id)
            }
            async fn create_layout(&self, layout: &Layout) -> Result<()> {
                self.faults.check("create_layout")?;
                self.lock_state().await.create_layout(layout)
            }
            async fn read_layout(&self, name: &str) -> Result<Layout> {
                self.faults.check("read_layout")?;
                self.lock_state().await.read_layout(name)
            }
            async fn create_container(&self, container: &Container) -> Result<()> {
                self.faults.check("create_container")?;
                self.lock_state().await.create_container(container)
            }
            async fn read_container(&self, uri: &str) -> Result<Container> {
                self.faults.check("read_container")?;
                self.lock_state().await.read_container(uri)
            }
            async fn update_container(&self, container: &Container) -> Result<()> {
                self.faults.check("update_container")?;
                self.lock_state().await.update_container(container)
            }
            async fn delete_container(&self, uri: &str) -> Result<()> {
                self.faults.check("delete_container")?;
                self.lock_state().await.delete_container(uri)
            }
            async fn find_container_uris(&self, prefix: &str) -> Result<Vec<String>> {
                self.faults.check("find_container_uris")?;
                self.lock_state().await.find_container_uris(prefix)
            }
            async fn create_dataset(&self, dataset: &Dataset) -> Result<()> {
                self.faults.check("create_dataset")?;
                self.lock_state().await.create_dataset(dataset)
            }
            async fn update_dataset(&self, dataset: &Dataset) -> Result<()> {
                self.faults.check("update_dataset")?;
                self.lock_state().await.update_dataset(dataset)
            }
            async fn delete_dataset(&self, id: Uuid) -> Result<()> {
                self.faults.check("delete_dataset")?;
                self.lock_state().await.delete_dataset(id)
            }
            async fn find_datasets(&self, filter: &DatasetFilter) -> Result<Vec<Dataset>> {
                self.faults.check("find_datasets")?;
                self.lock_state().await.find_datasets(filter)
            }
            async fn change_datasets_status(
                &self,
                job_id: Uuid,
                flag: LockFlag,
                from: DatasetStatus,
                to: DatasetStatus,
            ) -> Result<u64> {
                self.faults.check("change_datasets_status")?;
                self.lock_state()
                    .await
                    .change_datasets_status(job_id, flag, from, to)
            }
            async fn datasets_geometry_union(
                &self,
                job_id: Uuid,
                flag: LockFlag,
            ) -> Result<Option<BBox>> {
                self.faults.check("datasets_geometry_union")?;
                self.lock_state().await.datasets_geometry_union(job_id, flag)
            }
            async fn create_job(&self, job: &JobRecord) -> Result<()> {
                self.faults.check("create_job")?;
                self.lock_state().await.create_job(job)
            }
            async fn read_job(&self, id: Uuid) -> Result<JobRecord> {
                self.faults.check("read_job")?;
                self.lock_state().await.read_job(id)
            }
            async fn update_job(&self, job: &JobRecord, new_occ: DateTime<Utc>) -> Result<()> {
                self.faults.check("update_job")?;
                self.lock_state().await.update_job(job, new_occ)
            }
            async fn delete_job(&self, id: Uuid) -> Result<()> {
                self.faults.check("delete_job")?;
                self.lock_state().await.delete_job(id)
            }
            async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
                self.faults.check("find_jobs")?;
                self.lock_state().await.find_jobs(filter)
            }
            async fn create_task(&self, job_id: Uuid, task: &Task) -> Result<()> {
                self.faults.check("create_task")?;
                self.lock_state().await.create_task(job_id, task)
            }
            async fn update_task(&self, job_id: Uuid, task: &Task) -> Result<()> {
                self.faults.check("update_task")?;
                self.lock_state().await.update_task(job_id, task)
            }
            async fn delete_task(&self, job_id: Uuid, task_id: Uuid) -> Result<()> {
                self.faults.check("delete_task")?;
                self.lock_state().await.delete_task(job_id, task_id)
            }
            async fn read_tasks(&self, job_id: Uuid, task_id: Option<Uuid>) -> Result<Vec<Task>> {
                self.faults.check("read_tasks")?;
                self.lock_state().await.read_tasks(job_id, task_id)
            }
            async fn lock_datasets(
                &self,
                job_id: Uuid,
                dataset_ids: &[Uuid],
                flag: LockFlag,
            ) -> Result<()> {
                self.faults.check("lock_datasets")?;
                self.lock_state()
                    .await
                    .lock_datasets(job_id, dataset_ids, flag)
            }
            async fn release_datasets(&self, job_id: Uuid, flag: LockFlag) -> Result<()> {
                self.faults.check("release_datasets")?;
                self.lock_state().await.release_datasets(job_id, flag)
            }
        }
    };
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<FaultInjector>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls of `operation` (a `Backend` method
    /// name) fail with a database error, marked temporary if asked.
    pub fn fail_next(&self, operation: &'static str, count: u32, temporary: bool) {
        if count > 0 {
            self.faults.arm(operation, count, temporary);
        }
    }

    async fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().await
    }

    /// Number of rows in the lock table, for assertions.
    pub async fn lock_count(&self) -> usize {
        self.state.lock().await.locks.len()
    }

    pub async fn task_count(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }
}

delegate_backend!(InMemoryBackend);

#[async_trait]
impl TransactionalBackend for InMemoryBackend {
    async fn start_transaction(&self) -> Result<Box<dyn BackendTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let backup = guard.clone();
        Ok(Box::new(MemoryTransaction {
            state: Mutex::new(guard),
            backup: Some(backup),
            faults: Arc::clone(&self.faults),
        }))
    }

    fn backend(&self) -> &dyn Backend {
        self
    }
}

pub struct MemoryTransaction {
    state: Mutex<OwnedMutexGuard<MemoryState>>,
    /// Snapshot restored unless the transaction commits.
    backup: Option<MemoryState>,
    faults: Arc<FaultInjector>,
}

impl MemoryTransaction {
    async fn lock_state(&self) -> impl DerefMut<Target = MemoryState> + Send + '_ {
        MutexGuard::map(self.state.lock().await, |guard| &mut **guard)
    }
}

delegate_backend!(MemoryTransaction);

#[async_trait]
impl BackendTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.backup = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &dyn Backend {
        self
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(backup) = self.backup.take() {
            **self.state.get_mut() = backup;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DType, DataFormat, Job};
    use crate::state_machine::ExecutionLevel;

    async fn seed_job(backend: &InMemoryBackend) -> JobRecord {
        let job = Job::new_deletion("cleanup", vec![], vec![], None, ExecutionLevel::Asynchronous)
            .unwrap();
        let record = job.to_record();
        backend.create_job(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_rollback_on_drop() {
        let backend = InMemoryBackend::new();
        {
            let tx = backend.start_transaction().await.unwrap();
            tx.create_record(&Record::new("r", Utc::now())).await.unwrap();
        }
        let tx = backend.start_transaction().await.unwrap();
        let record = Record::new("r2", Utc::now());
        tx.create_record(&record).await.unwrap();
        tx.commit().await.unwrap();

        let stored = backend.read_records(&[record.id]).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(backend.state.lock().await.records.len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let backend = InMemoryBackend::new();
        let record = seed_job(&backend).await;
        let next = record.last_update + chrono::Duration::microseconds(1);
        backend.update_job(&record, next).await.unwrap();

        let err = backend.update_job(&record, next).await.unwrap_err();
        assert!(err.is_temporary());
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure_is_not_rearmed_by_rollback() {
        let backend = InMemoryBackend::new();
        let record = seed_job(&backend).await;
        let next = record.last_update + chrono::Duration::microseconds(1);
        backend.fail_next("update_job", 1, false);
        {
            let tx = backend.start_transaction().await.unwrap();
            let err = tx.update_job(&record, next).await.unwrap_err();
            assert!(!err.is_temporary());
            assert!(err.to_string().contains("injected update_job failure"));
        }
        backend.update_job(&record, next).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_conflict_between_jobs() {
        let backend = InMemoryBackend::new();
        let first = seed_job(&backend).await;
        let second = seed_job(&backend).await;

        let variable = Variable::new(
            "v",
            "",
            vec!["b".into()],
            DataFormat {
                dtype: DType::UInt8,
                no_data: 0.0,
                min_value: 0.0,
                max_value: 255.0,
            },
            crate::models::Resampling::Near,
        )
        .unwrap();
        backend.create_variable(&variable).await.unwrap();
        let instance = VariableInstance {
            id: Uuid::new_v4(),
            variable_id: variable.id,
            name: "i".into(),
            metadata: serde_json::Value::Null,
            persistence: PersistenceState::New,
        };
        backend.create_instance(&instance).await.unwrap();
        let record = Record::new("r", Utc::now());
        backend.create_record(&record).await.unwrap();
        backend
            .create_container(&Container::new("a.tif", false, ""))
            .await
            .unwrap();
        let mut dataset = Dataset::new(
            record.id,
            instance.id,
            "a.tif",
            "",
            vec![1],
            variable.dformat,
            BBox::new(0.0, 0.0, 1.0, 1.0),
            BBox::new(0.0, 0.0, 1.0, 1.0),
        );
        dataset.persistence = PersistenceState::Clean;
        backend.create_dataset(&dataset).await.unwrap();

        backend
            .lock_datasets(first.id, &[dataset.id], LockFlag::ToDelete)
            .await
            .unwrap();
        backend
            .lock_datasets(first.id, &[dataset.id], LockFlag::ToDelete)
            .await
            .unwrap();
        let err = backend
            .lock_datasets(second.id, &[dataset.id], LockFlag::ToDelete)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
        backend
            .lock_datasets(second.id, &[dataset.id], LockFlag::Init)
            .await
            .unwrap();

        let changed = backend
            .change_datasets_status(
                first.id,
                LockFlag::ToDelete,
                DatasetStatus::Active,
                DatasetStatus::ToDelete,
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert!(backend
            .delete_container("a.tif")
            .await
            .unwrap_err()
            .to_string()
            .contains("still holds datasets"));
    }
}
