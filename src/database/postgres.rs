//! Postgres implementation of [`Backend`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::{queries, Backend, BackendTransaction, DatasetFilter, JobFilter, TransactionalBackend};
use crate::error::{CatalogError, Result};
use crate::models::{
    BBox, ConsolidationParams, Container, Dataset, DatasetStatus, JobRecord, Layout, LockFlag,
    Record, Task, Variable, VariableInstance,
};

/// Every method expects `self.conn()` to yield something dereferencing to
/// a `PgConnection`.
macro_rules! delegate_pg {
    ($ty:ty) => {
        #[async_trait]
        impl Backend for $ty {
            async fn create_record(&self, record: &Record) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::create_record(&mut conn, record).await
            }
            async fn read_records(&self, ids: &[Uuid]) -> Result<Vec<Record>> {
                let mut conn = self.conn().await?;
                queries::read_records(&mut conn, ids).await
            }
            async fn create_variable(&self, variable: &Variable) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::create_variable(&mut conn, variable).await
            }
            async fn read_variable(&self, id: Uuid) -> Result<Variable> {
                let mut conn = self.conn().await?;
                queries::read_variable(&mut conn, id).await
            }
            async fn update_variable(&self, variable: &Variable) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::update_variable(&mut conn, variable).await
            }
            async fn delete_variable(&self, id: Uuid) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::delete_variable(&mut conn, id).await
            }
            async fn create_instance(&self, instance: &VariableInstance) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::create_instance(&mut conn, instance).await
            }
            async fn update_instance(&self, instance: &VariableInstance) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::update_instance(&mut conn, instance).await
            }
            async fn delete_instance(&self, id: Uuid) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::delete_instance(&mut conn, id).await
            }
            async fn create_consolidation_params(
                &self,
                owner_id: Uuid,
                params: &ConsolidationParams,
            ) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::create_consolidation_params(&mut conn, owner_id, params).await
            }
            async fn read_consolidation_params(
                &self,
                owner_id: Uuid,
            ) -> Result<Option<ConsolidationParams>> {
                let mut conn = self.conn().await?;
                queries::read_consolidation_params(&mut conn, owner_id).await
            }
            async fn update_consolidation_params(
                &self,
                owner_id: Uuid,
                params: &ConsolidationParams,
            ) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::update_consolidation_params(&mut conn, owner_id, params).await
            }
            async fn delete_consolidation_params(&self, owner_id: Uuid) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::delete_consolidation_params(&mut conn, owner_id).await
            }
            async fn create_layout(&self, layout: &Layout) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::create_layout(&mut conn, layout).await
            }
            async fn read_layout(&self, name: &str) -> Result<Layout> {
                let mut conn = self.conn().await?;
                queries::read_layout(&mut conn, name).await
            }
            async fn create_container(&self, container: &Container) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::create_container(&mut conn, container).await
            }
            async fn read_container(&self, uri: &str) -> Result<Container> {
                let mut conn = self.conn().await?;
                queries::read_container(&mut conn, uri).await
            }
            async fn update_container(&self, container: &Container) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::update_container(&mut conn, container).await
            }
            async fn delete_container(&self, uri: &str) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::delete_container(&mut conn, uri).await
            }
            async fn find_container_uris(&self, prefix: &str) -> Result<Vec<String>> {
                let mut conn = self.conn().await?;
                queries::find_container_uris(&mut conn, prefix).await
            }
            async fn create_dataset(&self, dataset: &Dataset) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::create_dataset(&mut conn, dataset).await
            }
            async fn update_dataset(&self, dataset: &Dataset) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::update_dataset(&mut conn, dataset).await
            }
            async fn delete_dataset(&self, id: Uuid) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::delete_dataset(&mut conn, id).await
            }
            async fn find_datasets(&self, filter: &DatasetFilter) -> Result<Vec<Dataset>> {
                let mut conn = self.conn().await?;
                queries::find_datasets(&mut conn, filter).await
            }
            async fn change_datasets_status(
                &self,
                job_id: Uuid,
                flag: LockFlag,
                from: DatasetStatus,
                to: DatasetStatus,
            ) -> Result<u64> {
                let mut conn = self.conn().await?;
                queries::change_datasets_status(&mut conn, job_id, flag, from, to).await
            }
            async fn datasets_geometry_union(
                &self,
                job_id: Uuid,
                flag: LockFlag,
            ) -> Result<Option<BBox>> {
                let mut conn = self.conn().await?;
                queries::datasets_geometry_union(&mut conn, job_id, flag).await
            }
            async fn create_job(&self, job: &JobRecord) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::create_job(&mut conn, job).await
            }
            async fn read_job(&self, id: Uuid) -> Result<JobRecord> {
                let mut conn = self.conn().await?;
                queries::read_job(&mut conn, id).await
            }
            async fn update_job(&self, job: &JobRecord, new_occ: DateTime<Utc>) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::update_job(&mut conn, job, new_occ).await
            }
            async fn delete_job(&self, id: Uuid) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::delete_job(&mut conn, id).await
            }
            async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
                let mut conn = self.conn().await?;
                queries::find_jobs(&mut conn, filter).await
            }
            async fn create_task(&self, job_id: Uuid, task: &Task) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::create_task(&mut conn, job_id, task).await
            }
            async fn update_task(&self, job_id: Uuid, task: &Task) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::update_task(&mut conn, job_id, task).await
            }
            async fn delete_task(&self, job_id: Uuid, task_id: Uuid) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::delete_task(&mut conn, job_id, task_id).await
            }
            async fn read_tasks(&self, job_id: Uuid, task_id: Option<Uuid>) -> Result<Vec<Task>> {
                let mut conn = self.conn().await?;
                queries::read_tasks(&mut conn, job_id, task_id).await
            }
            async fn lock_datasets(
                &self,
                job_id: Uuid,
                dataset_ids: &[Uuid],
                flag: LockFlag,
            ) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::lock_datasets(&mut conn, job_id, dataset_ids, flag).await
            }
            async fn release_datasets(&self, job_id: Uuid, flag: LockFlag) -> Result<()> {
                let mut conn = self.conn().await?;
                queries::release_datasets(&mut conn, job_id, flag).await
            }
        }
    };
}

/// Backend over a sqlx pool. Each call outside a transaction runs on its
/// own pooled connection.
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn conn(&self) -> Result<PoolConnection<Postgres>> {
        Ok(self.pool.acquire().await?)
    }
}

delegate_pg!(PgBackend);

#[async_trait]
impl TransactionalBackend for PgBackend {
    async fn start_transaction(&self) -> Result<Box<dyn BackendTransaction>> {
        let tx = self.pool.begin().await?;
        debug!("🔧 Postgres transaction started");
        Ok(Box::new(PgTransaction {
            tx: Mutex::new(Some(tx)),
            base: self.clone(),
        }))
    }

    fn backend(&self) -> &dyn Backend {
        self
    }
}

/// An open Postgres transaction. sqlx rolls it back when dropped uncommitted.
pub struct PgTransaction {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
    base: PgBackend,
}

impl PgTransaction {
    async fn conn(&self) -> Result<MappedMutexGuard<'_, PgConnection>> {
        MutexGuard::try_map(self.tx.lock().await, |tx| tx.as_deref_mut()).map_err(|_| {
            CatalogError::should_never_happen("transaction used after completion")
        })
    }

    fn take(self: Box<Self>) -> Result<Transaction<'static, Postgres>> {
        self.tx
            .into_inner()
            .ok_or_else(|| CatalogError::should_never_happen("transaction already completed"))
    }
}

delegate_pg!(PgTransaction);

#[async_trait]
impl BackendTransaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.take()?.commit().await?;
        debug!("✅ Postgres transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.take()?.rollback().await?;
        debug!("Postgres transaction rolled back");
        Ok(())
    }

    fn backend(&self) -> &dyn Backend {
        &self.base
    }
}
