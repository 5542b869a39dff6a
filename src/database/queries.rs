//! SQL for the Postgres backend.
//!
//! Every query is a free function over a `PgConnection`, so the same code
//! runs on a pooled connection or inside a transaction.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use uuid::Uuid;

use super::{DatasetFilter, JobFilter};
use crate::error::{CatalogError, Result};
use crate::models::{
    BBox, ConsolidationParams, Container, DataFormat, Dataset, DatasetStatus, GridParameters,
    JobLog, JobPayload, JobRecord, Layout, LockFlag, PersistenceState, Record, Resampling, Task,
    TaskState, Variable, VariableInstance,
};
use crate::state_machine::{ExecutionLevel, JobState, JobType};

fn corrupted(column: &str, value: impl std::fmt::Display) -> CatalogError {
    CatalogError::Database(format!("invalid value in column {column}: {value}"))
}

/// Text form of a unit-variant enum, as serde names it.
fn enum_to_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Err(CatalogError::should_never_happen(format!(
            "{other} is not a unit variant"
        ))),
    }
}

fn enum_from_text<T: DeserializeOwned>(column: &str, text: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(text.to_string()))
        .map_err(|_| corrupted(column, text))
}

fn to_i32(column: &str, value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| corrupted(column, value))
}

fn to_u32(column: &str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| corrupted(column, value))
}

fn ensure_affected(rows: u64, entity: &'static str, id: impl ToString) -> Result<()> {
    if rows == 0 {
        return Err(CatalogError::not_found(entity, id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct RecordRow {
    id: Uuid,
    name: String,
    datetime: DateTime<Utc>,
    tags: Json<BTreeMap<String, String>>,
}

pub(super) async fn create_record(conn: &mut PgConnection, record: &Record) -> Result<()> {
    sqlx::query("INSERT INTO records (id, name, datetime, tags) VALUES ($1, $2, $3, $4)")
        .bind(record.id)
        .bind(&record.name)
        .bind(record.datetime)
        .bind(Json(&record.tags))
        .execute(conn)
        .await?;
    Ok(())
}

pub(super) async fn read_records(conn: &mut PgConnection, ids: &[Uuid]) -> Result<Vec<Record>> {
    let rows: Vec<RecordRow> = sqlx::query_as(
        "SELECT id, name, datetime, tags FROM records WHERE id = ANY($1) ORDER BY datetime, id",
    )
    .bind(ids)
    .fetch_all(conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| Record {
            id: row.id,
            name: row.name,
            datetime: row.datetime,
            tags: row.tags.0,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Variables, instances, consolidation parameters
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct VariableRow {
    id: Uuid,
    name: String,
    unit: String,
    description: String,
    bands: Vec<String>,
    dformat: Json<DataFormat>,
    resampling_alg: String,
}

#[derive(FromRow)]
struct InstanceRow {
    id: Uuid,
    variable_id: Uuid,
    name: String,
    metadata: serde_json::Value,
}

pub(super) async fn create_variable(conn: &mut PgConnection, variable: &Variable) -> Result<()> {
    sqlx::query(
        "INSERT INTO variables (id, name, unit, description, bands, dformat, resampling_alg) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(variable.id)
    .bind(&variable.name)
    .bind(&variable.unit)
    .bind(&variable.description)
    .bind(&variable.bands)
    .bind(Json(variable.dformat))
    .bind(enum_to_text(&variable.resampling_alg)?)
    .execute(conn)
    .await?;
    Ok(())
}

pub(super) async fn read_variable(conn: &mut PgConnection, id: Uuid) -> Result<Variable> {
    let row: VariableRow = sqlx::query_as(
        "SELECT id, name, unit, description, bands, dformat, resampling_alg \
         FROM variables WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| CatalogError::not_found("variable", id))?;

    let instances: Vec<InstanceRow> = sqlx::query_as(
        "SELECT id, variable_id, name, metadata FROM variable_instances \
         WHERE variable_id = $1 ORDER BY name",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    let consolidation_params = read_consolidation_params(conn, id).await?;

    Ok(Variable {
        id: row.id,
        name: row.name,
        unit: row.unit,
        description: row.description,
        bands: row.bands,
        dformat: row.dformat.0,
        resampling_alg: enum_from_text::<Resampling>("resampling_alg", &row.resampling_alg)?,
        instances: instances
            .into_iter()
            .map(|i| VariableInstance {
                id: i.id,
                variable_id: i.variable_id,
                name: i.name,
                metadata: i.metadata,
                persistence: PersistenceState::Clean,
            })
            .collect(),
        consolidation_params,
        persistence: PersistenceState::Clean,
    })
}

pub(super) async fn update_variable(conn: &mut PgConnection, variable: &Variable) -> Result<()> {
    let result = sqlx::query(
        "UPDATE variables SET name = $2, unit = $3, description = $4, bands = $5, \
         dformat = $6, resampling_alg = $7 WHERE id = $1",
    )
    .bind(variable.id)
    .bind(&variable.name)
    .bind(&variable.unit)
    .bind(&variable.description)
    .bind(&variable.bands)
    .bind(Json(variable.dformat))
    .bind(enum_to_text(&variable.resampling_alg)?)
    .execute(conn)
    .await?;
    ensure_affected(result.rows_affected(), "variable", variable.id)
}

pub(super) async fn delete_variable(conn: &mut PgConnection, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM consolidation_params WHERE owner_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM variables WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    ensure_affected(result.rows_affected(), "variable", id)
}

pub(super) async fn create_instance(
    conn: &mut PgConnection,
    instance: &VariableInstance,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO variable_instances (id, variable_id, name, metadata) VALUES ($1, $2, $3, $4)",
    )
    .bind(instance.id)
    .bind(instance.variable_id)
    .bind(&instance.name)
    .bind(&instance.metadata)
    .execute(conn)
    .await?;
    Ok(())
}

pub(super) async fn update_instance(
    conn: &mut PgConnection,
    instance: &VariableInstance,
) -> Result<()> {
    let result =
        sqlx::query("UPDATE variable_instances SET name = $2, metadata = $3 WHERE id = $1")
            .bind(instance.id)
            .bind(&instance.name)
            .bind(&instance.metadata)
            .execute(conn)
            .await?;
    ensure_affected(result.rows_affected(), "instance", instance.id)
}

pub(super) async fn delete_instance(conn: &mut PgConnection, id: Uuid) -> Result<()> {
    let result = sqlx::query("DELETE FROM variable_instances WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    ensure_affected(result.rows_affected(), "instance", id)
}

pub(super) async fn create_consolidation_params(
    conn: &mut PgConnection,
    owner_id: Uuid,
    params: &ConsolidationParams,
) -> Result<()> {
    sqlx::query("INSERT INTO consolidation_params (owner_id, params) VALUES ($1, $2)")
        .bind(owner_id)
        .bind(Json(params))
        .execute(conn)
        .await?;
    Ok(())
}

pub(super) async fn read_consolidation_params(
    conn: &mut PgConnection,
    owner_id: Uuid,
) -> Result<Option<ConsolidationParams>> {
    let params: Option<Json<ConsolidationParams>> =
        sqlx::query_scalar("SELECT params FROM consolidation_params WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_optional(conn)
            .await?;
    Ok(params.map(|Json(mut p)| {
        p.persistence = PersistenceState::Clean;
        p
    }))
}

pub(super) async fn update_consolidation_params(
    conn: &mut PgConnection,
    owner_id: Uuid,
    params: &ConsolidationParams,
) -> Result<()> {
    let result = sqlx::query("UPDATE consolidation_params SET params = $2 WHERE owner_id = $1")
        .bind(owner_id)
        .bind(Json(params))
        .execute(conn)
        .await?;
    ensure_affected(result.rows_affected(), "consolidation_params", owner_id)
}

pub(super) async fn delete_consolidation_params(
    conn: &mut PgConnection,
    owner_id: Uuid,
) -> Result<()> {
    sqlx::query("DELETE FROM consolidation_params WHERE owner_id = $1")
        .bind(owner_id)
        .execute(conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct LayoutRow {
    name: String,
    grid: Json<GridParameters>,
    block_x: i32,
    block_y: i32,
    max_records: i32,
}

pub(super) async fn create_layout(conn: &mut PgConnection, layout: &Layout) -> Result<()> {
    layout.validate()?;
    sqlx::query(
        "INSERT INTO layouts (name, grid, block_x, block_y, max_records)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(&layout.name)
    .bind(Json(&layout.grid))
    .bind(to_i32("block_x", layout.block_x)?)
    .bind(to_i32("block_y", layout.block_y)?)
    .bind(to_i32("max_records", layout.max_records)?)
    .execute(conn)
    .await?;
    Ok(())
}

pub(super) async fn read_layout(conn: &mut PgConnection, name: &str) -> Result<Layout> {
    let row: LayoutRow = sqlx::query_as(
        "SELECT name, grid, block_x, block_y, max_records FROM layouts WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| CatalogError::not_found("layout", name))?;
    Ok(Layout {
        name: row.name,
        grid: row.grid.0,
        block_x: to_u32("block_x", row.block_x)?,
        block_y: to_u32("block_y", row.block_y)?,
        max_records: to_u32("max_records", row.max_records)?,
    })
}

// ---------------------------------------------------------------------------
// Containers and datasets
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct ContainerRow {
    uri: String,
    managed: bool,
    storage_class: String,
}

#[derive(FromRow)]
struct DatasetRow {
    id: Uuid,
    record_id: Uuid,
    instance_id: Uuid,
    container_uri: String,
    container_subdir: String,
    bands: Vec<i64>,
    dformat: Json<DataFormat>,
    overviews: bool,
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
    shape: Json<BBox>,
    status: String,
}

impl TryFrom<DatasetRow> for Dataset {
    type Error = CatalogError;

    fn try_from(row: DatasetRow) -> Result<Self> {
        Ok(Dataset {
            id: row.id,
            record_id: row.record_id,
            instance_id: row.instance_id,
            container_uri: row.container_uri,
            container_subdir: row.container_subdir,
            bands: row.bands,
            dformat: row.dformat.0,
            overviews: row.overviews,
            geometry: BBox::new(row.min_x, row.min_y, row.max_x, row.max_y),
            shape: row.shape.0,
            status: DatasetStatus::from_str(&row.status).map_err(|e| corrupted("status", e))?,
            persistence: PersistenceState::Clean,
        })
    }
}

const DATASET_COLUMNS: &str = "d.id, d.record_id, d.instance_id, d.container_uri, \
     d.container_subdir, d.bands, d.dformat, d.overviews, d.min_x, d.min_y, d.max_x, d.max_y, \
     d.shape, d.status";

pub(super) async fn create_container(conn: &mut PgConnection, container: &Container) -> Result<()> {
    sqlx::query("INSERT INTO containers (uri, managed, storage_class) VALUES ($1, $2, $3)")
        .bind(&container.uri)
        .bind(container.managed)
        .bind(&container.storage_class)
        .execute(conn)
        .await?;
    Ok(())
}

pub(super) async fn read_container(conn: &mut PgConnection, uri: &str) -> Result<Container> {
    let row: ContainerRow =
        sqlx::query_as("SELECT uri, managed, storage_class FROM containers WHERE uri = $1")
            .bind(uri)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| CatalogError::not_found("container", uri))?;

    let datasets: Vec<DatasetRow> = sqlx::query_as(&format!(
        "SELECT {DATASET_COLUMNS} FROM datasets d WHERE d.container_uri = $1 \
         ORDER BY d.container_subdir, d.id"
    ))
    .bind(uri)
    .fetch_all(conn)
    .await?;

    Ok(Container::restore(
        row.uri,
        row.managed,
        row.storage_class,
        datasets
            .into_iter()
            .map(Dataset::try_from)
            .collect::<Result<_>>()?,
    ))
}

pub(super) async fn update_container(
    conn: &mut PgConnection,
    container: &Container,
) -> Result<()> {
    let result =
        sqlx::query("UPDATE containers SET managed = $2, storage_class = $3 WHERE uri = $1")
            .bind(&container.uri)
            .bind(container.managed)
            .bind(&container.storage_class)
            .execute(conn)
            .await?;
    ensure_affected(result.rows_affected(), "container", &container.uri)
}

pub(super) async fn delete_container(conn: &mut PgConnection, uri: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM containers WHERE uri = $1")
        .bind(uri)
        .execute(conn)
        .await
        .map_err(|e| match CatalogError::from(e) {
            CatalogError::DependencyStillExists { reason, .. } => {
                CatalogError::dependency_still_exists("container", uri, reason)
            }
            other => other,
        })?;
    ensure_affected(result.rows_affected(), "container", uri)
}

pub(super) async fn find_container_uris(
    conn: &mut PgConnection,
    prefix: &str,
) -> Result<Vec<String>> {
    Ok(
        sqlx::query_scalar("SELECT uri FROM containers WHERE starts_with(uri, $1) ORDER BY uri")
            .bind(prefix)
            .fetch_all(conn)
            .await?,
    )
}

pub(super) async fn create_dataset(conn: &mut PgConnection, dataset: &Dataset) -> Result<()> {
    sqlx::query(
        "INSERT INTO datasets (id, record_id, instance_id, container_uri, container_subdir, \
         bands, dformat, overviews, min_x, min_y, max_x, max_y, shape, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(dataset.id)
    .bind(dataset.record_id)
    .bind(dataset.instance_id)
    .bind(&dataset.container_uri)
    .bind(&dataset.container_subdir)
    .bind(&dataset.bands)
    .bind(Json(dataset.dformat))
    .bind(dataset.overviews)
    .bind(dataset.geometry.min_x)
    .bind(dataset.geometry.min_y)
    .bind(dataset.geometry.max_x)
    .bind(dataset.geometry.max_y)
    .bind(Json(dataset.shape))
    .bind(dataset.status.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

pub(super) async fn update_dataset(conn: &mut PgConnection, dataset: &Dataset) -> Result<()> {
    let result = sqlx::query(
        "UPDATE datasets SET container_uri = $2, container_subdir = $3, bands = $4, dformat = $5, \
         overviews = $6, min_x = $7, min_y = $8, max_x = $9, max_y = $10, shape = $11, \
         status = $12 WHERE id = $1",
    )
    .bind(dataset.id)
    .bind(&dataset.container_uri)
    .bind(&dataset.container_subdir)
    .bind(&dataset.bands)
    .bind(Json(dataset.dformat))
    .bind(dataset.overviews)
    .bind(dataset.geometry.min_x)
    .bind(dataset.geometry.min_y)
    .bind(dataset.geometry.max_x)
    .bind(dataset.geometry.max_y)
    .bind(Json(dataset.shape))
    .bind(dataset.status.as_str())
    .execute(conn)
    .await?;
    ensure_affected(result.rows_affected(), "dataset", dataset.id)
}

pub(super) async fn delete_dataset(conn: &mut PgConnection, id: Uuid) -> Result<()> {
    let result = sqlx::query("DELETE FROM datasets WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    ensure_affected(result.rows_affected(), "dataset", id)
}

pub(super) async fn find_datasets(
    conn: &mut PgConnection,
    filter: &DatasetFilter,
) -> Result<Vec<Dataset>> {
    let mut query =
        QueryBuilder::<Postgres>::new(format!("SELECT {DATASET_COLUMNS} FROM datasets d"));
    if let Some((job_id, flag)) = filter.locked_by {
        query
            .push(" JOIN locked_datasets l ON l.dataset_id = d.id AND l.job_id = ")
            .push_bind(job_id)
            .push(" AND l.flag = ")
            .push_bind(flag.as_db());
    }
    query.push(" WHERE TRUE");
    if !filter.ids.is_empty() {
        query.push(" AND d.id = ANY(").push_bind(filter.ids.clone()).push(")");
    }
    if !filter.instance_ids.is_empty() {
        query
            .push(" AND d.instance_id = ANY(")
            .push_bind(filter.instance_ids.clone())
            .push(")");
    }
    if !filter.record_ids.is_empty() {
        query
            .push(" AND d.record_id = ANY(")
            .push_bind(filter.record_ids.clone())
            .push(")");
    }
    if !filter.statuses.is_empty() {
        let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
        query.push(" AND d.status = ANY(").push_bind(statuses).push(")");
    }
    if !filter.container_uris.is_empty() {
        query
            .push(" AND d.container_uri = ANY(")
            .push_bind(filter.container_uris.clone())
            .push(")");
    }
    if let Some(bbox) = filter.intersecting {
        query
            .push(" AND d.min_x < ")
            .push_bind(bbox.max_x)
            .push(" AND d.max_x > ")
            .push_bind(bbox.min_x)
            .push(" AND d.min_y < ")
            .push_bind(bbox.max_y)
            .push(" AND d.max_y > ")
            .push_bind(bbox.min_y);
    }
    query.push(" ORDER BY d.id");

    let rows: Vec<DatasetRow> = query.build_query_as().fetch_all(conn).await?;
    rows.into_iter().map(Dataset::try_from).collect()
}

pub(super) async fn change_datasets_status(
    conn: &mut PgConnection,
    job_id: Uuid,
    flag: LockFlag,
    from: DatasetStatus,
    to: DatasetStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE datasets d SET status = $4 FROM locked_datasets l \
         WHERE l.dataset_id = d.id AND l.job_id = $1 AND l.flag = $2 AND d.status = $3",
    )
    .bind(job_id)
    .bind(flag.as_db())
    .bind(from.as_str())
    .bind(to.as_str())
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

pub(super) async fn datasets_geometry_union(
    conn: &mut PgConnection,
    job_id: Uuid,
    flag: LockFlag,
) -> Result<Option<BBox>> {
    let (min_x, min_y, max_x, max_y): (Option<f64>, Option<f64>, Option<f64>, Option<f64>) =
        sqlx::query_as(
            "SELECT MIN(d.min_x), MIN(d.min_y), MAX(d.max_x), MAX(d.max_y) \
             FROM datasets d JOIN locked_datasets l ON l.dataset_id = d.id \
             WHERE l.job_id = $1 AND l.flag = $2",
        )
        .bind(job_id)
        .bind(flag.as_db())
        .fetch_one(conn)
        .await?;
    Ok(match (min_x, min_y, max_x, max_y) {
        (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) => {
            Some(BBox::new(min_x, min_y, max_x, max_y))
        }
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Jobs and tasks
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    job_type: String,
    state: String,
    execution_level: i16,
    waiting: bool,
    active_tasks: i32,
    failed_tasks: i32,
    payload: Json<JobPayload>,
    logs: Json<Vec<JobLog>>,
    last_update: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = CatalogError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(JobRecord {
            id: row.id,
            name: row.name,
            job_type: JobType::from_str(&row.job_type).map_err(|e| corrupted("job_type", e))?,
            state: JobState::from_str(&row.state).map_err(|e| corrupted("state", e))?,
            execution_level: ExecutionLevel::from_db(row.execution_level)
                .ok_or_else(|| corrupted("execution_level", row.execution_level))?,
            waiting: row.waiting,
            active_tasks: to_u32("active_tasks", row.active_tasks)?,
            failed_tasks: to_u32("failed_tasks", row.failed_tasks)?,
            payload: row.payload.0,
            logs: row.logs.0,
            last_update: row.last_update,
            created_at: row.created_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, name, job_type, state, execution_level, waiting, active_tasks, \
     failed_tasks, payload, logs, last_update, created_at";

pub(super) async fn create_job(conn: &mut PgConnection, job: &JobRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO jobs (id, name, job_type, state, execution_level, waiting, active_tasks, \
         failed_tasks, payload, logs, last_update, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(job.id)
    .bind(&job.name)
    .bind(job.job_type.as_str())
    .bind(job.state.as_str())
    .bind(job.execution_level.as_db())
    .bind(job.waiting)
    .bind(to_i32("active_tasks", job.active_tasks)?)
    .bind(to_i32("failed_tasks", job.failed_tasks)?)
    .bind(Json(&job.payload))
    .bind(Json(&job.logs))
    .bind(job.last_update)
    .bind(job.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub(super) async fn read_job(conn: &mut PgConnection, id: Uuid) -> Result<JobRecord> {
    let row: JobRow = sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| CatalogError::not_found("job", id))?;
    row.try_into()
}

pub(super) async fn update_job(
    conn: &mut PgConnection,
    job: &JobRecord,
    new_occ: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE jobs SET name = $2, state = $3, execution_level = $4, waiting = $5, \
         active_tasks = $6, failed_tasks = $7, payload = $8, logs = $9, last_update = $10 \
         WHERE id = $1 AND last_update = $11",
    )
    .bind(job.id)
    .bind(&job.name)
    .bind(job.state.as_str())
    .bind(job.execution_level.as_db())
    .bind(job.waiting)
    .bind(to_i32("active_tasks", job.active_tasks)?)
    .bind(to_i32("failed_tasks", job.failed_tasks)?)
    .bind(Json(&job.payload))
    .bind(Json(&job.logs))
    .bind(new_occ)
    .bind(job.last_update)
    .execute(conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(CatalogError::not_found("job", job.id).temporary());
    }
    Ok(())
}

pub(super) async fn delete_job(conn: &mut PgConnection, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM consolidation_params WHERE owner_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    ensure_affected(result.rows_affected(), "job", id)
}

pub(super) async fn find_jobs(
    conn: &mut PgConnection,
    filter: &JobFilter,
) -> Result<Vec<JobRecord>> {
    let mut query =
        QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"));
    if let Some(name) = &filter.name_contains {
        query
            .push(" AND strpos(lower(name), lower(")
            .push_bind(name.clone())
            .push(")) > 0");
    }
    if let Some(job_type) = filter.job_type {
        query.push(" AND job_type = ").push_bind(job_type.as_str());
    }
    if !filter.states.is_empty() {
        let states: Vec<&str> = filter.states.iter().map(|s| s.as_str()).collect();
        query.push(" AND state = ANY(").push_bind(states).push(")");
    }
    query.push(" ORDER BY created_at DESC, id");
    if let Some(limit) = filter.limit {
        query.push(" LIMIT ").push_bind(limit.max(0));
    }
    let rows: Vec<JobRow> = query.build_query_as().fetch_all(conn).await?;
    rows.into_iter().map(JobRecord::try_from).collect()
}

#[derive(FromRow)]
struct TaskRow {
    id: Uuid,
    state: String,
    payload: Vec<u8>,
}

pub(super) async fn create_task(conn: &mut PgConnection, job_id: Uuid, task: &Task) -> Result<()> {
    sqlx::query("INSERT INTO tasks (id, job_id, state, payload) VALUES ($1, $2, $3, $4)")
        .bind(task.id())
        .bind(job_id)
        .bind(task.state().as_str())
        .bind(task.payload())
        .execute(conn)
        .await?;
    Ok(())
}

pub(super) async fn update_task(conn: &mut PgConnection, job_id: Uuid, task: &Task) -> Result<()> {
    let result =
        sqlx::query("UPDATE tasks SET state = $3, payload = $4 WHERE id = $1 AND job_id = $2")
            .bind(task.id())
            .bind(job_id)
            .bind(task.state().as_str())
            .bind(task.payload())
            .execute(conn)
            .await?;
    ensure_affected(result.rows_affected(), "task", task.id())
}

pub(super) async fn delete_task(
    conn: &mut PgConnection,
    job_id: Uuid,
    task_id: Uuid,
) -> Result<()> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = $1 AND job_id = $2")
        .bind(task_id)
        .bind(job_id)
        .execute(conn)
        .await?;
    ensure_affected(result.rows_affected(), "task", task_id)
}

pub(super) async fn read_tasks(
    conn: &mut PgConnection,
    job_id: Uuid,
    task_id: Option<Uuid>,
) -> Result<Vec<Task>> {
    let rows: Vec<TaskRow> = sqlx::query_as(
        "SELECT id, state, payload FROM tasks \
         WHERE job_id = $1 AND ($2::uuid IS NULL OR id = $2) ORDER BY id",
    )
    .bind(job_id)
    .bind(task_id)
    .fetch_all(conn)
    .await?;
    if let (Some(task_id), true) = (task_id, rows.is_empty()) {
        return Err(CatalogError::not_found("task", task_id));
    }
    rows.into_iter()
        .map(|row| {
            let state = TaskState::from_str(&row.state).map_err(|e| corrupted("state", e))?;
            Ok(Task::restore(row.id, state, row.payload))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

pub(super) async fn lock_datasets(
    conn: &mut PgConnection,
    job_id: Uuid,
    dataset_ids: &[Uuid],
    flag: LockFlag,
) -> Result<()> {
    let ids: Vec<Uuid> = dataset_ids
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if ids.is_empty() {
        return Ok(());
    }
    // Rows already held by this job are touched, rows held by another job are skipped.
    let result = sqlx::query(
        "INSERT INTO locked_datasets (dataset_id, flag, job_id) \
         SELECT id, $2, $3 FROM unnest($1::uuid[]) AS id \
         ON CONFLICT (dataset_id, flag) DO UPDATE SET job_id = EXCLUDED.job_id \
         WHERE locked_datasets.job_id = EXCLUDED.job_id",
    )
    .bind(&ids)
    .bind(flag.as_db())
    .bind(job_id)
    .execute(conn)
    .await?;
    let locked = result.rows_affected();
    if locked < ids.len() as u64 {
        return Err(CatalogError::already_exists(
            "locked_dataset",
            format!(
                "{} dataset(s) already locked under {flag}",
                ids.len() as u64 - locked
            ),
        ));
    }
    Ok(())
}

pub(super) async fn release_datasets(
    conn: &mut PgConnection,
    job_id: Uuid,
    flag: LockFlag,
) -> Result<()> {
    sqlx::query("DELETE FROM locked_datasets WHERE job_id = $1 AND flag = $2")
        .bind(job_id)
        .bind(flag.as_db())
        .execute(conn)
        .await?;
    Ok(())
}
