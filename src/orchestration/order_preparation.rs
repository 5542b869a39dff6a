//! # Order Preparation
//!
//! Turns the datasets a consolidation job holds under `Init` into one task
//! per output container.
//!
//! ## Algorithm
//!
//! 1. Cover the union footprint of the locked datasets with the layout grid.
//! 2. Per cell (at most `max_parallel_workers` at a time), fetch the Active
//!    locked datasets overlapping it and the existing containers sharing the
//!    cell's base name.
//! 3. [`need_consolidation`] decides whether the cell must be rewritten and
//!    widens the working set to whole containers.
//! 4. Sort by record time, keep full untouched containers as they are, clip
//!    each record's valid shape to the cell and pack the records into
//!    containers of at most `max_records`.
//!
//! Every dataset written into a new container is claimed under `ToDelete`;
//! the `Init` claim is released once the tasks are saved.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::dispatcher::EventDispatcher;
use crate::database::DatasetFilter;
use crate::error::{CatalogError, Result};
use crate::models::container::{base_name, packing_suffix};
use crate::models::{
    BBox, Cell, ConsolidationContainer, ConsolidationDataset, ConsolidationEvent,
    ConsolidationParams, ConsolidationRecord, Container, DataFormat, Dataset, DatasetStatus, Job,
    JobPayload, Layout, LockFlag, LogSeverity, Record, TaskState,
};

/// Base name shared by every container of one cell and one instance.
pub fn container_base_name(
    storage_uri: &str,
    layout_name: &str,
    cell_id: &str,
    instance_id: Uuid,
) -> String {
    format!(
        "{}/{layout_name}/{}/{instance_id}",
        storage_uri.trim_end_matches('/'),
        cell_id.replace('/', "_")
    )
}

/// What a cell's containers are expected to look like.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateContainer {
    pub base_name: String,
    pub dformat: DataFormat,
    pub bands_count: usize,
}

/// Whether `container` no longer matches the expected encoding.
///
/// Only the data format and the band count are compared. Compression and
/// resampling are not recorded on containers, so a change of those alone
/// does not trigger a rewrite.
pub fn needs_reconsolidation(container: &Container, candidate: &CandidateContainer) -> bool {
    container.live_datasets().any(|d| {
        !d.dformat.same_encoding(&candidate.dformat) || d.bands.len() != candidate.bands_count
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationNeed {
    pub needed: bool,
    /// Working set, deduplicated and ordered by dataset id.
    pub datasets: Vec<Dataset>,
}

/// Decides whether `datasets` must be consolidated into the candidate.
///
/// A dataset needs it unless it already sits in one of `containers` that
/// shares the candidate base name and does not need reconsolidation. Every
/// such container contributes all its Active datasets to the working set,
/// so a container is always rewritten whole.
pub fn need_consolidation(
    datasets: &[Dataset],
    candidate: &CandidateContainer,
    containers: &[Container],
) -> ConsolidationNeed {
    let reusable: Vec<&Container> = containers
        .iter()
        .filter(|c| base_name(&c.uri) == candidate.base_name)
        .filter(|c| !needs_reconsolidation(c, candidate))
        .collect();

    let needed = datasets
        .iter()
        .any(|d| !reusable.iter().any(|c| c.uri == d.container_uri));

    let mut working: BTreeMap<Uuid, Dataset> =
        datasets.iter().map(|d| (d.id, d.clone())).collect();
    for container in reusable {
        for dataset in container.active_datasets() {
            working
                .entry(dataset.id)
                .or_insert_with(|| dataset.clone());
        }
    }
    ConsolidationNeed {
        needed,
        datasets: working.into_values().collect(),
    }
}

/// Datasets of one record, in working-set order.
type RecordGroup = (Record, Vec<Dataset>);

/// Removes every run of `max_records` consecutive records that exactly
/// fills an existing, reusable container none of whose records changed.
fn keep_full_containers(
    mut groups: Vec<RecordGroup>,
    containers: &[Container],
    candidate: &CandidateContainer,
    max_records: usize,
) -> Vec<RecordGroup> {
    for container in containers
        .iter()
        .filter(|c| base_name(&c.uri) == candidate.base_name)
        .filter(|c| !needs_reconsolidation(c, candidate))
    {
        let records: BTreeSet<Uuid> = container.active_datasets().map(|d| d.record_id).collect();
        if max_records == 0 || records.len() != max_records || groups.len() < max_records {
            continue;
        }
        let start = groups.windows(max_records).position(|window| {
            window.iter().map(|(r, _)| r.id).collect::<BTreeSet<_>>() == records
                && window
                    .iter()
                    .all(|(_, ds)| ds.iter().all(|d| d.container_uri == container.uri))
        });
        if let Some(start) = start {
            debug!(uri = %container.uri, "full container left untouched");
            groups.drain(start..start + max_records);
        }
    }
    groups
}

/// Smallest suffix not in `used`, which it joins.
fn next_suffix(used: &mut BTreeSet<u32>) -> u32 {
    let suffix = (1..).find(|n| !used.contains(n)).unwrap_or(u32::MAX);
    used.insert(suffix);
    suffix
}

/// Splits `records` into batches of at most `max_records`, each with a
/// fresh `{base}_{n}.tif` uri. `used` holds the suffixes already taken.
pub fn pack_records(
    base: &str,
    used: &mut BTreeSet<u32>,
    records: Vec<ConsolidationRecord>,
    max_records: usize,
) -> Vec<(String, Vec<ConsolidationRecord>)> {
    let max_records = max_records.max(1);
    let mut batches = Vec::with_capacity(records.len().div_ceil(max_records));
    let mut records = records.into_iter().peekable();
    while records.peek().is_some() {
        let batch: Vec<ConsolidationRecord> = records.by_ref().take(max_records).collect();
        batches.push((format!("{base}_{}.tif", next_suffix(used)), batch));
    }
    batches
}

/// Shared inputs of every cell of one preparation.
struct PlanContext<'a> {
    job_id: Uuid,
    instance_id: Uuid,
    storage_uri: &'a str,
    layout: &'a Layout,
    params: &'a ConsolidationParams,
    bands_count: usize,
}

#[derive(Debug)]
struct CellPlan {
    cell_id: String,
    orders: Vec<ConsolidationEvent>,
    superseded: Vec<Uuid>,
}

fn consolidation_dataset(dataset: &Dataset) -> ConsolidationDataset {
    ConsolidationDataset {
        dataset_id: dataset.id,
        uri: dataset.container_uri.clone(),
        subdir: dataset.container_subdir.clone(),
        bands: dataset.bands.clone(),
        dformat: dataset.dformat,
        overviews: dataset.overviews,
    }
}

impl EventDispatcher {
    /// Creates the consolidation tasks of `job` and saves it.
    ///
    /// Re-entry discards tasks and `ToDelete` claims of a previous attempt.
    /// A job that already released its `Init` claim keeps its tasks.
    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(super) async fn prepare_orders(&self, job: &mut Job) -> Result<()> {
        let JobPayload::Consolidation {
            variable_id,
            instance_id,
            layout_name,
            storage_uri,
        } = job.payload().clone()
        else {
            return Err(CatalogError::should_never_happen(
                "order preparation on a non-consolidation job",
            ));
        };

        let db = self.db();
        let Some(area) = db.datasets_geometry_union(job.id(), LockFlag::Init).await? else {
            if job.live_tasks().next().is_some() {
                info!("Orders already prepared");
                return Ok(());
            }
            job.log(LogSeverity::Warning, "no dataset to consolidate");
            return self.persister.save_job(job).await;
        };

        let stale: Vec<Uuid> = job
            .live_tasks()
            .filter(|t| t.state() == TaskState::New)
            .map(|t| t.id())
            .collect();
        for task_id in stale {
            job.delete_task(task_id)?;
        }
        job.release_datasets(LockFlag::ToDelete);

        let variable = db.read_variable(variable_id).await?;
        let params = match job.params() {
            Some(params) => params.clone(),
            None => variable
                .consolidation_params
                .clone()
                .unwrap_or_else(|| variable.default_consolidation_params()),
        };
        let layout = db.read_layout(&layout_name).await?;
        let context = PlanContext {
            job_id: job.id(),
            instance_id,
            storage_uri: &storage_uri,
            layout: &layout,
            params: &params,
            bands_count: variable.bands.len(),
        };

        let cells = layout.grid().cover(&area);
        let mut plans: Vec<CellPlan> = stream::iter(cells)
            .map(|cell| self.plan_cell(&context, cell))
            .buffer_unordered(self.config.max_parallel_workers.max(1))
            .try_collect::<Vec<Option<CellPlan>>>()
            .await?
            .into_iter()
            .flatten()
            .collect();
        plans.sort_by(|a, b| a.cell_id.cmp(&b.cell_id));

        let mut superseded = BTreeSet::new();
        let mut orders = 0usize;
        for plan in &mut plans {
            for order in plan.orders.drain(..) {
                job.create_consolidation_task(order)?;
                orders += 1;
            }
            superseded.extend(plan.superseded.iter().copied());
        }
        if job.params().is_none() {
            job.set_params(params)?;
        }
        job.lock_datasets(superseded.iter().copied(), LockFlag::ToDelete);
        job.release_datasets(LockFlag::Init);
        job.log(
            LogSeverity::Info,
            format!(
                "{orders} order(s) prepared in {} cell(s), {} dataset(s) superseded",
                plans.len(),
                superseded.len()
            ),
        );
        self.persister.save_job(job).await
    }

    async fn plan_cell(&self, context: &PlanContext<'_>, cell: Cell) -> Result<Option<CellPlan>> {
        let db = self.db();
        let filter = DatasetFilter::locked_by(context.job_id, LockFlag::Init)
            .with_statuses([DatasetStatus::Active])
            .intersecting(cell.bbox);
        let datasets = db.find_datasets(&filter).await?;
        if datasets.is_empty() {
            return Ok(None);
        }

        let base = container_base_name(
            context.storage_uri,
            &context.layout.name,
            &cell.id,
            context.instance_id,
        );
        let mut group = Vec::new();
        for uri in db.find_container_uris(&base).await? {
            if base_name(&uri) == base {
                group.push(db.read_container(&uri).await?);
            }
        }
        let candidate = CandidateContainer {
            base_name: base.clone(),
            dformat: context.params.dformat,
            bands_count: context.bands_count,
        };

        let need = need_consolidation(&datasets, &candidate, &group);
        if !need.needed {
            debug!(cell = %cell.id, "cell already consolidated");
            return Ok(None);
        }

        let record_ids: Vec<Uuid> = need
            .datasets
            .iter()
            .map(|d| d.record_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut by_record: BTreeMap<Uuid, Vec<Dataset>> = BTreeMap::new();
        for dataset in need.datasets {
            by_record.entry(dataset.record_id).or_default().push(dataset);
        }
        // read_records orders by datetime, then id.
        let groups: Vec<RecordGroup> = db
            .read_records(&record_ids)
            .await?
            .into_iter()
            .filter_map(|record| by_record.remove(&record.id).map(|ds| (record, ds)))
            .collect();

        let max_records = context.layout.max_records as usize;
        let groups = keep_full_containers(groups, &group, &candidate, max_records);

        let mut records = Vec::with_capacity(groups.len());
        for (record, datasets) in groups {
            let Some(valid_shape) = BBox::union_all(datasets.iter().map(|d| &d.shape))
                .and_then(|shape| shape.intersection(&cell.bbox))
                .filter(|shape| !shape.is_degenerate())
            else {
                debug!(record_id = %record.id, cell = %cell.id, "record does not cover the cell");
                continue;
            };
            records.push(ConsolidationRecord {
                id: record.id,
                datetime: record.datetime,
                valid_shape,
                datasets: datasets.iter().map(consolidation_dataset).collect(),
            });
        }
        if records.is_empty() {
            return Ok(None);
        }

        let mut used: BTreeSet<u32> = group.iter().filter_map(|c| packing_suffix(&c.uri)).collect();
        let mut superseded = Vec::new();
        let mut orders = Vec::new();
        for (uri, batch) in pack_records(&base, &mut used, records, max_records) {
            superseded.extend(
                batch
                    .iter()
                    .flat_map(|r| r.datasets.iter().map(|d| d.dataset_id)),
            );
            orders.push(ConsolidationEvent {
                job_id: context.job_id,
                task_id: Uuid::nil(),
                container: ConsolidationContainer {
                    uri,
                    base_name: base.clone(),
                    dformat: context.params.dformat,
                    bands_count: context.bands_count,
                    crs: cell.crs.clone(),
                    geotransform: cell.geotransform,
                    width: cell.width,
                    height: cell.height,
                    block_x: context.layout.block_x,
                    block_y: context.layout.block_y,
                    compression: context.params.compression,
                    overviews_min_size: context.params.overviews_min_size,
                    resampling_alg: context.params.resampling_alg,
                    bands_interleave: context.params.bands_interleave,
                    storage_class: context.params.storage_class.clone(),
                },
                records: batch,
            });
        }
        debug!(cell = %cell.id, containers = orders.len(), "cell planned");
        Ok(Some(CellPlan {
            cell_id: cell.id,
            orders,
            superseded,
        }))
    }
}
