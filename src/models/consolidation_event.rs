//! Payload of a consolidation task.
//!
//! Describes one output container and the input datasets grouped by record,
//! in the order they must be stacked. The external executor consumes it and
//! reports a `TaskEvent` back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::dataset::DataFormat;
use super::geometry::BBox;
use super::variable::{Compression, Resampling};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationContainer {
    pub uri: String,
    pub base_name: String,
    pub dformat: DataFormat,
    pub bands_count: usize,
    pub crs: String,
    pub geotransform: [f64; 6],
    pub width: u32,
    pub height: u32,
    pub block_x: u32,
    pub block_y: u32,
    pub compression: Compression,
    pub overviews_min_size: i32,
    pub resampling_alg: Resampling,
    pub bands_interleave: bool,
    pub storage_class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationDataset {
    pub dataset_id: Uuid,
    pub uri: String,
    pub subdir: String,
    pub bands: Vec<i64>,
    pub dformat: DataFormat,
    pub overviews: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationRecord {
    pub id: Uuid,
    pub datetime: DateTime<Utc>,
    /// Valid shape of the record clipped to the container cell.
    pub valid_shape: BBox,
    pub datasets: Vec<ConsolidationDataset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationEvent {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub container: ConsolidationContainer,
    pub records: Vec<ConsolidationRecord>,
}

impl ConsolidationEvent {
    pub fn dataset_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.records
            .iter()
            .flat_map(|r| r.datasets.iter().map(|d| d.dataset_id))
    }
}

pub fn marshal_consolidation_event(event: &ConsolidationEvent) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

pub fn unmarshal_consolidation_event(payload: &[u8]) -> Result<ConsolidationEvent> {
    Ok(serde_json::from_slice(payload)?)
}
