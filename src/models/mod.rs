//! # Catalog Models
//!
//! Domain entities of the raster catalog and of the orchestration layer.
//!
//! Mutable entities embed a [`PersistenceState`] telling the persister what
//! the next save must write. Reference data (records, layouts) is immutable
//! once created and carries none.

pub mod consolidation_event;
pub mod container;
pub mod dataset;
pub mod geometry;
pub mod job;
pub mod layout;
pub mod locked_datasets;
pub mod persistence_state;
pub mod record;
pub mod task;
pub mod variable;

pub use consolidation_event::{
    marshal_consolidation_event, unmarshal_consolidation_event, ConsolidationContainer,
    ConsolidationDataset, ConsolidationEvent, ConsolidationRecord,
};
pub use container::Container;
pub use dataset::{DType, DataFormat, Dataset, DatasetStatus};
pub use geometry::BBox;
pub use job::{Job, JobLog, JobPayload, JobRecord, LogSeverity};
pub use layout::{Cell, GridParameters, Layout, RegularGrid};
pub use locked_datasets::{LockFlag, LockedDatasetSet};
pub use persistence_state::PersistenceState;
pub use record::Record;
pub use task::{Task, TaskState};
pub use variable::{Compression, ConsolidationParams, Resampling, Variable, VariableInstance};
