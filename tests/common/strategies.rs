//! Proptest strategies for task outcomes, packing inputs and the messages
//! exchanged with the executors.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use uuid::Uuid;

use catalog_orchestrator::models::{
    BBox, Compression, ConsolidationContainer, ConsolidationDataset, ConsolidationEvent,
    ConsolidationRecord, DType, DataFormat, Resampling,
};
use catalog_orchestrator::state_machine::{JobEvent, JobStatus, TaskEvent, TaskStatus};

pub fn task_status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Pending),
        Just(TaskStatus::Successful),
        Just(TaskStatus::Failed),
        Just(TaskStatus::Cancelled),
        Just(TaskStatus::Ignored),
    ]
}

/// Outcomes as `(task index, status)` over `tasks` tasks, in arrival order.
pub fn outcome_sequence_strategy(
    tasks: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<(usize, TaskStatus)>> {
    prop::collection::vec((0..tasks, task_status_strategy()), 0..max_len)
}

/// `(records, max_records)` pairs for container packing.
pub fn packing_strategy() -> impl Strategy<Value = (usize, usize)> {
    (0usize..60, 1usize..12)
}

pub fn uuid_strategy() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

fn datetime_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_000_000_000, 0u32..1_000_000_000)
        .prop_map(|(secs, nanos)| Utc.timestamp_opt(secs, nanos).unwrap())
}

fn error_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::of("\\PC{0,40}")
}

fn uri_strategy() -> impl Strategy<Value = String> {
    "(mem|file|s3)://[a-z0-9_]{1,12}(/[a-z0-9_.-]{1,12}){0,3}"
}

pub fn job_event_strategy() -> impl Strategy<Value = JobEvent> {
    (
        uuid_strategy(),
        prop::sample::select(JobStatus::ALL.to_vec()),
        error_strategy(),
    )
        .prop_map(|(job_id, status, error)| JobEvent {
            job_id,
            status,
            error,
        })
}

pub fn task_event_strategy() -> impl Strategy<Value = TaskEvent> {
    (
        uuid_strategy(),
        uuid_strategy(),
        task_status_strategy(),
        error_strategy(),
    )
        .prop_map(|(job_id, task_id, status, error)| TaskEvent {
            job_id,
            task_id,
            status,
            error,
        })
}

/// Finite values with a short exact decimal form.
fn coordinate_strategy() -> impl Strategy<Value = f64> {
    (-4_000_000i32..4_000_000).prop_map(|n| f64::from(n) / 4.0)
}

/// Pixel values, NaN and the infinities included.
fn pixel_value_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![
        4 => coordinate_strategy(),
        1 => Just(f64::NAN),
        1 => Just(f64::INFINITY),
        1 => Just(f64::NEG_INFINITY),
    ]
}

pub fn dformat_strategy() -> impl Strategy<Value = DataFormat> {
    (
        prop::sample::select(vec![
            DType::Int8,
            DType::UInt8,
            DType::Int16,
            DType::UInt16,
            DType::Int32,
            DType::UInt32,
            DType::Float32,
            DType::Float64,
        ]),
        pixel_value_strategy(),
        pixel_value_strategy(),
        pixel_value_strategy(),
    )
        .prop_map(|(dtype, no_data, min_value, max_value)| DataFormat {
            dtype,
            no_data,
            min_value,
            max_value,
        })
}

fn bbox_strategy() -> impl Strategy<Value = BBox> {
    (
        coordinate_strategy(),
        coordinate_strategy(),
        1u16..10_000,
        1u16..10_000,
    )
        .prop_map(|(x, y, w, h)| BBox::new(x, y, x + f64::from(w), y + f64::from(h)))
}

fn consolidation_dataset_strategy() -> impl Strategy<Value = ConsolidationDataset> {
    (
        uuid_strategy(),
        uri_strategy(),
        prop::option::of(1u8..10),
        prop::collection::vec(1i64..16, 1..4),
        dformat_strategy(),
        any::<bool>(),
    )
        .prop_map(
            |(dataset_id, uri, dir, bands, dformat, overviews)| ConsolidationDataset {
                dataset_id,
                uri,
                subdir: dir.map(|n| format!("GTIFF_DIR:{n}")).unwrap_or_default(),
                bands,
                dformat,
                overviews,
            },
        )
}

fn consolidation_record_strategy() -> impl Strategy<Value = ConsolidationRecord> {
    (
        uuid_strategy(),
        datetime_strategy(),
        bbox_strategy(),
        prop::collection::vec(consolidation_dataset_strategy(), 1..3),
    )
        .prop_map(|(id, datetime, valid_shape, datasets)| ConsolidationRecord {
            id,
            datetime,
            valid_shape,
            datasets,
        })
}

fn consolidation_container_strategy() -> impl Strategy<Value = ConsolidationContainer> {
    let layout = (
        uri_strategy(),
        dformat_strategy(),
        1usize..8,
        "EPSG:[0-9]{4,5}",
        prop::array::uniform6(coordinate_strategy()),
        (1u32..10_000, 1u32..10_000),
        (1u32..1024, 1u32..1024),
    );
    let encoding = (
        prop_oneof![
            Just(Compression::None),
            Just(Compression::Lzw),
            Just(Compression::Deflate),
            Just(Compression::Zstd),
        ],
        -1i32..1024,
        prop_oneof![
            Just(Resampling::Near),
            Just(Resampling::Bilinear),
            Just(Resampling::Cubic),
            Just(Resampling::Average),
            Just(Resampling::Mode),
        ],
        any::<bool>(),
        "[A-Z_]{1,12}",
    );
    (layout, encoding).prop_map(
        |(
            (base_name, dformat, bands_count, crs, geotransform, (width, height), (bx, by)),
            (compression, overviews_min_size, resampling_alg, bands_interleave, storage_class),
        )| ConsolidationContainer {
            uri: format!("{base_name}_1.tif"),
            base_name,
            dformat,
            bands_count,
            crs,
            geotransform,
            width,
            height,
            block_x: bx,
            block_y: by,
            compression,
            overviews_min_size,
            resampling_alg,
            bands_interleave,
            storage_class,
        },
    )
}

pub fn consolidation_event_strategy() -> impl Strategy<Value = ConsolidationEvent> {
    (
        uuid_strategy(),
        uuid_strategy(),
        consolidation_container_strategy(),
        prop::collection::vec(consolidation_record_strategy(), 0..4),
    )
        .prop_map(|(job_id, task_id, container, records)| ConsolidationEvent {
            job_id,
            task_id,
            container,
            records,
        })
}
