//! Test harness over the in-memory backend, channel publishers and
//! in-memory storage, plus catalog seeding helpers.

#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

use catalog_orchestrator::config::ExecutionConfig;
use catalog_orchestrator::database::{Backend, DatasetFilter, InMemoryBackend};
use catalog_orchestrator::messaging::ChannelPublisher;
use catalog_orchestrator::models::{
    unmarshal_consolidation_event, BBox, ConsolidationEvent, Container, DType, DataFormat,
    Dataset, DatasetStatus, GridParameters, Job, Layout, Record, Resampling, Variable,
};
use catalog_orchestrator::orchestration::{EventDispatcher, JobService};
use catalog_orchestrator::state_machine::{unmarshal_event, Event, TaskEvent, TaskStatus};
use catalog_orchestrator::storage::{ContainerStorage, InMemoryStorage};

pub const CANCELLATION_PREFIX: &str = "mem://cancellation";
pub const STORAGE_URI: &str = "mem://cubes";
pub const LAYOUT: &str = "utm-31n";

pub fn dformat() -> DataFormat {
    DataFormat {
        dtype: DType::UInt16,
        no_data: 0.0,
        min_value: 1.0,
        max_value: 10000.0,
    }
}

/// Float encoding with a NaN no-data value and unbounded range.
pub fn nan_dformat() -> DataFormat {
    DataFormat {
        dtype: DType::Float32,
        no_data: f64::NAN,
        min_value: f64::NEG_INFINITY,
        max_value: f64::INFINITY,
    }
}

/// Footprint inside cell `0/0` of the test layout.
pub fn inner_bbox() -> BBox {
    BBox::new(100.0, 100.0, 900.0, 900.0)
}

pub struct Harness {
    pub backend: Arc<InMemoryBackend>,
    pub events: Arc<ChannelPublisher>,
    pub orders: Arc<ChannelPublisher>,
    pub storage: Arc<InMemoryStorage>,
    pub dispatcher: Arc<EventDispatcher>,
    pub service: JobService,
}

impl Harness {
    pub fn new() -> Self {
        let backend = Arc::new(InMemoryBackend::new());
        let events = Arc::new(ChannelPublisher::new("events"));
        let orders = Arc::new(ChannelPublisher::new("orders"));
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(
            EventDispatcher::new(
                backend.clone(),
                events.clone(),
                orders.clone(),
                storage.clone(),
                CANCELLATION_PREFIX,
            )
            .with_execution_config(ExecutionConfig {
                retry_base_delay_ms: 1,
                max_parallel_workers: 2,
                ..ExecutionConfig::default()
            }),
        );
        let service = JobService::new(dispatcher.clone());
        Self {
            backend,
            events,
            orders,
            storage,
            dispatcher,
            service,
        }
    }

    /// Dispatches published events until none is left. Returns how many ran.
    pub async fn pump(&self) -> usize {
        let mut handled = 0;
        loop {
            let payloads = self.events.drain();
            if payloads.is_empty() {
                return handled;
            }
            for payload in payloads {
                let event = unmarshal_event(&payload).expect("event payload");
                self.dispatcher
                    .handle_event(event)
                    .await
                    .expect("event handled");
                handled += 1;
            }
        }
    }

    /// Orders published since the last call.
    pub fn take_orders(&self) -> Vec<ConsolidationEvent> {
        self.orders
            .drain()
            .iter()
            .map(|payload| unmarshal_consolidation_event(payload).expect("order payload"))
            .collect()
    }

    /// Uploads the container of `order` and reports the task outcome, as an
    /// executor would.
    pub async fn execute(&self, order: &ConsolidationEvent, status: TaskStatus) {
        if status == TaskStatus::Successful {
            self.storage
                .write(&order.container.uri, b"GTiff")
                .await
                .expect("upload");
        }
        self.report(order.job_id, order.task_id, status).await;
    }

    pub async fn report(&self, job_id: Uuid, task_id: Uuid, status: TaskStatus) {
        let mut event = TaskEvent::new(job_id, task_id, status);
        if status == TaskStatus::Failed {
            event.error = Some("executor crashed".to_string());
        }
        self.dispatcher
            .handle_event(Event::Task(event))
            .await
            .expect("task event handled");
    }

    pub async fn job(&self, job_id: Uuid) -> Job {
        self.service.get_job(job_id).await.expect("job")
    }

    pub async fn datasets(&self, filter: DatasetFilter) -> Vec<Dataset> {
        self.backend.find_datasets(&filter).await.expect("datasets")
    }

    pub async fn active_datasets(&self, instance_id: Uuid) -> Vec<Dataset> {
        self.datasets(DatasetFilter {
            instance_ids: vec![instance_id],
            statuses: vec![DatasetStatus::Active],
            ..DatasetFilter::default()
        })
        .await
    }
}

/// A variable with one instance and the test layout.
pub struct Catalog {
    pub variable: Variable,
    pub instance_id: Uuid,
    pub layout: Layout,
}

pub async fn seed_catalog(harness: &Harness, max_records: u32) -> Catalog {
    seed_catalog_with_format(harness, max_records, dformat()).await
}

pub async fn seed_catalog_with_format(
    harness: &Harness,
    max_records: u32,
    format: DataFormat,
) -> Catalog {
    let mut variable = Variable::new(
        "ndvi",
        "",
        vec!["ndvi".to_string()],
        format,
        Resampling::Bilinear,
    )
    .expect("variable");
    let instance_id = variable.add_instance("sentinel2").expect("instance");
    harness
        .dispatcher
        .persister()
        .save_variable(&mut variable)
        .await
        .expect("save variable");

    let layout = Layout::new(
        LAYOUT,
        GridParameters {
            crs: "EPSG:32631".to_string(),
            origin_x: 0.0,
            origin_y: 0.0,
            resolution: 10.0,
            cell_size: 100,
        },
        256,
        256,
        max_records,
    )
    .expect("layout");
    harness
        .backend
        .create_layout(&layout)
        .await
        .expect("create layout");

    Catalog {
        variable,
        instance_id,
        layout,
    }
}

/// Record acquired `day` days after 2024-01-01.
pub async fn seed_record(harness: &Harness, day: i64) -> Record {
    let datetime = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap() + Duration::days(day);
    let record = Record::new(format!("S2A_{day:03}"), datetime);
    harness
        .backend
        .create_record(&record)
        .await
        .expect("create record");
    record
}

/// One raw scene per record, each in its own unmanaged container.
pub async fn seed_raw_datasets(
    harness: &Harness,
    catalog: &Catalog,
    records: &[Record],
) -> Vec<Dataset> {
    let mut datasets = Vec::new();
    for record in records {
        let uri = format!("mem://raw/{}.tif", record.name);
        let mut container = Container::new(&uri, false, "STANDARD");
        container.add_dataset(Dataset::new(
            record.id,
            catalog.instance_id,
            &uri,
            "",
            vec![1],
            catalog.variable.dformat,
            inner_bbox(),
            inner_bbox(),
        ));
        datasets.extend(container.datasets.iter().cloned());
        harness
            .dispatcher
            .persister()
            .save_container(&mut container)
            .await
            .expect("save raw container");
    }
    datasets
}

/// A managed container at `uri` holding one dataset per record, stored
/// both in the catalog and in storage.
pub async fn seed_managed_container(
    harness: &Harness,
    catalog: &Catalog,
    uri: &str,
    records: &[Record],
) -> Container {
    let mut container = Container::new(uri, true, "STANDARD");
    for (position, record) in records.iter().enumerate() {
        container.add_dataset(Dataset::new(
            record.id,
            catalog.instance_id,
            uri,
            format!("GTIFF_DIR:{}", position + 1),
            vec![1],
            catalog.variable.dformat,
            BBox::new(0.0, 0.0, 1000.0, 1000.0),
            inner_bbox(),
        ));
    }
    harness
        .dispatcher
        .persister()
        .save_container(&mut container)
        .await
        .expect("save managed container");
    harness
        .storage
        .write(uri, b"GTiff")
        .await
        .expect("upload container");
    container
}
