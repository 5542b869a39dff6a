mod common;

use common::*;

use catalog_orchestrator::database::JobFilter;
use catalog_orchestrator::orchestration::{
    container_base_name, marker_uri, ConsolidationRequest, DeletionRequest,
};
use catalog_orchestrator::state_machine::{
    Event, ExecutionLevel, JobState, JobType, TaskEvent, TaskStatus,
};
use catalog_orchestrator::storage::ContainerStorage;
use uuid::Uuid;

fn request(catalog: &Catalog) -> ConsolidationRequest {
    ConsolidationRequest::new(
        "ndvi tile 0-0",
        catalog.variable.id,
        catalog.instance_id,
        LAYOUT,
        STORAGE_URI,
    )
    .with_execution_level(ExecutionLevel::Synchronous)
}

fn base(catalog: &Catalog) -> String {
    container_base_name(STORAGE_URI, LAYOUT, "0/0", catalog.instance_id)
}

#[tokio::test]
async fn test_consolidated_datasets_produce_no_orders() {
    let harness = Harness::new();
    let catalog = seed_catalog(&harness, 5).await;
    let mut records = Vec::new();
    for day in 1..=3 {
        records.push(seed_record(&harness, day).await);
    }
    let uri = format!("{}_1.tif", base(&catalog));
    seed_managed_container(&harness, &catalog, &uri, &records).await;

    let job_id = harness.service.consolidate(request(&catalog)).await.unwrap();

    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::Done);
    assert!(job.tasks().is_empty());
    assert!(harness.take_orders().is_empty());

    let active = harness.active_datasets(catalog.instance_id).await;
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|d| d.container_uri == uri));
    assert!(harness.storage.contains(&uri));
    assert_eq!(harness.backend.lock_count().await, 0);
}

#[tokio::test]
async fn test_raw_scenes_are_packed_and_superseded() {
    let harness = Harness::new();
    let catalog = seed_catalog(&harness, 2).await;
    let mut records = Vec::new();
    for day in [3, 1, 2] {
        records.push(seed_record(&harness, day).await);
    }
    let raw = seed_raw_datasets(&harness, &catalog, &records).await;

    let job_id = harness.service.consolidate(request(&catalog)).await.unwrap();
    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::ConsolidationInProgress);
    assert_eq!(job.active_tasks(), 2);

    let orders = harness.take_orders();
    assert_eq!(orders.len(), 2);
    let base = base(&catalog);
    assert_eq!(orders[0].container.uri, format!("{base}_1.tif"));
    assert_eq!(orders[1].container.uri, format!("{base}_2.tif"));
    assert_eq!(orders[0].container.base_name, base);
    assert_eq!(orders[0].container.width, 100);

    // Records are packed in acquisition order.
    let first: Vec<Uuid> = orders[0].records.iter().map(|r| r.id).collect();
    assert_eq!(first, vec![records[1].id, records[2].id]);
    assert_eq!(orders[1].records.len(), 1);
    assert_eq!(orders[1].records[0].id, records[0].id);
    assert_eq!(orders[1].records[0].valid_shape, inner_bbox());

    for order in &orders {
        harness.execute(order, TaskStatus::Successful).await;
    }

    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::Done);
    assert_eq!(job.active_tasks(), 0);

    let active = harness.active_datasets(catalog.instance_id).await;
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|d| d.container_uri.starts_with(&base)));
    assert!(active.iter().all(|d| !raw.iter().any(|r| r.id == d.id)));

    // Raw containers were unmanaged: gone from the catalog, files untouched.
    assert_eq!(harness.backend.container_count().await, 2);
    assert_eq!(harness.backend.lock_count().await, 0);

    let deletions = harness
        .service
        .list_jobs(&JobFilter {
            job_type: Some(JobType::Deletion),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(deletions.len(), 1);
    assert_eq!(deletions[0].state, JobState::Done);
    assert_eq!(deletions[0].name, "ndvi tile 0-0 cleanup");
}

#[tokio::test]
async fn test_new_scene_extends_existing_container_group() {
    let harness = Harness::new();
    let catalog = seed_catalog(&harness, 2).await;
    let old = vec![seed_record(&harness, 1).await, seed_record(&harness, 2).await];
    let full = format!("{}_1.tif", base(&catalog));
    seed_managed_container(&harness, &catalog, &full, &old).await;
    let new = vec![seed_record(&harness, 3).await];
    seed_raw_datasets(&harness, &catalog, &new).await;

    harness.service.consolidate(request(&catalog)).await.unwrap();

    // The full container keeps its records; only the new scene is written.
    let orders = harness.take_orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].container.uri, format!("{}_2.tif", base(&catalog)));
    assert_eq!(orders[0].records.len(), 1);
    assert_eq!(orders[0].records[0].id, new[0].id);
}

#[tokio::test]
async fn test_failed_task_waits_for_retry() {
    let harness = Harness::new();
    let catalog = seed_catalog(&harness, 1).await;
    let records = vec![seed_record(&harness, 1).await, seed_record(&harness, 2).await];
    seed_raw_datasets(&harness, &catalog, &records).await;

    let job_id = harness.service.consolidate(request(&catalog)).await.unwrap();
    let orders = harness.take_orders();
    assert_eq!(orders.len(), 2);

    harness.execute(&orders[0], TaskStatus::Successful).await;
    harness.execute(&orders[1], TaskStatus::Failed).await;

    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::ConsolidationFailed);
    assert_eq!(job.failed_tasks(), 1);
    assert_eq!(job.active_tasks(), 0);
    assert!(job.logs().iter().any(|l| l.message.contains("executor crashed")));

    harness.service.retry(job_id, false).await.unwrap();
    let retried = harness.take_orders();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].task_id, orders[1].task_id);

    harness.execute(&retried[0], TaskStatus::Successful).await;
    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::Done);
    assert_eq!(job.failed_tasks(), 0);
    assert_eq!(harness.active_datasets(catalog.instance_id).await.len(), 2);
}

#[tokio::test]
async fn test_repeated_outcome_is_ignored() {
    let harness = Harness::new();
    let catalog = seed_catalog(&harness, 1).await;
    let records = vec![seed_record(&harness, 1).await, seed_record(&harness, 2).await];
    seed_raw_datasets(&harness, &catalog, &records).await;

    let job_id = harness.service.consolidate(request(&catalog)).await.unwrap();
    let orders = harness.take_orders();
    harness.execute(&orders[0], TaskStatus::Successful).await;
    harness.execute(&orders[0], TaskStatus::Successful).await;

    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::ConsolidationInProgress);
    assert_eq!(job.active_tasks(), 1);
}

#[tokio::test]
async fn test_cancel_rolls_back_and_drops_late_success() {
    let harness = Harness::new();
    let catalog = seed_catalog(&harness, 1).await;
    let records = vec![seed_record(&harness, 1).await, seed_record(&harness, 2).await];
    let raw = seed_raw_datasets(&harness, &catalog, &records).await;

    let job_id = harness.service.consolidate(request(&catalog)).await.unwrap();
    let orders = harness.take_orders();
    assert_eq!(orders.len(), 2);

    harness.service.cancel(job_id, false).await.unwrap();

    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::Failed);
    assert!(job.tasks().is_empty());
    for order in &orders {
        assert!(harness
            .storage
            .contains(&marker_uri(CANCELLATION_PREFIX, job_id, order.task_id)));
    }
    assert_eq!(harness.backend.task_count().await, 0);
    assert_eq!(harness.backend.lock_count().await, 0);

    let active = harness.active_datasets(catalog.instance_id).await;
    assert_eq!(active.len(), raw.len());

    // An executor that ignored the marker reports after the rollback.
    harness
        .report(job_id, orders[0].task_id, TaskStatus::Successful)
        .await;
    assert_eq!(harness.job(job_id).await.state(), JobState::Failed);
}

#[tokio::test]
async fn test_lock_conflict_fails_preparation_until_released() {
    let harness = Harness::new();
    let catalog = seed_catalog(&harness, 2).await;
    let records = vec![seed_record(&harness, 1).await];
    seed_raw_datasets(&harness, &catalog, &records).await;

    // A deletion job claims the scene without starting.
    let deletion_id = harness
        .service
        .delete_datasets(
            DeletionRequest::new("purge scene", vec![catalog.instance_id], Vec::new())
                .with_execution_level(ExecutionLevel::Asynchronous),
        )
        .await
        .unwrap();
    harness.events.drain();

    let job_id = harness.service.consolidate(request(&catalog)).await.unwrap();
    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::InitialisationFailed);
    assert!(harness.take_orders().is_empty());

    harness.service.cancel(deletion_id, false).await.unwrap();
    harness.pump().await;
    assert_eq!(harness.job(deletion_id).await.state(), JobState::Failed);

    harness.service.retry(job_id, false).await.unwrap();
    assert_eq!(
        harness.job(job_id).await.state(),
        JobState::ConsolidationInProgress
    );
    assert_eq!(harness.take_orders().len(), 1);
}

#[tokio::test]
async fn test_nan_no_data_containers_are_kept() {
    let harness = Harness::new();
    let catalog = seed_catalog_with_format(&harness, 5, nan_dformat()).await;
    let records = vec![seed_record(&harness, 1).await, seed_record(&harness, 2).await];
    let uri = format!("{}_1.tif", base(&catalog));
    seed_managed_container(&harness, &catalog, &uri, &records).await;

    let job_id = harness.service.consolidate(request(&catalog)).await.unwrap();

    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::Done);
    assert!(job.tasks().is_empty());
    assert!(harness.take_orders().is_empty());
    assert!(harness.storage.contains(&uri));
}

#[tokio::test]
async fn test_nan_no_data_scenes_are_consolidated() {
    let harness = Harness::new();
    let catalog = seed_catalog_with_format(&harness, 5, nan_dformat()).await;
    let records = vec![seed_record(&harness, 1).await];
    seed_raw_datasets(&harness, &catalog, &records).await;

    let job_id = harness.service.consolidate(request(&catalog)).await.unwrap();
    let orders = harness.take_orders();
    assert_eq!(orders.len(), 1);
    let order_format = orders[0].container.dformat;
    assert!(order_format.no_data.is_nan());
    assert_eq!(order_format.max_value, f64::INFINITY);
    assert!(orders[0].records[0].datasets[0].dformat.no_data.is_nan());

    harness.execute(&orders[0], TaskStatus::Successful).await;

    assert_eq!(harness.job(job_id).await.state(), JobState::Done);
    let active = harness.active_datasets(catalog.instance_id).await;
    assert_eq!(active.len(), 1);
    assert!(active[0].dformat.no_data.is_nan());
    assert_eq!(active[0].container_uri, orders[0].container.uri);
}

#[tokio::test]
async fn test_failed_order_bookkeeping_fails_the_step() {
    let harness = Harness::new();
    let catalog = seed_catalog(&harness, 5).await;
    let records = vec![seed_record(&harness, 1).await];
    seed_raw_datasets(&harness, &catalog, &records).await;
    harness.backend.fail_next("update_task", 1, false);

    let job_id = harness.service.consolidate(request(&catalog)).await.unwrap();

    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::ConsolidationFailed);
    assert!(job
        .logs()
        .iter()
        .any(|l| l.message.contains("injected update_task failure")));
    assert!(harness.take_orders().is_empty());

    harness.service.retry(job_id, false).await.unwrap();
    assert_eq!(
        harness.job(job_id).await.state(),
        JobState::ConsolidationInProgress
    );
    assert_eq!(harness.take_orders().len(), 1);
}

#[tokio::test]
async fn test_nested_temporary_error_reaches_the_caller() {
    let harness = Harness::new();
    let catalog = seed_catalog(&harness, 5).await;
    let records = vec![seed_record(&harness, 1).await];
    seed_raw_datasets(&harness, &catalog, &records).await;

    let job_id = harness.service.consolidate(request(&catalog)).await.unwrap();
    let orders = harness.take_orders();
    assert_eq!(orders.len(), 1);
    harness
        .storage
        .write(&orders[0].container.uri, b"GTiff")
        .await
        .unwrap();

    // The swap runs in-process after indexing and keeps failing.
    let failures = harness.dispatcher.config().max_retries + 1;
    harness
        .backend
        .fail_next("change_datasets_status", failures, true);
    let outcome = TaskEvent::new(job_id, orders[0].task_id, TaskStatus::Successful);
    let error = harness
        .dispatcher
        .handle_event(Event::Task(outcome))
        .await
        .unwrap_err();
    assert!(error.is_temporary());
    assert_eq!(
        harness.job(job_id).await.state(),
        JobState::ConsolidationIndexed
    );

    harness.service.retry(job_id, true).await.unwrap();
    assert_eq!(harness.job(job_id).await.state(), JobState::Done);
    let active = harness.active_datasets(catalog.instance_id).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].container_uri, orders[0].container.uri);
    assert_eq!(harness.backend.lock_count().await, 0);
}
