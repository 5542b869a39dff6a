mod common;

use common::*;

use catalog_orchestrator::database::JobFilter;
use catalog_orchestrator::error::CatalogError;
use catalog_orchestrator::orchestration::{ConsolidationRequest, DeletionRequest, MAX_LOG_PAGE};
use catalog_orchestrator::state_machine::{ExecutionLevel, JobState, JobType, TaskStatus};
use uuid::Uuid;

async fn seeded(harness: &Harness, max_records: u32, scenes: i64) -> Catalog {
    let catalog = seed_catalog(harness, max_records).await;
    let mut records = Vec::new();
    for day in 1..=scenes {
        records.push(seed_record(harness, day).await);
    }
    seed_raw_datasets(harness, &catalog, &records).await;
    catalog
}

fn request(catalog: &Catalog, level: ExecutionLevel) -> ConsolidationRequest {
    ConsolidationRequest::new(
        "ndvi step by step",
        catalog.variable.id,
        catalog.instance_id,
        LAYOUT,
        STORAGE_URI,
    )
    .with_execution_level(level)
}

#[tokio::test]
async fn test_step_by_step_job_waits_for_continue() {
    let harness = Harness::new();
    let catalog = seeded(&harness, 5, 2).await;

    let job_id = harness
        .service
        .consolidate(request(&catalog, ExecutionLevel::StepByStepAll))
        .await
        .unwrap();
    assert_eq!(harness.job(job_id).await.state(), JobState::New);

    harness.pump().await;
    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::Created);
    assert!(job.waiting());
    assert!(job.tasks().is_empty());

    harness.service.continue_job(job_id).await.unwrap();
    harness.pump().await;
    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::ConsolidationInProgress);
    assert!(job.waiting());
    assert_eq!(job.tasks().len(), 1);
    assert!(harness.take_orders().is_empty());

    harness.service.continue_job(job_id).await.unwrap();
    let orders = harness.take_orders();
    assert_eq!(orders.len(), 1);
    assert!(!harness.job(job_id).await.waiting());

    // Lowering the level lets the rest of the pipeline run through.
    harness
        .service
        .set_execution_level(job_id, ExecutionLevel::Asynchronous)
        .await
        .unwrap();
    harness.execute(&orders[0], TaskStatus::Successful).await;
    harness.pump().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::Done);
    assert!(job
        .logs()
        .iter()
        .any(|l| l.message.contains("execution level set to")));
}

#[tokio::test]
async fn test_continue_on_running_job_is_a_no_op() {
    let harness = Harness::new();
    let catalog = seeded(&harness, 5, 1).await;
    let job_id = harness
        .service
        .consolidate(request(&catalog, ExecutionLevel::Synchronous))
        .await
        .unwrap();
    let before = harness.job(job_id).await;
    assert_eq!(before.state(), JobState::ConsolidationInProgress);

    harness.service.continue_job(job_id).await.unwrap();

    let after = harness.job(job_id).await;
    assert_eq!(after.state(), before.state());
    assert_eq!(after.logs().len(), before.logs().len());
}

#[tokio::test]
async fn test_unhandled_command_leaves_job_untouched() {
    let harness = Harness::new();
    let catalog = seeded(&harness, 5, 1).await;
    let job_id = harness
        .service
        .consolidate(request(&catalog, ExecutionLevel::Synchronous))
        .await
        .unwrap();
    let before = harness.job(job_id).await;

    let error = harness.service.retry(job_id, false).await.unwrap_err();
    assert!(matches!(error, CatalogError::UnhandledEvent { .. }));

    let after = harness.job(job_id).await;
    assert_eq!(after.state(), JobState::ConsolidationInProgress);
    assert_eq!(after.occ(), before.occ());
}

#[tokio::test]
async fn test_forced_retry_replays_entry_action() {
    let harness = Harness::new();
    let catalog = seeded(&harness, 5, 1).await;
    let job_id = harness
        .service
        .consolidate(request(&catalog, ExecutionLevel::Synchronous))
        .await
        .unwrap();
    let first = harness.take_orders();
    assert_eq!(first.len(), 1);

    // Publishing again resends the order of the pending task.
    harness.service.retry(job_id, true).await.unwrap();
    let again = harness.take_orders();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].task_id, first[0].task_id);
    assert_eq!(harness.job(job_id).await.tasks().len(), 1);
}

#[tokio::test]
async fn test_requests_without_datasets_are_rejected() {
    let harness = Harness::new();
    let catalog = seed_catalog(&harness, 5).await;

    let error = harness
        .service
        .consolidate(request(&catalog, ExecutionLevel::Synchronous))
        .await
        .unwrap_err();
    assert!(matches!(error, CatalogError::Validation(_)));

    let error = harness
        .service
        .delete_datasets(DeletionRequest::new("nothing", Vec::new(), Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(error, CatalogError::Validation(_)));

    let error = harness
        .service
        .delete_datasets(DeletionRequest::new(
            "unknown",
            vec![catalog.instance_id],
            Vec::new(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(error, CatalogError::Validation(_)));

    let mut unknown = request(&catalog, ExecutionLevel::Synchronous);
    unknown.instance_id = Uuid::new_v4();
    let error = harness.service.consolidate(unknown).await.unwrap_err();
    assert!(error.is_not_found());

    assert!(harness
        .service
        .list_jobs(&JobFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_datasets_claimed_by_a_running_job_are_refused() {
    let harness = Harness::new();
    let catalog = seeded(&harness, 5, 1).await;
    let first = harness
        .service
        .consolidate(request(&catalog, ExecutionLevel::StepByStepAll))
        .await
        .unwrap();

    let error = harness
        .service
        .consolidate(request(&catalog, ExecutionLevel::Synchronous))
        .await
        .unwrap_err();
    assert!(error.is_already_exists());

    let jobs = harness
        .service
        .list_jobs(&JobFilter {
            job_type: Some(JobType::Consolidation),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, first);
}

#[tokio::test]
async fn test_list_jobs_filters_and_orders_newest_first() {
    let harness = Harness::new();
    let catalog = seed_catalog(&harness, 5).await;
    let records = vec![seed_record(&harness, 1).await, seed_record(&harness, 2).await];
    seed_raw_datasets(&harness, &catalog, &records).await;

    let older = harness
        .service
        .consolidate(
            request(&catalog, ExecutionLevel::Synchronous).with_records(vec![records[0].id]),
        )
        .await
        .unwrap();
    let newer = harness
        .service
        .delete_datasets(
            DeletionRequest::new("Purge leftovers", Vec::new(), vec![records[1].id])
                .with_execution_level(ExecutionLevel::StepByStepAll),
        )
        .await
        .unwrap();

    let all = harness.service.list_jobs(&JobFilter::default()).await.unwrap();
    let ids: Vec<Uuid> = all.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![newer, older]);

    let purges = harness
        .service
        .list_jobs(&JobFilter {
            name_contains: Some("purge".to_string()),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(purges.len(), 1);
    assert_eq!(purges[0].id, newer);

    let limited = harness
        .service
        .list_jobs(&JobFilter {
            limit: Some(1),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_job_logs_are_paged() {
    let harness = Harness::new();
    let catalog = seeded(&harness, 5, 1).await;
    let job_id = harness
        .service
        .consolidate(request(&catalog, ExecutionLevel::Synchronous))
        .await
        .unwrap();
    let total = harness.job(job_id).await.logs().len();
    assert!(total > 2);

    let first = harness.service.job_logs(job_id, 0, 2).await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(first[0].time <= first[1].time);

    let all = harness
        .service
        .job_logs(job_id, 0, MAX_LOG_PAGE * 10)
        .await
        .unwrap();
    assert_eq!(all.len(), total.min(MAX_LOG_PAGE));

    assert!(harness
        .service
        .job_logs(job_id, total, 1)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_delete_job_requires_terminal_state_or_force() {
    let harness = Harness::new();
    let catalog = seeded(&harness, 5, 1).await;
    let job_id = harness
        .service
        .consolidate(request(&catalog, ExecutionLevel::Synchronous))
        .await
        .unwrap();
    assert_eq!(harness.backend.task_count().await, 1);

    let error = harness.service.delete_job(job_id, false).await.unwrap_err();
    assert!(matches!(error, CatalogError::DependencyStillExists { .. }));

    harness.service.delete_job(job_id, true).await.unwrap();
    assert!(harness.service.get_job(job_id).await.unwrap_err().is_not_found());
    assert_eq!(harness.backend.task_count().await, 0);
    assert_eq!(harness.backend.lock_count().await, 0);
}

#[tokio::test]
async fn test_finished_job_can_be_deleted() {
    let harness = Harness::new();
    let catalog = seeded(&harness, 5, 1).await;
    let job_id = harness
        .service
        .consolidate(request(&catalog, ExecutionLevel::Synchronous))
        .await
        .unwrap();
    harness.service.cancel(job_id, false).await.unwrap();
    assert_eq!(harness.job(job_id).await.state(), JobState::Failed);

    harness.service.delete_job(job_id, false).await.unwrap();
    assert!(harness.service.get_job(job_id).await.unwrap_err().is_not_found());
}
