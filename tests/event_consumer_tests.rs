mod common;

use common::*;

use catalog_orchestrator::orchestration::{process_payload, ConsolidationRequest, Disposition};
use catalog_orchestrator::state_machine::{
    marshal_event, Event, ExecutionLevel, JobEvent, JobState, JobStatus, TaskEvent, TaskStatus,
};
use uuid::Uuid;

async fn asynchronous_job(harness: &Harness) -> Uuid {
    let catalog = seed_catalog(harness, 5).await;
    let records = vec![seed_record(harness, 1).await];
    seed_raw_datasets(harness, &catalog, &records).await;
    harness
        .service
        .consolidate(
            ConsolidationRequest::new(
                "queued",
                catalog.variable.id,
                catalog.instance_id,
                LAYOUT,
                STORAGE_URI,
            )
            .with_execution_level(ExecutionLevel::Asynchronous),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_undecodable_payload_is_dropped() {
    let harness = Harness::new();
    let disposition = process_payload(&harness.dispatcher, b"{not json").await;
    assert_eq!(disposition, Disposition::Ack);
}

#[tokio::test]
async fn test_event_for_unknown_job_is_dropped() {
    let harness = Harness::new();
    let payload =
        marshal_event(&Event::Job(JobEvent::new(Uuid::new_v4(), JobStatus::JobCreated))).unwrap();
    assert_eq!(
        process_payload(&harness.dispatcher, &payload).await,
        Disposition::Ack
    );

    let payload = marshal_event(&Event::Task(TaskEvent::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        TaskStatus::Successful,
    )))
    .unwrap();
    assert_eq!(
        process_payload(&harness.dispatcher, &payload).await,
        Disposition::Ack
    );
}

#[tokio::test]
async fn test_queued_events_drive_the_job() {
    let harness = Harness::new();
    let job_id = asynchronous_job(&harness).await;
    assert_eq!(harness.job(job_id).await.state(), JobState::New);

    let mut handled = 0;
    loop {
        let payloads = harness.events.drain();
        if payloads.is_empty() {
            break;
        }
        for payload in payloads {
            assert_eq!(
                process_payload(&harness.dispatcher, &payload).await,
                Disposition::Ack
            );
            handled += 1;
        }
    }
    assert_eq!(handled, 2);
    assert_eq!(
        harness.job(job_id).await.state(),
        JobState::ConsolidationInProgress
    );
    assert_eq!(harness.take_orders().len(), 1);
}

#[tokio::test]
async fn test_transient_publishing_failure_is_absorbed() {
    let harness = Harness::new();
    let job_id = asynchronous_job(&harness).await;
    let created = harness.events.drain();

    harness.events.fail_next(2);
    assert_eq!(
        process_payload(&harness.dispatcher, &created[0]).await,
        Disposition::Ack
    );
    assert_eq!(harness.events.len(), 1);

    harness.pump().await;
    assert_eq!(
        harness.job(job_id).await.state(),
        JobState::ConsolidationInProgress
    );
    assert_eq!(harness.take_orders().len(), 1);
}

#[tokio::test]
async fn test_redelivery_after_publishing_outage_resumes_the_step() {
    let harness = Harness::new();
    let job_id = asynchronous_job(&harness).await;
    let created = harness.events.drain();
    assert_eq!(created.len(), 1);

    let attempts = harness.dispatcher.config().max_retries as usize + 1;
    harness.events.fail_next(attempts);
    assert_eq!(
        process_payload(&harness.dispatcher, &created[0]).await,
        Disposition::Redeliver
    );
    // The transition and the prepared orders are committed.
    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::Created);
    assert_eq!(job.tasks().len(), 1);
    assert!(harness.events.is_empty());

    // The redelivered JobCreated replays the step and publishes its outcome.
    assert_eq!(
        process_payload(&harness.dispatcher, &created[0]).await,
        Disposition::Ack
    );
    assert_eq!(harness.events.len(), 1);

    harness.pump().await;
    let job = harness.job(job_id).await;
    assert_eq!(job.state(), JobState::ConsolidationInProgress);
    assert_eq!(job.tasks().len(), 1);
    assert_eq!(harness.take_orders().len(), 1);
}

#[tokio::test]
async fn test_stale_user_command_is_not_replayed() {
    let harness = Harness::new();
    let job_id = asynchronous_job(&harness).await;
    let created = harness.events.drain();
    assert_eq!(
        process_payload(&harness.dispatcher, &created[0]).await,
        Disposition::Ack
    );
    assert_eq!(harness.job(job_id).await.state(), JobState::Created);
    assert_eq!(harness.events.len(), 1);

    // Retry would lead to Created from InitialisationFailed, but a late user
    // command must not run the step again.
    let payload = marshal_event(&Event::Job(JobEvent::new(job_id, JobStatus::Retry))).unwrap();
    assert_eq!(
        process_payload(&harness.dispatcher, &payload).await,
        Disposition::Ack
    );
    assert_eq!(harness.events.len(), 1);
    assert_eq!(harness.job(job_id).await.state(), JobState::Created);
}
