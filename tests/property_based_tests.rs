//! Property-based tests for task accounting, container packing and the
//! wire format of queue messages.

mod common;

use common::*;

use chrono::Utc;
use proptest::prelude::*;
use std::collections::BTreeSet;
use uuid::Uuid;

use catalog_orchestrator::models::{
    marshal_consolidation_event, unmarshal_consolidation_event, BBox, ConsolidationRecord, Job,
    TaskState,
};
use catalog_orchestrator::orchestration::pack_records;
use catalog_orchestrator::state_machine::{
    marshal_event, unmarshal_event, Event, ExecutionLevel, TaskStatus,
};

fn job_with_tasks(count: usize) -> (Job, Vec<Uuid>) {
    let mut job = Job::new_deletion(
        "cleanup",
        Vec::new(),
        Vec::new(),
        None,
        ExecutionLevel::Asynchronous,
    )
    .unwrap();
    let ids = (0..count)
        .map(|n| job.create_deletion_task(&format!("mem://cubes/c_{n}.tif")))
        .collect();
    (job, ids)
}

fn records(count: usize) -> Vec<ConsolidationRecord> {
    (0..count)
        .map(|n| ConsolidationRecord {
            id: Uuid::from_u128(n as u128 + 1),
            datetime: Utc::now(),
            valid_shape: BBox::new(0.0, 0.0, 1.0, 1.0),
            datasets: Vec::new(),
        })
        .collect()
}

proptest! {
    #[test]
    fn test_counters_match_task_states(outcomes in outcome_sequence_strategy(6, 40)) {
        let (mut job, ids) = job_with_tasks(6);

        for (index, status) in outcomes {
            job.update_task(ids[index], status, None).unwrap();

            let active = job
                .tasks()
                .iter()
                .filter(|t| matches!(t.state(), TaskState::New | TaskState::Pending))
                .count();
            let failed = job
                .tasks()
                .iter()
                .filter(|t| t.state() == TaskState::Failed)
                .count();
            prop_assert_eq!(job.active_tasks() as usize, active);
            prop_assert_eq!(job.failed_tasks() as usize, failed);
        }
    }

    #[test]
    fn test_done_task_never_moves(status in task_status_strategy()) {
        let (mut job, ids) = job_with_tasks(1);
        job.update_task(ids[0], TaskStatus::Successful, None).unwrap();

        prop_assert!(!job.update_task(ids[0], status, None).unwrap());
        prop_assert_eq!(job.task(ids[0]).unwrap().state(), TaskState::Done);
        prop_assert_eq!(job.active_tasks(), 0);
    }

    #[test]
    fn test_reset_restores_failed_tasks(outcomes in outcome_sequence_strategy(4, 20)) {
        let (mut job, ids) = job_with_tasks(4);
        for (index, status) in outcomes {
            job.update_task(ids[index], status, None).unwrap();
        }
        let failed = job.failed_tasks();
        let active = job.active_tasks();

        prop_assert_eq!(job.reset_failed_tasks(), failed);
        prop_assert_eq!(job.failed_tasks(), 0);
        prop_assert_eq!(job.active_tasks(), active + failed);
    }

    #[test]
    fn test_packing_bounds((count, max_records) in packing_strategy()) {
        let mut used = BTreeSet::new();
        let batches = pack_records("mem://cubes/g", &mut used, records(count), max_records);

        prop_assert_eq!(batches.len(), count.div_ceil(max_records));
        prop_assert!(batches.iter().all(|(_, b)| !b.is_empty() && b.len() <= max_records));

        let packed: Vec<Uuid> = batches
            .iter()
            .flat_map(|(_, b)| b.iter().map(|r| r.id))
            .collect();
        let expected: Vec<Uuid> = records(count).iter().map(|r| r.id).collect();
        prop_assert_eq!(packed, expected);

        let uris: BTreeSet<&str> = batches.iter().map(|(uri, _)| uri.as_str()).collect();
        prop_assert_eq!(uris.len(), batches.len());
    }

    #[test]
    fn test_packing_skips_taken_suffixes(
        taken in prop::collection::btree_set(1u32..10, 0..5),
        count in 1usize..20,
    ) {
        let mut used = taken.clone();
        let batches = pack_records("mem://cubes/g", &mut used, records(count), 1);

        for (uri, _) in &batches {
            let suffix: u32 = uri
                .trim_start_matches("mem://cubes/g_")
                .trim_end_matches(".tif")
                .parse()
                .unwrap();
            prop_assert!(!taken.contains(&suffix));
        }
        prop_assert_eq!(used.len(), taken.len() + batches.len());
    }

    #[test]
    fn test_job_event_survives_the_queue(event in job_event_strategy()) {
        let event = Event::Job(event);
        let decoded = unmarshal_event(&marshal_event(&event).unwrap()).unwrap();
        prop_assert_eq!(decoded, event);
    }

    #[test]
    fn test_task_event_survives_the_queue(event in task_event_strategy()) {
        let event = Event::Task(event);
        let decoded = unmarshal_event(&marshal_event(&event).unwrap()).unwrap();
        prop_assert_eq!(decoded, event);
    }

    #[test]
    fn test_consolidation_order_survives_the_queue(event in consolidation_event_strategy()) {
        let payload = marshal_consolidation_event(&event).unwrap();
        let decoded = unmarshal_consolidation_event(&payload).unwrap();
        prop_assert_eq!(decoded, event);
    }
}
