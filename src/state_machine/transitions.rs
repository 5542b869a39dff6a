//! Static transition tables, one per job kind.
//!
//! `Continue` and `RetryForced` are handled generically by the job and never
//! appear here.

use super::events::JobStatus;
use super::states::{ExecutionLevel, JobState, JobType};

/// Next state for `(state, status)`, or `None` when the event is unhandled.
pub fn next_state(job_type: JobType, state: JobState, status: JobStatus) -> Option<JobState> {
    match job_type {
        JobType::Consolidation => consolidation_transition(state, status),
        JobType::Deletion => deletion_transition(state, status),
        JobType::Ingestion => None,
    }
}

fn consolidation_transition(state: JobState, status: JobStatus) -> Option<JobState> {
    use JobState as S;
    use JobStatus as E;

    let next = match (state, status) {
        (S::New, E::JobCreated) => S::Created,
        (S::Created, E::OrdersPrepared) => S::ConsolidationInProgress,
        (S::Created, E::PrepareOrdersFailed) => S::InitialisationFailed,
        (S::InitialisationFailed, E::Retry) => S::Created,
        (S::ConsolidationInProgress, E::ConsolidationDone) => S::ConsolidationDone,
        (S::ConsolidationInProgress, E::ConsolidationFailed) => S::ConsolidationFailed,
        (S::ConsolidationInProgress, E::CancelledByUser) => S::ConsolidationCancelling,
        (S::ConsolidationInProgress, E::CancelledByUserForced) => S::Aborted,
        (S::ConsolidationFailed, E::Retry) => S::ConsolidationRetrying,
        (S::ConsolidationRetrying, E::OrdersPrepared) => S::ConsolidationInProgress,
        (S::ConsolidationRetrying, E::ConsolidationFailed) => S::ConsolidationFailed,
        (S::ConsolidationCancelling, E::CancellationDone) => S::Aborted,
        (S::ConsolidationCancelling, E::CancellationFailed) => S::CancellationFailed,
        (S::ConsolidationCancelling, E::CancelledByUserForced) => S::Aborted,
        (S::CancellationFailed, E::Retry) => S::ConsolidationCancelling,
        (S::CancellationFailed, E::CancelledByUserForced) => S::Aborted,
        (S::ConsolidationDone, E::ConsolidationIndexed) => S::ConsolidationIndexed,
        (S::ConsolidationDone, E::ConsolidationIndexingFailed) => S::ConsolidationIndexingFailed,
        (S::ConsolidationIndexingFailed, E::Retry) => S::ConsolidationDone,
        (S::ConsolidationIndexed, E::ConsolidationEffective) => S::ConsolidationEffective,
        (S::ConsolidationIndexed, E::SwapDatasetsFailed) => S::SwapDatasetsFailed,
        (S::SwapDatasetsFailed, E::Retry) => S::ConsolidationIndexed,
        (S::ConsolidationEffective, E::DeletionStarted) => S::Done,
        (S::ConsolidationEffective, E::DeletionNotStarted) => S::DoneButUntidy,
        (S::DoneButUntidy, E::Retry) => S::ConsolidationEffective,
        (
            S::New
            | S::Created
            | S::InitialisationFailed
            | S::ConsolidationFailed
            | S::ConsolidationRetrying
            | S::ConsolidationDone
            | S::ConsolidationIndexingFailed
            | S::ConsolidationIndexed
            | S::SwapDatasetsFailed,
            E::CancelledByUser | E::CancelledByUserForced,
        ) => S::Aborted,
        _ => return rollback_transition(state, status),
    };
    Some(next)
}

fn deletion_transition(state: JobState, status: JobStatus) -> Option<JobState> {
    use JobState as S;
    use JobStatus as E;

    let next = match (state, status) {
        (S::New, E::JobCreated) => S::Created,
        (S::Created, E::DeletionReady) => S::DeletionInProgress,
        (S::Created, E::DeletionNotReady) => S::InitialisationFailed,
        (S::InitialisationFailed, E::Retry) => S::Created,
        (S::DeletionInProgress, E::DeletionEffective) => S::DeletionEffective,
        (S::DeletionInProgress, E::DeletionFailed) => S::DeletionFailed,
        (S::DeletionFailed, E::Retry) => S::DeletionInProgress,
        (S::DeletionEffective, E::RemovalDone) => S::Done,
        (S::DeletionEffective, E::RemovalFailed) => S::DoneButUntidy,
        (S::DoneButUntidy, E::Retry) => S::DeletionEffective,
        (
            S::New
            | S::Created
            | S::InitialisationFailed
            | S::DeletionInProgress
            | S::DeletionFailed,
            E::CancelledByUser | E::CancelledByUserForced,
        ) => S::Aborted,
        _ => return rollback_transition(state, status),
    };
    Some(next)
}

fn rollback_transition(state: JobState, status: JobStatus) -> Option<JobState> {
    match (state, status) {
        (JobState::Aborted, JobStatus::RollbackDone) => Some(JobState::Failed),
        (JobState::Aborted, JobStatus::RollbackFailed) => Some(JobState::RollbackFailed),
        (JobState::RollbackFailed, JobStatus::Retry) => Some(JobState::Aborted),
        _ => None,
    }
}

/// Whether some transition of the table leads into `state` on `status`.
///
/// A redelivered event that no longer applies but satisfies this already
/// moved the job where it is now.
pub fn leads_to(job_type: JobType, status: JobStatus, state: JobState) -> bool {
    JobState::ALL
        .iter()
        .any(|from| next_state(job_type, *from, status) == Some(state))
}

/// States whose entry action can be replayed with `RetryForced`.
pub fn is_retry_forced(state: JobState) -> bool {
    matches!(
        state,
        JobState::Created
            | JobState::ConsolidationInProgress
            | JobState::ConsolidationRetrying
            | JobState::ConsolidationCancelling
            | JobState::ConsolidationDone
            | JobState::ConsolidationIndexed
            | JobState::ConsolidationEffective
            | JobState::DeletionInProgress
            | JobState::DeletionEffective
            | JobState::Aborted
    )
}

/// Lowest execution level at which a job pauses on entering `state`.
pub fn pause_level(state: JobState) -> Option<ExecutionLevel> {
    match state {
        JobState::Created | JobState::ConsolidationDone | JobState::ConsolidationRetrying => {
            Some(ExecutionLevel::StepByStepAll)
        }
        JobState::ConsolidationInProgress
        | JobState::ConsolidationEffective
        | JobState::DeletionEffective => Some(ExecutionLevel::StepByStepMajor),
        JobState::ConsolidationIndexed | JobState::DeletionInProgress | JobState::Aborted => {
            Some(ExecutionLevel::StepByStepCritical)
        }
        _ => None,
    }
}
