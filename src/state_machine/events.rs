//! Events flowing through the events channel.
//!
//! A [`JobEvent`] drives the job state machine; a [`TaskEvent`] reports the
//! outcome of one task and only updates counters. Both travel as JSON bytes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    JobCreated,
    OrdersPrepared,
    PrepareOrdersFailed,
    ConsolidationDone,
    ConsolidationFailed,
    ConsolidationIndexed,
    ConsolidationIndexingFailed,
    ConsolidationEffective,
    SwapDatasetsFailed,
    DeletionStarted,
    DeletionNotStarted,
    DeletionReady,
    DeletionNotReady,
    DeletionEffective,
    DeletionFailed,
    RemovalDone,
    RemovalFailed,
    CancelledByUser,
    CancelledByUserForced,
    CancellationDone,
    CancellationFailed,
    RollbackDone,
    RollbackFailed,
    Retry,
    RetryForced,
    Continue,
}

impl JobStatus {
    pub const ALL: [JobStatus; 26] = [
        Self::JobCreated,
        Self::OrdersPrepared,
        Self::PrepareOrdersFailed,
        Self::ConsolidationDone,
        Self::ConsolidationFailed,
        Self::ConsolidationIndexed,
        Self::ConsolidationIndexingFailed,
        Self::ConsolidationEffective,
        Self::SwapDatasetsFailed,
        Self::DeletionStarted,
        Self::DeletionNotStarted,
        Self::DeletionReady,
        Self::DeletionNotReady,
        Self::DeletionEffective,
        Self::DeletionFailed,
        Self::RemovalDone,
        Self::RemovalFailed,
        Self::CancelledByUser,
        Self::CancelledByUserForced,
        Self::CancellationDone,
        Self::CancellationFailed,
        Self::RollbackDone,
        Self::RollbackFailed,
        Self::Retry,
        Self::RetryForced,
        Self::Continue,
    ];

    /// Statuses only a user (or the job service) sends.
    pub fn is_user_command(&self) -> bool {
        matches!(
            self,
            Self::Retry
                | Self::RetryForced
                | Self::Continue
                | Self::CancelledByUser
                | Self::CancelledByUserForced
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCreated => "job_created",
            Self::OrdersPrepared => "orders_prepared",
            Self::PrepareOrdersFailed => "prepare_orders_failed",
            Self::ConsolidationDone => "consolidation_done",
            Self::ConsolidationFailed => "consolidation_failed",
            Self::ConsolidationIndexed => "consolidation_indexed",
            Self::ConsolidationIndexingFailed => "consolidation_indexing_failed",
            Self::ConsolidationEffective => "consolidation_effective",
            Self::SwapDatasetsFailed => "swap_datasets_failed",
            Self::DeletionStarted => "deletion_started",
            Self::DeletionNotStarted => "deletion_not_started",
            Self::DeletionReady => "deletion_ready",
            Self::DeletionNotReady => "deletion_not_ready",
            Self::DeletionEffective => "deletion_effective",
            Self::DeletionFailed => "deletion_failed",
            Self::RemovalDone => "removal_done",
            Self::RemovalFailed => "removal_failed",
            Self::CancelledByUser => "cancelled_by_user",
            Self::CancelledByUserForced => "cancelled_by_user_forced",
            Self::CancellationDone => "cancellation_done",
            Self::CancellationFailed => "cancellation_failed",
            Self::RollbackDone => "rollback_done",
            Self::RollbackFailed => "rollback_failed",
            Self::Retry => "retry",
            Self::RetryForced => "retry_forced",
            Self::Continue => "continue",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a task reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Successful,
    Failed,
    Cancelled,
    /// The executor did not recognise the task.
    Ignored,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Ignored => "ignored",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    pub fn new(job_id: Uuid, status: JobStatus) -> Self {
        Self {
            job_id,
            status,
            error: None,
        }
    }

    pub fn failed(job_id: Uuid, status: JobStatus, error: impl fmt::Display) -> Self {
        Self {
            job_id,
            status,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskEvent {
    pub fn new(job_id: Uuid, task_id: Uuid, status: TaskStatus) -> Self {
        Self {
            job_id,
            task_id,
            status,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum Event {
    Job(JobEvent),
    Task(TaskEvent),
}

impl Event {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Job(evt) => evt.job_id,
            Self::Task(evt) => evt.job_id,
        }
    }
}

impl From<JobEvent> for Event {
    fn from(evt: JobEvent) -> Self {
        Self::Job(evt)
    }
}

impl From<TaskEvent> for Event {
    fn from(evt: TaskEvent) -> Self {
        Self::Task(evt)
    }
}

pub fn marshal_event(event: &Event) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

pub fn unmarshal_event(payload: &[u8]) -> Result<Event> {
    Ok(serde_json::from_slice(payload)?)
}
