use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of job; selects the transition table and the entry actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Consolidation,
    Deletion,
    Ingestion,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consolidation => "consolidation",
            Self::Deletion => "deletion",
            Self::Ingestion => "ingestion",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consolidation" => Ok(Self::Consolidation),
            "deletion" => Ok(Self::Deletion),
            "ingestion" => Ok(Self::Ingestion),
            _ => Err(format!("Invalid job type: {s}")),
        }
    }
}

/// Job state. Which states are reachable depends on the [`JobType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New,
    Created,
    ConsolidationInProgress,
    ConsolidationDone,
    ConsolidationIndexed,
    ConsolidationEffective,
    ConsolidationFailed,
    ConsolidationIndexingFailed,
    ConsolidationRetrying,
    ConsolidationCancelling,
    SwapDatasetsFailed,
    CancellationFailed,
    InitialisationFailed,
    DeletionInProgress,
    DeletionEffective,
    DeletionFailed,
    Aborted,
    RollbackFailed,
    Done,
    DoneButUntidy,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 21] = [
        Self::New,
        Self::Created,
        Self::ConsolidationInProgress,
        Self::ConsolidationDone,
        Self::ConsolidationIndexed,
        Self::ConsolidationEffective,
        Self::ConsolidationFailed,
        Self::ConsolidationIndexingFailed,
        Self::ConsolidationRetrying,
        Self::ConsolidationCancelling,
        Self::SwapDatasetsFailed,
        Self::CancellationFailed,
        Self::InitialisationFailed,
        Self::DeletionInProgress,
        Self::DeletionEffective,
        Self::DeletionFailed,
        Self::Aborted,
        Self::RollbackFailed,
        Self::Done,
        Self::DoneButUntidy,
        Self::Failed,
    ];

    /// No event is accepted in these states (except Retry from DoneButUntidy).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::DoneButUntidy)
    }

    /// States waiting for an operator decision.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::InitialisationFailed
                | Self::ConsolidationFailed
                | Self::ConsolidationIndexingFailed
                | Self::SwapDatasetsFailed
                | Self::CancellationFailed
                | Self::DeletionFailed
                | Self::RollbackFailed
                | Self::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Created => "created",
            Self::ConsolidationInProgress => "consolidation_in_progress",
            Self::ConsolidationDone => "consolidation_done",
            Self::ConsolidationIndexed => "consolidation_indexed",
            Self::ConsolidationEffective => "consolidation_effective",
            Self::ConsolidationFailed => "consolidation_failed",
            Self::ConsolidationIndexingFailed => "consolidation_indexing_failed",
            Self::ConsolidationRetrying => "consolidation_retrying",
            Self::ConsolidationCancelling => "consolidation_cancelling",
            Self::SwapDatasetsFailed => "swap_datasets_failed",
            Self::CancellationFailed => "cancellation_failed",
            Self::InitialisationFailed => "initialisation_failed",
            Self::DeletionInProgress => "deletion_in_progress",
            Self::DeletionEffective => "deletion_effective",
            Self::DeletionFailed => "deletion_failed",
            Self::Aborted => "aborted",
            Self::RollbackFailed => "rollback_failed",
            Self::Done => "done",
            Self::DoneButUntidy => "done_but_untidy",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Invalid job state: {s}"))
    }
}

/// How far a job runs on its own before waiting for `Continue`.
///
/// Ordered: a job pauses on entering a state whose pause level is at most
/// its own execution level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLevel {
    /// Every step runs in-process, in the caller's task.
    Synchronous,
    #[default]
    Asynchronous,
    StepByStepCritical,
    StepByStepMajor,
    StepByStepAll,
}

impl ExecutionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous",
            Self::Asynchronous => "asynchronous",
            Self::StepByStepCritical => "step_by_step_critical",
            Self::StepByStepMajor => "step_by_step_major",
            Self::StepByStepAll => "step_by_step_all",
        }
    }

    pub fn as_db(&self) -> i16 {
        *self as i16
    }

    pub fn from_db(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Synchronous),
            1 => Some(Self::Asynchronous),
            2 => Some(Self::StepByStepCritical),
            3 => Some(Self::StepByStepMajor),
            4 => Some(Self::StepByStepAll),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn test_execution_level_order() {
        assert!(ExecutionLevel::Synchronous < ExecutionLevel::Asynchronous);
        assert!(ExecutionLevel::StepByStepCritical < ExecutionLevel::StepByStepMajor);
        assert!(ExecutionLevel::StepByStepMajor < ExecutionLevel::StepByStepAll);
        assert_eq!(
            ExecutionLevel::from_db(ExecutionLevel::StepByStepMajor.as_db()),
            Some(ExecutionLevel::StepByStepMajor)
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::DoneButUntidy.is_terminal());
        assert!(!JobState::Aborted.is_terminal());
    }
}
