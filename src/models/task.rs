//! # Task Model
//!
//! A unit of work owned by a job. Consolidation tasks carry a marshalled
//! [`ConsolidationEvent`](super::consolidation_event::ConsolidationEvent);
//! deletion tasks carry the uri of the container to remove. The payload is
//! opaque to the orchestrator and handed verbatim to the executor.
//!
//! ## State Lifecycle
//!
//! ```text
//! New ──► Pending ──► Done
//!  │         │  ▲
//!  │         ▼  │ (late success)
//!  └──────► Failed / Cancelled
//! ```
//!
//! Transitions are monotonic except the late-success edge
//! (`Failed`/`Cancelled` → `Done`) and the explicit retry reset
//! (`Failed` → `New`).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::persistence_state::PersistenceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, not yet sent to an executor
    New,
    /// Sent, waiting for an outcome
    Pending,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    /// New or Pending: the task still counts towards `active_tasks`.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::New | Self::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub(crate) id: Uuid,
    pub(crate) state: TaskState,
    pub(crate) payload: Vec<u8>,
    pub(crate) persistence: PersistenceState,
}

impl Task {
    pub(crate) fn new(payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: TaskState::New,
            payload,
            persistence: PersistenceState::New,
        }
    }

    /// Rebuilds a task loaded from the database.
    pub fn restore(id: Uuid, state: TaskState, payload: Vec<u8>) -> Self {
        Self {
            id,
            state,
            payload,
            persistence: PersistenceState::Clean,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn persistence(&self) -> PersistenceState {
        self.persistence
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        if self.state != state {
            self.state = state;
            self.persistence.mark_dirty();
        }
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persistence.mark_persisted();
    }
}
