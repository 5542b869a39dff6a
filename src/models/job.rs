//! # Job Aggregate
//!
//! A job is a persisted, resumable state machine driving one long-running
//! catalog operation. It owns its tasks, an optional copy of the
//! consolidation parameters and one [`LockedDatasetSet`] per [`LockFlag`].
//!
//! ## Mutation Rules
//!
//! - The state only changes through [`Job::trigger`].
//! - `active_tasks` counts New/Pending tasks, `failed_tasks` counts Failed
//!   tasks. Both are maintained by the task operations and never go negative.
//! - Every mutation marks the job Dirty; the persister writes it back under
//!   the optimistic-concurrency timestamp captured at load.
//! - The user-visible log is append-only, time-ordered and capped at
//!   [`MAX_LOG_ENTRIES`]; the oldest entries are dropped first.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::consolidation_event::{marshal_consolidation_event, ConsolidationEvent};
use super::locked_datasets::{LockFlag, LockedDatasetSet};
use super::persistence_state::PersistenceState;
use super::task::{Task, TaskState};
use super::variable::{validate_name, ConsolidationParams};
use crate::error::{CatalogError, Result};
use crate::state_machine::{
    is_retry_forced, next_state, pause_level, ExecutionLevel, JobEvent, JobState, JobStatus,
    JobType, TaskStatus,
};

/// Oldest entries are dropped beyond this size.
pub const MAX_LOG_ENTRIES: usize = 10_000;

/// Kind-specific arguments of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Consolidation {
        variable_id: Uuid,
        instance_id: Uuid,
        layout_name: String,
        /// Prefix under which output containers are written.
        storage_uri: String,
    },
    Deletion {
        instance_ids: Vec<Uuid>,
        record_ids: Vec<Uuid>,
        /// Consolidation that spawned this deletion, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_job_id: Option<Uuid>,
    },
    Ingestion(serde_json::Value),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Consolidation { .. } => JobType::Consolidation,
            Self::Deletion { .. } => JobType::Deletion,
            Self::Ingestion(_) => JobType::Ingestion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub time: DateTime<Utc>,
    pub severity: LogSeverity,
    pub message: String,
}

/// Flat view of a job row, exchanged with the database backends.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: String,
    pub job_type: JobType,
    pub state: JobState,
    pub execution_level: ExecutionLevel,
    pub waiting: bool,
    pub active_tasks: u32,
    pub failed_tasks: u32,
    pub payload: JobPayload,
    pub logs: Vec<JobLog>,
    pub last_update: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Job {
    id: Uuid,
    name: String,
    job_type: JobType,
    state: JobState,
    execution_level: ExecutionLevel,
    waiting: bool,
    active_tasks: u32,
    failed_tasks: u32,
    payload: JobPayload,
    logs: Vec<JobLog>,
    occ: DateTime<Utc>,
    created_at: DateTime<Utc>,
    tasks: Vec<Task>,
    params: Option<ConsolidationParams>,
    locked: [LockedDatasetSet; 3],
    persistence: PersistenceState,
}

fn now() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(Duration::microseconds(1)).unwrap_or(now)
}

impl Job {
    fn new(name: String, payload: JobPayload, execution_level: ExecutionLevel) -> Result<Self> {
        validate_name("job", &name)?;
        let created_at = now();
        let mut job = Self {
            id: Uuid::new_v4(),
            name,
            job_type: payload.job_type(),
            state: JobState::New,
            execution_level,
            waiting: false,
            active_tasks: 0,
            failed_tasks: 0,
            payload,
            logs: Vec::new(),
            occ: created_at,
            created_at,
            tasks: Vec::new(),
            params: None,
            locked: LockFlag::ALL.map(LockedDatasetSet::new),
            persistence: PersistenceState::New,
        };
        job.log(LogSeverity::Info, format!("{} job created", job.job_type));
        Ok(job)
    }

    pub fn new_consolidation(
        name: impl Into<String>,
        variable_id: Uuid,
        instance_id: Uuid,
        layout_name: impl Into<String>,
        storage_uri: impl Into<String>,
        execution_level: ExecutionLevel,
    ) -> Result<Self> {
        let storage_uri = storage_uri.into();
        let layout_name = layout_name.into();
        if storage_uri.is_empty() {
            return Err(CatalogError::validation("consolidation job: empty storage uri"));
        }
        if layout_name.is_empty() {
            return Err(CatalogError::validation("consolidation job: empty layout name"));
        }
        Self::new(
            name.into(),
            JobPayload::Consolidation {
                variable_id,
                instance_id,
                layout_name,
                storage_uri: storage_uri.trim_end_matches('/').to_string(),
            },
            execution_level,
        )
    }

    pub fn new_deletion(
        name: impl Into<String>,
        instance_ids: Vec<Uuid>,
        record_ids: Vec<Uuid>,
        parent_job_id: Option<Uuid>,
        execution_level: ExecutionLevel,
    ) -> Result<Self> {
        Self::new(
            name.into(),
            JobPayload::Deletion {
                instance_ids,
                record_ids,
                parent_job_id,
            },
            execution_level,
        )
    }

    /// Rebuilds a job from its row, its loaded tasks and its parameters.
    pub fn from_record(
        record: JobRecord,
        tasks: Vec<Task>,
        params: Option<ConsolidationParams>,
    ) -> Self {
        Self {
            id: record.id,
            name: record.name,
            job_type: record.job_type,
            state: record.state,
            execution_level: record.execution_level,
            waiting: record.waiting,
            active_tasks: record.active_tasks,
            failed_tasks: record.failed_tasks,
            payload: record.payload,
            logs: record.logs,
            occ: record.last_update,
            created_at: record.created_at,
            tasks,
            params: params.map(|mut p| {
                p.persistence = PersistenceState::Clean;
                p
            }),
            locked: LockFlag::ALL.map(LockedDatasetSet::new),
            persistence: PersistenceState::Clean,
        }
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            name: self.name.clone(),
            job_type: self.job_type,
            state: self.state,
            execution_level: self.execution_level,
            waiting: self.waiting,
            active_tasks: self.active_tasks,
            failed_tasks: self.failed_tasks,
            payload: self.payload.clone(),
            logs: self.logs.clone(),
            last_update: self.occ,
            created_at: self.created_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn execution_level(&self) -> ExecutionLevel {
        self.execution_level
    }

    pub fn waiting(&self) -> bool {
        self.waiting
    }

    pub fn active_tasks(&self) -> u32 {
        self.active_tasks
    }

    pub fn failed_tasks(&self) -> u32 {
        self.failed_tasks
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Timestamp the next conditional update is checked against.
    pub fn occ(&self) -> DateTime<Utc> {
        self.occ
    }

    pub fn persistence(&self) -> PersistenceState {
        self.persistence
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Tasks that survive the next save.
    pub fn live_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.persistence.is_active())
    }

    pub fn task(&self, task_id: Uuid) -> Option<&Task> {
        self.live_tasks().find(|t| t.id == task_id)
    }

    pub fn params(&self) -> Option<&ConsolidationParams> {
        self.params.as_ref()
    }

    pub fn locked(&self, flag: LockFlag) -> &LockedDatasetSet {
        &self.locked[flag.index()]
    }

    pub fn logs(&self) -> &[JobLog] {
        &self.logs
    }

    /// One page of the log, oldest first. Out-of-range pages are empty.
    pub fn logs_page(&self, page: usize, limit: usize) -> &[JobLog] {
        let start = page.saturating_mul(limit).min(self.logs.len());
        let end = start.saturating_add(limit).min(self.logs.len());
        &self.logs[start..end]
    }

    fn touch(&mut self) {
        self.persistence.mark_dirty();
    }

    pub fn log(&mut self, severity: LogSeverity, message: impl Into<String>) {
        let time = match self.logs.last() {
            Some(last) if last.time > now() => last.time,
            _ => now(),
        };
        self.logs.push(JobLog {
            time,
            severity,
            message: message.into(),
        });
        if self.logs.len() > MAX_LOG_ENTRIES {
            let excess = self.logs.len() - MAX_LOG_ENTRIES;
            self.logs.drain(..excess);
        }
        self.touch();
    }

    pub fn set_execution_level(&mut self, level: ExecutionLevel) {
        if self.execution_level != level {
            self.execution_level = level;
            self.log(LogSeverity::Info, format!("execution level set to {level}"));
        }
    }

    pub fn set_params(&mut self, params: ConsolidationParams) -> Result<()> {
        params.validate()?;
        let persistence = match &self.params {
            Some(current) if !current.persistence.is_new() => PersistenceState::Dirty,
            _ => PersistenceState::New,
        };
        self.params = Some(ConsolidationParams {
            persistence,
            ..params
        });
        self.touch();
        Ok(())
    }

    fn enter(&mut self, state: JobState) {
        self.state = state;
        self.waiting = pause_level(state).is_some_and(|level| self.execution_level >= level);
        self.touch();
    }

    /// Applies an event to the state machine.
    ///
    /// Returns `false` for a `Continue` on a job that was not waiting (a
    /// successful no-op). An event the current state cannot handle returns
    /// `UnhandledEvent` and leaves the job untouched.
    pub fn trigger(&mut self, event: &JobEvent) -> Result<bool> {
        match event.status {
            JobStatus::Continue => {
                if !self.waiting {
                    return Ok(false);
                }
                self.waiting = false;
                self.log(LogSeverity::Info, format!("{}: resumed", self.state));
                return Ok(true);
            }
            JobStatus::RetryForced if is_retry_forced(self.state) => {
                self.waiting = false;
                self.log(
                    LogSeverity::Warning,
                    format!("{}: forced retry", self.state),
                );
                return Ok(true);
            }
            _ => {}
        }

        let Some(next) = next_state(self.job_type, self.state, event.status) else {
            return Err(CatalogError::UnhandledEvent {
                entity: "job",
                id: self.id.to_string(),
                state: self.state.to_string(),
                event: event.status.to_string(),
            });
        };

        if let Some(error) = &event.error {
            self.log(LogSeverity::Error, format!("{}: {error}", event.status));
        }
        let from = self.state;
        self.enter(next);
        self.log(
            LogSeverity::Info,
            format!("{}: {from} -> {next}", event.status),
        );
        Ok(true)
    }

    fn push_task(&mut self, task: Task) -> Uuid {
        let id = task.id;
        self.tasks.push(task);
        self.active_tasks += 1;
        self.touch();
        id
    }

    /// Adds a task carrying `event`; the job and task ids are filled in.
    pub fn create_consolidation_task(&mut self, mut event: ConsolidationEvent) -> Result<Uuid> {
        let mut task = Task::new(Vec::new());
        event.job_id = self.id;
        event.task_id = task.id;
        task.payload = marshal_consolidation_event(&event)?;
        Ok(self.push_task(task))
    }

    /// Adds a task removing the container at `uri`.
    pub fn create_deletion_task(&mut self, uri: &str) -> Uuid {
        self.push_task(Task::new(uri.as_bytes().to_vec()))
    }

    fn task_position(&self, task_id: Uuid) -> Result<usize> {
        self.tasks
            .iter()
            .position(|t| t.id == task_id && t.persistence.is_active())
            .ok_or_else(|| CatalogError::not_found("task", task_id))
    }

    fn decrement(counter: &mut u32, name: &str) -> Result<()> {
        *counter = counter.checked_sub(1).ok_or_else(|| {
            CatalogError::should_never_happen(format!("{name} would become negative"))
        })?;
        Ok(())
    }

    /// Records the outcome of a task and maintains the counters.
    ///
    /// Idempotent: a repeated status returns `Ok(false)`. A successful
    /// outcome is accepted after a failure or a cancellation (late success);
    /// nothing moves a task out of `Done`.
    pub fn update_task(
        &mut self,
        task_id: Uuid,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let position = self.task_position(task_id)?;
        let current = self.tasks[position].state;

        let next = match (current, status) {
            (_, TaskStatus::Ignored) | (TaskState::Done, _) => return Ok(false),
            (TaskState::New, TaskStatus::Pending) => TaskState::Pending,
            (TaskState::New | TaskState::Pending, TaskStatus::Successful) => {
                Self::decrement(&mut self.active_tasks, "active_tasks")?;
                TaskState::Done
            }
            (TaskState::New | TaskState::Pending, TaskStatus::Failed) => {
                Self::decrement(&mut self.active_tasks, "active_tasks")?;
                self.failed_tasks += 1;
                TaskState::Failed
            }
            (TaskState::New | TaskState::Pending, TaskStatus::Cancelled) => {
                Self::decrement(&mut self.active_tasks, "active_tasks")?;
                TaskState::Cancelled
            }
            (TaskState::Failed, TaskStatus::Successful) => {
                Self::decrement(&mut self.failed_tasks, "failed_tasks")?;
                TaskState::Done
            }
            (TaskState::Cancelled, TaskStatus::Successful) => TaskState::Done,
            _ => return Ok(false),
        };

        self.tasks[position].set_state(next);
        if let Some(error) = error {
            self.log(
                LogSeverity::Error,
                format!("task {task_id} {status}: {error}"),
            );
        }
        self.touch();
        Ok(true)
    }

    /// Moves every failed task back to New. Returns how many were reset.
    pub fn reset_failed_tasks(&mut self) -> u32 {
        let mut reset = 0;
        for task in self
            .tasks
            .iter_mut()
            .filter(|t| t.persistence.is_active() && t.state == TaskState::Failed)
        {
            task.set_state(TaskState::New);
            reset += 1;
        }
        if reset > 0 {
            self.failed_tasks -= reset.min(self.failed_tasks);
            self.active_tasks += reset;
            self.log(LogSeverity::Info, format!("{reset} failed task(s) reset"));
        }
        reset
    }

    pub fn delete_task(&mut self, task_id: Uuid) -> Result<()> {
        let position = self.task_position(task_id)?;
        match self.tasks[position].state {
            TaskState::New | TaskState::Pending => {
                Self::decrement(&mut self.active_tasks, "active_tasks")?
            }
            TaskState::Failed => Self::decrement(&mut self.failed_tasks, "failed_tasks")?,
            TaskState::Done | TaskState::Cancelled => {}
        }
        if self.tasks[position].persistence.is_new() {
            self.tasks.remove(position);
        } else {
            self.tasks[position].persistence.mark_to_delete();
        }
        self.touch();
        Ok(())
    }

    /// Deletes every task. Refused while tasks are active unless `force`.
    pub fn delete_all_tasks(&mut self, force: bool) -> Result<()> {
        if self.active_tasks > 0 && !force {
            return Err(CatalogError::dependency_still_exists(
                "job",
                self.id,
                format!("{} task(s) still active", self.active_tasks),
            ));
        }
        self.tasks.retain(|t| !t.persistence.is_new());
        for task in &mut self.tasks {
            if task.persistence.is_active() {
                task.persistence.mark_to_delete();
            }
        }
        self.active_tasks = 0;
        self.failed_tasks = 0;
        self.touch();
        Ok(())
    }

    pub fn lock_datasets(&mut self, ids: impl IntoIterator<Item = Uuid>, flag: LockFlag) {
        self.locked[flag.index()].lock(ids);
        self.touch();
    }

    pub fn release_datasets(&mut self, flag: LockFlag) {
        self.locked[flag.index()].release();
        self.touch();
    }

    /// Schedules the job for deletion. Refused while tasks are active unless `force`.
    pub fn to_delete(&mut self, force: bool) -> Result<()> {
        self.delete_all_tasks(force)?;
        self.persistence.mark_to_delete();
        Ok(())
    }

    /// Timestamp written by the next conditional update. Strictly increasing
    /// and truncated to the microsecond so it survives a database round trip.
    pub(crate) fn next_occ(&self) -> DateTime<Utc> {
        let candidate = now();
        if candidate > self.occ {
            candidate
        } else {
            self.occ + Duration::microseconds(1)
        }
    }

    pub(crate) fn set_occ(&mut self, occ: DateTime<Utc>) {
        self.occ = occ;
    }

    pub(crate) fn locked_sets(&self) -> &[LockedDatasetSet; 3] {
        &self.locked
    }

    /// Advances every persistence state after a successful save.
    pub(crate) fn mark_persisted(&mut self) {
        self.tasks.retain(|t| !t.persistence.is_to_delete());
        for task in &mut self.tasks {
            if task.persistence.needs_save() {
                task.mark_persisted();
            }
        }
        if let Some(params) = &mut self.params {
            if params.persistence.needs_save() {
                params.persistence.mark_persisted();
            }
        }
        for set in &mut self.locked {
            if set.persistence().needs_save() {
                set.mark_persisted();
            }
        }
        if self.persistence.needs_save() {
            self.persistence.mark_persisted();
        }
    }
}
