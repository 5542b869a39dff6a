// Job state machine: states, events and the per-kind transition tables.
//
// The tables are static and hand-written per job kind. `Job::trigger` applies
// them; the dispatcher runs the entry action of the state the job lands in.

pub mod events;
pub mod states;
pub mod transitions;

pub use events::{
    marshal_event, unmarshal_event, Event, JobEvent, JobStatus, TaskEvent, TaskStatus,
};
pub use states::{ExecutionLevel, JobState, JobType};
pub use transitions::{is_retry_forced, leads_to, next_state, pause_level};
