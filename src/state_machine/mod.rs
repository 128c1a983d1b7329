mod job;
mod state;

pub use job::{FinalResult, Job, JobError, JobStatus, JobView, StatusChange, StepRecord};
pub use state::{StateMachine, Transition};
