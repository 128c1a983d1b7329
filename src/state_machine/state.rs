use chrono::Utc;

use super::job::{FinalResult, Job, JobError, JobStatus, StatusChange};
use crate::error::CadenzaError;

/// A requested change to a job's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Move to the next non-terminal phase.
    Advance(JobStatus),
    /// Quality check passed; attach the final result.
    Complete(FinalResult),
    Fail(JobError),
    Cancel(String),
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Advance(status) => *status,
            Transition::Complete(_) => JobStatus::Completed,
            Transition::Fail(_) => JobStatus::Failed,
            Transition::Cancel(_) => JobStatus::Cancelled,
        }
    }
}

/// Validates and applies job transitions.
///
/// PENDING → ANALYZING → PROCESSING → QUALITY_CHECK → COMPLETED, with
/// FAILED and CANCELLED reachable from every non-terminal status.
pub struct StateMachine;

impl StateMachine {
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::*;
        match (from, to) {
            (from, _) if from.is_terminal() => false,
            (_, Failed | Cancelled) => true,
            (Pending, Analyzing)
            | (Analyzing, Processing)
            | (Processing, QualityCheck)
            | (QualityCheck, Completed) => true,
            _ => false,
        }
    }

    /// Applies `transition` to `job`, or leaves it untouched and returns
    /// `InvalidTransition`.
    pub fn apply(job: &mut Job, transition: Transition) -> Result<(), CadenzaError> {
        let from = job.status;
        let to = transition.target();
        if !Self::can_transition(from, to) {
            return Err(CadenzaError::InvalidTransition { from, to });
        }

        let now = Utc::now();
        match transition {
            Transition::Advance(_) => {}
            Transition::Complete(result) => {
                job.progress = 100;
                job.current_step = "Completed".to_string();
                job.final_result = Some(result);
            }
            Transition::Fail(error) => {
                job.current_step = "Failed".to_string();
                job.error = Some(error);
            }
            Transition::Cancel(reason) => {
                job.current_step = "Cancelled".to_string();
                job.cancel_reason = Some(reason);
            }
        }

        job.status = to;
        job.updated_at = now;
        job.status_history.push(StatusChange { status: to, at: now });
        if to.is_terminal() {
            job.estimated_completion = None;
        }
        Ok(())
    }
}
