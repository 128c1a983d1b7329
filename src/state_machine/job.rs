use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ToolFailure;

/// Lifecycle status of a job. Serialized as lowercase strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Analyzing,
    Processing,
    QualityCheck,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Analyzing => write!(f, "ANALYZING"),
            JobStatus::Processing => write!(f, "PROCESSING"),
            JobStatus::QualityCheck => write!(f, "QUALITY_CHECK"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// One completed step. Immutable once appended to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 0-based position in the job's step history.
    pub step: usize,
    pub task_id: String,
    pub tool: String,
    pub quality_score: f64,
    pub execution_time_secs: f64,
    pub cost: f64,
    /// True when the tool was not the task's planned primary.
    pub fallback_used: bool,
    pub timestamp: DateTime<Utc>,
}

/// Why a job failed: the triggering task, the tools tried and the last error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub task_id: Option<String>,
    pub tools_attempted: Vec<String>,
    pub message: String,
}

impl JobError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            task_id: None,
            tools_attempted: Vec::new(),
            message: message.into(),
        }
    }
}

impl From<ToolFailure> for JobError {
    fn from(failure: ToolFailure) -> Self {
        Self {
            kind: failure.class.as_str().to_string(),
            task_id: Some(failure.task_id),
            tools_attempted: failure.tools_attempted,
            message: failure.message,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task_id {
            Some(task) => write!(f, "[{}] task '{task}': {}", self.kind, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub quality_score: f64,
    pub total_steps: usize,
    pub successful_steps: usize,
    /// Optional tasks that were given up on.
    pub skipped_tasks: Vec<String>,
    pub total_cost: f64,
    pub total_execution_time_secs: f64,
    pub average_quality: f64,
    /// Outputs of tasks nothing else depends on, keyed by task id.
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
}

/// One end-to-end request. Mutated only by the task driving it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub input: String,
    pub workflow_config: Map<String, Value>,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: String,
    pub steps: Vec<StepRecord>,
    pub final_result: Option<FinalResult>,
    pub error: Option<JobError>,
    pub cancel_reason: Option<String>,
    pub status_history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        user_id: impl Into<String>,
        input: impl Into<String>,
        workflow_config: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            input: input.into(),
            workflow_config,
            status: JobStatus::Pending,
            progress: 0,
            current_step: "Queued".to_string(),
            steps: Vec::new(),
            final_result: None,
            error: None,
            cancel_reason: None,
            status_history: vec![StatusChange {
                status: JobStatus::Pending,
                at: now,
            }],
            created_at: now,
            updated_at: now,
            estimated_completion: None,
        }
    }

    /// Moves progress forward; lower values are ignored so progress never
    /// goes backwards. Also refreshes the completion estimate.
    pub fn set_progress(&mut self, progress: u8, current_step: impl Into<String>) {
        self.set_progress_at(progress, current_step, Utc::now());
    }

    pub fn set_progress_at(
        &mut self,
        progress: u8,
        current_step: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.progress = self.progress.max(progress.min(100));
        self.current_step = current_step.into();
        self.updated_at = now;
        self.estimated_completion = self.estimate_completion(now);
    }

    /// Linear extrapolation of elapsed time over progress made so far.
    fn estimate_completion(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.status.is_terminal() || self.progress == 0 {
            return None;
        }
        let elapsed_ms = (now - self.created_at).num_milliseconds().max(0);
        let remaining = 100 - i64::from(self.progress);
        let remaining_ms = elapsed_ms * remaining / i64::from(self.progress);
        Some(now + chrono::Duration::milliseconds(remaining_ms))
    }

    pub fn push_step(&mut self, mut record: StepRecord) {
        record.step = self.steps.len();
        self.updated_at = record.timestamp;
        self.steps.push(record);
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            status: self.status,
            progress: self.progress,
            current_step: self.current_step.clone(),
            steps: self.steps.clone(),
            final_result: self.final_result.clone(),
            error: self.error.clone(),
            cancel_reason: self.cancel_reason.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            estimated_completion: self.estimated_completion,
        }
    }
}

/// Read-only snapshot returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: String,
    pub steps: Vec<StepRecord>,
    pub final_result: Option<FinalResult>,
    pub error: Option<JobError>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
}
