use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::JobStatus;

#[derive(Debug, Error)]
pub enum CadenzaError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid task '{task_id}': {reason}")]
    InvalidTask { task_id: String, reason: String },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task '{task_id}' depends on unknown task '{dependency}'")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("Task '{task_id}' requests unknown tool '{tool}'")]
    UnknownTool { task_id: String, tool: String },

    #[error("No eligible tool for task '{task_id}' ({input_format} -> {output_format})")]
    NoEligibleTool {
        task_id: String,
        input_format: String,
        output_format: String,
    },

    #[error("Invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Planner error: {0}")]
    Planner(String),

    #[error(transparent)]
    Tool(#[from] ToolFailure),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CadenzaError {
    /// Planning errors are raised before any tool is invoked and are never retried.
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            CadenzaError::InvalidTask { .. }
                | CadenzaError::DuplicateTask(_)
                | CadenzaError::UnknownDependency { .. }
                | CadenzaError::DependencyCycle(_)
                | CadenzaError::UnknownTool { .. }
                | CadenzaError::NoEligibleTool { .. }
        )
    }

    /// Short machine-readable kind, used as `JobError::kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            CadenzaError::Config(_) => "config",
            CadenzaError::JobNotFound(_) => "not_found",
            CadenzaError::InvalidTask { .. } => "invalid_task",
            CadenzaError::DuplicateTask(_) => "duplicate_task",
            CadenzaError::UnknownDependency { .. } => "unknown_dependency",
            CadenzaError::DependencyCycle(_) => "dependency_cycle",
            CadenzaError::UnknownTool { .. } => "unknown_tool",
            CadenzaError::NoEligibleTool { .. } => "no_eligible_tool",
            CadenzaError::InvalidTransition { .. } => "invalid_transition",
            CadenzaError::Planner(_) => "planner",
            CadenzaError::Tool(failure) => failure.class.as_str(),
            CadenzaError::Io(_) | CadenzaError::Json(_) | CadenzaError::Toml(_) => "internal",
        }
    }
}

/// Failure class of a single tool attempt, derived from status codes or message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RateLimited,
    #[serde(rename = "tool_unavailable")]
    Unavailable,
    InsufficientResources,
    InvalidInput,
    Timeout,
    AuthFailed,
    Unknown,
}

impl ErrorClass {
    /// Classifies an error message by substring matching.
    ///
    /// Order matters: "rate limit" wins over "unavailable", and "invalid"
    /// needs a second hint ("format"/"input") to avoid catching
    /// "invalid api key" style auth errors.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("rate limit") || lower.contains("too many requests") {
            ErrorClass::RateLimited
        } else if lower.contains("unavailable") || lower.contains("service not found") {
            ErrorClass::Unavailable
        } else if lower.contains("timeout") || lower.contains("timed out") {
            ErrorClass::Timeout
        } else if lower.contains("insufficient") && lower.contains("resource") {
            ErrorClass::InsufficientResources
        } else if lower.contains("invalid") && (lower.contains("format") || lower.contains("input"))
        {
            ErrorClass::InvalidInput
        } else if lower.contains("authentication")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
        {
            ErrorClass::AuthFailed
        } else {
            ErrorClass::Unknown
        }
    }

    /// Recovery policy applied to this class.
    pub fn policy(self) -> RecoveryPolicy {
        let (delay_secs, max_retries, strategy) = match self {
            ErrorClass::RateLimited => (60, 3, RecoveryStrategy::Retry),
            ErrorClass::Unavailable => (30, 2, RecoveryStrategy::Fallback),
            ErrorClass::InsufficientResources => (120, 2, RecoveryStrategy::Retry),
            ErrorClass::InvalidInput => (0, 0, RecoveryStrategy::Skip),
            ErrorClass::Timeout => (30, 2, RecoveryStrategy::Retry),
            ErrorClass::AuthFailed => (0, 0, RecoveryStrategy::Abort),
            ErrorClass::Unknown => (30, 2, RecoveryStrategy::Retry),
        };
        RecoveryPolicy {
            retry_delay: Duration::from_secs(delay_secs),
            max_retries,
            strategy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Unavailable => "tool_unavailable",
            ErrorClass::InsufficientResources => "insufficient_resources",
            ErrorClass::InvalidInput => "invalid_input",
            ErrorClass::Timeout => "timeout",
            ErrorClass::AuthFailed => "auth_failed",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the invoker does once an attempt fails with a given class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Retry the same tool within its budget, then walk the fallback chain.
    Retry,
    /// Same path as `Retry`; the class is expected to recover on another tool.
    Fallback,
    /// Give up on the task without retries or fallbacks.
    Skip,
    /// Fail the whole job immediately.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub strategy: RecoveryStrategy,
}

/// A task whose every recovery avenue was exhausted (or aborted).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("task '{task_id}' failed ({class}) after trying [{}]: {message}", .tools_attempted.join(", "))]
pub struct ToolFailure {
    pub task_id: String,
    pub class: ErrorClass,
    pub tools_attempted: Vec<String>,
    pub message: String,
}
