//! The unit of work inside a job's dependency graph.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CadenzaError;

/// Requested media length when a task does not declare `duration`.
pub const DEFAULT_DURATION_SECS: f64 = 30.0;

/// One atomic unit of work. Immutable once a task list is accepted.
///
/// Deserialization is strict: unknown fields are rejected rather than
/// silently ignored, so a misspelled `dependencies` key fails planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub input_format: String,
    pub output_format: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Explicitly requested tool; always considered even if formats don't match.
    #[serde(default)]
    pub tool: Option<String>,
    /// Optional tasks degrade the result instead of failing the job.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        input_format: impl Into<String>,
        output_format: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            dependencies: Vec::new(),
            input_format: input_format.into(),
            output_format: output_format.into(),
            parameters: Map::new(),
            tool: None,
            required: true,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Requested output length in seconds (`parameters.duration`, default 30).
    pub fn duration_secs(&self) -> f64 {
        self.parameters
            .get("duration")
            .and_then(Value::as_f64)
            .filter(|d| d.is_finite() && *d >= 0.0)
            .unwrap_or(DEFAULT_DURATION_SECS)
    }

    /// Checks the task in isolation; graph-level checks live in [`crate::graph`].
    pub fn validate(&self) -> Result<(), CadenzaError> {
        let invalid = |reason: &str| CadenzaError::InvalidTask {
            task_id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.input_format.trim().is_empty() || self.output_format.trim().is_empty() {
            return Err(invalid("input and output formats are required"));
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err(invalid("task depends on itself"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.dependencies.iter().find(|d| !seen.insert(d.as_str())) {
            return Err(invalid(&format!("dependency '{dup}' listed twice")));
        }
        if self.tool.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(invalid("tool must not be empty when given"));
        }
        Ok(())
    }
}
