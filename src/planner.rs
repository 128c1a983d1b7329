//! Turning a request into a task list.
//!
//! The engine does not decompose natural language itself. A [`Planner`]
//! receives the request, its workflow configuration and the analysis
//! produced by an [`InputAnalyzer`], and returns tasks that the selector
//! then validates as a DAG. [`WorkflowPlanner`] is the built-in planner; it
//! understands four workflow types:
//!
//! - `tasks`: an explicit task list under `tasks`, used as-is.
//! - `custom`: ordered `steps` of `{tool, parameters}`.
//! - `preset`: a named step list (`standard_mastering` when unknown).
//! - `auto` (the default): steps chosen from the analysis.
//!
//! Step-based workflows become a linear chain, each step depending on the
//! previous one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::catalog::ToolCatalog;
use crate::error::CadenzaError;
use crate::task::Task;

/// Free-form metadata about the input (duration, genre, noise level, ...).
pub type Analysis = Map<String, Value>;

/// Everything a planner gets to see.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub input: String,
    pub workflow_config: Map<String, Value>,
    pub analysis: Analysis,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<Vec<Task>, CadenzaError>;
}

#[async_trait]
pub trait InputAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        input: &str,
        workflow_config: &Map<String, Value>,
    ) -> Result<Analysis, CadenzaError>;
}

/// Duration assumed when neither the caller nor the analyzer knows better.
const DEFAULT_INPUT_DURATION_SECS: f64 = 120.0;
const DEFAULT_NOISE_LEVEL: f64 = 0.1;

/// Builds the analysis from hints in the workflow configuration.
///
/// Recognised hints: `duration` (seconds), `genre`, `noise_level` (0-1).
#[derive(Debug, Default)]
pub struct DefaultAnalyzer;

#[async_trait]
impl InputAnalyzer for DefaultAnalyzer {
    async fn analyze(
        &self,
        input: &str,
        workflow_config: &Map<String, Value>,
    ) -> Result<Analysis, CadenzaError> {
        let duration = workflow_config
            .get("duration")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_INPUT_DURATION_SECS);
        if duration <= 0.0 {
            return Err(CadenzaError::Planner(format!(
                "duration must be positive, got {duration}"
            )));
        }
        let genre = workflow_config
            .get("genre")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_lowercase();
        let noise_level = workflow_config
            .get("noise_level")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_NOISE_LEVEL);

        let mut analysis = Analysis::new();
        analysis.insert("input".into(), json!(input));
        analysis.insert("duration".into(), json!(duration));
        analysis.insert("genre".into(), json!(genre));
        analysis.insert("noise_level".into(), json!(noise_level));
        Ok(analysis)
    }
}

/// One step of a step-based workflow.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowStep {
    #[serde(alias = "model_name")]
    tool: String,
    #[serde(default)]
    parameters: Map<String, Value>,
    #[serde(default = "default_required")]
    required: bool,
}

fn default_required() -> bool {
    true
}

impl WorkflowStep {
    fn new(tool: &str, parameters: Value) -> Self {
        Self {
            tool: tool.to_string(),
            parameters: match parameters {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            required: true,
        }
    }
}

pub const PRESETS: &[&str] = &[
    "standard_mastering",
    "creative_enhancement",
    "generation_from_scratch",
    "vocal_enhancement",
];

fn preset_steps(name: &str) -> Vec<WorkflowStep> {
    match name {
        "creative_enhancement" => vec![
            WorkflowStep::new("google_musiclm", json!({"analysis_depth": "full"})),
            WorkflowStep::new("jukebox", json!({"style_strength": 0.7})),
            WorkflowStep::new("melody_rnn", json!({"variation_level": "medium"})),
            WorkflowStep::new("aces_audio", json!({"enhancement_level": "high"})),
        ],
        "generation_from_scratch" => vec![
            WorkflowStep::new("musicgen", json!({"duration": 180, "style": "auto"})),
            WorkflowStep::new("melody_rnn", json!({"enhance_melody": true})),
            WorkflowStep::new("tepand_diff_rhythm", json!({"rhythm_enhancement": true})),
            WorkflowStep::new("stable_audio", json!({"quality": "high"})),
            WorkflowStep::new("aces_audio", json!({"final_master": true})),
        ],
        "vocal_enhancement" => vec![
            WorkflowStep::new("google_musiclm", json!({"focus": "vocals"})),
            WorkflowStep::new("suni_ai", json!({"vocal_enhancement": true})),
            WorkflowStep::new("aces_audio", json!({"vocal_clarity": true})),
        ],
        _ => vec![
            WorkflowStep::new("google_musiclm", json!({"analysis_depth": "full"})),
            WorkflowStep::new("aces_audio", json!({"enhancement_level": "moderate"})),
            WorkflowStep::new("audiocraft", json!({"mastering_preset": "balanced"})),
        ],
    }
}

/// Steps picked from the analysis: noise clean-up, genre-specific
/// processing and mastering, and an optional creative pass.
fn auto_steps(analysis: &Analysis, workflow_config: &Map<String, Value>) -> Vec<WorkflowStep> {
    let genre = analysis
        .get("genre")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let noise_level = analysis
        .get("noise_level")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_NOISE_LEVEL);

    let mut steps = vec![WorkflowStep::new(
        "google_musiclm",
        json!({"analysis_depth": "full"}),
    )];

    if noise_level > 0.3 {
        steps.push(WorkflowStep::new("suni_ai", json!({"noise_reduction": true})));
    }

    match genre {
        "electronic" | "edm" | "techno" => steps.extend([
            WorkflowStep::new("tepand_diff_rhythm", json!({"electronic_enhancement": true})),
            WorkflowStep::new("stable_audio", json!({"electronic_mastering": true})),
        ]),
        "classical" | "orchestral" => steps.extend([
            WorkflowStep::new("beethoven_ai", json!({"classical_enhancement": true})),
            WorkflowStep::new("aces_audio", json!({"orchestral_mastering": true})),
        ]),
        "rock" | "metal" => steps.extend([
            WorkflowStep::new("audiocraft", json!({"rock_processing": true})),
            WorkflowStep::new("aces_audio", json!({"rock_mastering": true})),
        ]),
        _ => steps.extend([
            WorkflowStep::new("audiocraft", json!({"general_enhancement": true})),
            WorkflowStep::new("aces_audio", json!({"balanced_mastering": true})),
        ]),
    }

    let creativity = workflow_config.get("creativity").and_then(Value::as_str);
    if creativity == Some("high") {
        // creative pass goes right before mastering
        let at = steps.len() - 1;
        steps.insert(
            at,
            WorkflowStep::new("jukebox", json!({"creative_processing": true})),
        );
    }
    steps
}

/// The built-in planner. Needs the catalog to give step tasks the formats
/// of their tool.
pub struct WorkflowPlanner {
    catalog: Arc<ToolCatalog>,
}

impl WorkflowPlanner {
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        Self { catalog }
    }

    /// Turns steps into a linear chain of tasks `step1 -> step2 -> ...`.
    ///
    /// The analysed `duration` is copied into each task's parameters unless
    /// the step sets its own.
    fn chain(&self, steps: Vec<WorkflowStep>, analysis: &Analysis) -> Result<Vec<Task>, CadenzaError> {
        if steps.is_empty() {
            return Err(CadenzaError::Planner("workflow has no steps".into()));
        }

        let mut tasks: Vec<Task> = Vec::with_capacity(steps.len());
        for (i, step) in steps.into_iter().enumerate() {
            let id = format!("step{}", i + 1);
            let Some(tool) = self.catalog.get(&step.tool) else {
                return Err(CadenzaError::UnknownTool {
                    task_id: id,
                    tool: step.tool,
                });
            };
            let input_format = tool.input_formats.first().cloned().unwrap_or_default();
            let output_format = tool.output_formats.first().cloned().unwrap_or_default();

            let mut task = Task::new(id, input_format, output_format).with_tool(&step.tool);
            task.name = step.tool.clone();
            task.parameters = step.parameters;
            task.required = step.required;
            if let Some(duration) = analysis.get("duration") {
                task.parameters
                    .entry("duration")
                    .or_insert_with(|| duration.clone());
            }
            if let Some(prev) = tasks.last() {
                task.dependencies.push(prev.id.clone());
            }
            tasks.push(task);
        }
        Ok(tasks)
    }
}

#[async_trait]
impl Planner for WorkflowPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<Vec<Task>, CadenzaError> {
        let config = &request.workflow_config;
        let kind = config.get("type").and_then(Value::as_str).unwrap_or("auto");
        debug!(workflow = kind, "planning workflow");

        match kind {
            "tasks" => {
                let raw = config
                    .get("tasks")
                    .cloned()
                    .ok_or_else(|| CadenzaError::Planner("workflow type 'tasks' needs a 'tasks' list".into()))?;
                serde_json::from_value(raw)
                    .map_err(|e| CadenzaError::Planner(format!("invalid task list: {e}")))
            }
            "custom" => {
                let raw = config.get("steps").cloned().unwrap_or(Value::Array(Vec::new()));
                let steps: Vec<WorkflowStep> = serde_json::from_value(raw)
                    .map_err(|e| CadenzaError::Planner(format!("invalid custom steps: {e}")))?;
                self.chain(steps, &request.analysis)
            }
            "preset" => {
                let name = config
                    .get("preset")
                    .and_then(Value::as_str)
                    .unwrap_or("standard_mastering");
                if !PRESETS.contains(&name) {
                    debug!(preset = name, "unknown preset, using standard_mastering");
                }
                self.chain(preset_steps(name), &request.analysis)
            }
            "auto" => self.chain(auto_steps(&request.analysis, config), &request.analysis),
            other => Err(CadenzaError::Planner(format!("unknown workflow type '{other}'"))),
        }
    }
}
