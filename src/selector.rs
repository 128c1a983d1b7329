use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::catalog::{ToolCatalog, ToolDescriptor};
use crate::error::CadenzaError;
use crate::graph::TaskGraph;
use crate::task::Task;

const EXPLICIT_WEIGHT: f64 = 0.4;
const INTENT_WEIGHT: f64 = 0.2;
const RELIABILITY_WEIGHT: f64 = 0.3;
const COST_WEIGHT: f64 = 0.2;
const DURATION_WEIGHT: f64 = 0.1;

/// Number of ranked alternatives kept per task after the primary.
const TASK_FALLBACKS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredTool {
    pub tool: String,
    pub score: f64,
    pub estimated_cost: f64,
    pub estimated_time_secs: f64,
}

/// Tool assignment for one task: best candidate plus the next two.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPlan {
    pub task: Task,
    pub primary: ScoredTool,
    pub fallbacks: Vec<ScoredTool>,
}

impl TaskPlan {
    /// Primary first, then task-level fallbacks.
    pub fn ranked_tools(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.tool.as_str())
            .chain(self.fallbacks.iter().map(|s| s.tool.as_str()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// Per-task assignments in declaration order.
    pub tasks: Vec<TaskPlan>,
    /// Parallel groups; group `i` finishes before group `i + 1` starts.
    pub groups: Vec<Vec<String>>,
    pub total_estimated_cost: f64,
    pub total_estimated_time_secs: f64,
    #[serde(skip)]
    pub graph: TaskGraph,
}

impl ExecutionPlan {
    pub fn task(&self, id: &str) -> Option<&TaskPlan> {
        self.tasks.iter().find(|p| p.task.id == id)
    }
}

/// Ranks catalog tools for each task with a fixed weighted score.
#[derive(Debug, Clone)]
pub struct ToolSelector {
    catalog: Arc<ToolCatalog>,
}

impl ToolSelector {
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Scores one tool for one task.
    ///
    /// 0.4 if explicitly requested (else 0.2), plus 0.3 x reliability, plus
    /// 0.2 x normalised cheapness, plus 0.1 when the requested duration fits.
    pub fn score(&self, tool: &ToolDescriptor, task: &Task) -> f64 {
        let explicit = task.tool.as_deref() == Some(tool.name.as_str());
        let mut score = if explicit {
            EXPLICIT_WEIGHT
        } else {
            INTENT_WEIGHT
        };

        score += tool.reliability * RELIABILITY_WEIGHT;
        score += (self.catalog.min_cost_factor() / tool.cost_factor) * COST_WEIGHT;

        if task.duration_secs() <= tool.max_duration_secs {
            score += DURATION_WEIGHT;
        }
        score
    }

    /// All candidates for `task`, best first. Equal scores keep catalog order.
    pub fn rank(&self, task: &Task) -> Result<Vec<ScoredTool>, CadenzaError> {
        if let Some(requested) = task.tool.as_deref() {
            if !self.catalog.contains(requested) {
                return Err(CadenzaError::UnknownTool {
                    task_id: task.id.clone(),
                    tool: requested.to_string(),
                });
            }
        }

        let duration = task.duration_secs();
        let mut scored: Vec<ScoredTool> = self
            .catalog
            .iter()
            .filter(|tool| {
                task.tool.as_deref() == Some(tool.name.as_str())
                    || tool.accepts(&task.input_format, &task.output_format)
            })
            .map(|tool| ScoredTool {
                tool: tool.name.clone(),
                score: self.score(tool, task),
                estimated_cost: tool.estimate_cost(duration),
                estimated_time_secs: tool.estimate_time_secs(duration),
            })
            .collect();

        // sort_by is stable, so ties stay in catalog order
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(scored)
    }

    pub fn plan_task(&self, task: &Task) -> Result<TaskPlan, CadenzaError> {
        let mut ranked = self.rank(task)?.into_iter();
        let Some(primary) = ranked.next() else {
            return Err(CadenzaError::NoEligibleTool {
                task_id: task.id.clone(),
                input_format: task.input_format.clone(),
                output_format: task.output_format.clone(),
            });
        };
        let fallbacks = ranked.take(TASK_FALLBACKS).collect();

        Ok(TaskPlan {
            task: task.clone(),
            primary,
            fallbacks,
        })
    }

    /// Validates the task list as a DAG, assigns tools and layers it into groups.
    ///
    /// Every error here is a planning error: nothing has been invoked yet.
    pub fn plan(&self, tasks: Vec<Task>) -> Result<ExecutionPlan, CadenzaError> {
        let graph = TaskGraph::new(tasks)?;

        let mut plans = Vec::with_capacity(graph.len());
        for task in graph.tasks() {
            let plan = self.plan_task(task)?;
            debug!(
                task_id = %task.id,
                primary = %plan.primary.tool,
                score = plan.primary.score,
                fallbacks = plan.fallbacks.len(),
                "tool selected"
            );
            plans.push(plan);
        }

        let total_estimated_cost = plans.iter().map(|p| p.primary.estimated_cost).sum();
        let total_estimated_time_secs = plans.iter().map(|p| p.primary.estimated_time_secs).sum();

        Ok(ExecutionPlan {
            tasks: plans,
            groups: graph.layers(),
            total_estimated_cost,
            total_estimated_time_secs,
            graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CostModel;

    fn tool(name: &str, reliability: f64) -> ToolDescriptor {
        ToolDescriptor::new(name, "generation")
            .formats(&["text"], &["audio/wav"])
            .cost(CostModel::PerRequest { rate: 0.01 }, 1.0)
            .reliability(reliability)
            .max_duration(300.0)
    }

    fn selector(tools: Vec<ToolDescriptor>) -> ToolSelector {
        ToolSelector::new(Arc::new(ToolCatalog::new(tools).unwrap()))
    }

    #[test]
    fn higher_reliability_ranks_first() {
        let sel = selector(vec![tool("shaky", 0.5), tool("solid", 0.95)]);
        let ranked = sel.rank(&Task::new("t", "text", "audio/wav")).unwrap();
        assert_eq!(ranked[0].tool, "solid");
        assert_eq!(ranked[1].tool, "shaky");
    }

    #[test]
    fn score_components() {
        let sel = selector(vec![
            tool("a", 1.0),
            tool("b", 0.5).cost(CostModel::PerRequest { rate: 0.01 }, 2.0),
        ]);
        let task = Task::new("t", "text", "audio/wav");
        let a = sel.catalog().get("a").unwrap();
        let b = sel.catalog().get("b").unwrap();

        assert!((sel.score(a, &task) - (0.2 + 0.3 + 0.2 + 0.1)).abs() < 1e-9);
        assert!((sel.score(b, &task) - (0.2 + 0.15 + 0.1 + 0.1)).abs() < 1e-9);

        let long = task.clone().with_param("duration", 600);
        assert!((sel.score(a, &long) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn explicit_tool_is_included_regardless_of_formats() {
        let midi_only = ToolDescriptor::new("midi_only", "melody")
            .formats(&["midi"], &["midi"])
            .reliability(0.1);
        let sel = selector(vec![tool("gen", 0.9), midi_only]);
        let task = Task::new("t", "text", "audio/wav").with_tool("midi_only");

        let ranked = sel.rank(&task).unwrap();
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().any(|s| s.tool == "midi_only"));
    }

    #[test]
    fn explicit_request_outweighs_reliability() {
        let sel = selector(vec![tool("solid", 0.95), tool("chosen", 0.6)]);
        let task = Task::new("t", "text", "audio/wav").with_tool("chosen");
        assert_eq!(sel.rank(&task).unwrap()[0].tool, "chosen");
    }

    #[test]
    fn ties_keep_catalog_order() {
        let sel = selector(vec![tool("first", 0.8), tool("second", 0.8), tool("third", 0.8)]);
        let names: Vec<String> = sel
            .rank(&Task::new("t", "text", "audio/wav"))
            .unwrap()
            .into_iter()
            .map(|s| s.tool)
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn unknown_explicit_tool_is_a_planning_error() {
        let sel = selector(vec![tool("gen", 0.9)]);
        let err = sel
            .plan(vec![Task::new("t", "text", "audio/wav").with_tool("nope")])
            .unwrap_err();
        assert!(matches!(err, CadenzaError::UnknownTool { .. }));
        assert!(err.is_planning_error());
    }

    #[test]
    fn no_eligible_tool_is_a_planning_error() {
        let sel = selector(vec![tool("gen", 0.9)]);
        let err = sel.plan(vec![Task::new("t", "midi", "midi")]).unwrap_err();
        assert!(matches!(err, CadenzaError::NoEligibleTool { .. }));
    }

    #[test]
    fn plan_keeps_two_fallbacks_and_totals() {
        let sel = selector(vec![
            tool("a", 0.9),
            tool("b", 0.8),
            tool("c", 0.7),
            tool("d", 0.6),
        ]);
        let plan = sel
            .plan(vec![
                Task::new("gen", "text", "audio/wav"),
                Task::new("again", "text", "audio/wav").depends_on(["gen"]),
            ])
            .unwrap();

        let gen_plan = plan.task("gen").unwrap();
        assert_eq!(gen_plan.primary.tool, "a");
        let fallbacks: Vec<&str> = gen_plan.fallbacks.iter().map(|s| s.tool.as_str()).collect();
        assert_eq!(fallbacks, vec!["b", "c"]);
        assert_eq!(gen_plan.ranked_tools().collect::<Vec<_>>(), vec!["a", "b", "c"]);

        assert_eq!(plan.groups, vec![vec!["gen"], vec!["again"]]);
        assert!((plan.total_estimated_cost - 0.02).abs() < 1e-9);
        assert!((plan.total_estimated_time_secs - 80.0).abs() < 1e-9);
    }

    #[test]
    fn cycle_is_rejected_before_selection() {
        let sel = selector(vec![tool("gen", 0.9)]);
        let err = sel
            .plan(vec![
                Task::new("a", "text", "audio/wav").depends_on(["b"]),
                Task::new("b", "text", "audio/wav").depends_on(["a"]),
            ])
            .unwrap_err();
        assert!(matches!(err, CadenzaError::DependencyCycle(_)));
    }

    #[test]
    fn builtin_catalog_generation_plan() {
        let sel = ToolSelector::new(Arc::new(ToolCatalog::builtin()));
        let plan = sel
            .plan(vec![
                Task::new("compose", "text", "audio/wav").with_param("duration", 90),
                Task::new("master", "audio/wav", "audio/wav").depends_on(["compose"]),
            ])
            .unwrap();
        assert_eq!(plan.task("compose").unwrap().primary.tool, "musicgen");
        assert_eq!(plan.groups.len(), 2);
    }
}
