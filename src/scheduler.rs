use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapter::ToolOutput;
use crate::error::ToolFailure;
use crate::invoker::{Invocation, InvokeError, ToolInvoker};
use crate::quality::QualityAssessor;
use crate::selector::{ExecutionPlan, TaskPlan};
use crate::task::Task;

/// Outcome of one successfully executed task.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub task_id: String,
    pub tool: String,
    pub output: ToolOutput,
    pub cost: f64,
    pub duration: Duration,
    pub attempts: u32,
    pub tools_attempted: Vec<String>,
    pub quality: f64,
    pub fallback_used: bool,
}

/// Everything that happened in one parallel group.
#[derive(Debug, Clone)]
pub struct GroupReport {
    /// 0-based group index.
    pub index: usize,
    pub total: usize,
    /// Successful steps in declaration order.
    pub steps: Vec<StepResult>,
    /// Optional tasks given up on in this group.
    pub skipped: Vec<String>,
    /// False when the group ends the run with a failure or a cancellation.
    pub completed: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub steps: Vec<StepResult>,
    pub skipped: Vec<String>,
    /// Outputs of sink tasks keyed by task id.
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// A required task could not be completed, or a tool aborted the job.
    #[error("{error}")]
    Failed {
        error: ToolFailure,
        completed: Vec<StepResult>,
    },

    #[error("execution cancelled")]
    Cancelled { completed: Vec<StepResult> },
}

/// Runs an [`ExecutionPlan`] group by group.
///
/// Tasks in a group run concurrently; group `i + 1` starts only after every
/// task of group `i` reached an outcome. Cancellation is checked between
/// groups, so an in-flight group always finishes.
pub struct TaskScheduler {
    invoker: Arc<ToolInvoker>,
    assessor: QualityAssessor,
}

impl TaskScheduler {
    pub fn new(invoker: Arc<ToolInvoker>, assessor: QualityAssessor) -> Self {
        Self { invoker, assessor }
    }

    pub fn invoker(&self) -> &ToolInvoker {
        &self.invoker
    }

    /// Executes every group of `plan`, calling `on_group` after each one,
    /// including a group that ends the run with a failure.
    pub async fn execute<F>(
        &self,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
        mut on_group: F,
    ) -> Result<ExecutionReport, ScheduleError>
    where
        F: FnMut(&GroupReport),
    {
        let total = plan.groups.len();
        let mut outputs: HashMap<String, ToolOutput> = HashMap::new();
        let mut completed: Vec<StepResult> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();

        for (index, group) in plan.groups.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(group = index + 1, total, "cancelled before group dispatch");
                return Err(ScheduleError::Cancelled { completed });
            }
            info!(group = index + 1, total, tasks = group.len(), "dispatching group");

            // a child token lets an aborting task stop its siblings' retries
            let group_cancel = cancel.child_token();
            let mut futs = FuturesUnordered::new();
            for id in group {
                let Some(task_plan) = plan.task(id) else {
                    continue;
                };
                let input = assemble_input(&task_plan.task, &outputs);
                let group_cancel = group_cancel.clone();
                futs.push(async move {
                    let result = self.invoker.invoke(task_plan, input, &group_cancel).await;
                    if matches!(result, Err(InvokeError::Aborted(_))) {
                        group_cancel.cancel();
                    }
                    (task_plan, result)
                });
            }

            let mut steps = Vec::new();
            let mut group_skipped = Vec::new();
            let mut aborted: Option<ToolFailure> = None;
            let mut failed: Option<ToolFailure> = None;
            let mut interrupted = false;

            while let Some((task_plan, result)) = futs.next().await {
                let task = &task_plan.task;
                match result {
                    Ok(done) => steps.push(self.step_result(task_plan, done)),
                    Err(InvokeError::Aborted(failure)) => {
                        error!(task_id = %task.id, error = %failure, "tool aborted the job");
                        aborted.get_or_insert(failure);
                    }
                    Err(InvokeError::Cancelled { .. }) => interrupted = true,
                    Err(InvokeError::Exhausted(failure) | InvokeError::Skipped(failure)) => {
                        if task.required {
                            error!(task_id = %task.id, error = %failure, "required task failed");
                            failed.get_or_insert(failure);
                        } else {
                            warn!(task_id = %task.id, error = %failure, "optional task skipped");
                            group_skipped.push(task.id.clone());
                        }
                    }
                }
            }
            drop(futs);

            // results arrive unordered; report them in declaration order
            let order = |id: &str| group.iter().position(|g| g == id);
            steps.sort_by_key(|s: &StepResult| order(&s.task_id));
            group_skipped.sort_by_key(|id: &String| order(id));

            for step in &steps {
                outputs.insert(step.task_id.clone(), step.output.clone());
            }
            completed.extend(steps.iter().cloned());
            skipped.extend(group_skipped.iter().cloned());

            on_group(&GroupReport {
                index,
                total,
                steps,
                skipped: group_skipped,
                completed: aborted.is_none() && failed.is_none() && !interrupted,
            });

            if let Some(error) = aborted.or(failed) {
                return Err(ScheduleError::Failed { error, completed });
            }
            if interrupted {
                return Err(ScheduleError::Cancelled { completed });
            }
            info!(group = index + 1, total, "group finished");
        }

        let mut sink_outputs = Map::new();
        for sink in plan.graph.sinks() {
            if let Some(output) = outputs.remove(&sink.id) {
                sink_outputs.insert(sink.id.clone(), Value::Object(output));
            }
        }

        Ok(ExecutionReport {
            steps: completed,
            skipped,
            outputs: sink_outputs,
        })
    }

    fn step_result(&self, plan: &TaskPlan, done: Invocation) -> StepResult {
        let quality = self
            .invoker
            .catalog()
            .get(&done.tool)
            .map(|tool| self.assessor.assess_step(tool))
            .unwrap_or(0.0);
        info!(
            task_id = %plan.task.id,
            tool = %done.tool,
            attempts = done.attempts,
            fallback = done.fallback_used,
            "task completed"
        );
        StepResult {
            task_id: plan.task.id.clone(),
            tool: done.tool,
            output: done.output,
            cost: done.cost,
            duration: done.duration,
            attempts: done.attempts,
            tools_attempted: done.tools_attempted,
            quality,
            fallback_used: done.fallback_used,
        }
    }
}

/// Task parameters overlaid with each dependency's output, in declared
/// dependency order. Later dependencies win on key collisions.
fn assemble_input(task: &Task, outputs: &HashMap<String, ToolOutput>) -> Map<String, Value> {
    let mut input = task.parameters.clone();
    for dep in &task.dependencies {
        if let Some(output) = outputs.get(dep) {
            for (key, value) in output {
                input.insert(key.clone(), value.clone());
            }
        }
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::adapter::{AdapterError, SimulatedAdapter, ToolAdapter, ToolRequest};
    use crate::catalog::{ToolCatalog, ToolDescriptor};
    use crate::config::{BackoffConfig, CadenzaConfig, QualityConfig};
    use crate::error::ErrorClass;
    use crate::selector::ToolSelector;

    /// Echoes its input back with a marker of which tool ran.
    #[derive(Default)]
    struct EchoAdapter {
        calls: AtomicUsize,
        seen: Mutex<Vec<Map<String, Value>>>,
    }

    #[async_trait]
    impl ToolAdapter for EchoAdapter {
        async fn call(&self, request: &ToolRequest) -> Result<ToolOutput, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.input.clone());
            let mut out = request.input.clone();
            out.insert(format!("{}_done", request.task_id), json!(true));
            out.insert("last".into(), json!(request.task_id));
            Ok(out)
        }
    }

    /// One tool per task; formats are unique so no other tool is eligible.
    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor::new(name, "processing")
            .formats(&[name], &[name])
            .attempts(1)
    }

    fn task(id: &str, deps: &[&str]) -> Task {
        let name = format!("t_{id}");
        Task::new(id, name.clone(), name).depends_on(deps.iter().copied())
    }

    struct Fixture {
        scheduler: TaskScheduler,
        selector: ToolSelector,
    }

    fn fixture(tasks: &[&str], adapters: Vec<(&str, Arc<dyn ToolAdapter>)>) -> Fixture {
        let catalog = Arc::new(
            ToolCatalog::new(tasks.iter().map(|id| tool(&format!("t_{id}"))).collect()).unwrap(),
        );
        let config = CadenzaConfig {
            backoff: BackoffConfig::immediate(),
            ..CadenzaConfig::default()
        };
        let mut invoker = ToolInvoker::new(catalog.clone(), &config);
        for (task_id, adapter) in adapters {
            invoker = invoker.with_adapter(format!("t_{task_id}"), adapter);
        }
        let assessor = QualityAssessor::new(QualityConfig {
            perturbation: 0.0,
            completion_bonus: 0.1,
        });
        Fixture {
            scheduler: TaskScheduler::new(Arc::new(invoker), assessor),
            selector: ToolSelector::new(catalog),
        }
    }

    fn as_dyn(echo: &Arc<EchoAdapter>) -> Arc<dyn ToolAdapter> {
        echo.clone()
    }

    fn failing(status: u16) -> Arc<dyn ToolAdapter> {
        Arc::new(SimulatedAdapter::new().always_fail(move || AdapterError::Api {
            status,
            message: "down".into(),
        }))
    }

    #[tokio::test]
    async fn outputs_flow_into_dependents() {
        let echo = Arc::new(EchoAdapter::default());
        let fx = fixture(
            &["a", "b", "c"],
            vec![("a", as_dyn(&echo)), ("b", as_dyn(&echo)), ("c", as_dyn(&echo))],
        );
        let plan = fx
            .selector
            .plan(vec![
                task("a", &[]).with_param("seed", 7),
                task("b", &["a"]),
                task("c", &["a", "b"]),
            ])
            .unwrap();

        let mut groups = Vec::new();
        let report = fx
            .scheduler
            .execute(&plan, &CancellationToken::new(), |g| {
                groups.push((g.index, g.completed))
            })
            .await
            .unwrap();

        assert_eq!(groups, vec![(0, true), (1, true), (2, true)]);
        assert_eq!(report.steps.len(), 3);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 3);

        let seen = echo.seen.lock().unwrap();
        // c sees both upstream outputs; b's output was merged last
        assert_eq!(seen[2]["seed"], json!(7));
        assert_eq!(seen[2]["a_done"], json!(true));
        assert_eq!(seen[2]["b_done"], json!(true));
        assert_eq!(seen[2]["last"], json!("b"));

        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs["c"]["c_done"], json!(true));
        assert!((report.steps[0].quality - 0.5625).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_root_stops_everything() {
        let downstream = Arc::new(EchoAdapter::default());
        let fx = fixture(
            &["a", "b", "c"],
            vec![
                ("a", failing(503)),
                ("b", as_dyn(&downstream)),
                ("c", as_dyn(&downstream)),
            ],
        );
        let plan = fx
            .selector
            .plan(vec![task("a", &[]), task("b", &["a"]), task("c", &["a", "b"])])
            .unwrap();

        let mut groups = Vec::new();
        let err = fx
            .scheduler
            .execute(&plan, &CancellationToken::new(), |g| {
                groups.push((g.index, g.completed))
            })
            .await
            .unwrap_err();
        assert_eq!(groups, vec![(0, false)]);
        match err {
            ScheduleError::Failed { error, completed } => {
                assert_eq!(error.task_id, "a");
                assert_eq!(error.tools_attempted, vec!["t_a"]);
                assert!(completed.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(downstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn optional_failure_is_skipped() {
        let echo = Arc::new(EchoAdapter::default());
        let fx = fixture(
            &["a", "b", "c"],
            vec![
                ("a", as_dyn(&echo)),
                ("b", failing(422)),
                ("c", as_dyn(&echo)),
            ],
        );
        let plan = fx
            .selector
            .plan(vec![
                task("a", &[]),
                task("b", &["a"]).optional(),
                task("c", &["b"]),
            ])
            .unwrap();

        let report = fx
            .scheduler
            .execute(&plan, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(report.skipped, vec!["b"]);
        let ids: Vec<&str> = report.steps.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        // c ran without b's output
        assert!(!echo.seen.lock().unwrap()[1].contains_key("b_done"));
    }

    #[tokio::test]
    async fn rejected_input_fails_a_required_task_without_fallback() {
        let rejecting = Arc::new(SimulatedAdapter::new().always_fail(|| AdapterError::Api {
            status: 422,
            message: "unsupported sample rate".into(),
        }));
        let spare = Arc::new(EchoAdapter::default());
        let catalog = Arc::new(
            ToolCatalog::new(vec![
                tool("t_a").attempts(3).fallbacks(&["t_spare"]),
                tool("t_spare"),
            ])
            .unwrap(),
        );
        let config = CadenzaConfig {
            backoff: BackoffConfig::immediate(),
            ..CadenzaConfig::default()
        };
        let invoker = ToolInvoker::new(catalog.clone(), &config)
            .with_adapter("t_a", rejecting.clone())
            .with_adapter("t_spare", as_dyn(&spare));
        let scheduler = TaskScheduler::new(Arc::new(invoker), QualityAssessor::default());
        let plan = ToolSelector::new(catalog).plan(vec![task("a", &[])]).unwrap();

        let err = scheduler
            .execute(&plan, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        match err {
            ScheduleError::Failed { error, completed } => {
                assert_eq!(error.class, ErrorClass::InvalidInput);
                assert_eq!(error.class.as_str(), "invalid_input");
                assert_eq!(error.tools_attempted, vec!["t_a"]);
                assert!(completed.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rejecting.calls(), 1);
        assert_eq!(spare.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auth_failure_fails_even_optional_tasks() {
        let fx = fixture(
            &["a", "b"],
            vec![
                ("a", as_dyn(&Arc::new(EchoAdapter::default()))),
                ("b", failing(401)),
            ],
        );
        let plan = fx
            .selector
            .plan(vec![task("a", &[]), task("b", &[]).optional()])
            .unwrap();

        let err = fx
            .scheduler
            .execute(&plan, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        match err {
            ScheduleError::Failed { error, .. } => {
                assert_eq!(error.class, ErrorClass::AuthFailed);
                assert_eq!(error.task_id, "b");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_waits_for_the_running_group() {
        let echo = Arc::new(EchoAdapter::default());
        let fx = fixture(
            &["a", "b", "c"],
            vec![("a", as_dyn(&echo)), ("b", as_dyn(&echo)), ("c", as_dyn(&echo))],
        );
        let plan = fx
            .selector
            .plan(vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])])
            .unwrap();

        let cancel = CancellationToken::new();
        let err = fx
            .scheduler
            .execute(&plan, &cancel, |g| {
                if g.index == 1 {
                    cancel.cancel();
                }
            })
            .await
            .unwrap_err();
        match err {
            ScheduleError::Cancelled { completed } => assert_eq!(completed.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn later_dependencies_win_on_collision() {
        let mut outputs = HashMap::new();
        outputs.insert("x".to_string(), Map::from_iter([("k".into(), json!(1))]));
        outputs.insert("y".to_string(), Map::from_iter([("k".into(), json!(2))]));
        let t = Task::new("z", "a", "b")
            .depends_on(["x", "y"])
            .with_param("k", 0)
            .with_param("keep", true);

        let input = assemble_input(&t, &outputs);
        assert_eq!(input["k"], json!(2));
        assert_eq!(input["keep"], json!(true));
    }
}
