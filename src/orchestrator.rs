//! Job lifecycle: create, drive, observe, cancel.
//!
//! Each job runs on its own tokio task. The driver walks it through
//! analysis, planning, scheduling, quality check and completion, applying
//! every status change through the [`StateMachine`]. Callers only see a job
//! through [`Orchestrator::status`], [`Orchestrator::cancel`] and the
//! notification sink.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapter::{SimulatedAdapter, ToolAdapter};
use crate::catalog::ToolCatalog;
use crate::config::CadenzaConfig;
use crate::error::CadenzaError;
use crate::invoker::ToolInvoker;
use crate::notify::{JobEvent, LogSink, NotificationSink, is_milestone};
use crate::planner::{Analysis, DefaultAnalyzer, InputAnalyzer, PlanRequest, Planner, WorkflowPlanner};
use crate::quality::QualityAssessor;
use crate::resilience::ToolUsage;
use crate::scheduler::{ExecutionReport, GroupReport, ScheduleError, TaskScheduler};
use crate::selector::ToolSelector;
use crate::state_machine::{
    FinalResult, Job, JobError, JobStatus, JobView, StateMachine, StepRecord, Transition,
};

const DEFAULT_CANCEL_REASON: &str = "cancelled by caller";

/// Progress reserved for each phase on the 0-100 scale.
const ANALYZING_PROGRESS: u8 = 5;
const PLANNING_PROGRESS: u8 = 15;
const PROCESSING_PROGRESS: u8 = 20;
const PROCESSING_SPAN: usize = 60;
const QUALITY_PROGRESS: u8 = 85;
const COMPILING_PROGRESS: u8 = 95;

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    cancel_reason: Option<String>,
    status_tx: watch::Sender<JobStatus>,
}

impl JobEntry {
    fn reason(&self) -> String {
        self.cancel_reason
            .clone()
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string())
    }
}

struct Inner {
    jobs: DashMap<String, JobEntry>,
    selector: ToolSelector,
    scheduler: TaskScheduler,
    planner: Arc<dyn Planner>,
    analyzer: Arc<dyn InputAnalyzer>,
    sink: Arc<dyn NotificationSink>,
    assessor: QualityAssessor,
}

/// Why the driver stopped before completion.
enum Halt {
    Cancelled,
    Failed(JobError),
}

impl From<CadenzaError> for Halt {
    fn from(err: CadenzaError) -> Self {
        let mut job_error = JobError::new(err.kind(), err.to_string());
        if let CadenzaError::Tool(failure) = err {
            job_error = JobError::from(failure);
        }
        Halt::Failed(job_error)
    }
}

/// Cheap to clone; clones share the same job table and services.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub struct OrchestratorBuilder {
    config: CadenzaConfig,
    catalog: Option<Arc<ToolCatalog>>,
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
    simulate: Option<Duration>,
    planner: Option<Arc<dyn Planner>>,
    analyzer: Option<Arc<dyn InputAnalyzer>>,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl OrchestratorBuilder {
    pub fn new(config: CadenzaConfig) -> Self {
        Self {
            config,
            catalog: None,
            adapters: HashMap::new(),
            simulate: None,
            planner: None,
            analyzer: None,
            sink: None,
        }
    }

    /// Defaults to [`ToolCatalog::builtin`].
    pub fn catalog(mut self, catalog: Arc<ToolCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn adapter(mut self, tool: impl Into<String>, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.adapters.insert(tool.into(), adapter);
        self
    }

    pub fn adapters(mut self, adapters: HashMap<String, Arc<dyn ToolAdapter>>) -> Self {
        self.adapters.extend(adapters);
        self
    }

    /// Backs every tool without an explicit adapter with a [`SimulatedAdapter`].
    pub fn simulate(mut self, latency: Duration) -> Self {
        self.simulate = Some(latency);
        self
    }

    /// Defaults to a [`WorkflowPlanner`] over the catalog.
    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn InputAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Defaults to [`LogSink`].
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Orchestrator {
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(ToolCatalog::builtin()));

        let mut adapters = self.adapters;
        if let Some(latency) = self.simulate {
            for tool in catalog.iter() {
                adapters.entry(tool.name.clone()).or_insert_with(|| {
                    Arc::new(SimulatedAdapter::new().with_latency(latency)) as Arc<dyn ToolAdapter>
                });
            }
        }

        let invoker = ToolInvoker::new(catalog.clone(), &self.config).with_adapters(adapters);
        let assessor = QualityAssessor::new(self.config.quality.clone());
        let planner = self
            .planner
            .unwrap_or_else(|| Arc::new(WorkflowPlanner::new(catalog.clone())));

        Orchestrator {
            inner: Arc::new(Inner {
                jobs: DashMap::new(),
                selector: ToolSelector::new(catalog),
                scheduler: TaskScheduler::new(Arc::new(invoker), assessor.clone()),
                planner,
                analyzer: self.analyzer.unwrap_or_else(|| Arc::new(DefaultAnalyzer)),
                sink: self.sink.unwrap_or_else(|| Arc::new(LogSink)),
                assessor,
            }),
        }
    }
}

impl Orchestrator {
    pub fn builder(config: CadenzaConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Registers a job and starts driving it immediately. Must be called
    /// from within a tokio runtime.
    pub fn create_job(
        &self,
        user_id: impl Into<String>,
        input: impl Into<String>,
        workflow_config: Map<String, Value>,
    ) -> String {
        let job = Job::new(user_id, input, workflow_config);
        let job_id = job.id.clone();
        let (status_tx, _) = watch::channel(job.status);

        self.inner.jobs.insert(
            job_id.clone(),
            JobEntry {
                job,
                cancel: CancellationToken::new(),
                cancel_reason: None,
                status_tx,
            },
        );
        info!(job_id = %job_id, "job created");

        let this = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move { this.drive(id).await });
        job_id
    }

    pub fn status(&self, job_id: &str) -> Result<JobView, CadenzaError> {
        self.inner
            .jobs
            .get(job_id)
            .map(|entry| entry.job.view())
            .ok_or_else(|| CadenzaError::JobNotFound(job_id.to_string()))
    }

    /// Requests cancellation. Returns `false` if the job is unknown or
    /// already terminal. The job becomes `Cancelled` at its next group or
    /// phase boundary; once accepted, a cancel is never overtaken by completion.
    pub fn cancel(&self, job_id: &str) -> bool {
        self.cancel_with_reason(job_id, DEFAULT_CANCEL_REASON)
    }

    pub fn cancel_with_reason(&self, job_id: &str, reason: impl Into<String>) -> bool {
        let Some(mut entry) = self.inner.jobs.get_mut(job_id) else {
            return false;
        };
        if entry.job.status.is_terminal() {
            return false;
        }
        if entry.cancel_reason.is_none() {
            let reason = reason.into();
            info!(job_id, reason = %reason, "cancellation requested");
            entry.cancel_reason = Some(reason);
        }
        entry.cancel.cancel();
        true
    }

    /// Every known job, oldest first.
    pub fn list_jobs(&self) -> Vec<JobView> {
        let mut views: Vec<JobView> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.job.view())
            .collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    /// Drops a terminal job from memory. Running jobs are never evicted.
    pub fn evict(&self, job_id: &str) -> bool {
        self.inner
            .jobs
            .remove_if(job_id, |_, entry| entry.job.status.is_terminal())
            .is_some()
    }

    /// Resolves once the job reaches a terminal status.
    pub async fn wait(&self, job_id: &str) -> Result<JobView, CadenzaError> {
        let mut rx = self
            .inner
            .jobs
            .get(job_id)
            .map(|entry| entry.status_tx.subscribe())
            .ok_or_else(|| CadenzaError::JobNotFound(job_id.to_string()))?;

        rx.wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| CadenzaError::JobNotFound(job_id.to_string()))?;
        self.status(job_id)
    }

    /// Per-tool call counts, cost and time across all jobs.
    pub fn usage(&self) -> BTreeMap<String, ToolUsage> {
        self.inner.scheduler.invoker().costs().snapshot()
    }

    pub fn catalog(&self) -> &ToolCatalog {
        self.inner.selector.catalog()
    }

    async fn drive(&self, job_id: String) {
        let Some((input, workflow_config, cancel)) = self.read_entry(&job_id, |entry| {
            (
                entry.job.input.clone(),
                entry.job.workflow_config.clone(),
                entry.cancel.clone(),
            )
        }) else {
            return;
        };

        let outcome = self.run(&job_id, input, workflow_config, &cancel).await;

        // decided under the entry lock that `cancel_with_reason` takes
        let finished = self.update_entry(&job_id, |entry| {
            let transition = if entry.cancel.is_cancelled() {
                if let Err(Halt::Failed(err)) = &outcome {
                    warn!(
                        job_id = %job_id,
                        error = %err,
                        "job failed after cancellation was requested"
                    );
                }
                info!(job_id = %job_id, "job cancelled");
                Transition::Cancel(entry.reason())
            } else {
                match outcome {
                    Ok(result) => {
                        info!(
                            job_id = %job_id,
                            quality = result.quality_score,
                            cost = result.total_cost,
                            "job completed"
                        );
                        Transition::Complete(result)
                    }
                    Err(Halt::Cancelled) => Transition::Cancel(entry.reason()),
                    Err(Halt::Failed(err)) => {
                        error!(job_id = %job_id, error = %err, "job failed");
                        Transition::Fail(err)
                    }
                }
            };
            StateMachine::apply(&mut entry.job, transition)
        });

        if let Some(Err(err)) = finished {
            error!(job_id = %job_id, error = %err, "could not finalize job");
        }
    }

    async fn run(
        &self,
        job_id: &str,
        input: String,
        workflow_config: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<FinalResult, Halt> {
        let checkpoint = || {
            if cancel.is_cancelled() {
                Err(Halt::Cancelled)
            } else {
                Ok(())
            }
        };

        checkpoint()?;
        self.apply(
            job_id,
            Transition::Advance(JobStatus::Analyzing),
            Some((ANALYZING_PROGRESS, "Analyzing input".into())),
        )?;
        let analysis = match self.inner.analyzer.analyze(&input, &workflow_config).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(job_id, error = %e, "analysis failed, planning without it");
                Analysis::new()
            }
        };

        checkpoint()?;
        self.progress(job_id, PLANNING_PROGRESS, "Planning workflow");
        let tasks = self
            .inner
            .planner
            .plan(&PlanRequest {
                input,
                workflow_config,
                analysis,
            })
            .await?;
        let plan = self.inner.selector.plan(tasks)?;
        info!(
            job_id,
            tasks = plan.tasks.len(),
            groups = plan.groups.len(),
            estimated_cost = plan.total_estimated_cost,
            "plan accepted"
        );

        checkpoint()?;
        let total_groups = plan.groups.len();
        self.apply(
            job_id,
            Transition::Advance(JobStatus::Processing),
            Some((
                PROCESSING_PROGRESS,
                format!("Processing group 1/{total_groups}"),
            )),
        )?;

        let report = self
            .inner
            .scheduler
            .execute(&plan, cancel, |group| self.record_group(job_id, group))
            .await
            .map_err(|e| match e {
                ScheduleError::Cancelled { .. } => Halt::Cancelled,
                ScheduleError::Failed { error, .. } => Halt::Failed(JobError::from(error)),
            })?;

        checkpoint()?;
        self.apply(
            job_id,
            Transition::Advance(JobStatus::QualityCheck),
            Some((QUALITY_PROGRESS, "Assessing quality".into())),
        )?;
        self.progress(job_id, COMPILING_PROGRESS, "Compiling final results");
        Ok(self.compile(report))
    }

    fn compile(&self, report: ExecutionReport) -> FinalResult {
        let scores: Vec<f64> = report.steps.iter().map(|s| s.quality).collect();
        let average_quality = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        FinalResult {
            quality_score: self
                .inner
                .assessor
                .assess_final(&scores, report.skipped.is_empty()),
            total_steps: report.steps.len() + report.skipped.len(),
            successful_steps: report.steps.len(),
            total_cost: report.steps.iter().map(|s| s.cost).sum(),
            total_execution_time_secs: report
                .steps
                .iter()
                .map(|s| s.duration.as_secs_f64())
                .sum(),
            average_quality,
            skipped_tasks: report.skipped,
            outputs: report.outputs,
        }
    }

    /// Appends the group's steps. Progress only moves for a group that completed.
    fn record_group(&self, job_id: &str, group: &GroupReport) {
        if !group.completed && group.steps.is_empty() {
            return;
        }
        let done = group.index + 1;
        let advance = group.completed.then(|| {
            let progress =
                PROCESSING_PROGRESS as usize + PROCESSING_SPAN * done / group.total.max(1);
            let step = if done < group.total {
                format!("Processing group {}/{}", done + 1, group.total)
            } else {
                format!("Processed {} groups", group.total)
            };
            (progress.min(100) as u8, step)
        });

        self.update(job_id, |job| {
            for result in &group.steps {
                job.push_step(StepRecord {
                    step: 0,
                    task_id: result.task_id.clone(),
                    tool: result.tool.clone(),
                    quality_score: result.quality,
                    execution_time_secs: result.duration.as_secs_f64(),
                    cost: result.cost,
                    fallback_used: result.fallback_used,
                    timestamp: Utc::now(),
                });
            }
            if let Some((progress, step)) = advance {
                job.set_progress(progress, step);
            }
        });
    }

    fn progress(&self, job_id: &str, progress: u8, step: &str) {
        self.update(job_id, |job| job.set_progress(progress, step));
    }

    /// Applies a status transition, optionally moving progress forward.
    fn apply(
        &self,
        job_id: &str,
        transition: Transition,
        progress: Option<(u8, String)>,
    ) -> Result<(), Halt> {
        self.update(job_id, |job| {
            StateMachine::apply(job, transition)?;
            if let Some((progress, step)) = progress {
                job.set_progress(progress, step);
            }
            Ok::<(), CadenzaError>(())
        })
        .unwrap_or_else(|| Err(CadenzaError::JobNotFound(job_id.to_string())))
        .map_err(Halt::from)
    }

    fn update<R>(&self, job_id: &str, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.update_entry(job_id, |entry| f(&mut entry.job))
    }

    /// Mutates a job under its entry lock, then notifies the sink once the
    /// lock is released.
    fn update_entry<R>(&self, job_id: &str, f: impl FnOnce(&mut JobEntry) -> R) -> Option<R> {
        let (result, event) = {
            let mut guard = self.inner.jobs.get_mut(job_id)?;
            let entry = &mut *guard;
            let before = (entry.job.status, entry.job.progress);
            let result = f(&mut *entry);
            let job = &entry.job;
            entry.status_tx.send_replace(job.status);
            let event = JobEvent {
                job_id: job.id.clone(),
                status: job.status,
                progress: job.progress,
                current_step: job.current_step.clone(),
                milestone: is_milestone(before, (job.status, job.progress)),
                error: job.error.clone(),
                final_result: job.final_result.clone(),
                at: job.updated_at,
            };
            (result, event)
        };

        if let Err(e) = self.inner.sink.notify(&event) {
            warn!(job_id, error = %e, "notification delivery failed");
        }
        Some(result)
    }

    fn read_entry<R>(&self, job_id: &str, f: impl FnOnce(&JobEntry) -> R) -> Option<R> {
        self.inner.jobs.get(job_id).map(|entry| f(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::adapter::{AdapterError, ToolOutput, ToolRequest};
    use crate::catalog::ToolDescriptor;
    use crate::config::BackoffConfig;
    use crate::notify::{ChannelSink, NotifyError};

    fn config() -> CadenzaConfig {
        CadenzaConfig {
            backoff: BackoffConfig::immediate(),
            ..CadenzaConfig::default()
        }
    }

    fn workflow(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("workflow must be an object"),
        }
    }

    /// Counts calls and fails with a fixed status, or succeeds when `None`.
    struct CountingAdapter {
        calls: AtomicUsize,
        fail_with: Option<u16>,
    }

    impl CountingAdapter {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_with: None,
            })
        }

        fn failing(status: u16) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_with: Some(status),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ToolAdapter for CountingAdapter {
        async fn call(&self, request: &ToolRequest) -> Result<ToolOutput, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(status) => Err(AdapterError::Api {
                    status,
                    message: "nope".into(),
                }),
                None => {
                    let mut out = ToolOutput::new();
                    out.insert("by".into(), json!(request.tool));
                    Ok(out)
                }
            }
        }
    }

    /// Three single-tool formats so each task has exactly one candidate.
    fn abc_catalog() -> Arc<ToolCatalog> {
        let tool = |name: &str| {
            ToolDescriptor::new(name, "processing")
                .formats(&[name], &[name])
                .attempts(2)
        };
        Arc::new(ToolCatalog::new(vec![tool("ta"), tool("tb"), tool("tc")]).unwrap())
    }

    fn abc_tasks() -> Map<String, Value> {
        workflow(json!({
            "type": "tasks",
            "tasks": [
                {"id": "A", "name": "A", "input_format": "ta", "output_format": "ta"},
                {"id": "B", "name": "B", "dependencies": ["A"], "input_format": "tb", "output_format": "tb"},
                {"id": "C", "name": "C", "dependencies": ["A", "B"], "input_format": "tc", "output_format": "tc"}
            ]
        }))
    }

    #[tokio::test]
    async fn preset_job_completes() {
        let orch = Orchestrator::builder(config())
            .simulate(Duration::ZERO)
            .build();
        let id = orch.create_job(
            "user-1",
            "upload-1",
            workflow(json!({"type": "preset", "preset": "standard_mastering"})),
        );

        let view = orch.wait(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress, 100);
        assert_eq!(view.steps.len(), 3);
        assert_eq!(view.steps[2].step, 2);
        assert!(view.estimated_completion.is_none());

        let result = view.final_result.unwrap();
        assert_eq!(result.successful_steps, 3);
        assert!((0.0..=1.0).contains(&result.quality_score));
        assert!(result.outputs.contains_key("step3"));
        assert_eq!(orch.usage().values().map(|u| u.count).sum::<u64>(), 3);
    }

    #[tokio::test]
    async fn failing_root_task_fails_job_with_no_steps() {
        let a = CountingAdapter::failing(503);
        let b = CountingAdapter::ok();
        let c = CountingAdapter::ok();
        let orch = Orchestrator::builder(config())
            .catalog(abc_catalog())
            .adapter("ta", a.clone())
            .adapter("tb", b.clone())
            .adapter("tc", c.clone())
            .build();

        let id = orch.create_job("u", "in", abc_tasks());
        let view = orch.wait(&id).await.unwrap();

        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.steps.is_empty());
        let err = view.error.unwrap();
        assert_eq!(err.kind, "tool_unavailable");
        assert_eq!(err.task_id.as_deref(), Some("A"));
        assert_eq!(err.tools_attempted, vec!["ta"]);
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls() + c.calls(), 0);
    }

    #[tokio::test]
    async fn failing_group_does_not_advance_progress() {
        let (sink, mut events) = ChannelSink::channel();
        let orch = Orchestrator::builder(config())
            .catalog(abc_catalog())
            .adapter("ta", CountingAdapter::ok())
            .adapter("tb", CountingAdapter::failing(503))
            .adapter("tc", CountingAdapter::ok())
            .sink(Arc::new(sink))
            .build();

        let id = orch.create_job("u", "in", abc_tasks());
        let view = orch.wait(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.steps.len(), 1);
        // only group 1 of 3 completed
        assert_eq!(view.progress, 40);

        drop(orch);
        let mut max_progress = 0;
        while let Ok(event) = events.try_recv() {
            max_progress = max_progress.max(event.progress);
        }
        assert_eq!(max_progress, 40);
    }

    #[tokio::test]
    async fn rejected_input_fails_job_without_fallback() {
        let primary = CountingAdapter::failing(422);
        let spare = CountingAdapter::ok();
        let catalog = Arc::new(
            ToolCatalog::new(vec![
                ToolDescriptor::new("ta", "processing")
                    .formats(&["ta"], &["ta"])
                    .attempts(3)
                    .fallbacks(&["spare"]),
                ToolDescriptor::new("spare", "processing").formats(&["sp"], &["sp"]),
            ])
            .unwrap(),
        );
        let orch = Orchestrator::builder(config())
            .catalog(catalog)
            .adapter("ta", primary.clone())
            .adapter("spare", spare.clone())
            .build();

        let id = orch.create_job(
            "u",
            "in",
            workflow(json!({
                "type": "tasks",
                "tasks": [{"id": "A", "name": "A", "input_format": "ta", "output_format": "ta"}]
            })),
        );
        let view = orch.wait(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        let err = view.error.unwrap();
        assert_eq!(err.kind, "invalid_input");
        assert_eq!(err.tools_attempted, vec!["ta"]);
        assert_eq!(primary.calls(), 1);
        assert_eq!(spare.calls(), 0);
    }

    #[tokio::test]
    async fn cycle_fails_before_any_call() {
        let a = CountingAdapter::ok();
        let orch = Orchestrator::builder(config())
            .catalog(abc_catalog())
            .adapter("ta", a.clone())
            .build();
        let id = orch.create_job(
            "u",
            "in",
            workflow(json!({
                "type": "tasks",
                "tasks": [
                    {"id": "x", "name": "x", "dependencies": ["y"], "input_format": "ta", "output_format": "ta"},
                    {"id": "y", "name": "y", "dependencies": ["x"], "input_format": "ta", "output_format": "ta"}
                ]
            })),
        );

        let view = orch.wait(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.unwrap().kind, "dependency_cycle");
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn auth_failure_keeps_earlier_steps() {
        let orch = Orchestrator::builder(config())
            .catalog(abc_catalog())
            .adapter("ta", CountingAdapter::ok())
            .adapter("tb", CountingAdapter::failing(401))
            .adapter("tc", CountingAdapter::ok())
            .build();

        let id = orch.create_job("u", "in", abc_tasks());
        let view = orch.wait(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.unwrap().kind, "auth_failed");
        assert_eq!(view.steps.len(), 1);
        assert_eq!(view.steps[0].task_id, "A");
    }

    #[tokio::test]
    async fn cancel_lets_running_group_finish() {
        let catalog = abc_catalog();
        let slow = || -> Arc<dyn ToolAdapter> {
            Arc::new(SimulatedAdapter::new().with_latency(Duration::from_millis(50)))
        };
        let c = Arc::new(SimulatedAdapter::new());
        let (sink, mut events) = ChannelSink::channel();
        let orch = Orchestrator::builder(config())
            .catalog(catalog)
            .adapter("ta", slow())
            .adapter("tb", slow())
            .adapter("tc", c.clone())
            .sink(Arc::new(sink))
            .build();

        let id = orch.create_job("u", "in", abc_tasks());
        assert!(!orch.evict(&id));
        // group 1 of 3 finished: B is now in flight
        while let Some(event) = events.recv().await {
            if event.progress == 40 {
                break;
            }
        }
        assert!(orch.cancel(&id));

        let view = orch.wait(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);
        assert_eq!(view.cancel_reason.as_deref(), Some("cancelled by caller"));
        assert_eq!(view.steps.len(), 2);
        assert_eq!(c.calls(), 0);
        assert!(!orch.cancel(&id));
    }

    #[tokio::test]
    async fn unknown_jobs() {
        let orch = Orchestrator::builder(config()).build();
        assert!(!orch.cancel("missing"));
        assert!(!orch.evict("missing"));
        assert!(matches!(
            orch.status("missing"),
            Err(CadenzaError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn status_is_idempotent_and_evictable() {
        let orch = Orchestrator::builder(config())
            .simulate(Duration::ZERO)
            .build();
        let id = orch.create_job("u", "in", Map::new());
        orch.wait(&id).await.unwrap();

        assert_eq!(orch.status(&id).unwrap(), orch.status(&id).unwrap());
        assert_eq!(orch.list_jobs().len(), 1);
        assert!(orch.evict(&id));
        assert!(orch.list_jobs().is_empty());
        assert!(orch.status(&id).is_err());
    }

    #[tokio::test]
    async fn notifications_track_progress() {
        let (sink, mut events) = ChannelSink::channel();
        let orch = Orchestrator::builder(config())
            .simulate(Duration::ZERO)
            .sink(Arc::new(sink))
            .build();
        let id = orch.create_job(
            "u",
            "in",
            workflow(json!({"type": "preset", "preset": "vocal_enhancement"})),
        );
        orch.wait(&id).await.unwrap();
        drop(orch);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.windows(2).all(|w| w[0].progress <= w[1].progress));
        let last = seen.last().unwrap();
        assert_eq!(last.status, JobStatus::Completed);
        assert!(last.milestone);
        assert!(last.final_result.is_some());
        assert!(seen.iter().any(|e| e.milestone && e.progress == 40));
    }

    /// Cancels a job from inside the notification of its quality check.
    struct CancelOnQualityCheck {
        orch: OnceLock<Orchestrator>,
        accepted: AtomicBool,
    }

    impl NotificationSink for CancelOnQualityCheck {
        fn notify(&self, event: &JobEvent) -> Result<(), NotifyError> {
            if event.status == JobStatus::QualityCheck {
                if let Some(orch) = self.orch.get() {
                    if orch.cancel(&event.job_id) {
                        self.accepted.store(true, Ordering::SeqCst);
                    }
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_during_quality_check_is_honoured() {
        let sink = Arc::new(CancelOnQualityCheck {
            orch: OnceLock::new(),
            accepted: AtomicBool::new(false),
        });
        let orch = Orchestrator::builder(config())
            .simulate(Duration::ZERO)
            .sink(sink.clone())
            .build();
        assert!(sink.orch.set(orch.clone()).is_ok());

        let id = orch.create_job("u", "in", Map::new());
        let view = orch.wait(&id).await.unwrap();
        assert!(sink.accepted.load(Ordering::SeqCst));
        assert_eq!(view.status, JobStatus::Cancelled);
        assert_eq!(view.cancel_reason.as_deref(), Some("cancelled by caller"));
        assert!(view.final_result.is_none());
        assert!(!orch.cancel(&id));
    }

    struct BrokenSink;

    impl NotificationSink for BrokenSink {
        fn notify(&self, _event: &JobEvent) -> Result<(), NotifyError> {
            Err(NotifyError::Other("webhook down".into()))
        }
    }

    #[tokio::test]
    async fn sink_failures_do_not_affect_jobs() {
        let orch = Orchestrator::builder(config())
            .simulate(Duration::ZERO)
            .sink(Arc::new(BrokenSink))
            .build();
        let id = orch.create_job("u", "in", Map::new());
        assert_eq!(orch.wait(&id).await.unwrap().status, JobStatus::Completed);
    }
}
