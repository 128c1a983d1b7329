//! Cadenza turns one request into a dependency-ordered set of tasks, assigns
//! each task a scored external tool with ranked fallbacks, runs the tasks
//! in parallel groups under per-tool rate limits and circuit breakers, and
//! reports per-step cost and quality.
//!
//! ```text
//! Orchestrator::create_job
//!   -> InputAnalyzer -> Planner            (task list)
//!   -> ToolSelector::plan                  (DAG check, tools, groups)
//!   -> TaskScheduler::execute              (group by group)
//!        -> ToolInvoker::invoke            (breaker, limiter, retry, fallback)
//!   -> QualityAssessor                     (final result)
//! ```

pub mod adapter;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod invoker;
pub mod notify;
pub mod orchestrator;
pub mod planner;
pub mod quality;
pub mod resilience;
pub mod scheduler;
pub mod selector;
pub mod state_machine;
pub mod task;
pub mod ui;

pub use catalog::{ToolCatalog, ToolDescriptor};
pub use config::CadenzaConfig;
pub use error::{CadenzaError, ErrorClass};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use selector::{ExecutionPlan, ToolSelector};
pub use state_machine::{Job, JobStatus, JobView};
pub use task::Task;
