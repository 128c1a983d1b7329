use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{ToolAdapter, ToolOutput, ToolRequest};
use crate::catalog::{ToolCatalog, ToolDescriptor};
use crate::config::{BackoffConfig, CadenzaConfig};
use crate::error::{ErrorClass, RecoveryStrategy, ToolFailure};
use crate::resilience::{CircuitBreaker, CircuitState, CostTracker, RateLimiter};
use crate::selector::TaskPlan;
use crate::task::Task;

/// A successful task execution.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: String,
    pub output: ToolOutput,
    pub cost: f64,
    pub duration: Duration,
    /// Attempts across every tool in the chain, including the successful one.
    pub attempts: u32,
    pub tools_attempted: Vec<String>,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// Every tool in the chain was tried and failed.
    #[error("{0}")]
    Exhausted(ToolFailure),

    /// A fatal class (authentication) stopped the chain; the job must fail.
    #[error("aborted: {0}")]
    Aborted(ToolFailure),

    /// The input was rejected; retrying or falling back cannot help.
    #[error("skipped: {0}")]
    Skipped(ToolFailure),

    #[error("task '{task_id}' cancelled")]
    Cancelled {
        task_id: String,
        tools_attempted: Vec<String>,
    },
}

impl InvokeError {
    pub fn failure(&self) -> Option<&ToolFailure> {
        match self {
            InvokeError::Exhausted(f) | InvokeError::Aborted(f) | InvokeError::Skipped(f) => {
                Some(f)
            }
            InvokeError::Cancelled { .. } => None,
        }
    }
}

/// Result of driving one tool through its attempt budget.
enum ToolOutcome {
    Success {
        output: ToolOutput,
        elapsed: Duration,
        attempts: u32,
    },
    /// Budget spent or tool unusable; move on to the next tool.
    Failed {
        class: ErrorClass,
        message: String,
        attempts: u32,
    },
    Abort {
        class: ErrorClass,
        message: String,
    },
    Skip {
        class: ErrorClass,
        message: String,
    },
    Cancelled,
}

/// One failed attempt against a tool.
struct AttemptError {
    class: ErrorClass,
    message: String,
    /// Wait the tool asked for before the next attempt.
    retry_after: Option<Duration>,
}

impl AttemptError {
    fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
        }
    }
}

/// Upper bound on a server-requested `retry-after` wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Executes tasks against external tools with retry, backoff, rate limiting,
/// circuit breaking and fallback chains.
///
/// One invoker is shared by every job; the global semaphore bounds the
/// number of external calls in flight across all of them.
pub struct ToolInvoker {
    catalog: Arc<ToolCatalog>,
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    costs: CostTracker,
    permits: Semaphore,
    backoff: BackoffConfig,
}

impl ToolInvoker {
    pub fn new(catalog: Arc<ToolCatalog>, config: &CadenzaConfig) -> Self {
        Self {
            limiter: RateLimiter::from_catalog(&catalog),
            breaker: CircuitBreaker::new(&config.circuit_breaker),
            costs: CostTracker::new(),
            permits: Semaphore::new(config.max_concurrent_calls.max(1)),
            backoff: config.backoff.clone(),
            adapters: HashMap::new(),
            catalog,
        }
    }

    pub fn with_adapter(mut self, tool: impl Into<String>, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.adapters.insert(tool.into(), adapter);
        self
    }

    pub fn with_adapters(mut self, adapters: HashMap<String, Arc<dyn ToolAdapter>>) -> Self {
        self.adapters.extend(adapters);
        self
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    /// Runs a planned task: primary, then its ranked fallbacks, then the
    /// primary's static fallback chain. Each tool is tried at most once.
    pub async fn invoke(
        &self,
        plan: &TaskPlan,
        input: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Invocation, InvokeError> {
        let mut chain: Vec<String> = plan.ranked_tools().map(String::from).collect();
        if let Some(primary) = self.catalog.get(&plan.primary.tool) {
            chain.extend(primary.fallbacks.iter().cloned());
        }
        self.run_chain(&plan.task, chain, &input, cancel).await
    }

    /// Runs `task` on `tool`, walking that tool's static fallbacks if it fails.
    pub async fn invoke_tool(
        &self,
        tool: &str,
        task: &Task,
        input: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Invocation, InvokeError> {
        let mut chain = vec![tool.to_string()];
        if let Some(desc) = self.catalog.get(tool) {
            chain.extend(desc.fallbacks.iter().cloned());
        }
        self.run_chain(task, chain, &input, cancel).await
    }

    async fn run_chain(
        &self,
        task: &Task,
        chain: Vec<String>,
        input: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Invocation, InvokeError> {
        let mut seen = Vec::with_capacity(chain.len());
        for name in chain {
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
        let primary = seen.first().cloned().unwrap_or_default();

        let mut tried: Vec<String> = Vec::new();
        let mut total_attempts = 0u32;
        let mut last: Option<(ErrorClass, String)> = None;

        for name in &seen {
            let Some(desc) = self.catalog.get(name) else {
                warn!(task_id = %task.id, tool = %name, "fallback names an unknown tool, skipping");
                continue;
            };
            if !tried.is_empty() {
                info!(task_id = %task.id, tool = %name, "falling back");
            }
            tried.push(name.clone());

            let failure = |class: ErrorClass, message: String, tried: &[String]| ToolFailure {
                task_id: task.id.clone(),
                class,
                tools_attempted: tried.to_vec(),
                message,
            };

            match self.try_tool(desc, task, input, cancel).await {
                ToolOutcome::Success {
                    output,
                    elapsed,
                    attempts,
                } => {
                    let cost = desc.estimate_cost(task.duration_secs());
                    self.costs.record(name, cost, elapsed);
                    return Ok(Invocation {
                        tool: name.clone(),
                        output,
                        cost,
                        duration: elapsed,
                        attempts: total_attempts + attempts,
                        fallback_used: *name != primary,
                        tools_attempted: tried,
                    });
                }
                ToolOutcome::Failed {
                    class,
                    message,
                    attempts,
                } => {
                    total_attempts += attempts;
                    last = Some((class, message));
                }
                ToolOutcome::Abort { class, message } => {
                    return Err(InvokeError::Aborted(failure(class, message, &tried)));
                }
                ToolOutcome::Skip { class, message } => {
                    return Err(InvokeError::Skipped(failure(class, message, &tried)));
                }
                ToolOutcome::Cancelled => {
                    return Err(InvokeError::Cancelled {
                        task_id: task.id.clone(),
                        tools_attempted: tried,
                    });
                }
            }
        }

        let (class, message) = last.unwrap_or_else(|| {
            (
                ErrorClass::Unavailable,
                "no usable tool in the fallback chain".to_string(),
            )
        });
        Err(InvokeError::Exhausted(ToolFailure {
            task_id: task.id.clone(),
            class,
            tools_attempted: tried,
            message,
        }))
    }

    /// Drives one tool through its attempt budget.
    async fn try_tool(
        &self,
        desc: &ToolDescriptor,
        task: &Task,
        input: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let name = desc.name.as_str();

        let Some(adapter) = self.adapters.get(name) else {
            return ToolOutcome::Failed {
                class: ErrorClass::Unavailable,
                message: format!("no adapter configured for '{name}'"),
                attempts: 0,
            };
        };

        let trial = match self.breaker.check(name) {
            CircuitState::Open => {
                debug!(tool = name, "circuit open, skipping tool");
                return ToolOutcome::Failed {
                    class: ErrorClass::Unavailable,
                    message: format!("circuit open for '{name}'"),
                    attempts: 0,
                };
            }
            CircuitState::HalfOpen => true,
            CircuitState::Closed => false,
        };
        let max_attempts = if trial { 1 } else { desc.max_attempts.max(1) };

        let request = ToolRequest::new(name, task.id.clone(), input.clone());
        let mut attempt = 0u32;
        let mut reached_tool = false;

        loop {
            if cancel.is_cancelled() {
                if trial && !reached_tool {
                    self.breaker.abandon_trial(name);
                }
                return ToolOutcome::Cancelled;
            }

            let result = if self.limiter.try_acquire(name) {
                reached_tool = true;
                self.call_once(desc, adapter.as_ref(), &request).await
            } else {
                Err(AttemptError::new(
                    ErrorClass::RateLimited,
                    format!("local rate limit reached for '{name}'"),
                ))
            };

            let AttemptError {
                class,
                message,
                retry_after,
            } = match result {
                Ok((output, elapsed)) => {
                    self.breaker.record_success(name);
                    return ToolOutcome::Success {
                        output,
                        elapsed,
                        attempts: attempt + 1,
                    };
                }
                Err(e) => e,
            };

            let policy = class.policy();
            warn!(
                tool = name,
                task_id = %task.id,
                attempt = attempt + 1,
                class = %class,
                error = %message,
                "tool attempt failed"
            );

            match policy.strategy {
                RecoveryStrategy::Abort => {
                    self.settle_failure(name, trial, reached_tool);
                    return ToolOutcome::Abort { class, message };
                }
                RecoveryStrategy::Skip => {
                    if trial {
                        self.breaker.abandon_trial(name);
                    }
                    return ToolOutcome::Skip { class, message };
                }
                RecoveryStrategy::Retry | RecoveryStrategy::Fallback => {}
            }

            if attempt + 1 >= max_attempts || attempt >= policy.max_retries {
                self.settle_failure(name, trial, reached_tool);
                return ToolOutcome::Failed {
                    class,
                    message,
                    attempts: attempt + 1,
                };
            }

            let delay = self.backoff_delay(attempt, policy.retry_delay, retry_after);
            debug!(tool = name, task_id = %task.id, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::select! {
                _ = cancel.cancelled() => {
                    // budget not spent: nothing to report
                    if trial {
                        self.breaker.abandon_trial(name);
                    }
                    return ToolOutcome::Cancelled;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// One external call under a global permit and the tool's hard timeout.
    async fn call_once(
        &self,
        desc: &ToolDescriptor,
        adapter: &dyn ToolAdapter,
        request: &ToolRequest,
    ) -> Result<(ToolOutput, Duration), AttemptError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AttemptError::new(ErrorClass::Unavailable, "invoker is shutting down"))?;

        let started = Instant::now();
        match tokio::time::timeout(desc.timeout_duration(), adapter.call(request)).await {
            Ok(Ok(output)) => Ok((output, started.elapsed())),
            Ok(Err(e)) => Err(AttemptError {
                class: e.class(),
                message: e.to_string(),
                retry_after: e.retry_after(),
            }),
            Err(_) => Err(AttemptError::new(
                ErrorClass::Timeout,
                format!("no response within {}s", desc.timeout_secs),
            )),
        }
    }

    /// Reports an exhausted tool to the breaker, or frees a trial that never
    /// reached the tool.
    fn settle_failure(&self, tool: &str, trial: bool, reached_tool: bool) {
        if reached_tool {
            self.breaker.record_failure(tool);
        } else if trial {
            self.breaker.abandon_trial(tool);
        }
    }

    /// Exponential delay, never shorter than what the tool asked for, plus jitter.
    fn backoff_delay(
        &self,
        attempt: u32,
        class_floor: Duration,
        retry_after: Option<Duration>,
    ) -> Duration {
        let mut base = self.backoff.delay_for_attempt(attempt, class_floor);
        if let Some(wait) = retry_after {
            base = base.max(wait.min(MAX_RETRY_AFTER));
        }
        if self.backoff.max_jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..self.backoff.max_jitter_ms);
        base + Duration::from_millis(jitter)
    }
}
