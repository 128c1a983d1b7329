use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::error::AdapterError;
use super::types::{ToolOutput, ToolRequest};
use super::ToolAdapter;

type FailureFn = Box<dyn Fn() -> AdapterError + Send + Sync>;

/// In-process stand-in for an external tool.
///
/// Sleeps for `latency`, then pops the next scripted failure if any, or
/// fails with the persistent failure if one is set, or succeeds with a
/// synthetic artifact reference.
pub struct SimulatedAdapter {
    latency: Duration,
    script: Mutex<VecDeque<AdapterError>>,
    persistent: Option<FailureFn>,
    calls: AtomicUsize,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            persistent: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queues one failure; queued failures are returned before anything else.
    pub fn then_fail(self, error: AdapterError) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
        self
    }

    /// Every call (after the script runs out) fails with `make()`.
    pub fn always_fail(mut self, make: impl Fn() -> AdapterError + Send + Sync + 'static) -> Self {
        self.persistent = Some(Box::new(make));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolAdapter for SimulatedAdapter {
    async fn call(&self, request: &ToolRequest) -> Result<ToolOutput, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        if let Some(make) = &self.persistent {
            return Err(make());
        }

        let mut output = ToolOutput::new();
        output.insert(
            "artifact".into(),
            json!(format!("sim://{}/{}", request.tool, request.task_id)),
        );
        output.insert("processed_by".into(), json!(request.tool));
        Ok(output)
    }
}
