use std::collections::BTreeMap;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

/// Accumulated usage of one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolUsage {
    pub count: u64,
    pub total_cost: f64,
    pub total_time_secs: f64,
}

/// Per-tool usage counters shared by every job.
#[derive(Debug, Default)]
pub struct CostTracker {
    usage: DashMap<String, ToolUsage>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tool: &str, cost: f64, elapsed: Duration) {
        let mut u = self.usage.entry(tool.to_string()).or_default();
        u.count += 1;
        u.total_cost += cost;
        u.total_time_secs += elapsed.as_secs_f64();
    }

    pub fn usage(&self, tool: &str) -> ToolUsage {
        self.usage
            .get(tool)
            .map(|u| u.value().clone())
            .unwrap_or_default()
    }

    /// Usage of every tool seen so far, sorted by tool name.
    pub fn snapshot(&self) -> BTreeMap<String, ToolUsage> {
        self.usage
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn total_cost(&self) -> f64 {
        self.snapshot().values().map(|u| u.total_cost).sum()
    }
}
