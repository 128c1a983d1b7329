use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Default)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-tool failure guard: Closed -> Open after `failure_threshold`
/// consecutive failures, Open -> HalfOpen once the cooldown has elapsed.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    circuits: DashMap<String, Circuit>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(&BreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            circuits: DashMap::new(),
        }
    }

    pub fn check(&self, tool: &str) -> CircuitState {
        self.check_at(tool, Instant::now())
    }

    /// Decides whether a call to `tool` may proceed.
    ///
    /// `Closed`: go ahead. `HalfOpen`: the caller holds the single trial call
    /// and must report its outcome (or [`abandon_trial`](Self::abandon_trial)).
    /// `Open`: rejected, including every other caller while a trial is running.
    pub fn check_at(&self, tool: &str, now: Instant) -> CircuitState {
        let mut entry = self.circuits.entry(tool.to_string()).or_default();
        let c = &mut *entry;
        match c.state {
            CircuitState::Closed => CircuitState::Closed,
            CircuitState::Open => {
                let cooled = c
                    .last_failure
                    .is_none_or(|t| now.saturating_duration_since(t) >= self.cooldown);
                if cooled {
                    info!(tool, "circuit half-open, allowing one trial call");
                    c.state = CircuitState::HalfOpen;
                    c.trial_in_flight = true;
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            CircuitState::HalfOpen if c.trial_in_flight => CircuitState::Open,
            CircuitState::HalfOpen => {
                c.trial_in_flight = true;
                CircuitState::HalfOpen
            }
        }
    }

    pub fn record_success(&self, tool: &str) {
        let mut c = self.circuits.entry(tool.to_string()).or_default();
        if c.state != CircuitState::Closed {
            info!(tool, "circuit closed");
        }
        *c = Circuit::default();
    }

    pub fn record_failure(&self, tool: &str) {
        self.record_failure_at(tool, Instant::now())
    }

    pub fn record_failure_at(&self, tool: &str, now: Instant) {
        let mut entry = self.circuits.entry(tool.to_string()).or_default();
        let c = &mut *entry;
        c.failure_count = c.failure_count.saturating_add(1);
        c.last_failure = Some(now);
        c.trial_in_flight = false;
        match c.state {
            CircuitState::HalfOpen => {
                warn!(tool, "trial call failed, circuit re-opened");
                c.state = CircuitState::Open;
            }
            CircuitState::Closed if c.failure_count >= self.failure_threshold => {
                warn!(tool, failures = c.failure_count, "circuit opened");
                c.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Releases a trial slot without an outcome, e.g. the trial call never
    /// reached the tool. The next check may claim the trial again.
    pub fn abandon_trial(&self, tool: &str) {
        if let Some(mut c) = self.circuits.get_mut(tool) {
            if c.state == CircuitState::HalfOpen {
                c.trial_in_flight = false;
            }
        }
    }

    /// Current state without triggering the Open -> HalfOpen transition.
    pub fn state(&self, tool: &str) -> CircuitState {
        self.circuits
            .get(tool)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    pub fn failure_count(&self, tool: &str) -> u32 {
        self.circuits.get(tool).map(|c| c.failure_count).unwrap_or(0)
    }
}
