use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

use crate::catalog::{RateLimit, ToolCatalog};

/// Request timestamps for each configured limit of one tool, oldest first.
type Windows = Vec<VecDeque<Instant>>;

/// Per-tool sliding-window admission control.
///
/// A tool may carry several named limits (per minute, per hour, ...); a
/// request is admitted only when every one of them has room. Tools without
/// configured limits are always admitted.
#[derive(Debug, Default)]
pub struct RateLimiter {
    limits: HashMap<String, Vec<RateLimit>>,
    windows: DashMap<String, Windows>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_catalog(catalog: &ToolCatalog) -> Self {
        catalog
            .iter()
            .filter(|t| !t.rate_limits.is_empty())
            .fold(Self::new(), |limiter, t| {
                limiter.with_limits(&t.name, t.rate_limits.clone())
            })
    }

    pub fn with_limits(mut self, tool: &str, limits: Vec<RateLimit>) -> Self {
        self.limits.insert(tool.to_string(), limits);
        self
    }

    pub fn admit(&self, tool: &str) -> bool {
        self.admit_at(tool, Instant::now())
    }

    pub fn record(&self, tool: &str) {
        self.record_at(tool, Instant::now())
    }

    pub fn try_acquire(&self, tool: &str) -> bool {
        self.try_acquire_at(tool, Instant::now())
    }

    /// True iff every limit of `tool` is below its threshold at `now`.
    pub fn admit_at(&self, tool: &str, now: Instant) -> bool {
        let Some(limits) = self.limits.get(tool) else {
            return true;
        };
        let mut windows = self.windows.entry(tool.to_string()).or_default();
        has_room(limits, &mut windows, now)
    }

    /// Appends `now` to every window of `tool`.
    pub fn record_at(&self, tool: &str, now: Instant) {
        let Some(limits) = self.limits.get(tool) else {
            return;
        };
        let mut windows = self.windows.entry(tool.to_string()).or_default();
        prune(limits, &mut windows, now);
        windows.iter_mut().for_each(|w| w.push_back(now));
    }

    /// Admits and records under the tool's entry lock, so concurrent callers
    /// cannot both take the last slot.
    pub fn try_acquire_at(&self, tool: &str, now: Instant) -> bool {
        let Some(limits) = self.limits.get(tool) else {
            return true;
        };
        let admitted = {
            let mut windows = self.windows.entry(tool.to_string()).or_default();
            let room = has_room(limits, &mut windows, now);
            if room {
                windows.iter_mut().for_each(|w| w.push_back(now));
            }
            room
        };
        if !admitted {
            debug!(tool, "rate limit reached");
        }
        admitted
    }
}

fn prune(limits: &[RateLimit], windows: &mut Windows, now: Instant) {
    if windows.len() != limits.len() {
        windows.resize_with(limits.len(), VecDeque::new);
    }
    for (limit, window) in limits.iter().zip(windows.iter_mut()) {
        let span = limit.window();
        while window
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= span)
        {
            window.pop_front();
        }
    }
}

fn has_room(limits: &[RateLimit], windows: &mut Windows, now: Instant) -> bool {
    prune(limits, windows, now);
    limits
        .iter()
        .zip(windows.iter())
        .all(|(limit, window)| window.len() < limit.max_requests as usize)
}
