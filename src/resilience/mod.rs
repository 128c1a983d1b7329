//! Shared, thread-safe guards around external tools.
//!
//! All three structures keep their per-tool state in a `DashMap` keyed by
//! tool name, so jobs hitting different tools rarely contend.

mod circuit_breaker;
mod cost_tracker;
mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use cost_tracker::{CostTracker, ToolUsage};
pub use rate_limiter::RateLimiter;
