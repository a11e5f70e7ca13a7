//! Guards wrapped around every outbound provider call.

/// Per-service circuit breakers.
pub mod circuit_breaker;
/// Controller combining limits, breakers, retries, timeouts, and fallbacks.
pub mod controller;
/// Fixed-window rate limiting per service.
pub mod rate_limit;
/// Exponential backoff policy.
pub mod retry;

pub use circuit_breaker::*;
pub use controller::*;
pub use rate_limit::*;
pub use retry::*;
