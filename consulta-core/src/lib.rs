//! Core types and service wiring for the consulta lookup engine.

/// Audit records and sinks.
pub mod audit;
/// Balance ledger, per-user serialization, and billing event listener.
pub mod billing;
/// Engine configuration loaded from TOML.
pub mod config;
/// Domain models and identifiers shared by all providers.
pub mod model;
/// Registry and lifecycle handling for provider plugins.
pub mod plugin;
/// Traits describing the plugin contract and external collaborators.
pub mod ports;
/// Rate limiting, circuit breaking, retries, and fallback chains.
pub mod resilience;
/// High-level dispatcher used by callers.
pub mod service;
/// Input validation, output normalization, and sanitization.
pub mod validation;

pub use audit::*;
pub use billing::*;
pub use config::*;
pub use model::*;
pub use plugin::*;
pub use ports::*;
pub use resilience::*;
pub use service::*;
pub use validation::*;
