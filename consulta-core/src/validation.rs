//! Stateless shaping of lookup inputs and provider outputs.

/// Check-digit algorithms and masking for regulated identifiers.
pub mod documents;
/// Canonical records built from provider payloads.
pub mod normalize;
/// Declarative per-service input rules.
pub mod rules;
/// Redaction of canonical records before they leave the engine.
pub mod sanitize;

pub use documents::*;
pub use normalize::*;
pub use rules::*;
pub use sanitize::*;
