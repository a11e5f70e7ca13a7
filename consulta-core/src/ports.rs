//! Traits describing the plugin contract, external collaborators, and shared errors.

use std::fmt;

use async_trait::async_trait;
use reqwest::Error as ReqwestError;
use rust_decimal::Decimal;

use crate::audit::AuditEntry;
use crate::billing::{BillingEvent, BillingTransaction, TransactionStatus};
use crate::model::{
    ExecutionContext, ExecutionResult, PluginConfig, PluginDescriptor, PluginId, ServiceId,
    ServiceInfo, UserId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// A single failed validation rule.
pub struct FieldError {
    /// Field name as it appears in the request.
    pub field: String,
    /// Human-readable reason.
    pub message: String,
}

impl FieldError {
    /// Construct a new field error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}: {}", self.field, self.message)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by the engine and its collaborators.
pub enum EngineError {
    /// No plugin is registered under the identifier.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),
    /// The plugin exists but is switched off.
    #[error("Plugin not active: {0}")]
    PluginNotActive(String),
    /// The plugin does not expose the requested service.
    #[error("Unsupported service: {0}")]
    UnsupportedService(ServiceId),
    /// Input failed validation.
    #[error("Validation failed: {}", join_field_errors(.0))]
    Validation(Vec<FieldError>),
    /// The service's rate-limit window is full.
    #[error("Rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimitExceeded {
        /// Whole seconds until the window resets.
        retry_after_seconds: u64,
    },
    /// The service's circuit breaker is open.
    #[error("Circuit open for service {0}")]
    CircuitOpen(ServiceId),
    /// A provider call failed after all retries.
    #[error("Provider call to {service} failed: {cause}")]
    ProviderCallFailed {
        /// Service that was called.
        service: ServiceId,
        /// Underlying failure.
        cause: String,
    },
    /// Every service in the fallback chain failed.
    #[error("All fallbacks exhausted: {0}")]
    AllFallbacksExhausted(Box<EngineError>),
    /// A debit would drive the balance below zero.
    #[error("insufficient balance")]
    InsufficientBalance,
    /// The transaction to refund does not exist.
    #[error("Refund target not found: {0}")]
    RefundTargetNotFound(String),
    /// The transaction has already been refunded or is not refundable.
    #[error("Transaction {0} cannot be refunded")]
    AlreadyRefunded(String),
    /// Amount has the wrong sign or exceeds what is allowed.
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),
    /// The user has no balance document.
    #[error("User not found: {0}")]
    UserNotFound(UserId),
    /// Plugin or engine configuration is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Persistence collaborator failed.
    #[error("Store error: {0}")]
    Store(String),
    /// Network layer failed.
    #[error("Network error: {0}")]
    Network(#[from] ReqwestError),
    /// Internal provider error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Build a validation error for a single field.
    #[must_use]
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation(vec![FieldError::new(field, message)])
    }

    /// Whether another attempt against the same service may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ProviderCallFailed { .. } | EngineError::Network(_) | EngineError::Internal(_)
        )
    }
}

#[async_trait]
/// Contract every provider adapter implements.
pub trait Plugin: Send + Sync {
    /// Static identity of the plugin.
    fn descriptor(&self) -> &PluginDescriptor;

    /// Validate the plugin's own configuration once at registration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] when the defaults are unusable.
    fn install(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called when the plugin is switched on.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] when the plugin refuses to start.
    fn enable(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called when the plugin is switched off.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] when the plugin fails to stop cleanly.
    fn disable(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Configuration used when a tenant does not override a field.
    fn default_config(&self) -> PluginConfig {
        PluginConfig::default()
    }

    /// Services this plugin can answer.
    fn available_services(&self) -> Vec<ServiceInfo> {
        Vec::new()
    }

    /// Run one lookup.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] when validation, resilience guards, or the provider fail.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, EngineError>;
}

#[async_trait]
/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    /// Persist one audit entry.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] when the entry cannot be written; callers swallow it.
    async fn log(&self, entry: AuditEntry) -> Result<(), EngineError>;
}

/// Channel carrying billing events to the billing listener.
pub trait BillingEventPublisher: Send + Sync {
    /// Publish without waiting for the event to be processed.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] when the channel is closed.
    fn publish(&self, event: BillingEvent) -> Result<(), EngineError>;
}

#[async_trait]
/// Document store holding balances and billing transactions.
///
/// Reads and writes are per document with no concurrency token; callers serialize
/// mutations per user.
pub trait LedgerStore: Send + Sync {
    /// Current credits of a user.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UserNotFound`] when the user has no balance document.
    async fn balance(&self, user: &UserId) -> Result<Decimal, EngineError>;

    /// Overwrite the credits of a user.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the write fails.
    async fn set_balance(&self, user: &UserId, credits: Decimal) -> Result<(), EngineError>;

    /// Persist a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the write fails.
    async fn insert_transaction(&self, transaction: BillingTransaction) -> Result<(), EngineError>;

    /// Load a transaction by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the read fails.
    async fn transaction(&self, id: &str) -> Result<Option<BillingTransaction>, EngineError>;

    /// Change the status of a stored transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the write fails.
    async fn update_status(&self, id: &str, status: TransactionStatus) -> Result<(), EngineError>;

    /// All transactions of a user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the read fails.
    async fn transactions_for(&self, user: &UserId) -> Result<Vec<BillingTransaction>, EngineError>;
}

#[async_trait]
/// Store for the runtime activation status of plugins.
pub trait PluginStatusStore: Send + Sync {
    /// Record whether a plugin is active.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the write fails.
    async fn save_status(&self, plugin: &PluginId, active: bool) -> Result<(), EngineError>;

    /// Identifiers of all plugins recorded as active.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the read fails.
    async fn active_plugins(&self) -> Result<Vec<PluginId>, EngineError>;
}
