//! High-level service facade dispatching lookups to plugins.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEntry, redact_input};
use crate::billing::BillingEvent;
use crate::model::{
    ExecutionContext, ExecutionRequest, ExecutionResult, PluginDescriptor, PluginId, ServiceInfo,
};
use crate::plugin::PluginRegistry;
use crate::ports::{AuditSink, BillingEventPublisher, EngineError, PluginStatusStore};

/// Public entry point for executing lookups and managing plugins.
pub struct ConsultaService {
    registry: Arc<PluginRegistry>,
    audit: Arc<dyn AuditSink>,
    events: Arc<dyn BillingEventPublisher>,
    status_store: Option<Arc<dyn PluginStatusStore>>,
}

impl ConsultaService {
    /// Create a new service bound to the registry and its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<PluginRegistry>,
        audit: Arc<dyn AuditSink>,
        events: Arc<dyn BillingEventPublisher>,
    ) -> Self {
        Self {
            registry,
            audit,
            events,
            status_store: None,
        }
    }

    /// Persist activation changes in `store`.
    #[must_use]
    pub fn with_status_store(mut self, store: Arc<dyn PluginStatusStore>) -> Self {
        self.status_store = Some(store);
        self
    }

    /// Registered plugins, sorted by identifier.
    #[must_use]
    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.registry.list()
    }

    /// Catalog of all services the registered plugins offer.
    #[must_use]
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.registry.services()
    }

    /// Switch a plugin on or off, persisting the change first when a store is set.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PluginNotFound`], the store's error, or the plugin's
    /// lifecycle hook error.
    pub async fn set_plugin_active(&self, plugin_id: &str, active: bool) -> Result<(), EngineError> {
        let declared = self.registry.resolve(plugin_id)?.descriptor().id.clone();
        if let Some(store) = &self.status_store {
            store.save_status(&declared, active).await?;
        }
        self.registry.set_active(plugin_id, active)
    }

    /// Re-activate every plugin the status store recorded as active.
    ///
    /// Unknown plugins in the store are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns the store's error or a plugin's `enable` hook error.
    pub async fn restore_activation(&self) -> Result<Vec<PluginId>, EngineError> {
        let Some(store) = &self.status_store else {
            return Ok(Vec::new());
        };

        let mut restored = Vec::new();
        for plugin in store.active_plugins().await? {
            match self.registry.set_active(plugin.as_str(), true) {
                Ok(()) => restored.push(plugin),
                Err(EngineError::PluginNotFound(_)) => {
                    warn!(plugin = %plugin, "persisted plugin is not registered");
                }
                Err(err) => return Err(err),
            }
        }
        info!(count = restored.len(), "plugin activation restored");
        Ok(restored)
    }

    /// Execute one lookup through the plugin registered as `plugin_id`.
    ///
    /// Never fails: every error becomes a failed [`ExecutionResult`] with zero cost.
    /// An audit entry is written for every resolved plugin and a billing event is
    /// published for every successful paid lookup.
    pub async fn execute(&self, plugin_id: &str, request: ExecutionRequest) -> ExecutionResult {
        let plugin = match self.registry.resolve(plugin_id) {
            Ok(plugin) => plugin,
            Err(err) => return ExecutionResult::failure(err.to_string()),
        };
        let declared = plugin.descriptor().id.clone();
        if !self.registry.is_active(&declared) {
            let err = EngineError::PluginNotActive(declared.to_string());
            return ExecutionResult::failure(err.to_string());
        }

        let ctx = ExecutionContext {
            tenant_id: request.tenant_id,
            user_id: request.user_id,
            config: request.config.merged_over(&plugin.default_config()),
            input: request.input,
        };

        let started = Instant::now();
        let result = match plugin.execute(&ctx).await {
            Ok(result) => result,
            Err(err) => {
                debug!(plugin = %declared, error = %err, "plugin execution failed");
                ExecutionResult::failure(err.to_string())
            }
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.audit(&ctx, &declared, &result, duration_ms).await;

        if result.success && result.cost > Decimal::ZERO {
            let event = BillingEvent::plugin_executed(
                ctx.tenant_id.clone(),
                ctx.user_id.clone(),
                declared.clone(),
                result.cost,
                ctx.input.correlation_id().map(str::to_owned),
            );
            if let Err(err) = self.events.publish(event) {
                warn!(plugin = %declared, user = %ctx.user_id, error = %err, "billing event not published");
            }
        }

        info!(
            plugin = %declared,
            tenant = %ctx.tenant_id,
            user = %ctx.user_id,
            success = result.success,
            duration_ms,
            "plugin executed"
        );
        result
    }

    async fn audit(
        &self,
        ctx: &ExecutionContext,
        plugin: &PluginId,
        result: &ExecutionResult,
        duration_ms: u64,
    ) {
        let input = serde_json::to_value(&ctx.input).unwrap_or(Value::Null);
        let action = if result.success {
            AuditAction::PluginExecute
        } else {
            AuditAction::PluginExecuteFailed
        };
        let entry = AuditEntry {
            tenant_id: ctx.tenant_id.clone(),
            user_id: ctx.user_id.clone(),
            action,
            resource: plugin.to_string(),
            details: json!({
                "input": redact_input(&input),
                "success": result.success,
                "cost": result.cost,
                "durationMs": duration_ms,
                "service": result.service,
                "error": result.error,
            }),
            ip_address: None,
            timestamp: Utc::now(),
        };

        if let Err(err) = self.audit.log(entry).await {
            warn!(plugin = %plugin, error = %err, "audit entry dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::audit::{MemoryAuditSink, REDACTED};
    use crate::model::{
        ExecutionInput, LookupRequest, PluginCategory, PluginConfig, ServiceId, TenantId, UserId,
    };
    use crate::plugin::InMemoryPluginStatusStore;

    struct StubPlugin {
        descriptor: PluginDescriptor,
        outcome: Result<Decimal, String>,
        calls: AtomicUsize,
        seen_config: Mutex<Option<PluginConfig>>,
    }

    impl StubPlugin {
        fn new(id: &str, outcome: Result<Decimal, String>) -> Arc<Self> {
            Arc::new(Self {
                descriptor: PluginDescriptor {
                    id: PluginId::from(id),
                    name: id.to_owned(),
                    category: PluginCategory::IdentityLookup,
                    version: "1.0.0".to_owned(),
                },
                outcome,
                calls: AtomicUsize::new(0),
                seen_config: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl crate::ports::Plugin for StubPlugin {
        fn descriptor(&self) -> &PluginDescriptor {
            &self.descriptor
        }

        fn default_config(&self) -> PluginConfig {
            PluginConfig {
                api_key: Some("default-key".to_owned()),
                base_url: Some("https://provider.test".to_owned()),
                ..PluginConfig::default()
            }
        }

        async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen_config.lock() = Some(ctx.config.clone());
            match &self.outcome {
                Ok(cost) => Ok(ExecutionResult::success(
                    json!({ "name": "Fulano" }),
                    *cost,
                    ServiceId::from("cpf"),
                )),
                Err(reason) => Err(EngineError::ProviderCallFailed {
                    service: ServiceId::from("cpf"),
                    cause: reason.clone(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<BillingEvent>>,
    }

    impl BillingEventPublisher for RecordingPublisher {
        fn publish(&self, event: BillingEvent) -> Result<(), EngineError> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    struct FailingAudit;

    #[async_trait]
    impl AuditSink for FailingAudit {
        async fn log(&self, _entry: AuditEntry) -> Result<(), EngineError> {
            Err(EngineError::Store("audit collection unavailable".to_owned()))
        }
    }

    struct Fixture {
        service: ConsultaService,
        audit: Arc<MemoryAuditSink>,
        events: Arc<RecordingPublisher>,
    }

    fn fixture(plugin: Arc<StubPlugin>) -> Fixture {
        let registry = Arc::new(PluginRegistry::new());
        registry.register(plugin).expect("register");
        let audit = Arc::new(MemoryAuditSink::new());
        let events = Arc::new(RecordingPublisher::default());
        let service = ConsultaService::new(
            registry,
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            Arc::clone(&events) as Arc<dyn BillingEventPublisher>,
        );
        Fixture {
            service,
            audit,
            events,
        }
    }

    fn request() -> ExecutionRequest {
        let mut input = ExecutionInput::new(LookupRequest::Cpf {
            cpf: "52998224725".to_owned(),
            birth_date: None,
        });
        input.consulta_id = Some("q-42".to_owned());
        ExecutionRequest {
            tenant_id: TenantId::from("acme"),
            user_id: UserId::from("u1"),
            input,
            config: PluginConfig {
                api_key: Some("tenant-key".to_owned()),
                ..PluginConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn unknown_plugin_fails_without_side_effects() {
        let fixture = fixture(StubPlugin::new("bureau", Ok(dec!(1.00))));

        let result = fixture.service.execute("missing", request()).await;

        assert!(!result.success);
        assert_eq!(result.cost, Decimal::ZERO);
        assert_eq!(result.error.as_deref(), Some("Plugin not found: missing"));
        assert!(fixture.audit.entries().is_empty());
        assert!(fixture.events.events.lock().is_empty());
    }

    #[tokio::test]
    async fn inactive_plugin_is_not_invoked() {
        let plugin = StubPlugin::new("bureau", Ok(dec!(1.00)));
        let fixture = fixture(Arc::clone(&plugin));

        let result = fixture.service.execute("bureau", request()).await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Plugin not active: bureau"));
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn paid_success_is_audited_and_billed() {
        let plugin = StubPlugin::new("bureau", Ok(dec!(1.50)));
        let fixture = fixture(Arc::clone(&plugin));
        fixture
            .service
            .set_plugin_active("bureau", true)
            .await
            .expect("activate");

        let result = fixture.service.execute("bureau", request()).await;

        assert!(result.success);
        assert_eq!(result.cost, dec!(1.50));

        let config = plugin.seen_config.lock().clone().expect("config");
        assert_eq!(config.api_key.as_deref(), Some("tenant-key"));
        assert_eq!(config.base_url.as_deref(), Some("https://provider.test"));

        let entries = fixture.audit.entries();
        assert_eq!(entries.len(), 1);
        let entry = entries.first().expect("entry");
        assert_eq!(entry.action, AuditAction::PluginExecute);
        assert_eq!(entry.resource, "bureau");
        assert_eq!(entry.details["input"]["cpf"], json!(REDACTED));
        assert_eq!(entry.details["input"]["service"], json!("cpf"));
        assert_eq!(entry.details["success"], json!(true));

        let events = fixture.events.events.lock();
        assert_eq!(
            *events,
            [BillingEvent::plugin_executed(
                TenantId::from("acme"),
                UserId::from("u1"),
                PluginId::from("bureau"),
                dec!(1.50),
                Some("q-42".to_owned()),
            )]
        );
    }

    #[tokio::test]
    async fn free_success_is_not_billed() {
        let fixture = fixture(StubPlugin::new("bureau", Ok(Decimal::ZERO)));
        fixture
            .service
            .set_plugin_active("bureau", true)
            .await
            .expect("activate");

        let result = fixture.service.execute("bureau", request()).await;

        assert!(result.success);
        assert!(fixture.events.events.lock().is_empty());
    }

    #[tokio::test]
    async fn plugin_error_becomes_failed_result() {
        let fixture = fixture(StubPlugin::new("bureau", Err("HTTP 503".to_owned())));
        fixture
            .service
            .set_plugin_active("bureau", true)
            .await
            .expect("activate");

        let result = fixture.service.execute("bureau", request()).await;

        assert!(!result.success);
        assert_eq!(result.cost, Decimal::ZERO);
        assert_eq!(
            result.error.as_deref(),
            Some("Provider call to cpf failed: HTTP 503")
        );
        let entries = fixture.audit.entries();
        assert_eq!(
            entries.first().map(|entry| entry.action),
            Some(AuditAction::PluginExecuteFailed)
        );
        assert!(fixture.events.events.lock().is_empty());
    }

    #[tokio::test]
    async fn audit_failure_does_not_abort_execution() {
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register(StubPlugin::new("bureau", Ok(dec!(1.00))))
            .expect("register");
        registry.set_active("bureau", true).expect("activate");
        let events = Arc::new(RecordingPublisher::default());
        let service = ConsultaService::new(
            registry,
            Arc::new(FailingAudit),
            Arc::clone(&events) as Arc<dyn BillingEventPublisher>,
        );

        let result = service.execute("bureau", request()).await;

        assert!(result.success);
        assert_eq!(events.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn activation_is_persisted_and_restored() {
        let store = Arc::new(InMemoryPluginStatusStore::new());
        let first = fixture(StubPlugin::new("bureau", Ok(dec!(1.00))))
            .service
            .with_status_store(Arc::clone(&store) as Arc<dyn PluginStatusStore>);
        first
            .set_plugin_active("bureau", true)
            .await
            .expect("activate");

        let second = fixture(StubPlugin::new("bureau", Ok(dec!(1.00))))
            .service
            .with_status_store(Arc::clone(&store) as Arc<dyn PluginStatusStore>);
        let restored = second.restore_activation().await.expect("restore");

        assert_eq!(restored, [PluginId::from("bureau")]);
        assert!(second.execute("bureau", request()).await.success);
    }
}
