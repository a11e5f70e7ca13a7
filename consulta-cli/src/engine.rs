//! Wiring of the lookup engine over in-memory stores.

use std::sync::Arc;

use anyhow::Result;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use consulta_core::{
    BillingCoordinator, BillingListener, BillingTransaction, ChannelPublisher, ConsultaService,
    EngineConfig, ExecutionInput, ExecutionRequest, ExecutionResult, InMemoryLedger,
    InMemoryPluginStatusStore, LedgerStore, PluginId, PluginRegistry, ResilienceController,
    ServiceInfo, TenantId, TracingAuditSink, UserId,
};
use consulta_provider_infosimples as infosimples;
use consulta_provider_viacep as viacep;

/// Everything `consulta run` prints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunReport {
    pub(crate) result: ExecutionResult,
    pub(crate) balance: Decimal,
    pub(crate) transactions: Vec<BillingTransaction>,
}

/// A fully wired engine for one CLI invocation.
pub(crate) struct Engine {
    config: EngineConfig,
    service: ConsultaService,
    coordinator: Arc<BillingCoordinator>,
    ledger: Arc<InMemoryLedger>,
    listener: JoinHandle<()>,
}

impl Engine {
    /// Build the registry, resilience controller, and billing pipeline.
    pub(crate) async fn build(mut config: EngineConfig) -> Result<Self> {
        for (primary, alternates) in infosimples::fallbacks().into_iter().chain(viacep::fallbacks()) {
            config
                .resilience
                .fallbacks
                .entry(primary)
                .or_insert(alternates);
        }

        let client = Client::builder()
            .user_agent(concat!("consulta/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let controller = Arc::new(ResilienceController::new(config.resilience.clone()));

        let registry = Arc::new(PluginRegistry::new());
        let plugins = [
            infosimples::plugin(
                client.clone(),
                Arc::clone(&controller),
                config.plugin_defaults(&PluginId::from("infosimples")),
            ),
            viacep::plugin(
                client,
                Arc::clone(&controller),
                config.plugin_defaults(&PluginId::from("viacep")),
            ),
        ];
        for plugin in plugins {
            let id = plugin.descriptor().id.clone();
            if let Err(err) = registry.register(plugin) {
                warn!(plugin = %id, error = %err, "plugin skipped");
            }
        }

        let ledger = Arc::new(InMemoryLedger::new());
        let coordinator = Arc::new(BillingCoordinator::new(
            Arc::clone(&ledger) as Arc<dyn LedgerStore>
        ));
        let (publisher, receiver) = ChannelPublisher::channel();
        let listener = BillingListener::new(Arc::clone(&coordinator)).spawn(receiver);

        let service = ConsultaService::new(
            Arc::clone(&registry),
            Arc::new(TracingAuditSink),
            Arc::new(publisher),
        )
        .with_status_store(Arc::new(InMemoryPluginStatusStore::new()));

        for descriptor in service.plugins() {
            service
                .set_plugin_active(descriptor.id.as_str(), true)
                .await?;
        }
        info!(plugins = service.plugins().len(), "engine ready");

        Ok(Self {
            config,
            service,
            coordinator,
            ledger,
            listener,
        })
    }

    /// Service catalog of the registered plugins.
    pub(crate) fn services(&self) -> Vec<ServiceInfo> {
        self.service.services()
    }

    /// Give `user` a starting balance.
    pub(crate) fn open_account(&self, user: &UserId, credits: Decimal) {
        self.ledger.open_account(user.clone(), credits);
    }

    /// Execute one lookup and settle its billing before reporting.
    pub(crate) async fn run(
        self,
        plugin: &str,
        tenant: TenantId,
        user: UserId,
        input: ExecutionInput,
    ) -> Result<RunReport> {
        let config = self
            .config
            .tenant_overrides(&tenant, &PluginId::from(plugin));
        let request = ExecutionRequest {
            tenant_id: tenant,
            user_id: user.clone(),
            input,
            config,
        };
        let result = self.service.execute(plugin, request).await;

        // Dropping the service closes the billing channel so the listener drains and exits.
        drop(self.service);
        self.listener.await?;

        Ok(RunReport {
            result,
            balance: self.coordinator.balance(&user).await?,
            transactions: self.coordinator.transactions(&user).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use consulta_core::LookupRequest;
    use rust_decimal_macros::dec;

    use super::*;

    #[tokio::test]
    async fn plugins_without_credentials_are_skipped() {
        let engine = Engine::build(EngineConfig::default())
            .await
            .expect("engine builds");

        let services: Vec<_> = engine
            .services()
            .into_iter()
            .map(|service| service.id.to_string())
            .collect();
        assert_eq!(services, ["cep", "cep_brasilapi"]);
    }

    #[tokio::test]
    async fn failed_lookup_is_not_billed() {
        let engine = Engine::build(EngineConfig::default())
            .await
            .expect("engine builds");
        let user = UserId::from("u1");
        engine.open_account(&user, dec!(10.00));

        let report = engine
            .run(
                "viacep",
                TenantId::from("acme"),
                user,
                ExecutionInput::new(LookupRequest::Cep {
                    cep: "123".to_owned(),
                }),
            )
            .await
            .expect("run completes");

        assert!(!report.result.success);
        assert_eq!(report.result.cost, Decimal::ZERO);
        assert_eq!(report.balance, dec!(10.00));
        assert!(report.transactions.is_empty());
    }

    #[tokio::test]
    async fn unknown_plugin_is_reported_in_the_result() {
        let engine = Engine::build(EngineConfig::default())
            .await
            .expect("engine builds");
        let user = UserId::from("u1");
        engine.open_account(&user, dec!(1.00));

        let report = engine
            .run(
                "infosimples",
                TenantId::from("acme"),
                user,
                ExecutionInput::new(LookupRequest::Cnpj {
                    cnpj: "11222333000181".to_owned(),
                }),
            )
            .await
            .expect("run completes");

        assert_eq!(
            report.result.error.as_deref(),
            Some("Plugin not found: infosimples")
        );
    }
}
