//! Billing events published after executions and the listener that settles them.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::billing::coordinator::{BillingCoordinator, BillingReceipt, TransactionRequest};
use crate::model::{PluginId, TenantId, UserId};
use crate::ports::{BillingEventPublisher, EngineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Fire-and-forget notification that a user's balance should move.
pub struct BillingEvent {
    /// Tenant owning the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    /// User whose balance moves.
    pub user_id: UserId,
    /// What happened.
    #[serde(flatten)]
    pub payload: BillingPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
/// Event kinds and their payloads.
pub enum BillingPayload {
    /// A plugin served a paid lookup.
    #[serde(rename = "plugin.executed", rename_all = "camelCase")]
    PluginExecuted {
        /// Plugin that served the lookup.
        plugin_id: PluginId,
        /// Amount charged.
        cost: Decimal,
        /// Correlation id of the query.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        consulta_id: Option<String>,
    },
    /// A lookup was served outside the plugin dispatcher.
    #[serde(rename = "query.executed", rename_all = "camelCase")]
    QueryExecuted {
        /// Amount charged.
        cost: Decimal,
        /// Correlation id of the query.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        consulta_id: Option<String>,
    },
    /// The user bought credits.
    #[serde(rename = "credits.purchased", rename_all = "camelCase")]
    CreditsPurchased {
        /// Credits added.
        amount: Decimal,
        /// Currency code.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        currency: Option<String>,
        /// Payment reference.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
}

impl BillingEvent {
    /// Charge for a lookup served by `plugin_id`.
    #[must_use]
    pub fn plugin_executed(
        tenant_id: TenantId,
        user_id: UserId,
        plugin_id: PluginId,
        cost: Decimal,
        consulta_id: Option<String>,
    ) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            user_id,
            payload: BillingPayload::PluginExecuted {
                plugin_id,
                cost,
                consulta_id,
            },
        }
    }

    fn into_request(self) -> (bool, TransactionRequest) {
        let mut request = TransactionRequest::new(self.user_id, Decimal::ZERO);
        request.tenant_id = self.tenant_id;
        match self.payload {
            BillingPayload::PluginExecuted {
                plugin_id,
                cost,
                consulta_id,
            } => {
                request.amount = -cost;
                request.description = Some(format!("lookup via {plugin_id}"));
                request.plugin_id = Some(plugin_id);
                request.consulta_id = consulta_id;
                (true, request)
            }
            BillingPayload::QueryExecuted { cost, consulta_id } => {
                request.amount = -cost;
                request.consulta_id = consulta_id;
                (true, request)
            }
            BillingPayload::CreditsPurchased {
                amount,
                currency,
                reference,
            } => {
                request.amount = amount;
                request.currency = currency;
                request.description = reference;
                (false, request)
            }
        }
    }
}

/// Publisher pushing events onto an in-process queue.
#[derive(Clone)]
pub struct ChannelPublisher {
    sender: UnboundedSender<BillingEvent>,
}

impl ChannelPublisher {
    /// Create a publisher and the receiving end for a [`BillingListener`].
    #[must_use]
    pub fn channel() -> (Self, UnboundedReceiver<BillingEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl BillingEventPublisher for ChannelPublisher {
    fn publish(&self, event: BillingEvent) -> Result<(), EngineError> {
        self.sender
            .send(event)
            .map_err(|err| EngineError::Internal(format!("billing channel closed: {err}")))
    }
}

/// Consumes billing events and applies them through the coordinator.
pub struct BillingListener {
    coordinator: Arc<BillingCoordinator>,
}

impl BillingListener {
    /// Create a listener settling events with `coordinator`.
    #[must_use]
    pub fn new(coordinator: Arc<BillingCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Returns the coordinator's error, e.g. [`EngineError::InsufficientBalance`].
    pub async fn handle(&self, event: BillingEvent) -> Result<BillingReceipt, EngineError> {
        let (is_debit, request) = event.into_request();
        if is_debit {
            self.coordinator.debit(request).await
        } else {
            self.coordinator.credit_purchase(request).await
        }
    }

    /// Drain `receiver` until every publisher is dropped.
    ///
    /// Failed events are logged and skipped.
    pub fn spawn(self, mut receiver: UnboundedReceiver<BillingEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let user = event.user_id.clone();
                match self.handle(event).await {
                    Ok(receipt) => debug!(
                        user = %user,
                        transaction = %receipt.transaction_id,
                        balance = %receipt.balance,
                        "billing event applied"
                    ),
                    Err(err) => warn!(user = %user, error = %err, "billing event rejected"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::billing::ledger::{InMemoryLedger, TransactionType};
    use crate::ports::LedgerStore;

    fn coordinator(credits: Decimal) -> Arc<BillingCoordinator> {
        let ledger = InMemoryLedger::new();
        ledger.open_account(UserId::from("u1"), credits);
        Arc::new(BillingCoordinator::new(Arc::new(ledger) as Arc<dyn LedgerStore>))
    }

    #[test]
    fn plugin_executed_wire_format() {
        let event = BillingEvent::plugin_executed(
            TenantId::from("acme"),
            UserId::from("u1"),
            PluginId::from("infosimples"),
            dec!(0.50),
            Some("q-1".to_owned()),
        );

        let wire = serde_json::to_value(&event).expect("serialize");
        assert_eq!(
            wire,
            json!({
                "type": "plugin.executed",
                "tenantId": "acme",
                "userId": "u1",
                "payload": {
                    "pluginId": "infosimples",
                    "cost": "0.50",
                    "consultaId": "q-1"
                }
            })
        );
    }

    #[tokio::test]
    async fn listener_debits_and_credits() {
        let coordinator = coordinator(dec!(1.00));
        let listener = BillingListener::new(Arc::clone(&coordinator));

        listener
            .handle(BillingEvent::plugin_executed(
                TenantId::from("acme"),
                UserId::from("u1"),
                PluginId::from("infosimples"),
                dec!(0.50),
                Some("q-1".to_owned()),
            ))
            .await
            .expect("debit");

        let receipt = listener
            .handle(BillingEvent {
                tenant_id: None,
                user_id: UserId::from("u1"),
                payload: BillingPayload::CreditsPurchased {
                    amount: dec!(20.00),
                    currency: None,
                    reference: Some("pix-123".to_owned()),
                },
            })
            .await
            .expect("purchase");
        assert_eq!(receipt.balance, dec!(20.50));

        let history = coordinator
            .transactions(&UserId::from("u1"))
            .await
            .expect("history");
        let kinds: Vec<_> = history.iter().map(|transaction| transaction.kind).collect();
        assert_eq!(kinds, [TransactionType::QueryDebit, TransactionType::CreditPurchase]);
        assert_eq!(
            history.first().and_then(|debit| debit.consulta_id.as_deref()),
            Some("q-1")
        );
    }

    #[tokio::test]
    async fn spawned_listener_drains_queue() {
        let coordinator = coordinator(dec!(1.00));
        let (publisher, receiver) = ChannelPublisher::channel();
        let handle = BillingListener::new(Arc::clone(&coordinator)).spawn(receiver);

        for _ in 0..3 {
            publisher
                .publish(BillingEvent::plugin_executed(
                    TenantId::from("acme"),
                    UserId::from("u1"),
                    PluginId::from("infosimples"),
                    dec!(0.40),
                    None,
                ))
                .expect("publish");
        }
        drop(publisher);
        handle.await.expect("listener");

        // The third debit would overdraw the account and is skipped.
        assert_eq!(
            coordinator.balance(&UserId::from("u1")).await.expect("balance"),
            dec!(0.20)
        );
    }

    #[test]
    fn publishing_after_listener_is_gone_fails() {
        let (publisher, receiver) = ChannelPublisher::channel();
        drop(receiver);

        let event = BillingEvent::plugin_executed(
            TenantId::from("acme"),
            UserId::from("u1"),
            PluginId::from("infosimples"),
            dec!(0.50),
            None,
        );
        assert!(matches!(publisher.publish(event), Err(EngineError::Internal(_))));
    }
}
