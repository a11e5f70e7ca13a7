//! Billing transaction records and an in-memory document store for them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::{PluginId, TenantId, UserId};
use crate::ports::{EngineError, LedgerStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Kind of balance movement.
pub enum TransactionType {
    /// Credits bought by the user.
    CreditPurchase,
    /// Charge for a lookup.
    QueryDebit,
    /// Money returned for an earlier debit.
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Lifecycle of a transaction.
pub enum TransactionStatus {
    /// Recorded and applied to the balance.
    Completed,
    /// The balance update failed after the record was written.
    Failed,
    /// A refund was issued against this transaction.
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Immutable record of a balance movement.
pub struct BillingTransaction {
    /// Unique identifier.
    pub id: String,
    /// Tenant owning the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    /// User whose balance moved.
    pub user_id: UserId,
    /// Kind of movement.
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// Signed amount; negative for debits.
    pub amount: Decimal,
    /// Currency code.
    pub currency: String,
    /// Plugin that caused a debit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<PluginId>,
    /// Correlation id of the query behind a debit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consulta_id: Option<String>,
    /// Transaction a refund points back to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_of: Option<String>,
    /// Free-form note, e.g. a refund reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Current status.
    pub status: TransactionStatus,
    /// When the transaction was recorded.
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<UserId, Decimal>,
    transactions: HashMap<String, BillingTransaction>,
    order: Vec<String>,
}

/// Ledger kept in process memory.
#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a user's balance document.
    pub fn open_account(&self, user: UserId, credits: Decimal) {
        self.state.write().balances.insert(user, credits);
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn balance(&self, user: &UserId) -> Result<Decimal, EngineError> {
        self.state
            .read()
            .balances
            .get(user)
            .copied()
            .ok_or_else(|| EngineError::UserNotFound(user.clone()))
    }

    async fn set_balance(&self, user: &UserId, credits: Decimal) -> Result<(), EngineError> {
        self.state.write().balances.insert(user.clone(), credits);
        Ok(())
    }

    async fn insert_transaction(&self, transaction: BillingTransaction) -> Result<(), EngineError> {
        let mut state = self.state.write();
        if state.transactions.contains_key(&transaction.id) {
            return Err(EngineError::Store(format!(
                "transaction {} already exists",
                transaction.id
            )));
        }
        state.order.push(transaction.id.clone());
        state.transactions.insert(transaction.id.clone(), transaction);
        Ok(())
    }

    async fn transaction(&self, id: &str) -> Result<Option<BillingTransaction>, EngineError> {
        Ok(self.state.read().transactions.get(id).cloned())
    }

    async fn update_status(&self, id: &str, status: TransactionStatus) -> Result<(), EngineError> {
        let mut state = self.state.write();
        let transaction = state
            .transactions
            .get_mut(id)
            .ok_or_else(|| EngineError::Store(format!("transaction {id} not found")))?;
        transaction.status = status;
        Ok(())
    }

    async fn transactions_for(&self, user: &UserId) -> Result<Vec<BillingTransaction>, EngineError> {
        let state = self.state.read();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.transactions.get(id))
            .filter(|transaction| &transaction.user_id == user)
            .cloned()
            .collect())
    }
}
