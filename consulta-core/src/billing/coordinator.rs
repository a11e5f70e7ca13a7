//! Balance mutations serialized per user.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::billing::ledger::{BillingTransaction, TransactionStatus, TransactionType};
use crate::billing::locks::KeyedLocks;
use crate::model::{PluginId, TenantId, UserId};
use crate::ports::{EngineError, LedgerStore};

/// Currency recorded when a request names none.
pub const DEFAULT_CURRENCY: &str = "BRL";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Input for a debit or a credit purchase.
pub struct TransactionRequest {
    /// Tenant owning the user.
    pub tenant_id: Option<TenantId>,
    /// User whose balance moves.
    pub user_id: UserId,
    /// Signed amount: negative for debits, positive for purchases.
    pub amount: Decimal,
    /// Currency code.
    pub currency: Option<String>,
    /// Plugin behind a debit.
    pub plugin_id: Option<PluginId>,
    /// Correlation id of the query behind a debit.
    pub consulta_id: Option<String>,
    /// Free-form note.
    pub description: Option<String>,
}

impl TransactionRequest {
    /// Request moving `amount` on `user`'s balance.
    #[must_use]
    pub fn new(user_id: UserId, amount: Decimal) -> Self {
        Self {
            tenant_id: None,
            user_id,
            amount,
            currency: None,
            plugin_id: None,
            consulta_id: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Applied transaction and the balance it left behind.
pub struct BillingReceipt {
    /// Recorded transaction.
    pub transaction_id: String,
    /// Balance after the transaction.
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Flat success/error view of a billing call.
pub struct BillingOutcome {
    /// Whether the operation was applied.
    pub success: bool,
    /// Recorded transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<BillingReceipt, EngineError>> for BillingOutcome {
    fn from(result: Result<BillingReceipt, EngineError>) -> Self {
        match result {
            Ok(receipt) => Self {
                success: true,
                transaction_id: Some(receipt.transaction_id),
                error: None,
            },
            Err(err) => Self {
                success: false,
                transaction_id: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Applies debits, purchases, and refunds one at a time per user.
///
/// Each operation re-reads the balance inside its turn, so concurrent callers never
/// overwrite each other's updates.
pub struct BillingCoordinator {
    store: Arc<dyn LedgerStore>,
    locks: KeyedLocks<UserId>,
}

impl BillingCoordinator {
    /// Create a coordinator over a ledger store.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Charge a user. `request.amount` must be negative.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InsufficientBalance`] when the balance would go below zero,
    /// [`EngineError::InvalidAmount`] for non-negative amounts, or the store's error.
    pub async fn debit(&self, request: TransactionRequest) -> Result<BillingReceipt, EngineError> {
        let amount = request.amount.round_dp(2);
        if amount >= Decimal::ZERO {
            return Err(EngineError::InvalidAmount(request.amount));
        }

        let _turn = self.locks.lock(&request.user_id).await;
        let balance = self.store.balance(&request.user_id).await?;
        if balance + amount < Decimal::ZERO {
            info!(user = %request.user_id, %balance, %amount, "debit rejected");
            return Err(EngineError::InsufficientBalance);
        }

        let transaction = new_transaction(request, TransactionType::QueryDebit, amount);
        self.apply(transaction, balance).await
    }

    /// Add purchased credits. `request.amount` must be positive.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidAmount`] for non-positive amounts, or the store's error.
    pub async fn credit_purchase(
        &self,
        request: TransactionRequest,
    ) -> Result<BillingReceipt, EngineError> {
        let amount = request.amount.round_dp(2);
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount(request.amount));
        }

        let _turn = self.locks.lock(&request.user_id).await;
        let balance = self.store.balance(&request.user_id).await?;
        let transaction = new_transaction(request, TransactionType::CreditPurchase, amount);
        self.apply(transaction, balance).await
    }

    /// Return all or part of a debit to the user.
    ///
    /// Without `amount` the whole debit is refunded. The original transaction is marked
    /// [`TransactionStatus::Refunded`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RefundTargetNotFound`] for unknown transactions,
    /// [`EngineError::AlreadyRefunded`] for non-refundable ones, or
    /// [`EngineError::InvalidAmount`] when `amount` exceeds the debit.
    pub async fn refund(
        &self,
        transaction_id: &str,
        amount: Option<Decimal>,
        reason: Option<String>,
    ) -> Result<BillingReceipt, EngineError> {
        let target = self.load(transaction_id).await?;
        let _turn = self.locks.lock(&target.user_id).await;

        // Re-read inside the turn; a concurrent refund may have won.
        let original = self.load(transaction_id).await?;
        if original.kind != TransactionType::QueryDebit
            || original.status != TransactionStatus::Completed
        {
            return Err(EngineError::AlreadyRefunded(transaction_id.to_owned()));
        }

        let refundable = -original.amount;
        let amount = amount.map_or(refundable, |amount| amount.round_dp(2));
        if amount <= Decimal::ZERO || amount > refundable {
            return Err(EngineError::InvalidAmount(amount));
        }

        let balance = self.store.balance(&original.user_id).await?;
        let mut transaction = new_transaction(
            TransactionRequest {
                tenant_id: original.tenant_id.clone(),
                user_id: original.user_id.clone(),
                amount,
                currency: Some(original.currency.clone()),
                plugin_id: original.plugin_id.clone(),
                consulta_id: original.consulta_id.clone(),
                description: reason,
            },
            TransactionType::Refund,
            amount,
        );
        transaction.refund_of = Some(original.id.clone());

        // Claim the original before crediting; undo the claim if the credit fails.
        self.store
            .update_status(&original.id, TransactionStatus::Refunded)
            .await?;
        let receipt = match self.apply(transaction, balance).await {
            Ok(receipt) => receipt,
            Err(err) => {
                if let Err(revert_err) = self
                    .store
                    .update_status(&original.id, TransactionStatus::Completed)
                    .await
                {
                    error!(transaction = %original.id, error = %revert_err, "could not restore refunded debit");
                }
                return Err(err);
            }
        };

        info!(
            transaction = %original.id,
            refund = %receipt.transaction_id,
            %amount,
            "debit refunded"
        );
        Ok(receipt)
    }

    /// Current credits of a user.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UserNotFound`] or the store's error.
    pub async fn balance(&self, user: &UserId) -> Result<Decimal, EngineError> {
        self.store.balance(user).await
    }

    /// Transactions of a user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn transactions(&self, user: &UserId) -> Result<Vec<BillingTransaction>, EngineError> {
        self.store.transactions_for(user).await
    }

    async fn load(&self, transaction_id: &str) -> Result<BillingTransaction, EngineError> {
        self.store
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| EngineError::RefundTargetNotFound(transaction_id.to_owned()))
    }

    async fn apply(
        &self,
        transaction: BillingTransaction,
        balance: Decimal,
    ) -> Result<BillingReceipt, EngineError> {
        let new_balance = (balance + transaction.amount).round_dp(2);
        let transaction_id = transaction.id.clone();
        let user = transaction.user_id.clone();

        self.store.insert_transaction(transaction).await?;
        if let Err(err) = self.store.set_balance(&user, new_balance).await {
            error!(user = %user, transaction = %transaction_id, error = %err, "balance update failed");
            if let Err(mark_err) = self
                .store
                .update_status(&transaction_id, TransactionStatus::Failed)
                .await
            {
                error!(transaction = %transaction_id, error = %mark_err, "could not mark transaction failed");
            }
            return Err(err);
        }

        Ok(BillingReceipt {
            transaction_id,
            balance: new_balance,
        })
    }
}

fn new_transaction(
    request: TransactionRequest,
    kind: TransactionType,
    amount: Decimal,
) -> BillingTransaction {
    BillingTransaction {
        id: Uuid::new_v4().to_string(),
        tenant_id: request.tenant_id,
        user_id: request.user_id,
        kind,
        amount,
        currency: request
            .currency
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_owned()),
        plugin_id: request.plugin_id,
        consulta_id: request.consulta_id,
        refund_of: None,
        description: request.description,
        status: TransactionStatus::Completed,
        created_at: Utc::now(),
    }
}
