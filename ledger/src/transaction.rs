//! Ingested monetary transactions and their deduplication log.

use civicledger_common::{
    Currency, Entity, GatewayTxnId, InvoiceId, JournalId, LedgerError, Result, Timestamp,
    TransactionId, WalletId,
};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Direction of a gateway payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    /// Customer to business.
    C2B,
    /// Business to customer.
    B2C,
    /// Business to business.
    B2B,
}

/// What a transaction is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "purpose", rename_all = "snake_case")]
pub enum TransactionPurpose {
    InvoiceSettlement { invoice_id: InvoiceId },
    WalletTopUp { wallet_id: WalletId },
    WalletWithdrawal { wallet_id: WalletId },
    /// Recorded and posted to clearing only.
    Unallocated,
}

/// Transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Processed,
    Failed,
}

impl TransactionStatus {
    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransactionStatus] {
        match self {
            TransactionStatus::Pending => &[TransactionStatus::Processed, TransactionStatus::Failed],
            TransactionStatus::Processed | TransactionStatus::Failed => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// A real-world monetary movement reported by a payment gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// Unique id assigned by the gateway; the deduplication key.
    pub gateway_txn_id: GatewayTxnId,
    pub gateway_reference: Option<String>,
    pub payer: String,
    pub payee: String,
    pub channel: Channel,
    /// Aggregator or gateway identifier.
    pub gateway: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub purpose: TransactionPurpose,
    /// Raw gateway callback body.
    pub raw_payload: serde_json::Value,
    pub status: TransactionStatus,
    pub journal_id: Option<JournalId>,
    pub failure_reason: Option<String>,
    pub occurred_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A gateway delivery to record.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub gateway_txn_id: GatewayTxnId,
    pub gateway_reference: Option<String>,
    pub payer: String,
    pub payee: String,
    pub channel: Channel,
    pub gateway: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub purpose: TransactionPurpose,
    pub raw_payload: serde_json::Value,
    pub occurred_at: Timestamp,
}

/// Result of recording a delivery.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub transaction: Transaction,
    /// True when the gateway id was already recorded; nothing changed.
    pub duplicate: bool,
}

/// Append-only log of transactions keyed by gateway id.
#[derive(Debug, Default)]
pub struct TransactionLog {
    transactions: DashMap<TransactionId, Transaction>,
    by_gateway_id: DashMap<GatewayTxnId, TransactionId>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery, or return the existing record for a redelivery.
    pub fn ingest(&self, new: NewTransaction) -> Result<Ingested> {
        if !new.gateway_txn_id.is_valid() {
            return Err(LedgerError::validation(
                format!("invalid gateway transaction id: {:?}", new.gateway_txn_id.as_str()),
                "gateway_txn_id",
            ));
        }
        if new.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(new.amount));
        }

        match self.by_gateway_id.entry(new.gateway_txn_id.clone()) {
            Entry::Occupied(existing) => {
                let transaction = self.get(*existing.get())?;
                debug!(
                    gateway_txn_id = %new.gateway_txn_id,
                    transaction_id = %transaction.id,
                    "Duplicate delivery"
                );
                Ok(Ingested {
                    transaction,
                    duplicate: true,
                })
            }
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let transaction = Transaction {
                    id: TransactionId::new(),
                    gateway_txn_id: new.gateway_txn_id,
                    gateway_reference: new.gateway_reference,
                    payer: new.payer,
                    payee: new.payee,
                    channel: new.channel,
                    gateway: new.gateway,
                    amount: new.amount,
                    currency: new.currency,
                    purpose: new.purpose,
                    raw_payload: new.raw_payload,
                    status: TransactionStatus::Pending,
                    journal_id: None,
                    failure_reason: None,
                    occurred_at: new.occurred_at,
                    created_at: now,
                    updated_at: now,
                };
                self.transactions.insert(transaction.id, transaction.clone());
                slot.insert(transaction.id);

                info!(
                    transaction_id = %transaction.id,
                    gateway_txn_id = %transaction.gateway_txn_id,
                    amount = %transaction.amount,
                    "Transaction recorded"
                );
                Ok(Ingested {
                    transaction,
                    duplicate: false,
                })
            }
        }
    }

    /// Get a transaction.
    pub fn get(&self, id: TransactionId) -> Result<Transaction> {
        self.transactions
            .get(&id)
            .map(|t| t.clone())
            .ok_or_else(|| LedgerError::not_found(Entity::Transaction, id))
    }

    /// Find a transaction by its gateway id.
    pub fn find_by_gateway_id(&self, gateway_txn_id: &GatewayTxnId) -> Option<Transaction> {
        let id = *self.by_gateway_id.get(gateway_txn_id)?;
        self.transactions.get(&id).map(|t| t.clone())
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.transactions.contains_key(&id)
    }

    /// Mark a pending transaction processed by `journal_id`.
    pub fn mark_processed(&self, id: TransactionId, journal_id: JournalId) -> Result<Transaction> {
        self.transition(id, TransactionStatus::Processed, |t| {
            t.journal_id = Some(journal_id);
        })
    }

    /// Mark a pending transaction failed.
    pub fn mark_failed(&self, id: TransactionId, reason: impl Into<String>) -> Result<Transaction> {
        let reason = reason.into();
        self.transition(id, TransactionStatus::Failed, |t| {
            t.failure_reason = Some(reason);
        })
    }

    fn transition(
        &self,
        id: TransactionId,
        next: TransactionStatus,
        apply: impl FnOnce(&mut Transaction),
    ) -> Result<Transaction> {
        let mut transaction = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found(Entity::Transaction, id))?;

        if !transaction.status.can_transition_to(next) {
            return Err(LedgerError::transition(
                Entity::Transaction,
                transaction.status,
                next,
            ));
        }

        transaction.status = next;
        transaction.updated_at = Utc::now();
        apply(&mut *transaction);
        Ok(transaction.clone())
    }

    /// Number of distinct transactions recorded.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// All transactions in a given status.
    pub fn with_status(&self, status: TransactionStatus) -> Vec<Transaction> {
        self.transactions
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicledger_common::now;
    use rust_decimal_macros::dec;

    fn delivery(gateway_txn_id: &str, amount: Decimal) -> NewTransaction {
        NewTransaction {
            gateway_txn_id: GatewayTxnId::new(gateway_txn_id),
            gateway_reference: Some("QK71H2".into()),
            payer: "254700000001".into(),
            payee: "600100".into(),
            channel: Channel::C2B,
            gateway: "mpesa".into(),
            amount,
            currency: Currency::kes(),
            purpose: TransactionPurpose::Unallocated,
            raw_payload: serde_json::json!({ "ResultCode": 0 }),
            occurred_at: now(),
        }
    }

    #[test]
    fn test_redelivery_is_deduplicated() {
        let log = TransactionLog::new();

        let first = log.ingest(delivery("MP-001", dec!(100))).unwrap();
        assert!(!first.duplicate);

        let second = log.ingest(delivery("MP-001", dec!(100))).unwrap();
        assert!(second.duplicate);
        assert_eq!(second.transaction.id, first.transaction.id);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_rejects_invalid_deliveries() {
        let log = TransactionLog::new();
        assert!(matches!(
            log.ingest(delivery("MP-002", dec!(0))),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            log.ingest(delivery("bad id!", dec!(10))),
            Err(LedgerError::Validation { .. })
        ));
        assert!(log.is_empty());
    }

    #[test]
    fn test_status_changes_once() {
        let log = TransactionLog::new();
        let ingested = log.ingest(delivery("MP-003", dec!(100))).unwrap();
        let id = ingested.transaction.id;

        let failed = log.mark_failed(id, "wallet locked").unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("wallet locked"));

        let again = log.mark_processed(id, JournalId::new());
        assert!(matches!(again, Err(LedgerError::InvalidTransition { .. })));

        let found = log.find_by_gateway_id(&GatewayTxnId::new("MP-003")).unwrap();
        assert_eq!(found.status, TransactionStatus::Failed);
    }
}
