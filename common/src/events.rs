//! Domain events published to the notification dispatcher.
//!
//! Engines publish an event only after the state change it describes has
//! been applied. Delivery (SMS, email, push) belongs to whoever subscribes.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    AccountId, Currency, GatewayTxnId, InvoiceId, JournalId, LedgerEntryId, ReceiptId, Timestamp,
    TransactionId, UserId, WalletId,
};

/// A state change in the settlement core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    TransactionIngested {
        transaction_id: TransactionId,
        gateway_txn_id: GatewayTxnId,
        amount: Decimal,
        currency: Currency,
    },
    JournalApproved {
        journal_id: JournalId,
        approver: UserId,
    },
    JournalRejected {
        journal_id: JournalId,
        reason: String,
    },
    JournalPosted {
        journal_id: JournalId,
        entries: [LedgerEntryId; 2],
        posted_at: Timestamp,
    },
    JournalReversed {
        original: JournalId,
        reversal: JournalId,
    },
    WalletCredited {
        wallet_id: WalletId,
        user_id: UserId,
        amount: Decimal,
        available: Decimal,
        reason: String,
    },
    WalletDebited {
        wallet_id: WalletId,
        user_id: UserId,
        amount: Decimal,
        available: Decimal,
        reason: String,
    },
    WalletHeld {
        wallet_id: WalletId,
        amount: Decimal,
        hold: Decimal,
    },
    WalletHoldReleased {
        wallet_id: WalletId,
        amount: Decimal,
        hold: Decimal,
    },
    WalletHoldCaptured {
        wallet_id: WalletId,
        amount: Decimal,
        hold: Decimal,
    },
    WalletLocked {
        wallet_id: WalletId,
        reason: String,
        until: Option<Timestamp>,
    },
    WalletUnlocked {
        wallet_id: WalletId,
    },
    InvoicePaymentApplied {
        invoice_id: InvoiceId,
        receipt_ref: String,
        amount: Decimal,
        balance: Decimal,
    },
    InvoiceSettled {
        invoice_id: InvoiceId,
        user_id: UserId,
    },
    InvoiceOverdue {
        invoice_id: InvoiceId,
        user_id: UserId,
        balance: Decimal,
    },
    InvoiceCancelled {
        invoice_id: InvoiceId,
        reason: String,
    },
    InvoiceRefunded {
        invoice_id: InvoiceId,
        amount: Decimal,
        paid: Decimal,
    },
    ReceiptIssued {
        receipt_id: ReceiptId,
        reference: String,
        invoice_id: Option<InvoiceId>,
        amount: Decimal,
    },
    ReconciliationMismatch {
        account_id: AccountId,
        stored: Decimal,
        replayed: Decimal,
    },
}

impl LedgerEvent {
    /// Dotted event name subscribers route on.
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::TransactionIngested { .. } => "transaction.ingested",
            LedgerEvent::JournalApproved { .. } => "journal.approved",
            LedgerEvent::JournalRejected { .. } => "journal.rejected",
            LedgerEvent::JournalPosted { .. } => "journal.posted",
            LedgerEvent::JournalReversed { .. } => "journal.reversed",
            LedgerEvent::WalletCredited { .. } => "wallet.credited",
            LedgerEvent::WalletDebited { .. } => "wallet.debited",
            LedgerEvent::WalletHeld { .. } => "wallet.held",
            LedgerEvent::WalletHoldReleased { .. } => "wallet.hold_released",
            LedgerEvent::WalletHoldCaptured { .. } => "wallet.hold_captured",
            LedgerEvent::WalletLocked { .. } => "wallet.locked",
            LedgerEvent::WalletUnlocked { .. } => "wallet.unlocked",
            LedgerEvent::InvoicePaymentApplied { .. } => "invoice.payment_applied",
            LedgerEvent::InvoiceSettled { .. } => "invoice.settled",
            LedgerEvent::InvoiceOverdue { .. } => "invoice.overdue",
            LedgerEvent::InvoiceCancelled { .. } => "invoice.cancelled",
            LedgerEvent::InvoiceRefunded { .. } => "invoice.refunded",
            LedgerEvent::ReceiptIssued { .. } => "receipt.issued",
            LedgerEvent::ReconciliationMismatch { .. } => "account.reconciliation_mismatch",
        }
    }
}

/// Receives events from the engines.
pub trait EventSink: Send + Sync {
    /// Publish an event. Must not block on delivery.
    fn publish(&self, event: LedgerEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: LedgerEvent) {}
}

/// Keeps every event in memory, in publish order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LedgerEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events published so far.
    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events.lock().clone()
    }

    /// Names of all events published so far.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(LedgerEvent::name).collect()
    }

    /// Number of events with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: LedgerEvent) {
        self.events.lock().push(event);
    }
}

/// Forwards events to an async consumer over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LedgerEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver the dispatcher reads from.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LedgerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: LedgerEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!(event = e.0.name(), "Event dispatcher gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlocked() -> LedgerEvent {
        LedgerEvent::WalletUnlocked {
            wallet_id: WalletId::new(),
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(unlocked().name(), "wallet.unlocked");
        let event = LedgerEvent::InvoiceSettled {
            invoice_id: InvoiceId::new(),
            user_id: UserId::new(),
        };
        assert_eq!(event.name(), "invoice.settled");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(unlocked()).unwrap();
        assert_eq!(json["event"], "wallet_unlocked");
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.publish(unlocked());
        sink.publish(unlocked());
        assert_eq!(sink.count("wallet.unlocked"), 2);
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = ChannelSink::new();
        sink.publish(unlocked());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "wallet.unlocked");

        drop(rx);
        // Publishing after the receiver is gone must not panic.
        sink.publish(unlocked());
    }
}
