//! Identifier types for ledger entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Declares a UUID-backed entity identifier.
///
/// Identifiers use UUID v7 so they sort by creation time. They serve as the
/// globally unique external identifier of a row.
macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new time-ordered identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Identifier of a chart-of-accounts node.
    AccountId
);
entity_id!(
    /// Identifier of a journal entry.
    JournalId
);
entity_id!(
    /// Identifier of a posted ledger entry.
    LedgerEntryId
);
entity_id!(
    /// Identifier of an ingested monetary transaction.
    TransactionId
);
entity_id!(
    /// Identifier of a wallet.
    WalletId
);
entity_id!(
    /// Identifier of an invoice.
    InvoiceId
);
entity_id!(
    /// Identifier of a receipt.
    ReceiptId
);
entity_id!(
    /// Identifier of a portal user (citizen, resident, diplomat or staff).
    UserId
);

/// Transaction identifier assigned by the payment gateway.
///
/// This is the deduplication key for gateway callbacks: the same value can
/// only ever produce one Transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayTxnId(String);

impl GatewayTxnId {
    /// Create a new gateway transaction ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate the identifier format.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 64
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl fmt::Display for GatewayTxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GatewayTxnId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for GatewayTxnId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Prefix of a human-readable reference number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Journal,
    LedgerEntry,
    Invoice,
    Receipt,
}

impl ReferenceKind {
    /// Prefix used in the reference number.
    pub fn prefix(&self) -> &'static str {
        match self {
            ReferenceKind::Journal => "JE",
            ReferenceKind::LedgerEntry => "LE",
            ReferenceKind::Invoice => "INV",
            ReferenceKind::Receipt => "RCT",
        }
    }
}

/// Issues unique reference numbers of the form `PREFIX-YYYYMMDD-NNNNNN`.
///
/// The sequence is shared by all kinds, so two references never collide even
/// when they carry different prefixes.
#[derive(Debug, Default)]
pub struct ReferenceGenerator {
    sequence: AtomicU64,
}

impl ReferenceGenerator {
    /// Create a generator starting at 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next reference for the given kind.
    pub fn next(&self, kind: ReferenceKind, at: DateTime<Utc>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}-{:06}", kind.prefix(), at.format("%Y%m%d"), seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ids_are_unique() {
        let id1 = JournalId::new();
        let id2 = JournalId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_gateway_txn_id_validation() {
        assert!(GatewayTxnId::new("QKT4ABC123").is_valid());
        assert!(GatewayTxnId::new(" ws_CO_191020261 ").is_valid());
        assert!(!GatewayTxnId::new("").is_valid());
        assert!(!GatewayTxnId::new("has space").is_valid());
    }

    #[test]
    fn test_reference_numbers() {
        let generator = ReferenceGenerator::new();
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap();

        assert_eq!(generator.next(ReferenceKind::Journal, at), "JE-20261019-000001");
        assert_eq!(generator.next(ReferenceKind::Invoice, at), "INV-20261019-000002");
    }
}
