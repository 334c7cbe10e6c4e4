//! Error types for the settlement core.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{AccountId, Currency, JournalId, WalletId};

/// Entity named in not-found and transition errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entity {
    Currency,
    Account,
    Journal,
    LedgerEntry,
    Transaction,
    Wallet,
    Invoice,
    Receipt,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Currency => "currency",
            Entity::Account => "account",
            Entity::Journal => "journal",
            Entity::LedgerEntry => "ledger entry",
            Entity::Transaction => "transaction",
            Entity::Wallet => "wallet",
            Entity::Invoice => "invoice",
            Entity::Receipt => "receipt",
        };
        f.write_str(name)
    }
}

/// Which wallet limit a debit ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Cap on a single debit.
    Transaction,
    /// Rolling 24-hour debit total.
    Daily,
    /// Rolling 30-day debit total.
    Monthly,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LimitKind::Transaction => "transaction",
            LimitKind::Daily => "daily",
            LimitKind::Monthly => "monthly",
        };
        f.write_str(name)
    }
}

/// Broad class of an error, used by callers to decide how to respond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad input, rejected before any write.
    Validation,
    /// Caller precondition violated against current state.
    StateConflict,
    /// Expected business-rule rejection (funds, limits, locks).
    Resource,
    /// Stored state disagrees with its own history.
    Integrity,
    /// Referenced entity does not exist.
    NotFound,
}

/// Main error type for ledger, wallet and settlement operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Amount must be strictly positive.
    #[error("Invalid amount: {0} (must be greater than zero)")]
    InvalidAmount(Decimal),

    /// Journal debits and credits the same account.
    #[error("Debited and credited account are the same: {0}")]
    SameAccount(AccountId),

    /// Accounts use currencies with no resolvable exchange rate.
    #[error("Unbalanced accounts: no exchange rate from {from} to {to}")]
    UnbalancedAccounts { from: Currency, to: Currency },

    /// Generic validation failure on a field.
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },

    /// Journal was already posted.
    #[error("Journal already posted: {0}")]
    AlreadyPosted(JournalId),

    /// Journal was already reversed.
    #[error("Journal already reversed: {original} by {reversal}")]
    AlreadyReversed {
        original: JournalId,
        reversal: JournalId,
    },

    /// Status change not allowed from the current state.
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: Entity,
        from: String,
        to: String,
    },

    /// Release or capture of more than is on hold.
    #[error("Invalid hold: requested {requested}, held {held}")]
    InvalidHold { requested: Decimal, held: Decimal },

    /// Payment larger than the outstanding balance.
    #[error("Overpayment: amount {amount} exceeds balance {balance}")]
    Overpayment { amount: Decimal, balance: Decimal },

    /// Refund larger than what was paid.
    #[error("Invalid refund: amount {amount} exceeds paid {paid}")]
    InvalidRefund { amount: Decimal, paid: Decimal },

    /// Receipt reference already applied to the invoice.
    #[error("Payment {receipt_ref} already applied")]
    DuplicatePayment { receipt_ref: String },

    /// Entity number or key already in use.
    #[error("Duplicate {entity}: {key}")]
    Duplicate { entity: Entity, key: String },

    /// Insufficient funds.
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    /// Debit would exceed a configured limit.
    #[error("{kind} limit exceeded: limit {limit}, attempted total {attempted}")]
    LimitExceeded {
        kind: LimitKind,
        limit: Decimal,
        attempted: Decimal,
    },

    /// Wallet is locked.
    #[error("Wallet {wallet_id} is locked: {reason}")]
    WalletLocked { wallet_id: WalletId, reason: String },

    /// Wallet status does not allow the operation.
    #[error("Wallet {wallet_id} is {status}")]
    WalletUnavailable { wallet_id: WalletId, status: String },

    /// Account status does not allow posting.
    #[error("Account {account_id} is {status}")]
    AccountUnavailable { account_id: AccountId, status: String },

    /// Stored balance disagrees with the ledger replay.
    #[error("Reconciliation mismatch on {account_id}: stored {stored}, replayed {replayed}")]
    ReconciliationMismatch {
        account_id: AccountId,
        stored: Decimal,
        replayed: Decimal,
    },

    /// Ledger totals do not balance.
    #[error("Ledger integrity violation: {0}")]
    IntegrityViolation(String),

    /// Service is not accepting requests.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Shorthand for a not-found error.
    pub fn not_found(entity: Entity, id: impl fmt::Display) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for a field validation error.
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        LedgerError::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Shorthand for an invalid status transition.
    pub fn transition(entity: Entity, from: impl fmt::Debug, to: impl fmt::Debug) -> Self {
        LedgerError::InvalidTransition {
            entity,
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount(_)
            | LedgerError::SameAccount(_)
            | LedgerError::UnbalancedAccounts { .. }
            | LedgerError::Validation { .. } => ErrorKind::Validation,
            LedgerError::NotFound { .. } => ErrorKind::NotFound,
            LedgerError::AlreadyPosted(_)
            | LedgerError::AlreadyReversed { .. }
            | LedgerError::InvalidTransition { .. }
            | LedgerError::InvalidHold { .. }
            | LedgerError::Overpayment { .. }
            | LedgerError::InvalidRefund { .. }
            | LedgerError::DuplicatePayment { .. }
            | LedgerError::Duplicate { .. }
            | LedgerError::AccountUnavailable { .. }
            | LedgerError::Unavailable(_) => ErrorKind::StateConflict,
            LedgerError::InsufficientFunds { .. }
            | LedgerError::LimitExceeded { .. }
            | LedgerError::WalletLocked { .. }
            | LedgerError::WalletUnavailable { .. } => ErrorKind::Resource,
            LedgerError::ReconciliationMismatch { .. } | LedgerError::IntegrityViolation(_) => {
                ErrorKind::Integrity
            }
        }
    }

    /// Whether the error is an expected rejection the caller should show
    /// the user with a specific message.
    pub fn is_business_rejection(&self) -> bool {
        self.kind() == ErrorKind::Resource || matches!(self, LedgerError::Overpayment { .. })
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::SameAccount(_) => "SAME_ACCOUNT",
            LedgerError::UnbalancedAccounts { .. } => "UNBALANCED_ACCOUNTS",
            LedgerError::Validation { .. } => "VALIDATION_FAILED",
            LedgerError::NotFound { .. } => "NOT_FOUND",
            LedgerError::AlreadyPosted(_) => "ALREADY_POSTED",
            LedgerError::AlreadyReversed { .. } => "ALREADY_REVERSED",
            LedgerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            LedgerError::InvalidHold { .. } => "INVALID_HOLD",
            LedgerError::Overpayment { .. } => "OVERPAYMENT",
            LedgerError::InvalidRefund { .. } => "INVALID_REFUND",
            LedgerError::DuplicatePayment { .. } => "DUPLICATE_PAYMENT",
            LedgerError::Duplicate { .. } => "DUPLICATE",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            LedgerError::WalletLocked { .. } => "WALLET_LOCKED",
            LedgerError::WalletUnavailable { .. } => "WALLET_UNAVAILABLE",
            LedgerError::AccountUnavailable { .. } => "ACCOUNT_UNAVAILABLE",
            LedgerError::ReconciliationMismatch { .. } => "RECONCILIATION_MISMATCH",
            LedgerError::IntegrityViolation(_) => "INTEGRITY_VIOLATION",
            LedgerError::Unavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = LedgerError::InsufficientFunds {
            required: Decimal::from(600),
            available: Decimal::from(500),
        };
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.is_business_rejection());
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");

        let err = LedgerError::AlreadyPosted(JournalId::new());
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert!(!err.is_business_rejection());

        let err = LedgerError::Overpayment {
            amount: Decimal::from(1500),
            balance: Decimal::from(1000),
        };
        assert!(err.is_business_rejection());

        assert_eq!(LedgerError::InvalidAmount(Decimal::ZERO).kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_error_messages() {
        let err = LedgerError::LimitExceeded {
            kind: LimitKind::Daily,
            limit: Decimal::from(1000),
            attempted: Decimal::from(1200),
        };
        assert_eq!(
            err.to_string(),
            "daily limit exceeded: limit 1000, attempted total 1200"
        );

        let err = LedgerError::not_found(Entity::Wallet, "w-1");
        assert_eq!(err.to_string(), "wallet not found: w-1");
    }
}
