//! Journal entries and their approval workflow.

use civicledger_common::{
    AccountId, Currency, JournalId, LedgerEntryId, Timestamp, TransactionId, UserId,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entry::EntryCategory;

/// Kind of journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalType {
    Operational,
    Adjustment,
    Accrual,
    Reversal,
    Closing,
    Opening,
    Transfer,
    Tax,
}

impl JournalType {
    /// Category carried by the ledger entries this journal posts.
    pub fn entry_category(&self) -> EntryCategory {
        match self {
            JournalType::Operational | JournalType::Transfer | JournalType::Tax => {
                EntryCategory::Operational
            }
            JournalType::Opening | JournalType::Closing => EntryCategory::NonOperational,
            JournalType::Adjustment => EntryCategory::Adjustment,
            JournalType::Accrual => EntryCategory::Accrual,
            JournalType::Reversal => EntryCategory::Reversal,
        }
    }
}

/// Journal status.
///
/// ```text
/// Pending -> Approved -> Posted
///    |
///    +-> Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalStatus {
    Pending,
    Approved,
    Rejected,
    Posted,
}

impl JournalStatus {
    /// Check if this is a terminal state.
    pub fn is_final(&self) -> bool {
        matches!(self, JournalStatus::Rejected | JournalStatus::Posted)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[JournalStatus] {
        match self {
            JournalStatus::Pending => &[JournalStatus::Approved, JournalStatus::Rejected],
            JournalStatus::Approved => &[JournalStatus::Posted],
            JournalStatus::Rejected | JournalStatus::Posted => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: JournalStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// A journal binding one debited and one credited account to an amount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique journal ID.
    pub id: JournalId,
    /// Human-readable reference number.
    pub reference: String,
    /// Originating transaction; `None` for manual journals.
    pub transaction_id: Option<TransactionId>,
    pub debit_account: AccountId,
    pub credit_account: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    /// Rate from `currency` into the base currency at creation.
    pub exchange_rate: Decimal,
    pub journal_type: JournalType,
    pub status: JournalStatus,
    pub description: String,
    pub created_by: Option<UserId>,
    pub approved_by: Option<UserId>,
    pub approved_at: Option<Timestamp>,
    pub rejection_reason: Option<String>,
    pub posted_at: Option<Timestamp>,
    /// Ledger entries created by posting: debit first, then credit.
    pub entry_ids: Option<[LedgerEntryId; 2]>,
    /// For a reversal, the journal it reverses.
    pub linked_journal_id: Option<JournalId>,
    /// Reversal posted against this journal.
    pub reversed_by: Option<JournalId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl JournalEntry {
    /// Build a pending journal.
    pub fn new(new: NewJournal, reference: String, exchange_rate: Decimal) -> Self {
        let now = Utc::now();

        Self {
            id: JournalId::new(),
            reference,
            transaction_id: new.transaction_id,
            debit_account: new.debit_account,
            credit_account: new.credit_account,
            amount: new.amount,
            currency: new.currency,
            exchange_rate,
            journal_type: new.journal_type,
            status: JournalStatus::Pending,
            description: new.description,
            created_by: new.created_by,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            posted_at: None,
            entry_ids: None,
            linked_journal_id: None,
            reversed_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build the approved reversal of this journal: accounts swapped, same amount.
    pub fn reversal(&self, reference: String, approver: UserId) -> Self {
        let now = Utc::now();

        Self {
            id: JournalId::new(),
            reference,
            transaction_id: self.transaction_id,
            debit_account: self.credit_account,
            credit_account: self.debit_account,
            amount: self.amount,
            currency: self.currency.clone(),
            exchange_rate: self.exchange_rate,
            journal_type: JournalType::Reversal,
            status: JournalStatus::Approved,
            description: format!("Reversal of {}", self.reference),
            created_by: Some(approver),
            approved_by: Some(approver),
            approved_at: Some(now),
            rejection_reason: None,
            posted_at: None,
            entry_ids: None,
            linked_journal_id: Some(self.id),
            reversed_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this journal has produced ledger entries.
    pub fn is_posted(&self) -> bool {
        self.status == JournalStatus::Posted
    }
}

/// Request to create a journal.
#[derive(Debug, Clone)]
pub struct NewJournal {
    pub transaction_id: Option<TransactionId>,
    pub debit_account: AccountId,
    pub credit_account: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub journal_type: JournalType,
    pub description: String,
    pub created_by: Option<UserId>,
}

impl NewJournal {
    /// An operational journal with no transaction link.
    pub fn new(
        debit_account: AccountId,
        credit_account: AccountId,
        amount: Decimal,
        currency: Currency,
    ) -> Self {
        Self {
            transaction_id: None,
            debit_account,
            credit_account,
            amount,
            currency,
            journal_type: JournalType::Operational,
            description: String::new(),
            created_by: None,
        }
    }

    pub fn for_transaction(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn of_type(mut self, journal_type: JournalType) -> Self {
        self.journal_type = journal_type;
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn created_by(mut self, user: UserId) -> Self {
        self.created_by = Some(user);
        self
    }
}

/// Result of posting a journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostedJournal {
    pub journal_id: JournalId,
    pub posted_at: Timestamp,
    /// Debit entry, then credit entry.
    pub ledger_entry_ids: [LedgerEntryId; 2],
}

/// Result of reversing a journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversedJournal {
    pub original_journal_id: JournalId,
    pub new_journal_id: JournalId,
    pub posting: PostedJournal,
}
