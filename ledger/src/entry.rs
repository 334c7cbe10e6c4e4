//! Posted ledger entries.

use std::collections::HashMap;

use civicledger_common::{
    AccountId, Currency, JournalId, LedgerEntryId, Timestamp, TransactionId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    /// Debit entry (increases asset/expense, decreases liability/equity/income).
    Debit,
    /// Credit entry (decreases asset/expense, increases liability/equity/income).
    Credit,
}

impl EntryType {
    /// The opposite side.
    pub fn opposite(&self) -> EntryType {
        match self {
            EntryType::Debit => EntryType::Credit,
            EntryType::Credit => EntryType::Debit,
        }
    }
}

/// Reporting category of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryCategory {
    Operational,
    NonOperational,
    Adjustment,
    Accrual,
    Reversal,
}

/// A single posted debit or credit against one account.
///
/// Entries are append-only. Only `reconciled` changes after posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID.
    pub id: LedgerEntryId,
    /// Human-readable reference number.
    pub reference: String,
    /// Journal whose posting created this entry.
    pub journal_id: JournalId,
    pub transaction_id: Option<TransactionId>,
    /// Account affected.
    pub account_id: AccountId,
    /// Entry type (debit or credit).
    pub entry_type: EntryType,
    pub category: EntryCategory,
    /// Amount in the account's currency.
    pub amount: Decimal,
    /// Account currency.
    pub currency: Currency,
    /// Rate from the journal currency into `currency`.
    pub exchange_rate: Decimal,
    /// Amount in the journal currency; equal on both entries of a posting.
    pub journal_amount: Decimal,
    pub journal_currency: Currency,
    /// Account balance after this entry.
    pub balance_after: Decimal,
    pub reconciled: bool,
    pub posting_date: Timestamp,
    pub value_date: Timestamp,
    /// Global commit order.
    pub sequence: u64,
}

/// The entries of one journal posting, checked before they are committed.
#[derive(Debug, Clone)]
pub struct PostingBatch {
    /// Entries in the batch.
    pub entries: Vec<LedgerEntry>,
    /// Journal the batch posts.
    pub journal_id: JournalId,
}

impl PostingBatch {
    /// Create a new batch.
    pub fn new(journal_id: JournalId) -> Self {
        Self {
            entries: Vec::new(),
            journal_id,
        }
    }

    /// Add an entry to the batch.
    pub fn add_entry(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }

    /// Debits equal credits per journal currency.
    pub fn is_balanced(&self) -> bool {
        let mut balances: HashMap<&Currency, Decimal> = HashMap::new();

        for entry in &self.entries {
            let amount = match entry.entry_type {
                EntryType::Debit => entry.journal_amount,
                EntryType::Credit => -entry.journal_amount,
            };
            *balances.entry(&entry.journal_currency).or_insert(Decimal::ZERO) += amount;
        }

        balances.values().all(|&balance| balance == Decimal::ZERO)
    }

    /// Exactly one debit and one credit, against different accounts.
    pub fn is_paired(&self) -> bool {
        match self.entries.as_slice() {
            [a, b] => a.entry_type != b.entry_type && a.account_id != b.account_id,
            _ => false,
        }
    }

    /// Total debits in journal currency.
    pub fn total_debits(&self) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Debit)
            .map(|e| e.journal_amount)
            .sum()
    }

    /// Total credits in journal currency.
    pub fn total_credits(&self) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Credit)
            .map(|e| e.journal_amount)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicledger_common::now;
    use rust_decimal_macros::dec;

    fn entry(journal_id: JournalId, entry_type: EntryType, amount: Decimal) -> LedgerEntry {
        LedgerEntry {
            id: LedgerEntryId::new(),
            reference: "LE-20260101-000001".into(),
            journal_id,
            transaction_id: None,
            account_id: AccountId::new(),
            entry_type,
            category: EntryCategory::Operational,
            amount,
            currency: Currency::kes(),
            exchange_rate: Decimal::ONE,
            journal_amount: amount,
            journal_currency: Currency::kes(),
            balance_after: amount,
            reconciled: false,
            posting_date: now(),
            value_date: now(),
            sequence: 0,
        }
    }

    #[test]
    fn test_balanced_batch() {
        let journal_id = JournalId::new();
        let mut batch = PostingBatch::new(journal_id);
        batch.add_entry(entry(journal_id, EntryType::Debit, dec!(1000)));
        batch.add_entry(entry(journal_id, EntryType::Credit, dec!(1000)));

        assert!(batch.is_balanced());
        assert!(batch.is_paired());
        assert_eq!(batch.total_debits(), dec!(1000));
        assert_eq!(batch.total_credits(), dec!(1000));
    }

    #[test]
    fn test_unbalanced_batch() {
        let journal_id = JournalId::new();
        let mut batch = PostingBatch::new(journal_id);
        batch.add_entry(entry(journal_id, EntryType::Debit, dec!(1000)));
        assert!(!batch.is_balanced());
        assert!(!batch.is_paired());

        batch.add_entry(entry(journal_id, EntryType::Credit, dec!(999)));
        assert!(!batch.is_balanced());
    }
}
