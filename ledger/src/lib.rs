//! CivicLedger Ledger Engine
//!
//! Double-entry ledger for the settlement core: a hierarchical chart of
//! accounts, journals with an approval gate, and append-only ledger entries
//! posted in balanced debit/credit pairs.
//!
//! Every account balance equals its opening balance plus the signed sum of
//! its posted entries. [`PostingEngine::account_balance`] replays the
//! history to check this and reports, never corrects, any discrepancy.

pub mod account;
pub mod balance;
pub mod engine;
pub mod entry;
pub mod journal;
pub mod store;
pub mod transaction;

pub use account::{Account, AccountStatus, AccountType, NewAccount};
pub use balance::{BalanceReport, ReconciliationSummary};
pub use engine::PostingEngine;
pub use entry::{EntryCategory, EntryType, LedgerEntry, PostingBatch};
pub use journal::{
    JournalEntry, JournalStatus, JournalType, NewJournal, PostedJournal, ReversedJournal,
};
pub use store::LedgerStore;
pub use transaction::{
    Channel, Ingested, NewTransaction, Transaction, TransactionLog, TransactionPurpose,
    TransactionStatus,
};
