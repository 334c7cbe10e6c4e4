//! In-memory row store for accounts, journals and ledger entries.
//!
//! Accounts and journals are individually locked rows. Posting takes the
//! commit guard shared, the journal row, then both account rows in
//! ascending id order. Integrity checks take the commit guard exclusively
//! to see no half-committed posting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use civicledger_common::{AccountId, Entity, JournalId, LedgerEntryId, LedgerError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::account::Account;
use crate::entry::{LedgerEntry, PostingBatch};
use crate::journal::JournalEntry;

pub(crate) type AccountRow = Arc<Mutex<Account>>;
pub(crate) type JournalRow = Arc<Mutex<JournalEntry>>;

#[derive(Default)]
pub struct LedgerStore {
    accounts: DashMap<AccountId, AccountRow>,
    account_numbers: DashMap<String, AccountId>,
    children: DashMap<AccountId, Vec<AccountId>>,
    journals: DashMap<JournalId, JournalRow>,
    entries: DashMap<LedgerEntryId, LedgerEntry>,
    /// Entry ids per account in commit order.
    account_entries: DashMap<AccountId, Vec<LedgerEntryId>>,
    journal_entries: DashMap<JournalId, Vec<LedgerEntryId>>,
    sequence: AtomicU64,
    commit: RwLock<()>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an account, reserving its number.
    pub(crate) fn insert_account(&self, account: Account) -> Result<()> {
        match self.account_numbers.entry(account.number.clone()) {
            Entry::Occupied(_) => Err(LedgerError::Duplicate {
                entity: Entity::Account,
                key: account.number,
            }),
            Entry::Vacant(slot) => {
                let id = account.id;
                if let Some(parent) = account.parent_id {
                    self.children.entry(parent).or_default().push(id);
                }
                self.accounts.insert(id, Arc::new(Mutex::new(account)));
                slot.insert(id);
                Ok(())
            }
        }
    }

    pub(crate) fn account_row(&self, id: AccountId) -> Result<AccountRow> {
        self.accounts
            .get(&id)
            .map(|row| Arc::clone(&row))
            .ok_or_else(|| LedgerError::not_found(Entity::Account, id))
    }

    pub(crate) fn account(&self, id: AccountId) -> Result<Account> {
        Ok(self.account_row(id)?.lock().clone())
    }

    pub(crate) fn account_id_by_number(&self, number: &str) -> Result<AccountId> {
        self.account_numbers
            .get(number)
            .map(|id| *id)
            .ok_or_else(|| LedgerError::not_found(Entity::Account, number))
    }

    pub(crate) fn account_ids(&self) -> Vec<AccountId> {
        self.accounts.iter().map(|row| *row.key()).collect()
    }

    pub(crate) fn child_ids(&self, parent: AccountId) -> Vec<AccountId> {
        self.children
            .get(&parent)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub(crate) fn insert_journal(&self, journal: JournalEntry) {
        self.journals.insert(journal.id, Arc::new(Mutex::new(journal)));
    }

    pub(crate) fn journal_row(&self, id: JournalId) -> Result<JournalRow> {
        self.journals
            .get(&id)
            .map(|row| Arc::clone(&row))
            .ok_or_else(|| LedgerError::not_found(Entity::Journal, id))
    }

    pub(crate) fn journal_rows(&self) -> Vec<JournalRow> {
        self.journals.iter().map(|row| Arc::clone(row.value())).collect()
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Append a checked posting. Callers hold both account rows.
    pub(crate) fn append(&self, batch: PostingBatch) {
        let ids: Vec<LedgerEntryId> = batch.entries.iter().map(|e| e.id).collect();
        for entry in batch.entries {
            self.account_entries
                .entry(entry.account_id)
                .or_default()
                .push(entry.id);
            self.entries.insert(entry.id, entry);
        }
        self.journal_entries
            .entry(batch.journal_id)
            .or_default()
            .extend(ids);
    }

    pub(crate) fn entry(&self, id: LedgerEntryId) -> Result<LedgerEntry> {
        self.entries
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| LedgerError::not_found(Entity::LedgerEntry, id))
    }

    /// Entries for an account in commit order.
    pub(crate) fn entries_for_account(&self, account_id: AccountId) -> Vec<LedgerEntry> {
        self.collect(self.account_entries.get(&account_id).map(|ids| ids.clone()))
    }

    pub(crate) fn entries_for_journal(&self, journal_id: JournalId) -> Vec<LedgerEntry> {
        self.collect(self.journal_entries.get(&journal_id).map(|ids| ids.clone()))
    }

    fn collect(&self, ids: Option<Vec<LedgerEntryId>>) -> Vec<LedgerEntry> {
        ids.unwrap_or_default()
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| e.clone()))
            .collect()
    }

    pub(crate) fn all_entries(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self.entries.iter().map(|e| e.clone()).collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Flag entries as reconciled; returns how many changed.
    pub(crate) fn mark_reconciled(&self, ids: &[LedgerEntryId]) -> usize {
        let mut changed = 0;
        for id in ids {
            if let Some(mut entry) = self.entries.get_mut(id) {
                if !entry.reconciled {
                    entry.reconciled = true;
                    changed += 1;
                }
            }
        }
        changed
    }

    pub(crate) fn commit_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.commit.read()
    }

    pub(crate) fn snapshot_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit.write()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn journal_count(&self) -> usize {
        self.journals.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Lock two distinct account rows in ascending id order, returned as (a, b).
pub(crate) fn lock_pair<'a>(
    a_id: AccountId,
    a: &'a Mutex<Account>,
    b_id: AccountId,
    b: &'a Mutex<Account>,
) -> (MutexGuard<'a, Account>, MutexGuard<'a, Account>) {
    if a_id < b_id {
        let first = a.lock();
        let second = b.lock();
        (first, second)
    } else {
        let first = b.lock();
        let second = a.lock();
        (second, first)
    }
}
