//! Posting engine: the only component that creates ledger entries and
//! mutates account balances.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use civicledger_common::{
    now, AccountId, Currency, Entity, EventSink, JournalId, LedgerEntryId, LedgerError,
    LedgerEvent, Money, ReferenceGenerator, ReferenceKind, Result, Timestamp, TransactionId,
    UserId,
};
use civicledger_fx::CurrencyRegistry;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use crate::account::{Account, AccountStatus, NewAccount};
use crate::balance::{replay, BalanceReport, ReconciliationSummary};
use crate::entry::{EntryType, LedgerEntry, PostingBatch};
use crate::journal::{
    JournalEntry, JournalStatus, NewJournal, PostedJournal, ReversedJournal,
};
use crate::store::{lock_pair, LedgerStore};
use crate::transaction::{Ingested, NewTransaction, TransactionLog};

/// Where posting takes its conversion rates from.
enum Rates {
    /// Resolve journal currency into each account currency at this instant.
    At(Timestamp),
    /// Reuse the rates of the entries being reversed.
    Fixed { debit: Decimal, credit: Decimal },
}

/// The posting engine manages the chart of accounts, journals and the
/// double-entry ledger.
pub struct PostingEngine {
    store: LedgerStore,
    transactions: TransactionLog,
    registry: Arc<CurrencyRegistry>,
    references: Arc<ReferenceGenerator>,
    events: Arc<dyn EventSink>,
}

impl PostingEngine {
    /// Create a new posting engine.
    pub fn new(
        registry: Arc<CurrencyRegistry>,
        references: Arc<ReferenceGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store: LedgerStore::new(),
            transactions: TransactionLog::new(),
            registry,
            references,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<CurrencyRegistry> {
        &self.registry
    }

    pub fn transactions(&self) -> &TransactionLog {
        &self.transactions
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    // Chart of accounts

    /// Open an account in the chart.
    #[instrument(skip(self, new), fields(number = %new.number))]
    pub fn open_account(&self, new: NewAccount) -> Result<Account> {
        if new.number.trim().is_empty() {
            return Err(LedgerError::validation("account number is required", "number"));
        }
        if new.name.trim().is_empty() {
            return Err(LedgerError::validation("account name is required", "name"));
        }
        self.registry.active_currency(&new.currency)?;

        if let Some(parent_id) = new.parent_id {
            let parent = self.store.account(parent_id)?;
            if parent.account_type != new.account_type {
                return Err(LedgerError::validation(
                    format!(
                        "child type {:?} does not match parent type {:?}",
                        new.account_type, parent.account_type
                    ),
                    "parent_id",
                ));
            }
            if parent.status == AccountStatus::Closed {
                return Err(LedgerError::AccountUnavailable {
                    account_id: parent_id,
                    status: "closed".into(),
                });
            }
        }

        let account = Account::open(new);
        self.store.insert_account(account.clone())?;

        info!(
            account_id = %account.id,
            number = %account.number,
            account_type = ?account.account_type,
            currency = %account.currency,
            "Account opened"
        );
        Ok(account)
    }

    /// Get an account.
    pub fn account(&self, id: AccountId) -> Result<Account> {
        self.store.account(id)
    }

    /// Get an account by number.
    pub fn account_by_number(&self, number: &str) -> Result<Account> {
        self.store.account(self.store.account_id_by_number(number)?)
    }

    /// Direct children of an account.
    pub fn children(&self, parent: AccountId) -> Result<Vec<Account>> {
        self.store.account_row(parent)?;
        self.store
            .child_ids(parent)
            .into_iter()
            .map(|id| self.store.account(id))
            .collect()
    }

    /// Ancestors of an account, nearest first.
    pub fn ancestors(&self, id: AccountId) -> Result<Vec<Account>> {
        let mut ancestors = Vec::new();
        let mut next = self.store.account(id)?.parent_id;
        while let Some(parent_id) = next {
            let parent = self.store.account(parent_id)?;
            next = parent.parent_id;
            ancestors.push(parent);
        }
        Ok(ancestors)
    }

    /// Sum of current balances over the subtree rooted at `root`.
    pub fn subtree_balance(&self, root: AccountId) -> Result<Money> {
        let root_account = self.store.account(root)?;
        let mut total = Decimal::ZERO;
        let mut queue = VecDeque::from([root]);

        while let Some(id) = queue.pop_front() {
            let account = self.store.account(id)?;
            if account.currency != root_account.currency {
                return Err(LedgerError::UnbalancedAccounts {
                    from: root_account.currency.clone(),
                    to: account.currency,
                });
            }
            total += account.current_balance;
            queue.extend(self.store.child_ids(id));
        }

        Ok(Money::new(total, root_account.currency))
    }

    /// Stop postings to an account.
    pub fn freeze_account(&self, id: AccountId, by: Option<UserId>) -> Result<Account> {
        self.set_account_status(id, AccountStatus::Frozen, by)
    }

    /// Resume postings to a frozen account.
    pub fn unfreeze_account(&self, id: AccountId, by: Option<UserId>) -> Result<Account> {
        self.set_account_status(id, AccountStatus::Active, by)
    }

    /// Close an account with a zero balance.
    pub fn close_account(&self, id: AccountId, by: Option<UserId>) -> Result<Account> {
        self.set_account_status(id, AccountStatus::Closed, by)
    }

    fn set_account_status(
        &self,
        id: AccountId,
        next: AccountStatus,
        by: Option<UserId>,
    ) -> Result<Account> {
        let row = self.store.account_row(id)?;
        let mut account = row.lock();

        if !account.status.can_transition_to(next) {
            return Err(LedgerError::transition(Entity::Account, account.status, next));
        }
        if next == AccountStatus::Closed && !account.current_balance.is_zero() {
            return Err(LedgerError::validation(
                format!("balance {} must be zero to close", account.current_balance),
                "current_balance",
            ));
        }

        let at = now();
        account.status = next;
        account.updated_by = by;
        account.updated_at = at;
        if next == AccountStatus::Closed {
            account.deleted_at = Some(at);
        }

        info!(account_id = %id, status = ?next, "Account status changed");
        Ok(account.clone())
    }

    // Transactions

    /// Record a gateway delivery; redeliveries return the existing record.
    pub fn ingest_transaction(&self, new: NewTransaction) -> Result<Ingested> {
        let ingested = self.transactions.ingest(new)?;
        if !ingested.duplicate {
            let transaction = &ingested.transaction;
            self.events.publish(LedgerEvent::TransactionIngested {
                transaction_id: transaction.id,
                gateway_txn_id: transaction.gateway_txn_id.clone(),
                amount: transaction.amount,
                currency: transaction.currency.clone(),
            });
        }
        Ok(ingested)
    }

    // Journals

    /// Create a pending journal.
    #[instrument(skip(self, new), fields(amount = %new.amount, currency = %new.currency))]
    pub fn create_journal(&self, new: NewJournal) -> Result<JournalEntry> {
        if new.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(new.amount));
        }
        if new.debit_account == new.credit_account {
            return Err(LedgerError::SameAccount(new.debit_account));
        }

        let currency = self.registry.active_currency(&new.currency)?;
        if currency.round(new.amount) != new.amount {
            return Err(LedgerError::validation(
                format!(
                    "amount {} exceeds {} decimal places of {}",
                    new.amount, currency.decimal_places, currency.code
                ),
                "amount",
            ));
        }

        if let Some(transaction_id) = new.transaction_id {
            if !self.transactions.contains(transaction_id) {
                return Err(LedgerError::not_found(Entity::Transaction, transaction_id));
            }
        }

        let at = now();
        for account_id in [new.debit_account, new.credit_account] {
            let account = self.store.account(account_id)?;
            ensure_transactable(&account)?;
            self.registry.rate_at(&new.currency, &account.currency, at)?;
        }
        let exchange_rate = self
            .registry
            .rate_at(&new.currency, self.registry.base(), at)?
            .rate;

        let reference = self.references.next(ReferenceKind::Journal, at);
        let journal = JournalEntry::new(new, reference, exchange_rate);
        self.store.insert_journal(journal.clone());

        info!(
            journal_id = %journal.id,
            reference = %journal.reference,
            journal_type = ?journal.journal_type,
            "Journal created"
        );
        Ok(journal)
    }

    /// Get a journal.
    pub fn journal(&self, id: JournalId) -> Result<JournalEntry> {
        Ok(self.store.journal_row(id)?.lock().clone())
    }

    /// Approve a pending journal.
    #[instrument(skip(self))]
    pub fn approve_journal(&self, id: JournalId, approver: UserId) -> Result<JournalEntry> {
        let row = self.store.journal_row(id)?;
        let mut journal = row.lock();

        if !journal.status.can_transition_to(JournalStatus::Approved) {
            return Err(LedgerError::transition(
                Entity::Journal,
                journal.status,
                JournalStatus::Approved,
            ));
        }

        let at = now();
        journal.status = JournalStatus::Approved;
        journal.approved_by = Some(approver);
        journal.approved_at = Some(at);
        journal.updated_at = at;
        let approved = journal.clone();
        drop(journal);

        self.events.publish(LedgerEvent::JournalApproved {
            journal_id: id,
            approver,
        });
        info!(journal_id = %id, approver = %approver, "Journal approved");
        Ok(approved)
    }

    /// Reject a pending journal.
    #[instrument(skip(self, reason))]
    pub fn reject_journal(
        &self,
        id: JournalId,
        approver: UserId,
        reason: impl Into<String>,
    ) -> Result<JournalEntry> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(LedgerError::validation("rejection reason is required", "reason"));
        }

        let row = self.store.journal_row(id)?;
        let mut journal = row.lock();

        if !journal.status.can_transition_to(JournalStatus::Rejected) {
            return Err(LedgerError::transition(
                Entity::Journal,
                journal.status,
                JournalStatus::Rejected,
            ));
        }

        journal.status = JournalStatus::Rejected;
        journal.approved_by = Some(approver);
        journal.rejection_reason = Some(reason.clone());
        journal.updated_at = now();
        let rejected = journal.clone();
        drop(journal);

        self.events.publish(LedgerEvent::JournalRejected {
            journal_id: id,
            reason: reason.clone(),
        });
        info!(journal_id = %id, reason = %reason, "Journal rejected");
        Ok(rejected)
    }

    /// Post an approved journal as a debit and a credit ledger entry.
    #[instrument(skip(self))]
    pub fn post_journal(&self, id: JournalId) -> Result<PostedJournal> {
        let _commit = self.store.commit_guard();
        let row = self.store.journal_row(id)?;
        let mut journal = row.lock();

        let posted = match self.post_locked(&mut journal, Rates::At(now())) {
            Ok(posted) => posted,
            Err(e) => {
                warn!(journal_id = %id, error = %e, "Journal posting refused");
                return Err(e);
            }
        };
        drop(journal);

        self.publish_posted(&posted);
        info!(
            journal_id = %id,
            debit_entry = %posted.ledger_entry_ids[0],
            credit_entry = %posted.ledger_entry_ids[1],
            "Journal posted"
        );
        Ok(posted)
    }

    /// Approve a pending journal and post it under one lock. When posting is
    /// refused the journal stays pending.
    #[instrument(skip(self))]
    pub fn approve_and_post(&self, id: JournalId, approver: UserId) -> Result<PostedJournal> {
        let _commit = self.store.commit_guard();
        let row = self.store.journal_row(id)?;
        let mut journal = row.lock();

        if journal.status != JournalStatus::Pending {
            return Err(LedgerError::transition(
                Entity::Journal,
                journal.status,
                JournalStatus::Approved,
            ));
        }

        let at = now();
        let last_update = journal.updated_at;
        journal.status = JournalStatus::Approved;
        journal.approved_by = Some(approver);
        journal.approved_at = Some(at);
        journal.updated_at = at;

        let posted = match self.post_locked(&mut journal, Rates::At(at)) {
            Ok(posted) => posted,
            Err(e) => {
                journal.status = JournalStatus::Pending;
                journal.approved_by = None;
                journal.approved_at = None;
                journal.updated_at = last_update;
                warn!(journal_id = %id, error = %e, "Journal posting refused");
                return Err(e);
            }
        };
        drop(journal);

        self.events.publish(LedgerEvent::JournalApproved {
            journal_id: id,
            approver,
        });
        self.publish_posted(&posted);
        info!(journal_id = %id, approver = %approver, "Journal approved and posted");
        Ok(posted)
    }

    /// Post an approved reversal of a posted journal. The original entries
    /// are left untouched.
    #[instrument(skip(self))]
    pub fn reverse_journal(&self, id: JournalId, approver: UserId) -> Result<ReversedJournal> {
        let _commit = self.store.commit_guard();
        let row = self.store.journal_row(id)?;
        let mut original = row.lock();

        if let Some(reversal) = original.reversed_by {
            return Err(LedgerError::AlreadyReversed {
                original: id,
                reversal,
            });
        }
        let Some([debit_entry, credit_entry]) = original.entry_ids.filter(|_| original.is_posted())
        else {
            return Err(LedgerError::InvalidTransition {
                entity: Entity::Journal,
                from: format!("{:?}", original.status),
                to: "Reversed".into(),
            });
        };

        // The reversal debits what was credited, at the rates originally applied.
        let rates = Rates::Fixed {
            debit: self.store.entry(credit_entry)?.exchange_rate,
            credit: self.store.entry(debit_entry)?.exchange_rate,
        };

        let at = now();
        let mut reversal = original.reversal(self.references.next(ReferenceKind::Journal, at), approver);
        let posting = self.post_locked(&mut reversal, rates)?;

        original.reversed_by = Some(reversal.id);
        original.updated_at = at;
        let new_journal_id = reversal.id;
        self.store.insert_journal(reversal);
        drop(original);

        self.events.publish(LedgerEvent::JournalReversed {
            original: id,
            reversal: new_journal_id,
        });
        self.publish_posted(&posting);
        info!(journal_id = %id, reversal = %new_journal_id, "Journal reversed");

        Ok(ReversedJournal {
            original_journal_id: id,
            new_journal_id,
            posting,
        })
    }

    /// Post a locked journal. Every check runs before the first write.
    fn post_locked(&self, journal: &mut JournalEntry, rates: Rates) -> Result<PostedJournal> {
        match journal.status {
            JournalStatus::Approved => {}
            JournalStatus::Posted => return Err(LedgerError::AlreadyPosted(journal.id)),
            status => {
                return Err(LedgerError::transition(
                    Entity::Journal,
                    status,
                    JournalStatus::Posted,
                ))
            }
        }

        let debit_row = self.store.account_row(journal.debit_account)?;
        let credit_row = self.store.account_row(journal.credit_account)?;
        let (mut debit, mut credit) = lock_pair(
            journal.debit_account,
            &debit_row,
            journal.credit_account,
            &credit_row,
        );
        ensure_transactable(&debit)?;
        ensure_transactable(&credit)?;

        let posted_at = now();
        let (debit_rate, credit_rate) = match rates {
            Rates::At(at) => (
                self.registry.rate_at(&journal.currency, &debit.currency, at)?.rate,
                self.registry.rate_at(&journal.currency, &credit.currency, at)?.rate,
            ),
            Rates::Fixed { debit: d, credit: c } => (d, c),
        };

        let mut batch = PostingBatch::new(journal.id);
        batch.add_entry(self.build_entry(journal, &debit, EntryType::Debit, debit_rate, posted_at));
        batch.add_entry(self.build_entry(journal, &credit, EntryType::Credit, credit_rate, posted_at));

        if !batch.is_balanced() || !batch.is_paired() {
            return Err(LedgerError::IntegrityViolation(format!(
                "posting for journal {} is not a balanced pair",
                journal.id
            )));
        }

        let ledger_entry_ids = [batch.entries[0].id, batch.entries[1].id];
        debit.current_balance = batch.entries[0].balance_after;
        debit.updated_at = posted_at;
        credit.current_balance = batch.entries[1].balance_after;
        credit.updated_at = posted_at;
        self.store.append(batch);

        journal.status = JournalStatus::Posted;
        journal.posted_at = Some(posted_at);
        journal.entry_ids = Some(ledger_entry_ids);
        journal.updated_at = posted_at;

        self.registry.mark_referenced(&journal.currency);
        self.registry.mark_referenced(&debit.currency);
        self.registry.mark_referenced(&credit.currency);

        Ok(PostedJournal {
            journal_id: journal.id,
            posted_at,
            ledger_entry_ids,
        })
    }

    fn build_entry(
        &self,
        journal: &JournalEntry,
        account: &Account,
        side: EntryType,
        rate: Decimal,
        posted_at: Timestamp,
    ) -> LedgerEntry {
        let amount = self.registry.round(&account.currency, journal.amount * rate);

        LedgerEntry {
            id: LedgerEntryId::new(),
            reference: self.references.next(ReferenceKind::LedgerEntry, posted_at),
            journal_id: journal.id,
            transaction_id: journal.transaction_id,
            account_id: account.id,
            entry_type: side,
            category: journal.journal_type.entry_category(),
            amount,
            currency: account.currency.clone(),
            exchange_rate: rate,
            journal_amount: journal.amount,
            journal_currency: journal.currency.clone(),
            balance_after: account.balance_after(side, amount),
            reconciled: false,
            posting_date: posted_at,
            value_date: posted_at,
            sequence: self.store.next_sequence(),
        }
    }

    fn publish_posted(&self, posted: &PostedJournal) {
        self.events.publish(LedgerEvent::JournalPosted {
            journal_id: posted.journal_id,
            entries: posted.ledger_entry_ids,
            posted_at: posted.posted_at,
        });
    }

    /// Journals created for a transaction.
    pub fn journals_for_transaction(&self, transaction_id: TransactionId) -> Vec<JournalEntry> {
        let mut journals: Vec<JournalEntry> = self
            .store
            .journal_rows()
            .iter()
            .map(|row| row.lock().clone())
            .filter(|j| j.transaction_id == Some(transaction_id))
            .collect();
        journals.sort_by_key(|j| j.created_at);
        journals
    }

    /// Ledger entries a journal posted.
    pub fn entries_for_journal(&self, journal_id: JournalId) -> Vec<LedgerEntry> {
        self.store.entries_for_journal(journal_id)
    }

    /// Ledger entries against an account, in commit order.
    pub fn entries_for_account(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        self.store.account_row(account_id)?;
        Ok(self.store.entries_for_account(account_id))
    }

    // Reconciliation

    /// Replay an account's entries up to `as_of` and compare with the
    /// stored balance. A discrepancy is reported, never corrected.
    #[instrument(skip(self))]
    pub fn account_balance(&self, id: AccountId, as_of: Timestamp) -> Result<BalanceReport> {
        let row = self.store.account_row(id)?;
        let account = row.lock();
        let report = replay(&account, &self.store.entries_for_account(id), as_of);
        drop(account);

        if let (Some(stored), Some(_)) = (report.stored, report.discrepancy) {
            self.report_mismatch(id, stored, report.replayed);
        }
        Ok(report)
    }

    /// Mark an account's entries reconciled when the replay matches.
    #[instrument(skip(self))]
    pub fn reconcile_account(&self, id: AccountId) -> Result<usize> {
        let row = self.store.account_row(id)?;
        let account = row.lock();
        let entries = self.store.entries_for_account(id);
        let report = replay(&account, &entries, now());

        if let (Some(stored), Some(_)) = (report.stored, report.discrepancy) {
            drop(account);
            self.report_mismatch(id, stored, report.replayed);
            return Err(LedgerError::ReconciliationMismatch {
                account_id: id,
                stored,
                replayed: report.replayed,
            });
        }

        let pending: Vec<LedgerEntryId> = entries
            .iter()
            .filter(|e| !e.reconciled)
            .map(|e| e.id)
            .collect();
        let reconciled = self.store.mark_reconciled(&pending);
        drop(account);

        if reconciled > 0 {
            info!(account_id = %id, entries = reconciled, "Account reconciled");
        }
        Ok(reconciled)
    }

    /// Reconcile every account in the chart.
    pub fn reconcile_all(&self) -> ReconciliationSummary {
        let mut summary = ReconciliationSummary::default();

        for id in self.store.account_ids() {
            summary.accounts_checked += 1;
            match self.reconcile_account(id) {
                Ok(count) => summary.entries_reconciled += count,
                Err(_) => summary.mismatches.push(id),
            }
        }

        if !summary.is_clean() {
            warn!(mismatches = summary.mismatches.len(), "Reconciliation found mismatches");
        }
        summary
    }

    fn report_mismatch(&self, account_id: AccountId, stored: Decimal, replayed: Decimal) {
        warn!(
            account_id = %account_id,
            stored = %stored,
            replayed = %replayed,
            "Reconciliation mismatch"
        );
        self.events.publish(LedgerEvent::ReconciliationMismatch {
            account_id,
            stored,
            replayed,
        });
    }

    /// Verify ledger integrity: debits equal credits per journal currency,
    /// and every posted journal owns exactly one balanced debit/credit pair.
    #[instrument(skip(self))]
    pub fn verify_integrity(&self) -> Result<()> {
        let _snapshot = self.store.snapshot_guard();

        let entries = self.store.all_entries();
        let mut totals: HashMap<&Currency, (Decimal, Decimal)> = HashMap::new();
        let mut by_journal: HashMap<JournalId, PostingBatch> = HashMap::new();

        for entry in &entries {
            let total = totals.entry(&entry.journal_currency).or_default();
            match entry.entry_type {
                EntryType::Debit => total.0 += entry.journal_amount,
                EntryType::Credit => total.1 += entry.journal_amount,
            }
            by_journal
                .entry(entry.journal_id)
                .or_insert_with(|| PostingBatch::new(entry.journal_id))
                .add_entry(entry.clone());
        }

        for (currency, (debits, credits)) in &totals {
            if debits != credits {
                return Err(self.integrity_violation(format!(
                    "{} debits {} do not equal credits {}",
                    currency, debits, credits
                )));
            }
        }

        let mut posted = HashSet::new();
        for row in self.store.journal_rows() {
            let journal = row.lock();
            if !journal.is_posted() {
                if by_journal.contains_key(&journal.id) {
                    return Err(self.integrity_violation(format!(
                        "unposted journal {} has ledger entries",
                        journal.id
                    )));
                }
                continue;
            }
            match by_journal.get(&journal.id) {
                Some(batch) if batch.is_paired() && batch.is_balanced() => {
                    posted.insert(journal.id);
                }
                _ => {
                    return Err(self.integrity_violation(format!(
                        "posted journal {} does not have one debit and one credit entry",
                        journal.id
                    )))
                }
            }
        }

        if let Some(orphan) = by_journal.keys().find(|id| !posted.contains(*id)) {
            return Err(self.integrity_violation(format!(
                "ledger entries reference unknown journal {}",
                orphan
            )));
        }

        info!(entries = entries.len(), journals = posted.len(), "Ledger integrity verified");
        Ok(())
    }

    fn integrity_violation(&self, message: String) -> LedgerError {
        warn!(message = %message, "Ledger integrity violation");
        LedgerError::IntegrityViolation(message)
    }
}

fn ensure_transactable(account: &Account) -> Result<()> {
    if account.can_transact() {
        return Ok(());
    }
    Err(LedgerError::AccountUnavailable {
        account_id: account.id,
        status: format!("{:?}", account.status).to_lowercase(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountType;
    use crate::journal::JournalType;
    use civicledger_common::{MemorySink, NullSink};
    use civicledger_fx::NewCurrency;
    use rust_decimal_macros::dec;

    struct Fixture {
        engine: PostingEngine,
        events: Arc<MemorySink>,
        cash: Account,
        fees: Account,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(CurrencyRegistry::new(Currency::kes()));
        let events = Arc::new(MemorySink::new());
        let engine = PostingEngine::new(
            registry,
            Arc::new(ReferenceGenerator::new()),
            events.clone(),
        );
        let cash = engine
            .open_account(NewAccount::new("1000", "Cash", AccountType::Asset, Currency::kes()))
            .unwrap();
        let fees = engine
            .open_account(NewAccount::new("4000", "Permit fees", AccountType::Income, Currency::kes()))
            .unwrap();
        Fixture {
            engine,
            events,
            cash,
            fees,
        }
    }

    fn approved(f: &Fixture, amount: Decimal) -> JournalEntry {
        let journal = f
            .engine
            .create_journal(NewJournal::new(f.cash.id, f.fees.id, amount, Currency::kes()))
            .unwrap();
        f.engine.approve_journal(journal.id, UserId::new()).unwrap()
    }

    #[test]
    fn test_post_approved_journal() {
        let f = fixture();
        let journal = approved(&f, dec!(100));

        let posted = f.engine.post_journal(journal.id).unwrap();

        assert_eq!(f.engine.account(f.cash.id).unwrap().current_balance, dec!(100));
        assert_eq!(f.engine.account(f.fees.id).unwrap().current_balance, dec!(100));
        assert_eq!(f.engine.journal(journal.id).unwrap().status, JournalStatus::Posted);

        let entries = f.engine.entries_for_journal(journal.id);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, posted.ledger_entry_ids[0]);
        assert_eq!(entries[0].entry_type, EntryType::Debit);
        assert_eq!(entries[1].entry_type, EntryType::Credit);
        assert_eq!(f.events.count("journal.posted"), 1);
    }

    #[test]
    fn test_second_post_is_refused() {
        let f = fixture();
        let journal = approved(&f, dec!(100));
        f.engine.post_journal(journal.id).unwrap();

        let again = f.engine.post_journal(journal.id);
        assert_eq!(again, Err(LedgerError::AlreadyPosted(journal.id)));
        assert_eq!(f.engine.store().entry_count(), 2);
        assert_eq!(f.engine.account(f.cash.id).unwrap().current_balance, dec!(100));
    }

    #[test]
    fn test_pending_journal_cannot_post() {
        let f = fixture();
        let journal = f
            .engine
            .create_journal(NewJournal::new(f.cash.id, f.fees.id, dec!(10), Currency::kes()))
            .unwrap();

        let result = f.engine.post_journal(journal.id);
        assert!(matches!(result, Err(LedgerError::InvalidTransition { .. })));
        assert_eq!(f.engine.store().entry_count(), 0);
    }

    #[test]
    fn test_create_journal_validation() {
        let f = fixture();

        let zero = f
            .engine
            .create_journal(NewJournal::new(f.cash.id, f.fees.id, dec!(0), Currency::kes()));
        assert_eq!(zero.unwrap_err(), LedgerError::InvalidAmount(dec!(0)));

        let same = f
            .engine
            .create_journal(NewJournal::new(f.cash.id, f.cash.id, dec!(5), Currency::kes()));
        assert_eq!(same.unwrap_err(), LedgerError::SameAccount(f.cash.id));

        let precise = f
            .engine
            .create_journal(NewJournal::new(f.cash.id, f.fees.id, dec!(1.005), Currency::kes()));
        assert!(matches!(precise, Err(LedgerError::Validation { .. })));
    }

    #[test]
    fn test_cross_currency_requires_rate() {
        let f = fixture();
        f.engine
            .registry()
            .register_currency(NewCurrency::new(Currency::usd(), "US Dollar"))
            .unwrap();
        let usd_cash = f
            .engine
            .open_account(NewAccount::new("1010", "USD cash", AccountType::Asset, Currency::usd()))
            .unwrap();

        let result = f.engine.create_journal(NewJournal::new(
            usd_cash.id,
            f.fees.id,
            dec!(10),
            Currency::usd(),
        ));
        assert_eq!(
            result.unwrap_err(),
            LedgerError::UnbalancedAccounts {
                from: Currency::usd(),
                to: Currency::kes(),
            }
        );

        f.engine
            .registry()
            .record_rate(Currency::usd(), Currency::kes(), dec!(129.5), now(), "CBK")
            .unwrap();
        let journal = f
            .engine
            .create_journal(NewJournal::new(usd_cash.id, f.fees.id, dec!(10), Currency::usd()))
            .unwrap();
        f.engine.approve_journal(journal.id, UserId::new()).unwrap();
        f.engine.post_journal(journal.id).unwrap();

        let entries = f.engine.entries_for_journal(journal.id);
        assert_eq!(entries[0].amount, dec!(10));
        assert_eq!(entries[1].amount, dec!(1295.00));
        assert_eq!(entries[1].exchange_rate, dec!(129.5));
        assert_eq!(f.engine.account(f.fees.id).unwrap().current_balance, dec!(1295));
        assert!(f.engine.registry().currency(&Currency::usd()).unwrap().referenced);
    }

    #[test]
    fn test_reverse_journal() {
        let f = fixture();
        let journal = approved(&f, dec!(100));
        f.engine.post_journal(journal.id).unwrap();

        let reversed = f.engine.reverse_journal(journal.id, UserId::new()).unwrap();

        assert_eq!(f.engine.account(f.cash.id).unwrap().current_balance, dec!(0));
        assert_eq!(f.engine.account(f.fees.id).unwrap().current_balance, dec!(0));

        let reversal = f.engine.journal(reversed.new_journal_id).unwrap();
        assert_eq!(reversal.journal_type, JournalType::Reversal);
        assert_eq!(reversal.linked_journal_id, Some(journal.id));
        assert_eq!(reversal.debit_account, f.fees.id);

        // Original entries survive untouched.
        assert_eq!(f.engine.entries_for_journal(journal.id).len(), 2);
        assert_eq!(f.engine.store().entry_count(), 4);

        let again = f.engine.reverse_journal(journal.id, UserId::new());
        assert!(matches!(again, Err(LedgerError::AlreadyReversed { .. })));
        assert!(f.engine.verify_integrity().is_ok());
    }

    #[test]
    fn test_unposted_journal_cannot_be_reversed() {
        let f = fixture();
        let journal = approved(&f, dec!(100));
        let result = f.engine.reverse_journal(journal.id, UserId::new());
        assert!(matches!(result, Err(LedgerError::InvalidTransition { .. })));
    }

    #[test]
    fn test_reject_journal() {
        let f = fixture();
        let journal = f
            .engine
            .create_journal(NewJournal::new(f.cash.id, f.fees.id, dec!(10), Currency::kes()))
            .unwrap();

        let rejected = f
            .engine
            .reject_journal(journal.id, UserId::new(), "duplicate receipt")
            .unwrap();
        assert_eq!(rejected.status, JournalStatus::Rejected);

        let approve = f.engine.approve_journal(journal.id, UserId::new());
        assert!(matches!(approve, Err(LedgerError::InvalidTransition { .. })));
        assert_eq!(f.events.count("journal.rejected"), 1);
    }

    #[test]
    fn test_frozen_account_refuses_posting() {
        let f = fixture();
        let journal = approved(&f, dec!(100));
        f.engine.freeze_account(f.fees.id, None).unwrap();

        let result = f.engine.post_journal(journal.id);
        assert!(matches!(result, Err(LedgerError::AccountUnavailable { .. })));
        assert_eq!(f.engine.journal(journal.id).unwrap().status, JournalStatus::Approved);
        assert_eq!(f.engine.account(f.cash.id).unwrap().current_balance, dec!(0));

        f.engine.unfreeze_account(f.fees.id, None).unwrap();
        assert!(f.engine.post_journal(journal.id).is_ok());
    }

    #[test]
    fn test_refused_approve_and_post_leaves_journal_pending() {
        let f = fixture();
        let journal = f
            .engine
            .create_journal(NewJournal::new(f.cash.id, f.fees.id, dec!(100), Currency::kes()))
            .unwrap();
        f.engine.freeze_account(f.fees.id, None).unwrap();

        let result = f.engine.approve_and_post(journal.id, UserId::new());
        assert!(matches!(result, Err(LedgerError::AccountUnavailable { .. })));
        let pending = f.engine.journal(journal.id).unwrap();
        assert_eq!(pending.status, JournalStatus::Pending);
        assert!(pending.approved_by.is_none());
        assert_eq!(f.events.count("journal.approved"), 0);

        f.engine.unfreeze_account(f.fees.id, None).unwrap();
        f.engine.approve_and_post(journal.id, UserId::new()).unwrap();
        assert_eq!(f.engine.journal(journal.id).unwrap().status, JournalStatus::Posted);
        assert_eq!(f.engine.account(f.cash.id).unwrap().current_balance, dec!(100));
        assert!(f.engine.approve_and_post(journal.id, UserId::new()).is_err());
    }

    #[test]
    fn test_close_requires_zero_balance() {
        let f = fixture();
        let journal = approved(&f, dec!(100));
        f.engine.post_journal(journal.id).unwrap();

        assert!(f.engine.close_account(f.cash.id, None).is_err());

        let empty = f
            .engine
            .open_account(NewAccount::new("1999", "Suspense", AccountType::Asset, Currency::kes()))
            .unwrap();
        let closed = f.engine.close_account(empty.id, None).unwrap();
        assert_eq!(closed.status, AccountStatus::Closed);
        assert!(closed.deleted_at.is_some());
    }

    #[test]
    fn test_chart_hierarchy() {
        let f = fixture();
        let mobile = f
            .engine
            .open_account(
                NewAccount::new("1100", "Mobile money", AccountType::Asset, Currency::kes())
                    .with_parent(f.cash.id)
                    .with_opening_balance(dec!(40)),
            )
            .unwrap();
        let till = f
            .engine
            .open_account(
                NewAccount::new("1110", "Till 600100", AccountType::Asset, Currency::kes())
                    .with_parent(mobile.id)
                    .with_opening_balance(dec!(2)),
            )
            .unwrap();

        let mismatched = f.engine.open_account(
            NewAccount::new("1200", "Wrong", AccountType::Income, Currency::kes())
                .with_parent(f.cash.id),
        );
        assert!(matches!(mismatched, Err(LedgerError::Validation { .. })));

        let duplicate = f
            .engine
            .open_account(NewAccount::new("1100", "Again", AccountType::Asset, Currency::kes()));
        assert!(matches!(duplicate, Err(LedgerError::Duplicate { .. })));

        assert_eq!(f.engine.children(f.cash.id).unwrap().len(), 1);
        let ancestors = f.engine.ancestors(till.id).unwrap();
        assert_eq!(ancestors[0].id, mobile.id);
        assert_eq!(ancestors[1].id, f.cash.id);
        assert_eq!(f.engine.subtree_balance(f.cash.id).unwrap().value, dec!(42));
    }

    #[test]
    fn test_account_balance_as_of() {
        let f = fixture();
        let before = now() - chrono::Duration::microseconds(1);
        let journal = approved(&f, dec!(75));
        f.engine.post_journal(journal.id).unwrap();

        let historical = f.engine.account_balance(f.cash.id, before).unwrap();
        assert_eq!(historical.replayed, dec!(0));
        assert_eq!(historical.stored, None);

        let current = f.engine.account_balance(f.cash.id, now()).unwrap();
        assert_eq!(current.replayed, dec!(75));
        assert_eq!(current.stored, Some(dec!(75)));
        assert!(current.is_consistent());
    }

    #[test]
    fn test_reconciliation_marks_entries_and_flags_mismatch() {
        let f = fixture();
        let journal = approved(&f, dec!(75));
        f.engine.post_journal(journal.id).unwrap();

        assert_eq!(f.engine.reconcile_account(f.cash.id).unwrap(), 1);
        assert!(f.engine.entries_for_account(f.cash.id).unwrap()[0].reconciled);
        assert_eq!(f.engine.reconcile_account(f.cash.id).unwrap(), 0);

        // Corrupt the stored balance directly.
        f.engine.store.account_row(f.fees.id).unwrap().lock().current_balance = dec!(70);

        let result = f.engine.reconcile_account(f.fees.id);
        assert!(matches!(result, Err(LedgerError::ReconciliationMismatch { .. })));
        assert!(!f.engine.entries_for_account(f.fees.id).unwrap()[0].reconciled);
        assert_eq!(f.events.count("account.reconciliation_mismatch"), 1);

        let summary = f.engine.reconcile_all();
        assert_eq!(summary.accounts_checked, 2);
        assert_eq!(summary.mismatches, vec![f.fees.id]);
        // Never corrected.
        assert_eq!(f.engine.account(f.fees.id).unwrap().current_balance, dec!(70));
    }

    #[test]
    fn test_transaction_link_must_exist() {
        let registry = Arc::new(CurrencyRegistry::new(Currency::kes()));
        let engine = PostingEngine::new(registry, Arc::new(ReferenceGenerator::new()), Arc::new(NullSink));
        let a = engine
            .open_account(NewAccount::new("1", "A", AccountType::Asset, Currency::kes()))
            .unwrap();
        let b = engine
            .open_account(NewAccount::new("2", "B", AccountType::Liability, Currency::kes()))
            .unwrap();

        let result = engine.create_journal(
            NewJournal::new(a.id, b.id, dec!(1), Currency::kes()).for_transaction(TransactionId::new()),
        );
        assert!(matches!(
            result,
            Err(LedgerError::NotFound {
                entity: Entity::Transaction,
                ..
            })
        ));
    }
}
