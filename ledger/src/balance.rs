//! Balance replay and reconciliation reports.

use civicledger_common::{AccountId, Currency, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::entry::LedgerEntry;

/// Account balance recomputed from ledger history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceReport {
    /// Account identifier.
    pub account_id: AccountId,
    /// Currency.
    pub currency: Currency,
    /// Replay cutoff.
    pub as_of: Timestamp,
    pub opening_balance: Decimal,
    /// Opening balance plus signed entries posted at or before `as_of`.
    pub replayed: Decimal,
    /// Stored balance; present only when `as_of` covers the full history.
    pub stored: Option<Decimal>,
    /// `stored - replayed` when they disagree.
    pub discrepancy: Option<Decimal>,
    /// Entries included in the replay.
    pub entry_count: usize,
}

impl BalanceReport {
    /// Whether the replay disagreed with the stored balance.
    pub fn is_consistent(&self) -> bool {
        self.discrepancy.is_none()
    }
}

/// Replay `entries` (in commit order) for `account` up to `as_of`.
pub fn replay(account: &Account, entries: &[LedgerEntry], as_of: Timestamp) -> BalanceReport {
    let mut replayed = account.opening_balance;
    let mut entry_count = 0;
    let mut covers_history = true;

    for entry in entries {
        if entry.posting_date > as_of {
            covers_history = false;
            continue;
        }
        replayed += account
            .account_type
            .signed_effect(entry.entry_type, entry.amount);
        entry_count += 1;
    }

    let stored = covers_history.then_some(account.current_balance);
    let discrepancy = stored
        .map(|stored| stored - replayed)
        .filter(|difference| !difference.is_zero());

    BalanceReport {
        account_id: account.id,
        currency: account.currency.clone(),
        as_of,
        opening_balance: account.opening_balance,
        replayed,
        stored,
        discrepancy,
        entry_count,
    }
}

/// Outcome of reconciling every account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub accounts_checked: usize,
    pub entries_reconciled: usize,
    pub mismatches: Vec<AccountId>,
}

impl ReconciliationSummary {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountType, NewAccount};
    use crate::entry::{EntryCategory, EntryType};
    use civicledger_common::{now, JournalId, LedgerEntryId};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn entry(account: &Account, side: EntryType, amount: Decimal, at: Timestamp) -> LedgerEntry {
        LedgerEntry {
            id: LedgerEntryId::new(),
            reference: "LE-20260101-000001".into(),
            journal_id: JournalId::new(),
            transaction_id: None,
            account_id: account.id,
            entry_type: side,
            category: EntryCategory::Operational,
            amount,
            currency: account.currency.clone(),
            exchange_rate: Decimal::ONE,
            journal_amount: amount,
            journal_currency: account.currency.clone(),
            balance_after: Decimal::ZERO,
            reconciled: false,
            posting_date: at,
            value_date: at,
            sequence: 0,
        }
    }

    #[test]
    fn test_replay_matches_stored() {
        let mut account = Account::open(
            NewAccount::new("1000", "Cash", AccountType::Asset, Currency::kes())
                .with_opening_balance(dec!(50)),
        );
        let t = now();
        let entries = vec![
            entry(&account, EntryType::Debit, dec!(100), t),
            entry(&account, EntryType::Credit, dec!(30), t),
        ];
        account.current_balance = dec!(120);

        let report = replay(&account, &entries, t);
        assert_eq!(report.replayed, dec!(120));
        assert_eq!(report.stored, Some(dec!(120)));
        assert!(report.is_consistent());
    }

    #[test]
    fn test_historical_replay_has_no_stored_balance() {
        let mut account = Account::open(NewAccount::new(
            "4000",
            "Fees",
            AccountType::Income,
            Currency::kes(),
        ));
        let t = now();
        let entries = vec![
            entry(&account, EntryType::Credit, dec!(100), t - Duration::hours(2)),
            entry(&account, EntryType::Credit, dec!(40), t),
        ];
        account.current_balance = dec!(140);

        let report = replay(&account, &entries, t - Duration::hours(1));
        assert_eq!(report.replayed, dec!(100));
        assert_eq!(report.entry_count, 1);
        assert_eq!(report.stored, None);
        assert!(report.is_consistent());
    }

    #[test]
    fn test_discrepancy_is_reported() {
        let mut account = Account::open(NewAccount::new(
            "1000",
            "Cash",
            AccountType::Asset,
            Currency::kes(),
        ));
        let entries = vec![entry(&account, EntryType::Debit, dec!(100), now())];
        account.current_balance = dec!(90);

        let report = replay(&account, &entries, now());
        assert_eq!(report.discrepancy, Some(dec!(-10)));
    }
}
