//! Chart-of-accounts nodes.

use civicledger_common::{AccountId, Currency, Timestamp, UserId};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entry::EntryType;

/// Classification of an account in the chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

impl AccountType {
    /// The side that increases this account's balance.
    ///
    /// Debits increase asset and expense accounts; credits increase
    /// liability, equity and income accounts.
    pub fn normal_side(&self) -> EntryType {
        match self {
            AccountType::Asset | AccountType::Expense => EntryType::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Income => {
                EntryType::Credit
            }
        }
    }

    /// Signed effect of an entry on an account of this type.
    pub fn signed_effect(&self, side: EntryType, amount: Decimal) -> Decimal {
        if side == self.normal_side() {
            amount
        } else {
            -amount
        }
    }
}

/// Account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// Account is active and can be posted to.
    Active,
    /// Account is frozen (no postings allowed).
    Frozen,
    /// Account is closed.
    Closed,
}

impl AccountStatus {
    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[AccountStatus] {
        match self {
            AccountStatus::Active => &[AccountStatus::Frozen, AccountStatus::Closed],
            AccountStatus::Frozen => &[AccountStatus::Active, AccountStatus::Closed],
            AccountStatus::Closed => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: AccountStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// A node in the chart of accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Unique account number.
    pub number: String,
    /// Account name/description.
    pub name: String,
    pub account_type: AccountType,
    pub subtype: Option<String>,
    /// Parent in the chart; shares `account_type`.
    pub parent_id: Option<AccountId>,
    /// Account currency.
    pub currency: Currency,
    pub opening_balance: Decimal,
    /// Mutated only by posted ledger entries.
    pub current_balance: Decimal,
    /// Account status.
    pub status: AccountStatus,
    pub created_by: Option<UserId>,
    pub updated_by: Option<UserId>,
    /// When the account was created.
    pub created_at: Timestamp,
    /// When the account was last updated.
    pub updated_at: Timestamp,
    /// Set when the account is closed.
    pub deleted_at: Option<Timestamp>,
}

impl Account {
    /// Build an account from an opening request.
    pub fn open(new: NewAccount) -> Self {
        let now = Utc::now();

        Self {
            id: AccountId::new(),
            number: new.number,
            name: new.name,
            account_type: new.account_type,
            subtype: new.subtype,
            parent_id: new.parent_id,
            currency: new.currency,
            opening_balance: new.opening_balance,
            current_balance: new.opening_balance,
            status: AccountStatus::Active,
            created_by: new.created_by,
            updated_by: new.created_by,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Check if account can be posted to.
    pub fn can_transact(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Balance after applying an entry on `side`.
    pub fn balance_after(&self, side: EntryType, amount: Decimal) -> Decimal {
        self.current_balance + self.account_type.signed_effect(side, amount)
    }
}

/// Request to open an account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub number: String,
    pub name: String,
    pub account_type: AccountType,
    pub subtype: Option<String>,
    pub parent_id: Option<AccountId>,
    pub currency: Currency,
    pub opening_balance: Decimal,
    pub created_by: Option<UserId>,
}

impl NewAccount {
    /// Open a top-level account with a zero opening balance.
    pub fn new(
        number: impl Into<String>,
        name: impl Into<String>,
        account_type: AccountType,
        currency: Currency,
    ) -> Self {
        Self {
            number: number.into(),
            name: name.into(),
            account_type,
            subtype: None,
            parent_id: None,
            currency,
            opening_balance: Decimal::ZERO,
            created_by: None,
        }
    }

    pub fn with_parent(mut self, parent: AccountId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_opening_balance(mut self, balance: Decimal) -> Self {
        self.opening_balance = balance;
        self
    }

    pub fn created_by(mut self, user: UserId) -> Self {
        self.created_by = Some(user);
        self
    }
}
