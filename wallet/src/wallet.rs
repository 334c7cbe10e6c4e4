//! Wallet model and movement log.

use civicledger_common::{Currency, Timestamp, UserId, WalletId};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::limits::WalletLimits;

/// Wallet status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletStatus {
    /// Provisioned, not yet activated. Accepts credits only.
    Pending,
    Active,
    Inactive,
    Suspended,
}

impl WalletStatus {
    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[WalletStatus] {
        match self {
            WalletStatus::Pending => &[WalletStatus::Active, WalletStatus::Inactive],
            WalletStatus::Active => &[WalletStatus::Inactive, WalletStatus::Suspended],
            WalletStatus::Inactive => &[WalletStatus::Active],
            WalletStatus::Suspended => &[WalletStatus::Active, WalletStatus::Inactive],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: WalletStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Whether incoming funds are accepted.
    pub fn accepts_credits(&self) -> bool {
        matches!(self, WalletStatus::Pending | WalletStatus::Active)
    }

    pub(crate) fn label(&self) -> String {
        format!("{:?}", self).to_lowercase()
    }
}

/// An administrative lock on a wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletLock {
    pub reason: String,
    pub locked_at: Timestamp,
    /// Lock lapses at this instant; `None` holds until unlocked.
    pub until: Option<Timestamp>,
}

impl WalletLock {
    /// Whether the lock still applies at `at`.
    pub fn in_force(&self, at: Timestamp) -> bool {
        self.until.map_or(true, |until| at < until)
    }
}

/// A per-user, per-currency store of spendable funds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub currency: Currency,
    /// Disambiguates when a user has several wallets in one currency.
    pub is_primary: bool,
    pub available_balance: Decimal,
    /// Funds awaiting gateway confirmation.
    pub pending_balance: Decimal,
    /// Funds earmarked for a pending operation.
    pub hold_balance: Decimal,
    pub total_credit: Decimal,
    pub total_debit: Decimal,
    pub limits: WalletLimits,
    pub lock: Option<WalletLock>,
    pub status: WalletStatus,
    pub last_transaction_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Wallet {
    pub(crate) fn open(new: &NewWallet, is_primary: bool, limits: WalletLimits) -> Self {
        let now = Utc::now();

        Self {
            id: WalletId::new(),
            user_id: new.user_id,
            currency: new.currency.clone(),
            is_primary,
            available_balance: Decimal::ZERO,
            pending_balance: Decimal::ZERO,
            hold_balance: Decimal::ZERO,
            total_credit: Decimal::ZERO,
            total_debit: Decimal::ZERO,
            limits,
            lock: None,
            status: new.status,
            last_transaction_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a lock applies at `at`.
    pub fn is_locked(&self, at: Timestamp) -> bool {
        self.lock.as_ref().map_or(false, |lock| lock.in_force(at))
    }

    /// Available plus held funds.
    pub fn total_balance(&self) -> Decimal {
        self.available_balance + self.hold_balance
    }

    pub(crate) fn touch(&mut self, at: Timestamp) {
        self.last_transaction_at = Some(at);
        self.updated_at = at;
    }
}

/// Request to provision a wallet.
#[derive(Debug, Clone)]
pub struct NewWallet {
    pub user_id: UserId,
    pub currency: Currency,
    /// Ask for the primary wallet of the (user, currency) pair.
    pub primary: bool,
    /// Overrides the engine's default limits.
    pub limits: Option<WalletLimits>,
    pub status: WalletStatus,
}

impl NewWallet {
    /// A pending primary wallet with default limits.
    pub fn new(user_id: UserId, currency: Currency) -> Self {
        Self {
            user_id,
            currency,
            primary: true,
            limits: None,
            status: WalletStatus::Pending,
        }
    }

    /// Open the wallet already active.
    pub fn active(mut self) -> Self {
        self.status = WalletStatus::Active;
        self
    }

    /// An additional, non-primary wallet.
    pub fn secondary(mut self) -> Self {
        self.primary = false;
        self
    }

    pub fn with_limits(mut self, limits: WalletLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// Kind of wallet balance movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    /// Credit (increase available).
    Credit,
    /// Debit (decrease available).
    Debit,
    /// Hold (move from available to hold).
    Hold,
    /// Release (move from hold to available).
    ReleaseHold,
    /// Capture (held funds leave as a debit).
    CaptureHold,
    /// Funds announced, awaiting confirmation.
    PendingIn,
    /// Pending funds confirmed into available.
    PendingSettled,
    /// A credit or debit undone.
    Reversal,
}

/// One entry in a wallet's append-only movement log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletMovement {
    pub wallet_id: WalletId,
    pub kind: MovementKind,
    pub amount: Decimal,
    pub available_after: Decimal,
    pub hold_after: Decimal,
    pub pending_after: Decimal,
    pub reason: String,
    pub at: Timestamp,
}

impl WalletMovement {
    pub(crate) fn record(wallet: &Wallet, kind: MovementKind, amount: Decimal, reason: &str, at: Timestamp) -> Self {
        Self {
            wallet_id: wallet.id,
            kind,
            amount,
            available_after: wallet.available_balance,
            hold_after: wallet.hold_balance,
            pending_after: wallet.pending_balance,
            reason: reason.to_string(),
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use civicledger_common::now;

    #[test]
    fn test_status_transitions() {
        assert!(WalletStatus::Pending.can_transition_to(WalletStatus::Active));
        assert!(WalletStatus::Active.can_transition_to(WalletStatus::Suspended));
        assert!(WalletStatus::Suspended.can_transition_to(WalletStatus::Active));
        assert!(!WalletStatus::Inactive.can_transition_to(WalletStatus::Suspended));
        assert!(WalletStatus::Pending.accepts_credits());
        assert!(!WalletStatus::Suspended.accepts_credits());
    }

    #[test]
    fn test_lock_lapses() {
        let at = now();
        let lock = WalletLock {
            reason: "fraud review".into(),
            locked_at: at,
            until: Some(at + Duration::minutes(30)),
        };
        assert!(lock.in_force(at));
        assert!(!lock.in_force(at + Duration::minutes(30)));

        let indefinite = WalletLock { until: None, ..lock };
        assert!(indefinite.in_force(at + Duration::days(365)));
    }
}
