//! Wallet balance engine.
//!
//! Each wallet is a locked row; every mutation runs its checks and its
//! writes under that row lock, so concurrent operations on one wallet are
//! serialized and operations on different wallets run in parallel.

use std::sync::Arc;

use civicledger_common::{
    now, Currency, Entity, EventSink, LedgerError, LedgerEvent, Result, Timestamp, UserId,
    WalletId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use crate::limits::{DebitWindow, WalletLimits};
use crate::wallet::{MovementKind, NewWallet, Wallet, WalletLock, WalletMovement, WalletStatus};

struct WalletRow {
    wallet: Wallet,
    window: DebitWindow,
    movements: Vec<WalletMovement>,
}

impl WalletRow {
    fn log(&mut self, kind: MovementKind, amount: Decimal, reason: &str, at: Timestamp) {
        self.movements
            .push(WalletMovement::record(&self.wallet, kind, amount, reason, at));
    }
}

/// Result of a balance mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletBalance {
    pub wallet_id: WalletId,
    pub available: Decimal,
    pub hold: Decimal,
    pub pending: Decimal,
}

impl WalletBalance {
    fn of(wallet: &Wallet) -> Self {
        Self {
            wallet_id: wallet.id,
            available: wallet.available_balance,
            hold: wallet.hold_balance,
            pending: wallet.pending_balance,
        }
    }
}

/// Manages wallet balances.
pub struct WalletEngine {
    wallets: DashMap<WalletId, Arc<Mutex<WalletRow>>>,
    by_owner: DashMap<(UserId, Currency), Vec<WalletId>>,
    default_limits: WalletLimits,
    events: Arc<dyn EventSink>,
}

impl WalletEngine {
    /// Create a new wallet engine applying `default_limits` to new wallets.
    pub fn new(default_limits: WalletLimits, events: Arc<dyn EventSink>) -> Self {
        Self {
            wallets: DashMap::new(),
            by_owner: DashMap::new(),
            default_limits,
            events,
        }
    }

    /// Provision a wallet. The first wallet for a (user, currency) pair is
    /// primary; further ones must be requested as secondary.
    #[instrument(skip(self, new), fields(user_id = %new.user_id, currency = %new.currency))]
    pub fn open_wallet(&self, new: NewWallet) -> Result<Wallet> {
        if !new.currency.is_valid() {
            return Err(LedgerError::validation(
                format!("invalid currency code {}", new.currency),
                "currency",
            ));
        }
        let limits = new.limits.clone().unwrap_or_else(|| self.default_limits.clone());
        limits.validate()?;

        let mut owned = self
            .by_owner
            .entry((new.user_id, new.currency.clone()))
            .or_default();
        if !owned.is_empty() && new.primary {
            return Err(LedgerError::Duplicate {
                entity: Entity::Wallet,
                key: format!("primary {} wallet for user {}", new.currency, new.user_id),
            });
        }

        let wallet = Wallet::open(&new, owned.is_empty(), limits);
        owned.push(wallet.id);
        self.wallets.insert(
            wallet.id,
            Arc::new(Mutex::new(WalletRow {
                wallet: wallet.clone(),
                window: DebitWindow::new(),
                movements: Vec::new(),
            })),
        );

        info!(wallet_id = %wallet.id, primary = wallet.is_primary, "Wallet opened");
        Ok(wallet)
    }

    fn row(&self, id: WalletId) -> Result<Arc<Mutex<WalletRow>>> {
        self.wallets
            .get(&id)
            .map(|row| Arc::clone(&row))
            .ok_or_else(|| LedgerError::not_found(Entity::Wallet, id))
    }

    /// Get a wallet.
    pub fn wallet(&self, id: WalletId) -> Result<Wallet> {
        Ok(self.row(id)?.lock().wallet.clone())
    }

    /// The primary wallet of a user in a currency.
    pub fn primary_wallet(&self, user_id: UserId, currency: &Currency) -> Result<Wallet> {
        let ids = self
            .by_owner
            .get(&(user_id, currency.clone()))
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.into_iter()
            .map(|id| self.wallet(id))
            .find(|w| w.as_ref().map_or(false, |w| w.is_primary))
            .unwrap_or_else(|| {
                Err(LedgerError::not_found(
                    Entity::Wallet,
                    format!("{} wallet of user {}", currency, user_id),
                ))
            })
    }

    /// All wallets a user holds.
    pub fn wallets_for_user(&self, user_id: UserId) -> Vec<Wallet> {
        let ids: Vec<WalletId> = self
            .by_owner
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .flat_map(|entry| entry.value().clone())
            .collect();
        ids.into_iter().filter_map(|id| self.wallet(id).ok()).collect()
    }

    /// Snapshot of every wallet.
    pub fn all_wallets(&self) -> Vec<Wallet> {
        let rows: Vec<_> = self.wallets.iter().map(|row| Arc::clone(row.value())).collect();
        rows.iter().map(|row| row.lock().wallet.clone()).collect()
    }

    /// Movement log of a wallet, oldest first.
    pub fn movements(&self, id: WalletId) -> Result<Vec<WalletMovement>> {
        Ok(self.row(id)?.lock().movements.clone())
    }

    pub fn activate(&self, id: WalletId) -> Result<Wallet> {
        self.set_status(id, WalletStatus::Active)
    }

    pub fn deactivate(&self, id: WalletId) -> Result<Wallet> {
        self.set_status(id, WalletStatus::Inactive)
    }

    pub fn suspend(&self, id: WalletId) -> Result<Wallet> {
        self.set_status(id, WalletStatus::Suspended)
    }

    fn set_status(&self, id: WalletId, next: WalletStatus) -> Result<Wallet> {
        let row = self.row(id)?;
        let mut row = row.lock();
        let wallet = &mut row.wallet;

        if !wallet.status.can_transition_to(next) {
            return Err(LedgerError::transition(Entity::Wallet, wallet.status, next));
        }
        wallet.status = next;
        wallet.updated_at = now();

        info!(wallet_id = %id, status = ?next, "Wallet status changed");
        Ok(wallet.clone())
    }

    /// Replace a wallet's limits.
    pub fn set_limits(&self, id: WalletId, limits: WalletLimits) -> Result<Wallet> {
        limits.validate()?;
        let row = self.row(id)?;
        let mut row = row.lock();
        row.wallet.limits = limits;
        row.wallet.updated_at = now();
        Ok(row.wallet.clone())
    }

    /// Increase available funds. Returns the new available balance.
    #[instrument(skip(self, reason))]
    pub fn credit(&self, id: WalletId, amount: Decimal, reason: &str) -> Result<Decimal> {
        let at = now();
        let row = self.row(id)?;
        let mut row = row.lock();

        self.clear_lapsed_lock(&mut row.wallet, at);
        let checked = ensure_positive(amount)
            .and_then(|_| ensure_unlocked(&row.wallet, at))
            .and_then(|_| ensure_accepts_credits(&row.wallet));
        if let Err(e) = checked {
            warn!(wallet_id = %id, amount = %amount, error = %e, "Credit refused");
            return Err(e);
        }

        let wallet = &mut row.wallet;
        wallet.available_balance += amount;
        wallet.total_credit += amount;
        wallet.touch(at);
        let (available, user_id) = (wallet.available_balance, wallet.user_id);
        row.log(MovementKind::Credit, amount, reason, at);
        drop(row);

        self.events.publish(LedgerEvent::WalletCredited {
            wallet_id: id,
            user_id,
            amount,
            available,
            reason: reason.to_string(),
        });
        info!(wallet_id = %id, amount = %amount, available = %available, "Wallet credited");
        Ok(available)
    }

    /// Decrease available funds. Returns the new available balance.
    ///
    /// Rejected without effect when the wallet is locked or not active, when
    /// available funds are short, or when a limit would be exceeded.
    #[instrument(skip(self, reason))]
    pub fn debit(&self, id: WalletId, amount: Decimal, reason: &str) -> Result<Decimal> {
        let at = now();
        let row = self.row(id)?;
        let mut row = row.lock();

        self.clear_lapsed_lock(&mut row.wallet, at);
        let checked = ensure_positive(amount)
            .and_then(|_| ensure_spendable(&row.wallet, at))
            .and_then(|_| ensure_funds(row.wallet.available_balance, amount))
            .and_then(|_| row.window.check(&row.wallet.limits, amount, at));
        if let Err(e) = checked {
            warn!(wallet_id = %id, amount = %amount, error = %e, "Debit refused");
            return Err(e);
        }

        row.wallet.available_balance -= amount;
        row.wallet.total_debit += amount;
        row.wallet.touch(at);
        row.window.record(amount, at);
        let (available, user_id) = (row.wallet.available_balance, row.wallet.user_id);
        row.log(MovementKind::Debit, amount, reason, at);
        drop(row);

        self.events.publish(LedgerEvent::WalletDebited {
            wallet_id: id,
            user_id,
            amount,
            available,
            reason: reason.to_string(),
        });
        info!(wallet_id = %id, amount = %amount, available = %available, "Wallet debited");
        Ok(available)
    }

    /// Earmark available funds for a pending operation.
    #[instrument(skip(self, reason))]
    pub fn hold(&self, id: WalletId, amount: Decimal, reason: &str) -> Result<WalletBalance> {
        let at = now();
        let row = self.row(id)?;
        let mut row = row.lock();

        self.clear_lapsed_lock(&mut row.wallet, at);
        let checked = ensure_positive(amount)
            .and_then(|_| ensure_spendable(&row.wallet, at))
            .and_then(|_| ensure_funds(row.wallet.available_balance, amount));
        if let Err(e) = checked {
            warn!(wallet_id = %id, amount = %amount, error = %e, "Hold refused");
            return Err(e);
        }

        row.wallet.available_balance -= amount;
        row.wallet.hold_balance += amount;
        row.wallet.touch(at);
        row.log(MovementKind::Hold, amount, reason, at);
        let balance = WalletBalance::of(&row.wallet);
        drop(row);

        self.events.publish(LedgerEvent::WalletHeld {
            wallet_id: id,
            amount,
            hold: balance.hold,
        });
        info!(wallet_id = %id, amount = %amount, hold = %balance.hold, "Funds held");
        Ok(balance)
    }

    /// Return held funds to available. Allowed on locked wallets.
    #[instrument(skip(self, reason))]
    pub fn release_hold(&self, id: WalletId, amount: Decimal, reason: &str) -> Result<WalletBalance> {
        let at = now();
        let row = self.row(id)?;
        let mut row = row.lock();

        ensure_positive(amount)?;
        ensure_held(row.wallet.hold_balance, amount)?;

        row.wallet.hold_balance -= amount;
        row.wallet.available_balance += amount;
        row.wallet.touch(at);
        row.log(MovementKind::ReleaseHold, amount, reason, at);
        let balance = WalletBalance::of(&row.wallet);
        drop(row);

        self.events.publish(LedgerEvent::WalletHoldReleased {
            wallet_id: id,
            amount,
            hold: balance.hold,
        });
        info!(wallet_id = %id, amount = %amount, hold = %balance.hold, "Hold released");
        Ok(balance)
    }

    /// Convert held funds into a debit. Counts toward the rolling limits.
    #[instrument(skip(self, reason))]
    pub fn capture_hold(&self, id: WalletId, amount: Decimal, reason: &str) -> Result<WalletBalance> {
        let at = now();
        let row = self.row(id)?;
        let mut row = row.lock();

        self.clear_lapsed_lock(&mut row.wallet, at);
        let checked = ensure_positive(amount)
            .and_then(|_| ensure_spendable(&row.wallet, at))
            .and_then(|_| ensure_held(row.wallet.hold_balance, amount));
        if let Err(e) = checked {
            warn!(wallet_id = %id, amount = %amount, error = %e, "Capture refused");
            return Err(e);
        }

        row.wallet.hold_balance -= amount;
        row.wallet.total_debit += amount;
        row.wallet.touch(at);
        row.window.record(amount, at);
        row.log(MovementKind::CaptureHold, amount, reason, at);
        let balance = WalletBalance::of(&row.wallet);
        drop(row);

        self.events.publish(LedgerEvent::WalletHoldCaptured {
            wallet_id: id,
            amount,
            hold: balance.hold,
        });
        info!(wallet_id = %id, amount = %amount, "Hold captured");
        Ok(balance)
    }

    /// Record funds announced by the gateway but not yet confirmed.
    pub fn add_pending(&self, id: WalletId, amount: Decimal, reason: &str) -> Result<WalletBalance> {
        let at = now();
        let row = self.row(id)?;
        let mut row = row.lock();

        self.clear_lapsed_lock(&mut row.wallet, at);
        ensure_positive(amount)?;
        ensure_unlocked(&row.wallet, at)?;
        ensure_accepts_credits(&row.wallet)?;

        row.wallet.pending_balance += amount;
        row.wallet.updated_at = at;
        row.log(MovementKind::PendingIn, amount, reason, at);
        Ok(WalletBalance::of(&row.wallet))
    }

    /// Move confirmed pending funds into available.
    pub fn settle_pending(&self, id: WalletId, amount: Decimal, reason: &str) -> Result<WalletBalance> {
        let at = now();
        let row = self.row(id)?;
        let mut row = row.lock();

        ensure_positive(amount)?;
        if row.wallet.pending_balance < amount {
            return Err(LedgerError::validation(
                format!(
                    "settling {} exceeds pending balance {}",
                    amount, row.wallet.pending_balance
                ),
                "pending_balance",
            ));
        }

        row.wallet.pending_balance -= amount;
        row.wallet.available_balance += amount;
        row.wallet.total_credit += amount;
        row.wallet.touch(at);
        row.log(MovementKind::PendingSettled, amount, reason, at);
        let balance = WalletBalance::of(&row.wallet);
        let user_id = row.wallet.user_id;
        drop(row);

        self.events.publish(LedgerEvent::WalletCredited {
            wallet_id: id,
            user_id,
            amount,
            available: balance.available,
            reason: reason.to_string(),
        });
        Ok(balance)
    }

    /// Lock a wallet until `until`, or until explicitly unlocked.
    #[instrument(skip(self))]
    pub fn lock(&self, id: WalletId, reason: &str, until: Option<Timestamp>) -> Result<Wallet> {
        if reason.trim().is_empty() {
            return Err(LedgerError::validation("lock reason is required", "reason"));
        }
        let at = now();
        if until.map_or(false, |until| until <= at) {
            return Err(LedgerError::validation("lock expiry is in the past", "until"));
        }

        let row = self.row(id)?;
        let mut row = row.lock();
        row.wallet.lock = Some(WalletLock {
            reason: reason.to_string(),
            locked_at: at,
            until,
        });
        row.wallet.updated_at = at;
        let wallet = row.wallet.clone();
        drop(row);

        self.events.publish(LedgerEvent::WalletLocked {
            wallet_id: id,
            reason: reason.to_string(),
            until,
        });
        info!(wallet_id = %id, reason = %reason, until = ?until, "Wallet locked");
        Ok(wallet)
    }

    /// Remove a wallet lock. Unlocking an unlocked wallet is a no-op.
    pub fn unlock(&self, id: WalletId) -> Result<Wallet> {
        let row = self.row(id)?;
        let mut row = row.lock();
        let was_locked = row.wallet.lock.take().is_some();
        row.wallet.updated_at = now();
        let wallet = row.wallet.clone();
        drop(row);

        if was_locked {
            self.events.publish(LedgerEvent::WalletUnlocked { wallet_id: id });
            info!(wallet_id = %id, "Wallet unlocked");
        }
        Ok(wallet)
    }

    /// Undo a credit or debit whose ledger posting was refused. Status, lock
    /// and limit gates do not apply; undoing a credit still needs the funds
    /// to be available. Returns the new available balance.
    #[instrument(skip(self, reason))]
    pub fn reverse(
        &self,
        id: WalletId,
        movement: MovementKind,
        amount: Decimal,
        reason: &str,
    ) -> Result<Decimal> {
        ensure_positive(amount)?;
        let at = now();
        let row = self.row(id)?;
        let mut row = row.lock();

        match movement {
            MovementKind::Credit => {
                ensure_funds(row.wallet.available_balance, amount)?;
                row.wallet.available_balance -= amount;
                row.wallet.total_credit -= amount;
            }
            MovementKind::Debit => {
                row.wallet.available_balance += amount;
                row.wallet.total_debit -= amount;
                row.window.forget(amount);
            }
            other => {
                return Err(LedgerError::validation(
                    format!("{:?} movements cannot be reversed", other),
                    "movement",
                ));
            }
        }
        row.wallet.updated_at = at;
        let (available, user_id) = (row.wallet.available_balance, row.wallet.user_id);
        row.log(MovementKind::Reversal, amount, reason, at);
        drop(row);

        let reason = reason.to_string();
        self.events.publish(match movement {
            MovementKind::Credit => LedgerEvent::WalletDebited {
                wallet_id: id,
                user_id,
                amount,
                available,
                reason,
            },
            _ => LedgerEvent::WalletCredited {
                wallet_id: id,
                user_id,
                amount,
                available,
                reason,
            },
        });
        warn!(wallet_id = %id, movement = ?movement, amount = %amount, available = %available, "Wallet movement reversed");
        Ok(available)
    }

    /// Clear every lock whose expiry has passed. Returns how many were cleared.
    pub fn sweep_expired_locks(&self, at: Timestamp) -> usize {
        let rows: Vec<_> = self.wallets.iter().map(|row| Arc::clone(row.value())).collect();
        let mut cleared = 0;
        for row in rows {
            let mut row = row.lock();
            if self.clear_lapsed_lock(&mut row.wallet, at) {
                cleared += 1;
            }
        }
        if cleared > 0 {
            info!(cleared, "Expired wallet locks cleared");
        }
        cleared
    }

    /// Drop a lock that has lapsed at `at`. Returns whether one was dropped.
    fn clear_lapsed_lock(&self, wallet: &mut Wallet, at: Timestamp) -> bool {
        let lapsed = wallet.lock.as_ref().map_or(false, |lock| !lock.in_force(at));
        if lapsed {
            wallet.lock = None;
            wallet.updated_at = at;
            self.events.publish(LedgerEvent::WalletUnlocked { wallet_id: wallet.id });
        }
        lapsed
    }

    pub fn wallet_count(&self) -> usize {
        self.wallets.len()
    }
}

fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

fn ensure_unlocked(wallet: &Wallet, at: Timestamp) -> Result<()> {
    match &wallet.lock {
        Some(lock) if lock.in_force(at) => Err(LedgerError::WalletLocked {
            wallet_id: wallet.id,
            reason: lock.reason.clone(),
        }),
        _ => Ok(()),
    }
}

fn ensure_accepts_credits(wallet: &Wallet) -> Result<()> {
    if wallet.status.accepts_credits() {
        return Ok(());
    }
    Err(LedgerError::WalletUnavailable {
        wallet_id: wallet.id,
        status: wallet.status.label(),
    })
}

fn ensure_spendable(wallet: &Wallet, at: Timestamp) -> Result<()> {
    ensure_unlocked(wallet, at)?;
    if wallet.status != WalletStatus::Active {
        return Err(LedgerError::WalletUnavailable {
            wallet_id: wallet.id,
            status: wallet.status.label(),
        });
    }
    Ok(())
}

fn ensure_funds(available: Decimal, amount: Decimal) -> Result<()> {
    if available < amount {
        return Err(LedgerError::InsufficientFunds {
            required: amount,
            available,
        });
    }
    Ok(())
}

fn ensure_held(held: Decimal, amount: Decimal) -> Result<()> {
    if held < amount {
        return Err(LedgerError::InvalidHold {
            requested: amount,
            held,
        });
    }
    Ok(())
}
