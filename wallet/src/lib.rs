//! CivicLedger Wallet Engine
//!
//! Per-user, per-currency wallets with available, held and pending funds.
//! All balance changes on one wallet are serialized by a row lock and are
//! checked in full before anything is written, so a rejected operation
//! leaves the wallet untouched.

pub mod engine;
pub mod limits;
pub mod wallet;

pub use engine::{WalletBalance, WalletEngine};
pub use limits::{DebitWindow, WalletLimits};
pub use wallet::{MovementKind, NewWallet, Wallet, WalletLock, WalletMovement, WalletStatus};
