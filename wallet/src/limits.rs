//! Debit limits evaluated over rolling windows.

use std::collections::VecDeque;

use civicledger_common::constants::{daily_limit_window, monthly_limit_window};
use civicledger_common::{window_start, LedgerError, LimitKind, Result, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-wallet debit limits. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletLimits {
    /// Cap on a single debit.
    pub transaction: Option<Decimal>,
    /// Cap on debits in the last 24 hours.
    pub daily: Option<Decimal>,
    /// Cap on debits in the last 30 days.
    pub monthly: Option<Decimal>,
}

impl WalletLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Reject non-positive limits and a transaction cap above the daily cap.
    pub fn validate(&self) -> Result<()> {
        for (name, limit) in [
            ("transaction", self.transaction),
            ("daily", self.daily),
            ("monthly", self.monthly),
        ] {
            if let Some(limit) = limit {
                if limit <= Decimal::ZERO {
                    return Err(LedgerError::validation(
                        format!("{} limit must be positive, got {}", name, limit),
                        "limits",
                    ));
                }
            }
        }
        if let (Some(transaction), Some(daily)) = (self.transaction, self.daily) {
            if transaction > daily {
                return Err(LedgerError::validation(
                    format!("transaction limit {} exceeds daily limit {}", transaction, daily),
                    "limits",
                ));
            }
        }
        if let (Some(daily), Some(monthly)) = (self.daily, self.monthly) {
            if daily > monthly {
                return Err(LedgerError::validation(
                    format!("daily limit {} exceeds monthly limit {}", daily, monthly),
                    "limits",
                ));
            }
        }
        Ok(())
    }
}

/// Debits recorded inside the longest limit window.
#[derive(Debug, Clone, Default)]
pub struct DebitWindow {
    debits: VecDeque<(Timestamp, Decimal)>,
}

impl DebitWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total debited strictly after `since`.
    pub fn total_since(&self, since: Timestamp) -> Decimal {
        self.debits
            .iter()
            .filter(|(when, _)| *when > since)
            .map(|(_, amount)| *amount)
            .sum()
    }

    /// Check a prospective debit of `amount` at `at` against `limits`.
    pub fn check(&self, limits: &WalletLimits, amount: Decimal, at: Timestamp) -> Result<()> {
        if let Some(limit) = limits.transaction {
            if amount > limit {
                return Err(LedgerError::LimitExceeded {
                    kind: LimitKind::Transaction,
                    limit,
                    attempted: amount,
                });
            }
        }

        let windows = [
            (LimitKind::Daily, limits.daily, daily_limit_window()),
            (LimitKind::Monthly, limits.monthly, monthly_limit_window()),
        ];
        for (kind, limit, length) in windows {
            let Some(limit) = limit else { continue };
            let attempted = self.total_since(window_start(at, length)) + amount;
            if attempted > limit {
                return Err(LedgerError::LimitExceeded {
                    kind,
                    limit,
                    attempted,
                });
            }
        }
        Ok(())
    }

    /// Record a debit and drop anything older than the monthly window.
    pub fn record(&mut self, amount: Decimal, at: Timestamp) {
        self.debits.push_back((at, amount));
        let horizon = window_start(at, monthly_limit_window());
        while self
            .debits
            .front()
            .map_or(false, |(when, _)| *when <= horizon)
        {
            self.debits.pop_front();
        }
    }

    /// Drop the most recent debit of `amount`.
    pub fn forget(&mut self, amount: Decimal) {
        if let Some(index) = self.debits.iter().rposition(|(_, debit)| *debit == amount) {
            self.debits.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use civicledger_common::now;
    use rust_decimal_macros::dec;

    fn limits() -> WalletLimits {
        WalletLimits {
            transaction: Some(dec!(500)),
            daily: Some(dec!(1000)),
            monthly: Some(dec!(5000)),
        }
    }

    #[test]
    fn test_transaction_limit() {
        let window = DebitWindow::new();
        let err = window.check(&limits(), dec!(600), now()).unwrap_err();
        assert_eq!(
            err,
            LedgerError::LimitExceeded {
                kind: LimitKind::Transaction,
                limit: dec!(500),
                attempted: dec!(600),
            }
        );
    }

    #[test]
    fn test_daily_window_rolls() {
        let at = now();
        let mut window = DebitWindow::new();
        window.record(dec!(500), at - Duration::hours(25));
        window.record(dec!(500), at - Duration::hours(2));
        window.record(dec!(400), at - Duration::hours(1));

        // 900 in the last 24h.
        assert!(window.check(&limits(), dec!(100), at).is_ok());
        let err = window.check(&limits(), dec!(101), at).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::LimitExceeded {
                kind: LimitKind::Daily,
                ..
            }
        ));
    }

    #[test]
    fn test_monthly_window() {
        let at = now();
        let mut window = DebitWindow::new();
        for day in 1..=10 {
            window.record(dec!(490), at - Duration::days(day));
        }
        window.record(dec!(490), at - Duration::days(31));

        // 4900 inside 30 days; the 31-day-old debit falls outside.
        assert_eq!(window.total_since(window_start(at, monthly_limit_window())), dec!(4900));
        let err = window.check(&limits(), dec!(200), at).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::LimitExceeded {
                kind: LimitKind::Monthly,
                ..
            }
        ));
    }

    #[test]
    fn test_unlimited() {
        let mut window = DebitWindow::new();
        window.record(dec!(1000000), now());
        assert!(window.check(&WalletLimits::unlimited(), dec!(1000000), now()).is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(limits().validate().is_ok());
        let inverted = WalletLimits {
            transaction: Some(dec!(2000)),
            ..limits()
        };
        assert!(inverted.validate().is_err());
        let zero = WalletLimits {
            daily: Some(dec!(0)),
            ..WalletLimits::default()
        };
        assert!(zero.validate().is_err());
    }
}
