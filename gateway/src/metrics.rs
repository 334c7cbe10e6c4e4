//! Service counters with Prometheus text export.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use civicledger_common::LedgerError;
use serde::Serialize;

/// Service metrics.
#[derive(Debug, Default)]
pub struct Metrics {
    pub transactions_ingested: AtomicU64,
    pub transactions_duplicate: AtomicU64,
    pub transactions_processed: AtomicU64,
    pub transactions_failed: AtomicU64,
    pub journals_posted: AtomicU64,
    pub journals_reversed: AtomicU64,
    pub wallet_credits: AtomicU64,
    pub wallet_debits: AtomicU64,
    pub payments_applied: AtomicU64,
    /// Expected rejections: insufficient funds, limits, locks, overpayment.
    pub business_rejections: AtomicU64,
    pub locks_expired: AtomicU64,
    pub invoices_overdue: AtomicU64,
    pub reconciliation_runs: AtomicU64,
    pub reconciliation_mismatches: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_ingested(&self) {
        self.transactions_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_duplicate(&self) {
        self.transactions_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_processed(&self) {
        self.transactions_processed.fetch_add(1, Ordering::Relaxed);
        self.journals_posted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed delivery, classifying the error.
    pub fn transaction_failed(&self, error: &LedgerError) {
        self.transactions_failed.fetch_add(1, Ordering::Relaxed);
        self.rejected(error);
    }

    /// Count an error if it is a business rejection.
    pub fn rejected(&self, error: &LedgerError) {
        if error.is_business_rejection() {
            self.business_rejections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn journal_posted(&self) {
        self.journals_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn journal_reversed(&self) {
        self.journals_reversed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn wallet_credited(&self) {
        self.wallet_credits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn wallet_debited(&self) {
        self.wallet_debits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payment_applied(&self) {
        self.payments_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn locks_expired(&self, count: usize) {
        self.locks_expired.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn invoices_overdue(&self, count: usize) {
        self.invoices_overdue.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn reconciled(&self, mismatches: usize) {
        self.reconciliation_runs.fetch_add(1, Ordering::Relaxed);
        self.reconciliation_mismatches
            .fetch_add(mismatches as u64, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            transactions_ingested: load(&self.transactions_ingested),
            transactions_duplicate: load(&self.transactions_duplicate),
            transactions_processed: load(&self.transactions_processed),
            transactions_failed: load(&self.transactions_failed),
            journals_posted: load(&self.journals_posted),
            journals_reversed: load(&self.journals_reversed),
            wallet_credits: load(&self.wallet_credits),
            wallet_debits: load(&self.wallet_debits),
            payments_applied: load(&self.payments_applied),
            business_rejections: load(&self.business_rejections),
            locks_expired: load(&self.locks_expired),
            invoices_overdue: load(&self.invoices_overdue),
            reconciliation_runs: load(&self.reconciliation_runs),
            reconciliation_mismatches: load(&self.reconciliation_mismatches),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let counters = [
            ("transactions_ingested", "Gateway deliveries recorded", s.transactions_ingested),
            ("transactions_duplicate", "Redelivered callbacks ignored", s.transactions_duplicate),
            ("transactions_processed", "Deliveries posted to the ledger", s.transactions_processed),
            ("transactions_failed", "Deliveries whose business step failed", s.transactions_failed),
            ("journals_posted", "Journals posted", s.journals_posted),
            ("journals_reversed", "Journals reversed", s.journals_reversed),
            ("wallet_credits", "Wallet credits", s.wallet_credits),
            ("wallet_debits", "Wallet debits", s.wallet_debits),
            ("payments_applied", "Invoice payments applied", s.payments_applied),
            ("business_rejections", "Expected business-rule rejections", s.business_rejections),
            ("locks_expired", "Wallet locks cleared on expiry", s.locks_expired),
            ("invoices_overdue", "Invoices marked overdue", s.invoices_overdue),
            ("reconciliation_runs", "Reconciliation sweeps", s.reconciliation_runs),
            ("reconciliation_mismatches", "Accounts whose balance disagreed with replay", s.reconciliation_mismatches),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            // Writing to a String cannot fail.
            let _ = writeln!(out, "# HELP civicledger_{name} {help}");
            let _ = writeln!(out, "# TYPE civicledger_{name} counter");
            let _ = writeln!(out, "civicledger_{name} {value}\n");
        }
        out
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub transactions_ingested: u64,
    pub transactions_duplicate: u64,
    pub transactions_processed: u64,
    pub transactions_failed: u64,
    pub journals_posted: u64,
    pub journals_reversed: u64,
    pub wallet_credits: u64,
    pub wallet_debits: u64,
    pub payments_applied: u64,
    pub business_rejections: u64,
    pub locks_expired: u64,
    pub invoices_overdue: u64,
    pub reconciliation_runs: u64,
    pub reconciliation_mismatches: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();
        metrics.transaction_ingested();
        metrics.transaction_ingested();
        metrics.transaction_processed();
        metrics.transaction_failed(&LedgerError::InsufficientFunds {
            required: dec!(10),
            available: dec!(5),
        });
        metrics.transaction_failed(&LedgerError::InvalidAmount(dec!(0)));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transactions_ingested, 2);
        assert_eq!(snapshot.transactions_processed, 1);
        assert_eq!(snapshot.journals_posted, 1);
        assert_eq!(snapshot.transactions_failed, 2);
        assert_eq!(snapshot.business_rejections, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.transaction_ingested();
        metrics.locks_expired(3);

        let output = metrics.to_prometheus();
        assert!(output.contains("civicledger_transactions_ingested 1"));
        assert!(output.contains("civicledger_locks_expired 3"));
        assert!(output.contains("# TYPE civicledger_wallet_debits counter"));
    }
}
