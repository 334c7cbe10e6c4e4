//! CivicLedger Gateway Service
//!
//! The settlement node behind the payment-gateway callback handler. It owns
//! the posting, wallet and settlement engines, turns gateway deliveries into
//! balanced journals plus their business effect, and runs the background
//! sweeps for lock expiry, overdue invoices and reconciliation.

pub mod config;
pub mod metrics;
pub mod service;
pub mod state;

pub use config::{AccountsConfig, ConfigError, ServiceConfig, SweepConfig, WalletConfig};
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use service::{
    IngestOutcome, IngestRequest, LedgerService, SettlementEffect, SweepReport, SystemAccounts,
};
pub use state::ServiceState;
