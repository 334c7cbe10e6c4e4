//! Ledger service node.
//!
//! Wires the posting, wallet and settlement engines together and turns
//! payment-gateway deliveries into ledger postings plus the business effect
//! their declared purpose asks for.

use std::sync::Arc;
use std::time::Duration;

use civicledger_billing::{Invoice, NewInvoice, PaymentOutcome, SettlementEngine};
use civicledger_common::{
    now, AccountId, Currency, EventSink, InvoiceId, JournalId, LedgerError, Money,
    ReferenceGenerator, Result, Timestamp, TransactionId, UserId, WalletId,
};
use civicledger_fx::CurrencyRegistry;
use civicledger_ledger::{
    AccountType, JournalType, NewAccount, NewJournal, NewTransaction, PostedJournal,
    PostingEngine, ReconciliationSummary, ReversedJournal, Transaction, TransactionPurpose,
};
use civicledger_wallet::{MovementKind, NewWallet, Wallet, WalletEngine};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServiceConfig;
use crate::metrics::{Metrics, SharedMetrics};
use crate::state::ServiceState;

/// A payment-gateway delivery.
pub type IngestRequest = NewTransaction;

/// What a processed delivery did beyond the ledger posting.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementEffect {
    InvoicePaid(PaymentOutcome),
    /// `amount` is in the wallet's currency.
    WalletCredited { wallet_id: WalletId, amount: Decimal, new_balance: Decimal },
    WalletDebited { wallet_id: WalletId, amount: Decimal, new_balance: Decimal },
    /// Parked in suspense for manual allocation.
    Unallocated,
}

/// Result of `ingest_transaction`.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Processed {
        transaction_id: TransactionId,
        posting: PostedJournal,
        effect: SettlementEffect,
    },
    /// The gateway id was seen before; nothing changed.
    Duplicate { transaction: Transaction },
}

/// Ids of the accounts the service posts against.
#[derive(Debug, Clone, Copy)]
pub struct SystemAccounts {
    pub clearing: AccountId,
    pub receivables: AccountId,
    pub wallet_float: AccountId,
    pub suspense: AccountId,
    pub revenue: AccountId,
}

/// Outcome of one pass of every sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub locks_expired: usize,
    pub invoices_overdue: usize,
    pub reconciliation: ReconciliationSummary,
}

/// The settlement core behind the gateway callback handler.
pub struct LedgerService {
    config: ServiceConfig,
    node_id: String,
    state: RwLock<ServiceState>,
    /// Approver recorded on journals the service posts itself.
    system_user: UserId,
    accounts: SystemAccounts,
    ledger: Arc<PostingEngine>,
    wallets: Arc<WalletEngine>,
    billing: Arc<SettlementEngine>,
    metrics: SharedMetrics,
    shutdown: watch::Sender<bool>,
    sweeps: Mutex<Vec<JoinHandle<()>>>,
}

impl LedgerService {
    /// Build the engines and open the system accounts.
    pub fn new(config: ServiceConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        let registry = Arc::new(CurrencyRegistry::new(config.base_currency.clone()));
        let references = Arc::new(ReferenceGenerator::new());
        let ledger = Arc::new(PostingEngine::new(
            registry,
            Arc::clone(&references),
            Arc::clone(&events),
        ));
        let wallets = Arc::new(WalletEngine::new(config.wallet.limits(), Arc::clone(&events)));
        let billing = Arc::new(SettlementEngine::new(references, events));

        let base = &config.base_currency;
        let numbers = &config.accounts;
        let open = |number: &str, name: &str, account_type: AccountType| {
            ledger
                .open_account(NewAccount::new(number, name, account_type, base.clone()))
                .map(|account| account.id)
        };
        let accounts = SystemAccounts {
            clearing: open(&numbers.clearing, "Gateway clearing", AccountType::Asset)?,
            receivables: open(&numbers.receivables, "Invoice receivables", AccountType::Asset)?,
            wallet_float: open(&numbers.wallet_float, "Wallet float", AccountType::Liability)?,
            suspense: open(&numbers.suspense, "Unallocated receipts", AccountType::Liability)?,
            revenue: open(&numbers.revenue, "Service revenue", AccountType::Income)?,
        };

        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| format!("ledgerd-{}", uuid::Uuid::new_v4()));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            node_id,
            state: RwLock::new(ServiceState::Starting),
            system_user: UserId::new(),
            accounts,
            ledger,
            wallets,
            billing,
            metrics: Arc::new(Metrics::new()),
            shutdown,
            sweeps: Mutex::new(Vec::new()),
        })
    }

    /// Start accepting requests and launch the background sweeps.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != ServiceState::Starting {
                return Err(LedgerError::Unavailable(format!("cannot start from {:?}", *state)));
            }
            *state = ServiceState::Running;
        }
        self.start_sweeps();

        info!(node_id = %self.node_id, "Ledger service started");
        Ok(())
    }

    /// Refuse new requests and wait for the sweeps to stop.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn stop(&self) -> Result<()> {
        *self.state.write() = ServiceState::ShuttingDown;
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.sweeps.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sweep task ended abnormally");
            }
        }

        *self.state.write() = ServiceState::Stopped;
        info!(node_id = %self.node_id, "Ledger service stopped");
        Ok(())
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn is_accepting_requests(&self) -> bool {
        self.state.read().accepts_requests()
    }

    fn ensure_running(&self) -> Result<()> {
        let state = self.state();
        if state.accepts_requests() {
            return Ok(());
        }
        Err(LedgerError::Unavailable(format!("service is {:?}", state)))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn accounts(&self) -> SystemAccounts {
        self.accounts
    }

    pub fn registry(&self) -> &Arc<CurrencyRegistry> {
        self.ledger.registry()
    }

    pub fn ledger(&self) -> &Arc<PostingEngine> {
        &self.ledger
    }

    pub fn wallets(&self) -> &Arc<WalletEngine> {
        &self.wallets
    }

    pub fn billing(&self) -> &Arc<SettlementEngine> {
        &self.billing
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    // Provisioning

    pub fn open_wallet(&self, new: NewWallet) -> Result<Wallet> {
        self.ensure_running()?;
        self.wallets.open_wallet(new)
    }

    /// Register an invoice and accrue it: debit receivables, credit revenue.
    #[instrument(skip(self, new), fields(user_id = %new.user_id))]
    pub fn register_invoice(&self, new: NewInvoice) -> Result<Invoice> {
        self.ensure_running()?;

        let journal = self.ledger.create_journal(
            NewJournal::new(
                self.accounts.receivables,
                self.accounts.revenue,
                new.payable - new.discount,
                new.currency.clone(),
            )
            .of_type(JournalType::Accrual)
            .described(format!("{} invoice for {}", new.category, new.user_id))
            .created_by(self.system_user),
        )?;

        let invoice = match self.billing.register_invoice(new) {
            Ok(invoice) => invoice,
            Err(e) => {
                self.reject(journal.id, &e);
                return Err(e);
            }
        };
        if let Err(e) = self.ledger.approve_and_post(journal.id, self.system_user) {
            if let Err(cancel) = self.billing.cancel(invoice.id, &format!("accrual refused: {}", e)) {
                error!(invoice_id = %invoice.id, error = %cancel, "Unaccrued invoice left open");
            }
            self.reject(journal.id, &e);
            return Err(e);
        }
        self.metrics.journal_posted();

        info!(invoice_id = %invoice.id, journal_id = %journal.id, "Invoice accrued");
        Ok(invoice)
    }

    // Gateway ingestion

    /// Record a gateway delivery and act on its declared purpose.
    ///
    /// A redelivery of a known gateway id returns the original record and
    /// has no effect. When the business step or the posting is refused the
    /// journal is rejected, the transaction marked failed and the typed error
    /// returned. A refused posting first undoes the business step.
    #[instrument(skip(self, request), fields(gateway_txn_id = %request.gateway_txn_id))]
    pub fn ingest_transaction(&self, request: IngestRequest) -> Result<IngestOutcome> {
        self.ensure_running()?;

        let ingested = self.ledger.ingest_transaction(request)?;
        let transaction = ingested.transaction;
        if ingested.duplicate {
            self.metrics.transaction_duplicate();
            info!(
                transaction_id = %transaction.id,
                status = ?transaction.status,
                "Redelivered callback ignored"
            );
            return Ok(IngestOutcome::Duplicate { transaction });
        }
        self.metrics.transaction_ingested();

        let (debit, credit) = self.journal_accounts(&transaction.purpose);
        let journal = self.ledger.create_journal(
            NewJournal::new(debit, credit, transaction.amount, transaction.currency.clone())
                .for_transaction(transaction.id)
                .described(format!(
                    "{} {} from {}",
                    transaction.gateway, transaction.gateway_txn_id, transaction.payer
                ))
                .created_by(self.system_user),
        );
        let journal = match journal {
            Ok(journal) => journal,
            Err(e) => return Err(self.fail(&transaction, None, e)),
        };

        let effect = match self.settle(&transaction) {
            Ok(effect) => effect,
            Err(e) => return Err(self.fail(&transaction, Some(journal.id), e)),
        };

        let posting = match self.ledger.approve_and_post(journal.id, self.system_user) {
            Ok(posting) => posting,
            Err(e) => {
                self.undo(&transaction, &effect, &e);
                return Err(self.fail(&transaction, Some(journal.id), e));
            }
        };
        self.ledger
            .transactions()
            .mark_processed(transaction.id, journal.id)?;
        self.metrics.transaction_processed();

        info!(
            transaction_id = %transaction.id,
            journal_id = %journal.id,
            amount = %transaction.amount,
            currency = %transaction.currency,
            "Delivery processed"
        );
        Ok(IngestOutcome::Processed {
            transaction_id: transaction.id,
            posting,
            effect,
        })
    }

    fn journal_accounts(&self, purpose: &TransactionPurpose) -> (AccountId, AccountId) {
        let a = &self.accounts;
        match purpose {
            TransactionPurpose::InvoiceSettlement { .. } => (a.clearing, a.receivables),
            TransactionPurpose::WalletTopUp { .. } => (a.clearing, a.wallet_float),
            TransactionPurpose::WalletWithdrawal { .. } => (a.wallet_float, a.clearing),
            TransactionPurpose::Unallocated => (a.clearing, a.suspense),
        }
    }

    fn settle(&self, transaction: &Transaction) -> Result<SettlementEffect> {
        let reference = transaction.gateway_txn_id.as_str();
        match &transaction.purpose {
            TransactionPurpose::InvoiceSettlement { invoice_id } => {
                let invoice = self.billing.invoice(*invoice_id)?;
                let amount = self.convert(transaction, &invoice.currency)?;
                let outcome = self.billing.apply_payment(*invoice_id, amount, reference)?;
                self.metrics.payment_applied();
                Ok(SettlementEffect::InvoicePaid(outcome))
            }
            TransactionPurpose::WalletTopUp { wallet_id } => {
                let wallet = self.wallets.wallet(*wallet_id)?;
                let amount = self.convert(transaction, &wallet.currency)?;
                let new_balance = self
                    .wallets
                    .credit(*wallet_id, amount, &format!("top-up {}", reference))?;
                self.metrics.wallet_credited();
                Ok(SettlementEffect::WalletCredited {
                    wallet_id: *wallet_id,
                    amount,
                    new_balance,
                })
            }
            TransactionPurpose::WalletWithdrawal { wallet_id } => {
                let wallet = self.wallets.wallet(*wallet_id)?;
                let amount = self.convert(transaction, &wallet.currency)?;
                let new_balance = self
                    .wallets
                    .debit(*wallet_id, amount, &format!("withdrawal {}", reference))?;
                self.metrics.wallet_debited();
                Ok(SettlementEffect::WalletDebited {
                    wallet_id: *wallet_id,
                    amount,
                    new_balance,
                })
            }
            TransactionPurpose::Unallocated => Ok(SettlementEffect::Unallocated),
        }
    }

    /// Take back the business step of a delivery whose posting was refused.
    fn undo(&self, transaction: &Transaction, effect: &SettlementEffect, cause: &LedgerError) {
        let reason = format!("reversal {}: {}", transaction.gateway_txn_id, cause);
        let undone = match effect {
            SettlementEffect::InvoicePaid(outcome) => self
                .billing
                .revert_payment(outcome.invoice_id, transaction.gateway_txn_id.as_str())
                .map(|_| ()),
            SettlementEffect::WalletCredited { wallet_id, amount, .. } => self
                .wallets
                .reverse(*wallet_id, MovementKind::Credit, *amount, &reason)
                .map(|_| ()),
            SettlementEffect::WalletDebited { wallet_id, amount, .. } => self
                .wallets
                .reverse(*wallet_id, MovementKind::Debit, *amount, &reason)
                .map(|_| ()),
            SettlementEffect::Unallocated => Ok(()),
        };
        if let Err(e) = undone {
            error!(
                transaction_id = %transaction.id,
                effect = ?effect,
                error = %e,
                "Business step could not be undone; needs operator review"
            );
        }
    }

    /// The delivery amount expressed in `to`, at the rate effective when the
    /// payment occurred.
    fn convert(&self, transaction: &Transaction, to: &Currency) -> Result<Decimal> {
        if &transaction.currency == to {
            return Ok(transaction.amount);
        }
        let money = Money::new(transaction.amount, transaction.currency.clone());
        let conversion = self
            .registry()
            .convert(&money, to, transaction.occurred_at)?;
        debug!(
            from = %transaction.currency,
            to = %to,
            rate = %conversion.rate,
            output = %conversion.output.value,
            "Delivery amount converted"
        );
        Ok(conversion.output.value)
    }

    fn reject(&self, journal_id: JournalId, cause: &LedgerError) {
        if let Err(e) = self
            .ledger
            .reject_journal(journal_id, self.system_user, cause.to_string())
        {
            warn!(journal_id = %journal_id, error = %e, "Could not reject journal");
        }
    }

    fn fail(&self, transaction: &Transaction, journal: Option<JournalId>, error: LedgerError) -> LedgerError {
        if let Some(journal_id) = journal {
            self.reject(journal_id, &error);
        }
        if let Err(e) = self
            .ledger
            .transactions()
            .mark_failed(transaction.id, error.to_string())
        {
            warn!(transaction_id = %transaction.id, error = %e, "Could not mark transaction failed");
        }
        self.metrics.transaction_failed(&error);

        warn!(
            transaction_id = %transaction.id,
            code = error.error_code(),
            error = %error,
            "Delivery refused"
        );
        error
    }

    // Direct operations

    pub fn post_journal(&self, id: JournalId) -> Result<PostedJournal> {
        self.ensure_running()?;
        let posted = self.ledger.post_journal(id)?;
        self.metrics.journal_posted();
        Ok(posted)
    }

    pub fn reverse_journal(&self, id: JournalId, approver: UserId) -> Result<ReversedJournal> {
        self.ensure_running()?;
        let reversed = self.ledger.reverse_journal(id, approver)?;
        self.metrics.journal_reversed();
        Ok(reversed)
    }

    /// Returns the new available balance.
    pub fn wallet_credit(&self, id: WalletId, amount: Decimal, reason: &str) -> Result<Decimal> {
        self.ensure_running()?;
        let balance = self
            .wallets
            .credit(id, amount, reason)
            .inspect_err(|e| self.metrics.rejected(e))?;
        self.metrics.wallet_credited();
        Ok(balance)
    }

    /// Returns the new available balance.
    pub fn wallet_debit(&self, id: WalletId, amount: Decimal, reason: &str) -> Result<Decimal> {
        self.ensure_running()?;
        let balance = self
            .wallets
            .debit(id, amount, reason)
            .inspect_err(|e| self.metrics.rejected(e))?;
        self.metrics.wallet_debited();
        Ok(balance)
    }

    pub fn invoice_apply_payment(
        &self,
        id: InvoiceId,
        amount: Decimal,
        receipt_ref: &str,
    ) -> Result<PaymentOutcome> {
        self.ensure_running()?;
        let outcome = self
            .billing
            .apply_payment(id, amount, receipt_ref)
            .inspect_err(|e| self.metrics.rejected(e))?;
        self.metrics.payment_applied();
        Ok(outcome)
    }

    // Sweeps

    /// Run every sweep once at `at`.
    pub fn run_sweeps(&self, at: Timestamp) -> SweepReport {
        let locks_expired = self.wallets.sweep_expired_locks(at);
        let invoices_overdue = self.billing.sweep_overdue(at);
        let reconciliation = self.ledger.reconcile_all();

        self.metrics.locks_expired(locks_expired);
        self.metrics.invoices_overdue(invoices_overdue);
        self.metrics.reconciled(reconciliation.mismatches.len());
        SweepReport {
            locks_expired,
            invoices_overdue,
            reconciliation,
        }
    }

    fn start_sweeps(&self) {
        let sweep = &self.config.sweep;

        let wallets = Arc::clone(&self.wallets);
        let metrics = Arc::clone(&self.metrics);
        self.spawn_sweep("lock_expiry", sweep.lock_expiry_interval, move || {
            metrics.locks_expired(wallets.sweep_expired_locks(now()));
        });

        let billing = Arc::clone(&self.billing);
        let metrics = Arc::clone(&self.metrics);
        self.spawn_sweep("overdue", sweep.overdue_interval, move || {
            metrics.invoices_overdue(billing.sweep_overdue(now()));
        });

        let ledger = Arc::clone(&self.ledger);
        let metrics = Arc::clone(&self.metrics);
        self.spawn_sweep("reconciliation", sweep.reconciliation_interval, move || {
            let summary = ledger.reconcile_all();
            if !summary.is_clean() {
                warn!(
                    mismatches = summary.mismatches.len(),
                    "Reconciliation found accounts out of balance"
                );
            }
            metrics.reconciled(summary.mismatches.len());
        });
    }

    fn spawn_sweep<F>(&self, name: &'static str, every: Duration, sweep: F)
    where
        F: Fn() + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep(),
                    _ = shutdown.changed() => break,
                }
            }
            debug!(sweep = name, "Sweep stopped");
        });
        self.sweeps.lock().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicledger_common::NullSink;

    fn service() -> LedgerService {
        LedgerService::new(ServiceConfig::default(), Arc::new(NullSink)).unwrap()
    }

    #[tokio::test]
    async fn test_service_creation() {
        let service = service();
        assert_eq!(service.state(), ServiceState::Starting);
        assert!(service.node_id().starts_with("ledgerd-"));
        assert_eq!(service.ledger().store().account_count(), 5);
        assert!(matches!(
            service.wallet_credit(WalletId::new(), Decimal::ONE, "x"),
            Err(LedgerError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_service_start_stop() {
        let service = service();

        service.start().await.unwrap();
        assert_eq!(service.state(), ServiceState::Running);
        assert!(service.start().await.is_err());

        service.stop().await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(!service.is_accepting_requests());
    }

    #[test]
    fn test_duplicate_account_numbers_fail() {
        let mut config = ServiceConfig::default();
        config.accounts.revenue = config.accounts.clearing.clone();
        assert!(matches!(
            LedgerService::new(config, Arc::new(NullSink)),
            Err(LedgerError::Duplicate { .. })
        ));
    }
}
