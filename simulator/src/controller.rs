//! Simulation controller.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use civicledger_billing::{InvoiceStatus, NewInvoice};
use civicledger_common::{now, GatewayTxnId, InvoiceId, MemorySink};
use civicledger_gateway::{IngestOutcome, IngestRequest, LedgerService, ServiceConfig};
use civicledger_ledger::{Channel, TransactionPurpose};

use crate::metrics::SimulationMetrics;
use crate::population::{Citizen, CitizenFactory};
use crate::scenario::{AssertCondition, Scenario, ScenarioStep};

const GATEWAYS: [&str; 3] = ["mpesa", "airtel-money", "card"];

/// Controls the simulation.
pub struct SimulationController {
    citizen_count: usize,
    /// Maximum deliveries in flight.
    concurrency: usize,
    rng: StdRng,
    service: Arc<LedgerService>,
    events: Arc<MemorySink>,
    citizens: Vec<Citizen>,
    invoices: Vec<InvoiceId>,
    metrics: Arc<RwLock<SimulationMetrics>>,
    next_delivery: u64,
}

impl SimulationController {
    pub fn new(citizen_count: usize, concurrency: usize, seed: Option<u64>) -> anyhow::Result<Self> {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let events = Arc::new(MemorySink::new());
        let service = LedgerService::new(ServiceConfig::default(), events.clone())?;

        Ok(Self {
            citizen_count,
            concurrency: concurrency.max(1),
            rng,
            service: Arc::new(service),
            events,
            citizens: Vec::new(),
            invoices: Vec::new(),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            next_delivery: 0,
        })
    }

    /// Start the service and open a wallet for every citizen.
    pub async fn initialize(&mut self) -> anyhow::Result<()> {
        info!("Initializing simulation with {} citizens", self.citizen_count);

        self.service.start().await?;
        self.citizens = CitizenFactory::create_citizens(&self.service, self.citizen_count)?;
        for citizen in &self.citizens {
            info!("Opened wallet {} for {} ({})", citizen.wallet_id, citizen.name, citizen.msisdn);
        }

        Ok(())
    }

    /// Run a scenario.
    pub async fn run_scenario(&mut self, scenario: Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        for step in &scenario.steps {
            self.execute_step(step).await?;
        }

        Ok(())
    }

    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::FundWallets { amount } => {
                info!("Funding {} wallets with {}", self.citizens.len(), amount);
                let requests: Vec<_> = self
                    .citizens
                    .clone()
                    .iter()
                    .map(|c| {
                        self.delivery(c, *amount, TransactionPurpose::WalletTopUp { wallet_id: c.wallet_id })
                    })
                    .collect();
                self.metrics.write().await.record_unique(requests.len());
                self.deliver(requests).await?;
            }
            ScenarioStep::Withdraw { amount, attempts } => {
                info!("Firing {} withdrawals of {} per wallet", attempts, amount);
                let mut requests = Vec::new();
                for citizen in self.citizens.clone() {
                    for _ in 0..*attempts {
                        requests.push(self.delivery(
                            &citizen,
                            *amount,
                            TransactionPurpose::WalletWithdrawal { wallet_id: citizen.wallet_id },
                        ));
                    }
                }
                self.metrics.write().await.record_unique(requests.len());
                self.deliver(requests).await?;
            }
            ScenarioStep::Redeliver { amount, copies } => {
                info!("Delivering {} unallocated payments {} times each", self.citizens.len(), copies);
                let mut requests = Vec::new();
                for citizen in self.citizens.clone() {
                    let request = self.delivery(&citizen, *amount, TransactionPurpose::Unallocated);
                    for _ in 0..*copies {
                        requests.push(request.clone());
                    }
                }
                self.metrics.write().await.record_unique(self.citizens.len());
                self.deliver(requests).await?;
            }
            ScenarioStep::IssueInvoices { category, amount } => {
                let currency = self.service.config().base_currency.clone();
                for citizen in &self.citizens {
                    let invoice = self.service.register_invoice(NewInvoice::new(
                        category.clone(),
                        citizen.user_id,
                        *amount,
                        currency.clone(),
                    ))?;
                    info!("Issued invoice {} of {} to {}", invoice.reference, amount, citizen.name);
                    self.invoices.push(invoice.id);
                }
            }
            ScenarioStep::PayInvoices { installments } => {
                let mut requests = Vec::new();
                for (citizen, invoice_id) in self.citizens.clone().iter().zip(self.invoices.clone()) {
                    let invoice = self.service.billing().invoice(invoice_id)?;
                    let part = invoice
                        .currency
                        .round(invoice.balance / Decimal::from(*installments));
                    // One part more than the balance covers.
                    for _ in 0..=*installments {
                        requests.push(self.delivery(
                            citizen,
                            part,
                            TransactionPurpose::InvoiceSettlement { invoice_id },
                        ));
                    }
                }
                info!("Paying {} invoices in {} parts", self.invoices.len(), installments);
                self.metrics.write().await.record_unique(requests.len());
                self.deliver(requests).await?;
            }
            ScenarioStep::RunSweeps => {
                let report = self.service.run_sweeps(now());
                info!(
                    "Sweeps: {} locks expired, {} invoices overdue, {} accounts reconciled",
                    report.locks_expired, report.invoices_overdue, report.reconciliation.accounts_checked
                );
            }
            ScenarioStep::Assert { condition } => {
                let passed = self.check(condition).await;
                if passed {
                    info!("Assertion passed: {:?}", condition);
                } else {
                    error!("Assertion failed: {:?}", condition);
                }
                self.metrics.write().await.record_assertion(passed);
            }
        }

        Ok(())
    }

    fn delivery(&mut self, citizen: &Citizen, amount: Decimal, purpose: TransactionPurpose) -> IngestRequest {
        self.next_delivery += 1;
        let gateway = GATEWAYS[self.rng.gen_range(0..GATEWAYS.len())];
        let id = format!("SIM{:09}", self.next_delivery);

        IngestRequest {
            gateway_txn_id: GatewayTxnId::new(id.clone()),
            gateway_reference: Some(citizen.msisdn.clone()),
            payer: citizen.msisdn.clone(),
            payee: "600100".to_string(),
            channel: Channel::C2B,
            gateway: gateway.to_string(),
            amount,
            currency: self.service.config().base_currency.clone(),
            purpose,
            raw_payload: serde_json::json!({
                "TransID": id,
                "TransAmount": amount.to_string(),
                "MSISDN": citizen.msisdn,
            }),
            occurred_at: now(),
        }
    }

    /// Send deliveries in random order, at most `concurrency` in flight.
    async fn deliver(&mut self, mut requests: Vec<IngestRequest>) -> anyhow::Result<()> {
        requests.shuffle(&mut self.rng);

        let service = Arc::clone(&self.service);
        let results: Vec<_> = stream::iter(requests.into_iter().map(|request| {
            let service = Arc::clone(&service);
            tokio::task::spawn_blocking(move || {
                let started = Instant::now();
                let result = service.ingest_transaction(request);
                (result, started.elapsed().as_micros() as u64)
            })
        }))
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

        let mut metrics = self.metrics.write().await;
        for joined in results {
            let (result, latency_us) = joined?;
            match result {
                Ok(IngestOutcome::Processed { .. }) => metrics.record_processed(latency_us),
                Ok(IngestOutcome::Duplicate { .. }) => metrics.record_duplicate(latency_us),
                Err(e) => metrics.record_failure(e.error_code()),
            }
        }

        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> bool {
        let service = &self.service;
        match condition {
            AssertCondition::WalletsNonNegative => service.wallets().all_wallets().iter().all(|w| {
                !w.available_balance.is_sign_negative() && !w.hold_balance.is_sign_negative()
            }),
            AssertCondition::WalletBalancesEqual { amount } => self.citizens.iter().all(|c| {
                service
                    .wallets()
                    .wallet(c.wallet_id)
                    .map(|w| w.available_balance == *amount)
                    .unwrap_or(false)
            }),
            AssertCondition::EachDeliveryProcessedOnce => {
                let metrics = self.metrics.read().await;
                let processed = service.metrics().snapshot().transactions_processed;
                metrics.failed == 0 && processed == metrics.unique_deliveries
            }
            AssertCondition::InvoicesSettled => self.invoices.iter().all(|id| {
                service
                    .billing()
                    .invoice(*id)
                    .map(|i| i.status == InvoiceStatus::Settled)
                    .unwrap_or(false)
            }),
            AssertCondition::ReceivablesCleared => service
                .ledger()
                .account(service.accounts().receivables)
                .map(|a| a.current_balance.is_zero())
                .unwrap_or(false),
            AssertCondition::LedgerReconciled => service.ledger().reconcile_all().is_clean(),
            AssertCondition::IntegrityHolds => match service.ledger().verify_integrity() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Integrity check failed: {}", e);
                    false
                }
            },
        }
    }

    /// Invariants that must hold after any scenario.
    pub async fn verify_invariants(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for condition in [
            AssertCondition::WalletsNonNegative,
            AssertCondition::LedgerReconciled,
            AssertCondition::IntegrityHolds,
        ] {
            if !self.check(&condition).await {
                violations.push(format!("{:?}", condition));
            }
        }
        violations
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.service.stop().await?;
        Ok(())
    }

    pub async fn get_metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }

    pub fn events_published(&self) -> usize {
        self.events.events().len()
    }

    pub fn service(&self) -> &LedgerService {
        &self.service
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(name: &str) -> (SimulationController, SimulationMetrics) {
        let mut controller = SimulationController::new(3, 8, Some(7)).unwrap();
        controller.initialize().await.unwrap();
        controller.run_scenario(Scenario::load(name).unwrap()).await.unwrap();
        let metrics = controller.get_metrics().await;
        (controller, metrics)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wallet_contention() {
        let (controller, metrics) = run("wallet-contention").await;

        // 3 top-ups, then 10 of 25 withdrawals per wallet.
        assert_eq!(metrics.processed, 3 + 30);
        assert_eq!(metrics.failures_by_code["INSUFFICIENT_FUNDS"], 45);
        assert_eq!(metrics.assertions_failed, 0);
        assert!(controller.verify_invariants().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_callback_redelivery() {
        let (_, metrics) = run("callback-redelivery").await;

        assert_eq!(metrics.processed, 6);
        assert_eq!(metrics.duplicates, 12);
        assert_eq!(metrics.assertions_failed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_invoice_settlement() {
        let (controller, metrics) = run("invoice-settlement").await;

        assert_eq!(metrics.processed, 12);
        assert_eq!(metrics.failed, 3);
        assert_eq!(metrics.assertions_failed, 0);
        controller.shutdown().await.unwrap();
    }
}
