//! CivicLedger Simulator
//!
//! Drives the settlement node with concurrent gateway deliveries and checks
//! the ledger invariants afterwards.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod metrics;
mod population;
mod scenario;

use controller::SimulationController;
use scenario::Scenario;

/// CivicLedger Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "CivicLedger load and contention simulator")]
struct Args {
    /// Scenario to run: wallet-contention, callback-redelivery or invoice-settlement
    #[arg(short, long, default_value = "wallet-contention")]
    scenario: String,

    /// Number of simulated citizens
    #[arg(short, long, default_value = "10")]
    citizens: usize,

    /// Maximum deliveries in flight
    #[arg(long, default_value = "16")]
    concurrency: usize,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let scenario = Scenario::load(&args.scenario)?;

    info!("Starting CivicLedger Simulator");
    info!("Citizens: {}", args.citizens);
    info!("Concurrency: {}", args.concurrency);

    let mut controller = SimulationController::new(args.citizens, args.concurrency, args.seed)?;
    controller.initialize().await?;
    controller.run_scenario(scenario).await?;

    let violations = controller.verify_invariants().await;
    controller.shutdown().await?;

    let metrics = controller.get_metrics().await;
    info!("Simulation complete");
    info!("Deliveries: {} ({} distinct)", metrics.total_deliveries, metrics.unique_deliveries);
    info!("Processed: {}", metrics.processed);
    info!("Duplicates: {}", metrics.duplicates);
    info!("Failed: {}", metrics.failed);
    for (code, count) in &metrics.failures_by_code {
        info!("  {}: {}", code, count);
    }
    info!("Success rate: {:.1}%", metrics.success_rate() * 100.0);
    info!("Average latency: {}µs", metrics.average_latency_us());
    info!("p99 latency: {}µs", metrics.p99_latency_us());
    info!("Events published: {}", controller.events_published());
    info!(
        "Assertions: {} passed, {} failed",
        metrics.assertions_passed, metrics.assertions_failed
    );
    info!("Service counters:\n{}", controller.service().metrics().to_prometheus());

    if !violations.is_empty() || metrics.assertions_failed > 0 {
        for violation in &violations {
            error!("Invariant violated: {}", violation);
        }
        let failures = violations.len() + metrics.assertions_failed as usize;
        return Err(anyhow::anyhow!("Simulation found {} violated invariants", failures));
    }

    Ok(())
}
