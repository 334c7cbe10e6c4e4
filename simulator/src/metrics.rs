//! Simulation metrics.

use std::collections::{BTreeMap, VecDeque};

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Deliveries sent to the service, redeliveries included.
    pub total_deliveries: u64,
    pub processed: u64,
    pub duplicates: u64,
    pub failed: u64,
    /// Distinct gateway ids sent.
    pub unique_deliveries: u64,
    /// Failures by error code.
    pub failures_by_code: BTreeMap<&'static str, u64>,
    pub assertions_passed: u64,
    pub assertions_failed: u64,
    /// Latency samples (µs).
    latency_samples: VecDeque<u64>,
    max_samples: usize,
}

impl SimulationMetrics {
    pub fn new() -> Self {
        Self {
            total_deliveries: 0,
            processed: 0,
            duplicates: 0,
            failed: 0,
            unique_deliveries: 0,
            failures_by_code: BTreeMap::new(),
            assertions_passed: 0,
            assertions_failed: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    pub fn record_processed(&mut self, latency_us: u64) {
        self.total_deliveries += 1;
        self.processed += 1;
        self.sample(latency_us);
    }

    pub fn record_duplicate(&mut self, latency_us: u64) {
        self.total_deliveries += 1;
        self.duplicates += 1;
        self.sample(latency_us);
    }

    pub fn record_failure(&mut self, code: &'static str) {
        self.total_deliveries += 1;
        self.failed += 1;
        *self.failures_by_code.entry(code).or_insert(0) += 1;
    }

    pub fn record_unique(&mut self, count: usize) {
        self.unique_deliveries += count as u64;
    }

    pub fn record_assertion(&mut self, passed: bool) {
        if passed {
            self.assertions_passed += 1;
        } else {
            self.assertions_failed += 1;
        }
    }

    fn sample(&mut self, latency_us: u64) {
        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Share of deliveries that were processed or recognised as duplicates.
    pub fn success_rate(&self) -> f64 {
        if self.total_deliveries == 0 {
            return 0.0;
        }

        (self.processed + self.duplicates) as f64 / self.total_deliveries as f64
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
