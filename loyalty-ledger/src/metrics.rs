//! Metrics collection for observability
//!
//! Prometheus metrics for the jewels ledger, registered on a per-ledger
//! registry so several ledgers can live in one process.
//!
//! # Metrics
//!
//! - `loyalty_jewels_earned_total` - Jewels granted
//! - `loyalty_jewels_redeemed_total` - Jewels redeemed
//! - `loyalty_jewels_expired_total` - Jewels expired by the sweeper
//! - `loyalty_redemptions_total` - Successful redemptions
//! - `loyalty_redemptions_rejected_total` - Rejected redemptions
//! - `loyalty_lock_conflicts_total` - Per-user lock timeouts
//! - `loyalty_append_duration_seconds` - Histogram of append latencies
//! - `loyalty_sweep_duration_seconds` - Histogram of sweep durations

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Jewels granted
    pub jewels_earned: IntCounter,

    /// Jewels redeemed
    pub jewels_redeemed: IntCounter,

    /// Jewels expired
    pub jewels_expired: IntCounter,

    /// Successful redemptions
    pub redemptions: IntCounter,

    /// Rejected redemptions (threshold, balance, conflict)
    pub redemptions_rejected: IntCounter,

    /// Lock timeouts
    pub lock_conflicts: IntCounter,

    /// Append duration histogram
    pub append_duration: Histogram,

    /// Sweep duration histogram
    pub sweep_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("jewels_earned", &self.jewels_earned.get())
            .field("jewels_redeemed", &self.jewels_redeemed.get())
            .field("jewels_expired", &self.jewels_expired.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let jewels_earned = counter("loyalty_jewels_earned_total", "Jewels granted")?;
        let jewels_redeemed = counter("loyalty_jewels_redeemed_total", "Jewels redeemed")?;
        let jewels_expired = counter("loyalty_jewels_expired_total", "Jewels expired by the sweeper")?;
        let redemptions = counter("loyalty_redemptions_total", "Successful redemptions")?;
        let redemptions_rejected =
            counter("loyalty_redemptions_rejected_total", "Rejected redemptions")?;
        let lock_conflicts = counter("loyalty_lock_conflicts_total", "Per-user lock timeouts")?;

        let append_duration = Histogram::with_opts(
            HistogramOpts::new(
                "loyalty_append_duration_seconds",
                "Histogram of append latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(append_duration.clone()))?;

        let sweep_duration = Histogram::with_opts(
            HistogramOpts::new("loyalty_sweep_duration_seconds", "Histogram of sweep durations")
                .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )?;
        registry.register(Box::new(sweep_duration.clone()))?;

        Ok(Self {
            jewels_earned,
            jewels_redeemed,
            jewels_expired,
            redemptions,
            redemptions_rejected,
            lock_conflicts,
            append_duration,
            sweep_duration,
            registry,
        })
    }

    /// Record a credit
    pub fn record_earn(&self, jewels: i64) {
        self.jewels_earned.inc_by(jewels.max(0) as u64);
    }

    /// Record a successful redemption
    pub fn record_redemption(&self, jewels: i64) {
        self.redemptions.inc();
        self.jewels_redeemed.inc_by(jewels.max(0) as u64);
    }

    /// Record a rejected redemption
    pub fn record_redemption_rejected(&self) {
        self.redemptions_rejected.inc();
    }

    /// Record sweeper expirations
    pub fn record_expired(&self, jewels: i64) {
        self.jewels_expired.inc_by(jewels.max(0) as u64);
    }

    /// Record a lock timeout
    pub fn record_lock_conflict(&self) {
        self.lock_conflicts.inc();
    }

    /// Record append duration
    pub fn record_append_duration(&self, duration_seconds: f64) {
        self.append_duration.observe(duration_seconds);
    }

    /// Record sweep duration
    pub fn record_sweep_duration(&self, duration_seconds: f64) {
        self.sweep_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
