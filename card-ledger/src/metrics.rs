//! Metrics collection for observability
//!
//! Prometheus metrics for the integrity engine. Each [`Metrics`] owns its
//! registry, so several ledgers (and tests) can live in one process.
//!
//! # Metrics
//!
//! - `ledger_validations_total` - Completed validation passes
//! - `ledger_issues_total{kind}` - Issues found, by kind
//! - `ledger_validate_duration_seconds` - Histogram of validation latencies
//! - `ledger_repairs_total` - Card repairs that rewrote at least one event
//! - `ledger_events_rewritten_total` - Events persisted by repairs
//! - `ledger_tampers_total` - Simulated tampers applied

use crate::audit::Issue;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Validation passes completed
    pub validations_total: IntCounter,

    /// Issues found, labelled by kind
    pub issues_total: IntCounterVec,

    /// Validation duration histogram
    pub validate_duration: Histogram,

    /// Card repairs that changed something
    pub repairs_total: IntCounter,

    /// Events rewritten by repairs
    pub events_rewritten: IntCounter,

    /// Simulated tampers
    pub tampers_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("validations_total", &self.validations_total.get())
            .field("repairs_total", &self.repairs_total.get())
            .field("tampers_total", &self.tampers_total.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let validations_total = IntCounter::new(
            "ledger_validations_total",
            "Total number of validation passes",
        )?;
        registry.register(Box::new(validations_total.clone()))?;

        let issues_total = IntCounterVec::new(
            Opts::new("ledger_issues_total", "Integrity issues found, by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(issues_total.clone()))?;

        let validate_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_validate_duration_seconds",
                "Histogram of validation latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(validate_duration.clone()))?;

        let repairs_total =
            IntCounter::new("ledger_repairs_total", "Card repairs that rewrote events")?;
        registry.register(Box::new(repairs_total.clone()))?;

        let events_rewritten = IntCounter::new(
            "ledger_events_rewritten_total",
            "Events persisted by repairs",
        )?;
        registry.register(Box::new(events_rewritten.clone()))?;

        let tampers_total = IntCounter::new("ledger_tampers_total", "Simulated tampers applied")?;
        registry.register(Box::new(tampers_total.clone()))?;

        Ok(Self {
            validations_total,
            issues_total,
            validate_duration,
            repairs_total,
            events_rewritten,
            tampers_total,
            registry,
        })
    }

    /// Record a finished validation pass
    pub fn record_validation(&self, issues: &[Issue], duration_seconds: f64) {
        self.validations_total.inc();
        self.validate_duration.observe(duration_seconds);
        for issue in issues {
            self.issues_total
                .with_label_values(&[issue.kind.name()])
                .inc();
        }
    }

    /// Record a card repair that rewrote `events` events
    pub fn record_repair(&self, events: usize) {
        self.repairs_total.inc();
        self.events_rewritten.inc_by(events as u64);
    }

    /// Record a simulated tamper
    pub fn record_tamper(&self) {
        self.tampers_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
