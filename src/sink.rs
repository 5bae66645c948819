use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use prometheus::{Gauge, IntCounter, Opts, Registry};

pub const PROOF_RATE_METRIC: &str = "proof_rate";
pub const LOG_ERRORS_METRIC: &str = "log_errors_total";

/// Destination for values extracted from the log.
///
/// Sinks are shared between the tailing worker and whatever reads the values back (an exporter, a test),
/// so implementations handle their own synchronization.
pub trait MetricSink: Send + Sync {
    /// Replace current proof rate. Last write wins.
    fn set_rate(&self, value: u64);

    /// Record one more error encountered while tailing.
    fn increment_error_count(&self);
}

/// Sink backed by a gauge and a counter registered in a prometheus `Registry`.
///
/// ```rust
/// # use prooftail::{MetricSink, PrometheusSink};
/// let registry = prometheus::Registry::new();
/// let sink = PrometheusSink::register(&registry)?;
/// sink.set_rate(935755);
/// assert_eq!(registry.gather().len(), 2);
/// # Ok::<(), prometheus::Error>(())
/// ```
#[derive(Clone)]
pub struct PrometheusSink {
    rate: Gauge,
    errors: IntCounter,
}

impl PrometheusSink {
    /// Create metrics and register them in `registry`. Fails if metrics with the same names are already registered.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let rate = Gauge::with_opts(Opts::new(
            PROOF_RATE_METRIC,
            "Current proof rate reported by the miner log",
        ))?;
        let errors = IntCounter::with_opts(Opts::new(
            LOG_ERRORS_METRIC,
            "Errors encountered while tailing the miner log",
        ))?;
        registry.register(Box::new(rate.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        Ok(Self { rate, errors })
    }

    pub fn rate(&self) -> f64 {
        self.rate.get()
    }

    pub fn error_count(&self) -> u64 {
        self.errors.get()
    }
}

impl MetricSink for PrometheusSink {
    fn set_rate(&self, value: u64) {
        self.rate.set(value as f64);
    }

    fn increment_error_count(&self) {
        self.errors.inc();
    }
}

/// Sink that keeps every reported rate in memory. Useful for embedding and tests.
#[derive(Default)]
pub struct MemorySink {
    rates: Mutex<Vec<u64>>,
    errors: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rates reported so far, oldest first
    pub fn rates(&self) -> Vec<u64> {
        self.rates
            .lock()
            .map(|rates| rates.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn last_rate(&self) -> Option<u64> {
        self.rates().last().copied()
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }
}

impl MetricSink for MemorySink {
    fn set_rate(&self, value: u64) {
        let mut rates = self
            .rates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rates.push(value);
    }

    fn increment_error_count(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}
