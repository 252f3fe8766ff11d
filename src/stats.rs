//! Latency statistics and invocation counters
//!
//! Online statistics (Welford's algorithm) for the per-function latency
//! series, an exponentially decaying average used by the clock-skew
//! estimator, and the monotonic invocation counters surfaced through the
//! stats ticker.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default weight for [`DecayingAverage`]
pub const DEFAULT_DECAY_WEIGHT: f64 = 0.3;

/// Current wall-clock time as fractional epoch milliseconds
pub(crate) fn epoch_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Online mean/variance over a stream of samples.
///
/// Uses Welford's algorithm so variance stays numerically stable without
/// retaining the samples themselves.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Statistics {
    samples: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Statistics {
    /// Create an empty series
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample into the series
    pub fn update(&mut self, value: f64) {
        self.samples += 1;
        if self.samples == 1 {
            self.mean = value;
            self.m2 = 0.0;
            self.min = value;
            self.max = value;
            return;
        }
        let delta = value - self.mean;
        self.mean += delta / self.samples as f64;
        self.m2 += delta * (value - self.mean);
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    /// Number of samples observed
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Mean of the observed samples (0 when empty)
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation (0 when fewer than two samples)
    pub fn stddev(&self) -> f64 {
        if self.samples < 2 {
            0.0
        } else {
            (self.m2 / self.samples as f64).sqrt()
        }
    }

    /// Smallest observed sample
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest observed sample
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Sum of all observed samples
    pub fn total(&self) -> f64 {
        self.mean * self.samples as f64
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}ms ±{:.1} (n={})",
            self.mean,
            self.stddev(),
            self.samples
        )
    }
}

/// Exponentially decaying average.
///
/// Starts empty; the first sample becomes the value directly, later samples
/// fold in with the configured weight.
#[derive(Debug, Clone, Copy)]
pub struct DecayingAverage {
    value: Option<f64>,
    weight: f64,
}

impl DecayingAverage {
    /// Create an empty average with the default weight
    pub fn new() -> Self {
        Self::with_weight(DEFAULT_DECAY_WEIGHT)
    }

    /// Create an empty average with a custom weight in `(0, 1]`
    pub fn with_weight(weight: f64) -> Self {
        Self {
            value: None,
            weight,
        }
    }

    /// Fold one sample in
    pub fn update(&mut self, sample: f64) {
        self.value = Some(match self.value {
            None => sample,
            Some(current) => current * (1.0 - self.weight) + sample * self.weight,
        });
    }

    /// The current average, if any sample has been observed
    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

impl Default for DecayingAverage {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic invocation counters for one function (or the aggregate)
#[derive(Debug, Default)]
pub struct FunctionCounters {
    invocations: AtomicU64,
    completed: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
}

impl FunctionCounters {
    /// Record one issued attempt
    pub fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one successful completion
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one retried attempt
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one terminal failure
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent point-in-time copy of the counters
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FunctionCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    /// Attempts issued (each retry and speculative attempt counts)
    pub invocations: u64,
    /// Successful completions
    pub completed: u64,
    /// Reissued attempts
    pub retries: u64,
    /// Terminal failures
    pub errors: u64,
}

impl CountersSnapshot {
    /// Counter increments since `earlier`
    pub fn delta(&self, earlier: &CountersSnapshot) -> CountersSnapshot {
        CountersSnapshot {
            invocations: self.invocations.saturating_sub(earlier.invocations),
            completed: self.completed.saturating_sub(earlier.completed),
            retries: self.retries.saturating_sub(earlier.retries),
            errors: self.errors.saturating_sub(earlier.errors),
        }
    }

    /// True if no counter moved
    pub fn is_empty(&self) -> bool {
        *self == CountersSnapshot::default()
    }
}

/// Latency series tracked per function
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FunctionStatsSnapshot {
    /// Time from invoke to the request leaving the client
    pub local_start_latency: Statistics,
    /// Time from invoke to the function starting remotely (skew-corrected)
    pub remote_start_latency: Statistics,
    /// Remote execution time
    pub execution_time: Statistics,
    /// Time the remote side spent publishing its response
    pub send_response_latency: Statistics,
    /// Time from remote completion to local receipt (skew-corrected)
    pub return_latency: Statistics,
    /// Billed execution time estimate
    pub estimated_billed_time: Statistics,
}

/// Counters plus latency series for one function name
#[derive(Debug, Default)]
pub struct FunctionMetrics {
    /// Monotonic counters
    pub counters: FunctionCounters,
    stats: Mutex<FunctionStatsSnapshot>,
}

impl FunctionMetrics {
    /// Mutate the latency series under the metrics lock
    pub fn update_stats(&self, f: impl FnOnce(&mut FunctionStatsSnapshot)) {
        let mut stats = self.stats.lock();
        f(&mut stats);
    }

    /// Copy of the latency series
    pub fn stats(&self) -> FunctionStatsSnapshot {
        *self.stats.lock()
    }
}

/// Per-function metrics plus the aggregate, shared across the engine and
/// the reconciler.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    functions: RwLock<HashMap<String, Arc<FunctionMetrics>>>,
    aggregate: Arc<FunctionMetrics>,
}

impl MetricsRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the metrics entry for `name`
    pub fn function(&self, name: &str) -> Arc<FunctionMetrics> {
        if let Some(metrics) = self.functions.read().get(name) {
            return Arc::clone(metrics);
        }
        let mut functions = self.functions.write();
        Arc::clone(
            functions
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(FunctionMetrics::default())),
        )
    }

    /// The aggregate metrics across all functions
    pub fn aggregate(&self) -> Arc<FunctionMetrics> {
        Arc::clone(&self.aggregate)
    }

    /// Names of all functions seen so far
    pub fn function_names(&self) -> Vec<String> {
        self.functions.read().keys().cloned().collect()
    }
}
