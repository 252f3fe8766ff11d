//! Instance configuration for Cumulus
//!
//! Options recognized by the invocation engine and lifecycle controller.
//! Packaging-time options (bundling, dependency layers, archive contents)
//! belong to the packager and are not represented here.

use crate::error::{CumulusError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default maximum number of in-flight calls per instance
pub const DEFAULT_CONCURRENCY: usize = 100;

/// Default per-invocation remote time limit in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default function memory size in MB, used for billed-time estimation
pub const DEFAULT_MEMORY_SIZE_MB: u64 = 1728;

/// Default retry budget for transient failures
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default sigma multiplier for the speculative tail-latency retry trigger
pub const DEFAULT_SPECULATIVE_THRESHOLD: f64 = 3.0;

/// Minimum completed samples before the speculative trigger may fire
pub const DEFAULT_SPECULATIVE_MIN_SAMPLES: u64 = 3;

/// Default residual-resource retention in days
pub const DEFAULT_RETENTION_DAYS: f64 = 1.0;

/// Grace period added on top of the function timeout before a queued call
/// is considered lost
pub const TIMEOUT_GRACE: Duration = Duration::from_millis(200);

/// Invocation transport mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Let the provider driver pick its preferred transport
    #[default]
    Auto,
    /// Synchronous HTTP-like invocation path
    Https,
    /// Request/response queue pair
    Queue,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Auto => write!(f, "auto"),
            Mode::Https => write!(f, "https"),
            Mode::Queue => write!(f, "queue"),
        }
    }
}

impl FromStr for Mode {
    type Err = CumulusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Mode::Auto),
            "https" => Ok(Mode::Https),
            "queue" => Ok(Mode::Queue),
            other => Err(CumulusError::config(
                "mode",
                format!("expected auto|https|queue, got '{}'", other),
            )),
        }
    }
}

/// Rate limit applied to outbound invocations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Target sustained requests per second
    pub target_rps: f64,
    /// Token bucket capacity
    pub burst: u32,
}

/// Options for one live instance.
///
/// # Example
///
/// ```ignore
/// use cumulus::config::{InstanceOptions, Mode};
///
/// let options = InstanceOptions {
///     mode: Mode::Queue,
///     timeout_secs: 30,
///     ..Default::default()
/// };
/// options.validate()?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceOptions {
    /// Maximum in-flight calls (0 = unlimited)
    pub concurrency: usize,
    /// Transport mode
    pub mode: Mode,
    /// Per-invocation remote time limit in seconds
    pub timeout_secs: u64,
    /// Function memory size in MB (billed-time and cost estimation)
    pub memory_size_mb: u64,
    /// Whether to run the residual-resource garbage collector
    pub gc: bool,
    /// Age in days before a residual resource becomes collectable.
    /// `0.0` also collects resources owned by other live processes, which
    /// is dangerous and requires explicit opt-in.
    pub retention_in_days: f64,
    /// Retry budget for transient failures
    pub max_retries: u32,
    /// Sigma multiplier for the speculative tail-latency retry trigger
    pub speculative_retry_threshold: f64,
    /// Completed samples required before speculative retry may fire
    pub speculative_min_samples: u64,
    /// Optional outbound rate limit
    pub rate_limit: Option<RateLimit>,
    /// Run the serialization round-trip validator on every invoke
    pub validate_serialization: bool,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            mode: Mode::Auto,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            memory_size_mb: DEFAULT_MEMORY_SIZE_MB,
            gc: true,
            retention_in_days: DEFAULT_RETENTION_DAYS,
            max_retries: DEFAULT_MAX_RETRIES,
            speculative_retry_threshold: DEFAULT_SPECULATIVE_THRESHOLD,
            speculative_min_samples: DEFAULT_SPECULATIVE_MIN_SAMPLES,
            rate_limit: None,
            validate_serialization: true,
        }
    }
}

impl InstanceOptions {
    /// Check option values for consistency
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(CumulusError::config("timeout_secs", "must be positive"));
        }
        if self.memory_size_mb == 0 {
            return Err(CumulusError::config("memory_size_mb", "must be positive"));
        }
        if self.retention_in_days < 0.0 {
            return Err(CumulusError::config(
                "retention_in_days",
                "must be non-negative",
            ));
        }
        if self.speculative_retry_threshold <= 0.0 {
            return Err(CumulusError::config(
                "speculative_retry_threshold",
                "must be positive",
            ));
        }
        if let Some(rate) = &self.rate_limit {
            if rate.target_rps <= 0.0 {
                return Err(CumulusError::config(
                    "rate_limit.target_rps",
                    "must be positive",
                ));
            }
            if rate.burst == 0 {
                return Err(CumulusError::config("rate_limit.burst", "must be positive"));
            }
        }
        Ok(())
    }

    /// The remote time limit as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Full deadline for a queued call: timeout plus the delivery grace
    pub fn call_deadline(&self) -> Duration {
        self.timeout() + TIMEOUT_GRACE
    }
}
