//! Provider driver contract
//!
//! The invocation engine is provider-agnostic; everything cloud-specific
//! lives behind [`ProviderDriver`]. A driver owns the SDK clients and the
//! provisioned resource handles for one instance, and exposes the small set
//! of operations the engine, reconciler, log follower, and garbage
//! collector consume.

use crate::config::{InstanceOptions, Mode};
use crate::error::Result;
use crate::logs::LogEvent;
use crate::message::{Call, PollResult, ReturnPayload};
use crate::stats::{CountersSnapshot, FunctionStatsSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name prefix stamped on every cloud resource the framework creates, so
/// the garbage collector can recognize residual resources by scanning a
/// provider namespace.
pub const RESOURCE_NAME_PREFIX: &str = "cumulus-";

/// Default compute price per GB-second, used when the driver does not
/// supply its own cost model
pub const DEFAULT_PRICE_PER_GB_SECOND: f64 = 0.000_016_666_7;

/// Default price per request
pub const DEFAULT_PRICE_PER_REQUEST: f64 = 0.000_000_2;

/// Handle to one instance's provisioned cloud resources.
///
/// Reconstructable deterministically from `name` alone, which is what the
/// garbage collector relies on when it finds a residual resource it did not
/// create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// Framework-prefixed deterministic resource name
    pub name: String,
    /// Deployed function identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    /// Request queue / topic identifier (queued mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_queue_id: Option<String>,
    /// Response queue identifier (queued mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_queue_id: Option<String>,
    /// Log group or stream identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_group: Option<String>,
}

impl Resources {
    /// A bare handle carrying only the deterministic name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function_id: None,
            request_queue_id: None,
            response_queue_id: None,
            log_group: None,
        }
    }
}

/// A residual resource discovered while scanning the provider namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceCandidate {
    /// Resource name, carrying the framework prefix
    pub name: String,
    /// When the resource was created
    pub created_at: DateTime<Utc>,
}

/// Control messages the client publishes to its own response queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Sentinel that unblocks queue pollers during shutdown
    StopQueue,
}

/// Cost estimate for an instance's usage so far
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    /// Total billed compute time, seconds
    pub billed_time_secs: f64,
    /// Function memory size, GB
    pub memory_gb: f64,
    /// Attempts issued
    pub invocations: u64,
    /// Compute share of the cost
    pub compute_cost: f64,
    /// Per-request share of the cost
    pub request_cost: f64,
}

impl CostEstimate {
    /// Estimate from the aggregate counters and stats using the default
    /// price model.
    pub fn from_metrics(
        counters: &CountersSnapshot,
        stats: &FunctionStatsSnapshot,
        memory_size_mb: u64,
    ) -> Self {
        let billed_time_secs = stats.estimated_billed_time.total() / 1000.0;
        let memory_gb = memory_size_mb as f64 / 1024.0;
        Self {
            billed_time_secs,
            memory_gb,
            invocations: counters.invocations,
            compute_cost: billed_time_secs * memory_gb * DEFAULT_PRICE_PER_GB_SECOND,
            request_cost: counters.invocations as f64 * DEFAULT_PRICE_PER_REQUEST,
        }
    }

    /// Total estimated cost
    pub fn total(&self) -> f64 {
        self.compute_cost + self.request_cost
    }
}

impl fmt::Display for CostEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "${:.8} ({:.1}s billed at {:.2}GB over {} invocations)",
            self.total(),
            self.billed_time_secs,
            self.memory_gb,
            self.invocations
        )
    }
}

/// The boundary between the provider-agnostic core and per-cloud glue.
///
/// Implementations wrap one provider SDK (or the local child-process
/// runner). All methods take `&self`; drivers are shared as
/// `Arc<dyn ProviderDriver>` and treated as thread-safe singletons.
#[async_trait]
pub trait ProviderDriver: Send + Sync + 'static {
    /// Short provider name (`aws`, `google`, `local`), used to scope the
    /// persistent cache
    fn provider_name(&self) -> &'static str;

    /// Provision all resources for this instance and return the handle
    async fn provision(&self, options: &InstanceOptions) -> Result<Resources>;

    /// The transport this provider prefers when the caller picked
    /// [`Mode::Auto`]
    fn preferred_mode(&self) -> Mode;

    /// Synchronous invocation path. Returns `None` when the driver runs in
    /// pure queue mode and the response will arrive on the queue instead.
    async fn invoke_sync(&self, call: &Call) -> Result<Option<ReturnPayload>>;

    /// Enqueue a call for queued-mode execution
    async fn publish_request(&self, call: &Call) -> Result<()>;

    /// One long-poll batch from the response queue. May legitimately return
    /// an empty batch; the reconciler polls again.
    async fn poll_response_queue(&self) -> Result<PollResult>;

    /// Publish a control message to the instance's own response queue
    async fn publish_control(&self, kind: ControlKind) -> Result<()>;

    /// The response queue id to stamp on outgoing calls, if provisioned
    fn response_queue_id(&self) -> Option<String>;

    /// Human-readable URL for this instance's remote logs
    fn log_url(&self) -> Option<String>;

    /// Fetch one page of log events at or after `start_time` (epoch ms)
    async fn poll_logs(&self, start_time: i64) -> Result<Vec<LogEvent>>;

    /// Scan the provider namespace for residual framework resources
    async fn list_residual_resources(&self) -> Result<Vec<ResourceCandidate>>;

    /// Rebuild a full resource handle from a residual resource's name.
    /// Returns `None` when the name does not parse as one of ours.
    fn resources_from_name(&self, name: &str) -> Option<Resources>;

    /// Tear down a set of resources. Must be idempotent.
    async fn delete_resources(&self, resources: &Resources) -> Result<()>;

    /// Provider-specific cost model override. The default defers to the
    /// built-in price model.
    fn cost_estimate(
        &self,
        _counters: &CountersSnapshot,
        _stats: &FunctionStatsSnapshot,
    ) -> Option<CostEstimate> {
        None
    }
}
