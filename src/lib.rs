#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Cumulus
//!
//! Cumulus turns a module of pure-compute functions into a fleet of
//! ephemeral, auto-scaled serverless invocations and presents them back as
//! ordinary async function calls. The user writes functions; Cumulus
//! dispatches them across a cloud provider, throttles and retries them,
//! reconciles the responses, tears the cloud resources down, and estimates
//! what the whole thing cost.
//!
//! ## Features
//!
//! - **Provider-agnostic engine**: one [`ProviderDriver`] trait hides AWS
//!   Lambda, Google Cloud Functions, and the local child-process runner
//! - **Two transports**: a synchronous HTTP-like path and a request/response
//!   queue pair, selected per provider or forced via [`config::Mode`]
//! - **Throttling and retry**: FIFO concurrency gate, token-bucket rate
//!   limiting, exponential-backoff retry, and speculative tail-latency
//!   retries driven by per-function latency statistics
//! - **Clock-skew-corrected metrics**: remote timestamps aligned to the
//!   local clock so latency breakdowns stay meaningful
//! - **Orderly teardown**: pending calls cancelled, queue pollers drained
//!   behind a sentinel, residual cloud resources garbage collected
//!
//! ## Library Usage
//!
//! ```no_run
//! use cumulus::{CleanupOptions, Instance, InstanceOptions};
//! use cumulus::testing::ScriptedDriver;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> cumulus::Result<()> {
//!     // Any ProviderDriver works here; the scripted driver runs in-process.
//!     let driver = ScriptedDriver::https_mode();
//!
//!     let instance = Instance::initialize(driver, InstanceOptions::default()).await?;
//!     let greeting = instance.invoke("hello", json!(["world"])).await?;
//!     println!("remote said: {}", greeting);
//!
//!     println!("estimated cost: {}", instance.cost_estimate());
//!     instance.cleanup(CleanupOptions::default()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`instance`]: lifecycle controller owning every sub-component
//! - [`engine`]: the invocation state machine (routing, retry, speculation)
//! - [`queue`]: response-queue reconciler with an adaptive poller pool
//! - [`funnel`]: concurrency / rate / retry / memoization admission primitive
//! - [`driver`]: the provider boundary
//! - [`skew`]: remote-vs-local clock alignment
//! - [`logs`]: deduplicating log stitcher
//! - [`cache`]: persistent on-disk cache (GC gate, dependency archives)
//! - [`gc`]: residual cloud-resource collection
//! - [`stats`]: Welford statistics, counters, per-function metrics
//! - [`config`]: instance options
//! - [`error`]: error taxonomy and transient/fatal classification
//! - [`testing`]: in-process scriptable driver for tests

pub mod cache;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod funnel;
pub mod gc;
pub mod instance;
pub mod logs;
pub mod message;
pub mod queue;
pub mod skew;
pub mod stats;
pub mod testing;

pub use cache::PersistentCache;
pub use config::{InstanceOptions, Mode, RateLimit};
pub use driver::{CostEstimate, ProviderDriver, ResourceCandidate, Resources};
pub use error::{CumulusError, Result, TransportKind, UserError};
pub use funnel::{Funnel, MemoFunnel};
pub use instance::{CleanupOptions, FunctionStatsEvent, Instance};
pub use logs::{LogEvent, LogStitcher};
pub use message::{Call, QueueMessage, ReturnPayload};
pub use stats::{CountersSnapshot, FunctionStatsSnapshot, Statistics};
