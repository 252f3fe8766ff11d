//! Instance lifecycle controller
//!
//! An [`Instance`] is one live deployment of the user's module on one
//! provider: it owns the provisioned resources, the invocation engine, the
//! queue reconciler, the log follower, the stats ticker, and the garbage
//! collection pass. Shutdown is ordered: stop accepting calls, reject
//! queued waiters, drain the reconciler behind a `stopqueue` sentinel, then
//! cancel whatever is still outstanding.

use crate::cache::PersistentCache;
use crate::config::{InstanceOptions, Mode};
use crate::driver::{ControlKind, CostEstimate, ProviderDriver, Resources};
use crate::engine::{InvocationEngine, PendingCalls};
use crate::error::Result;
use crate::gc::{GarbageCollector, GC_MIN_INTERVAL};
use crate::logs::{LogEvent, LogStitcher};
use crate::queue::{QueueReconciler, ReconcilerPhase, DEFAULT_MAX_POLLERS};
use crate::skew::ClockSkewEstimator;
use crate::stats::{CountersSnapshot, FunctionStatsSnapshot, MetricsRegistry};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interval of the stats ticker
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between log pages when the follower is idle
const LOG_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the stats and log broadcast channels
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Options for [`Instance::cleanup`]
#[derive(Debug, Clone, Copy)]
pub struct CleanupOptions {
    /// Tear down the instance's cloud resources. Pass `false` to keep them
    /// around for debugging; a later cleanup with `true` finishes the job.
    pub delete_resources: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            delete_resources: true,
        }
    }
}

/// Periodic per-function stats emission: counter deltas since the previous
/// tick alongside the cumulative latency series.
#[derive(Debug, Clone)]
pub struct FunctionStatsEvent {
    /// Function name
    pub function: String,
    /// Counter increments since the last tick
    pub counters: CountersSnapshot,
    /// Cumulative latency statistics
    pub stats: FunctionStatsSnapshot,
}

/// One live deployment of the user's module on one provider
pub struct Instance {
    driver: Arc<dyn ProviderDriver>,
    options: InstanceOptions,
    resources: Resources,
    mode: Mode,
    engine: Arc<InvocationEngine>,
    metrics: Arc<MetricsRegistry>,
    reconciler: Option<Arc<QueueReconciler>>,
    stop_tx: watch::Sender<bool>,
    stats_tx: broadcast::Sender<FunctionStatsEvent>,
    log_tx: broadcast::Sender<LogEvent>,
    reconciler_handle: Mutex<Option<JoinHandle<()>>>,
    stats_handle: Mutex<Option<JoinHandle<()>>>,
    log_handle: Mutex<Option<JoinHandle<()>>>,
    gc_handle: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    resources_deleted: AtomicBool,
}

impl Instance {
    /// Provision resources through the driver and bring the instance up
    pub async fn initialize<D: ProviderDriver>(driver: D, options: InstanceOptions) -> Result<Self> {
        Self::initialize_shared(Arc::new(driver), options).await
    }

    /// As [`initialize`](Self::initialize), for an already-shared driver
    pub async fn initialize_shared(
        driver: Arc<dyn ProviderDriver>,
        options: InstanceOptions,
    ) -> Result<Self> {
        options.validate()?;
        let resources = driver.provision(&options).await?;

        let mode = match options.mode {
            Mode::Auto => match driver.preferred_mode() {
                // A driver that itself defers picks the queue: every
                // provider supports it.
                Mode::Auto => Mode::Queue,
                resolved => resolved,
            },
            explicit => explicit,
        };
        info!(
            resources = %resources.name,
            %mode,
            provider = driver.provider_name(),
            "instance initialized"
        );

        let pending = Arc::new(PendingCalls::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let skew = Arc::new(ClockSkewEstimator::new());
        let engine = Arc::new(InvocationEngine::new(
            Arc::clone(&driver),
            options.clone(),
            mode,
            Arc::clone(&pending),
            Arc::clone(&metrics),
            Arc::clone(&skew),
        ));

        let (stop_tx, stop_rx) = watch::channel(false);
        let (stats_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (log_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let (reconciler, reconciler_handle) = if mode == Mode::Queue {
            let reconciler = QueueReconciler::new(
                Arc::clone(&driver),
                Arc::clone(&pending),
                Arc::clone(&metrics),
                Arc::clone(&skew),
                options.call_deadline(),
                DEFAULT_MAX_POLLERS,
                stop_rx.clone(),
            );
            let handle = tokio::spawn(Arc::clone(&reconciler).run());
            (Some(reconciler), Some(handle))
        } else {
            (None, None)
        };

        let stats_handle = Self::spawn_stats_ticker(
            Arc::clone(&metrics),
            stats_tx.clone(),
            stop_rx.clone(),
        );
        let log_handle =
            Self::spawn_log_follower(Arc::clone(&driver), log_tx.clone(), stop_rx.clone());

        let gc_handle = if options.gc {
            Some(Self::spawn_gc(Arc::clone(&driver), options.retention_in_days))
        } else {
            None
        };

        Ok(Self {
            driver,
            options,
            resources,
            mode,
            engine,
            metrics,
            reconciler,
            stop_tx,
            stats_tx,
            log_tx,
            reconciler_handle: Mutex::new(reconciler_handle),
            stats_handle: Mutex::new(Some(stats_handle)),
            log_handle: Mutex::new(Some(log_handle)),
            gc_handle: Mutex::new(gc_handle),
            stopped: AtomicBool::new(false),
            resources_deleted: AtomicBool::new(false),
        })
    }

    /// Invoke a remote function and wait for the terminal outcome
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value> {
        self.engine.invoke(name, args).await
    }

    /// The resolved transport mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The provisioned resource handle
    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Human-readable URL for this instance's remote logs
    pub fn log_url(&self) -> Option<String> {
        self.driver.log_url()
    }

    /// Outstanding attempts
    pub fn pending_count(&self) -> usize {
        self.engine.pending_count()
    }

    /// Aggregate counters across all functions
    pub fn counters(&self) -> CountersSnapshot {
        self.metrics.aggregate().counters.snapshot()
    }

    /// Counters for one function
    pub fn function_counters(&self, name: &str) -> CountersSnapshot {
        self.metrics.function(name).counters.snapshot()
    }

    /// Latency statistics for one function
    pub fn function_stats(&self, name: &str) -> FunctionStatsSnapshot {
        self.metrics.function(name).stats()
    }

    /// Subscribe to the periodic per-function stats emissions
    pub fn stats_events(&self) -> broadcast::Receiver<FunctionStatsEvent> {
        self.stats_tx.subscribe()
    }

    /// Subscribe to stitched remote log events
    pub fn log_events(&self) -> broadcast::Receiver<LogEvent> {
        self.log_tx.subscribe()
    }

    /// The reconciler's lifecycle phase (queue mode only)
    pub fn reconciler_phase(&self) -> Option<ReconcilerPhase> {
        self.reconciler.as_ref().map(|r| r.phase())
    }

    /// Estimated cost of this instance's usage so far
    pub fn cost_estimate(&self) -> CostEstimate {
        let counters = self.counters();
        let stats = self.metrics.aggregate().stats();
        self.driver
            .cost_estimate(&counters, &stats)
            .unwrap_or_else(|| {
                CostEstimate::from_metrics(&counters, &stats, self.options.memory_size_mb)
            })
    }

    /// Stop the instance: refuse new calls, reject queued waiters, drain
    /// the reconciler, then cancel everything still outstanding. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(pending = self.pending_count(), "stopping instance");

        self.engine.stop_accepting();

        if self.mode == Mode::Queue {
            if let Err(err) = self.driver.publish_control(ControlKind::StopQueue).await {
                warn!(error = %err, "failed to publish stop sentinel");
            }
        }
        let _ = self.stop_tx.send(true);

        let reconciler = self.reconciler_handle.lock().take();
        if let Some(handle) = reconciler {
            let _ = handle.await;
        }
        self.engine.cancel_pending();

        let stats = self.stats_handle.lock().take();
        if let Some(handle) = stats {
            let _ = handle.await;
        }
        let log = self.log_handle.lock().take();
        if let Some(handle) = log {
            let _ = handle.await;
        }
        debug!("instance stopped");
    }

    /// Stop and tear down. Safe to call twice (e.g. first without resource
    /// deletion to inspect remote state, then with it).
    pub async fn cleanup(&self, options: CleanupOptions) -> Result<()> {
        self.stop().await;

        if options.delete_resources && !self.resources_deleted.swap(true, Ordering::SeqCst) {
            self.driver.delete_resources(&self.resources).await?;
            info!(resources = %self.resources.name, "resources deleted");
        }

        let gc = self.gc_handle.lock().take();
        if let Some(handle) = gc {
            let _ = handle.await;
        }
        Ok(())
    }

    fn spawn_stats_ticker(
        metrics: Arc<MetricsRegistry>,
        stats_tx: broadcast::Sender<FunctionStatsEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut previous: HashMap<String, CountersSnapshot> = HashMap::new();
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for name in metrics.function_names() {
                            let function = metrics.function(&name);
                            let snapshot = function.counters.snapshot();
                            let delta = snapshot
                                .delta(previous.get(&name).unwrap_or(&CountersSnapshot::default()));
                            previous.insert(name.clone(), snapshot);
                            if delta.is_empty() {
                                continue;
                            }
                            let _ = stats_tx.send(FunctionStatsEvent {
                                function: name,
                                counters: delta,
                                stats: function.stats(),
                            });
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_log_follower(
        driver: Arc<dyn ProviderDriver>,
        log_tx: broadcast::Sender<LogEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stitcher = LogStitcher::new();
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                match driver.poll_logs(stitcher.start_time()).await {
                    Ok(page) if !page.is_empty() => {
                        for event in stitcher.filter_page(page) {
                            let _ = log_tx.send(event);
                        }
                        // More pages may be ready; fetch again immediately.
                        continue;
                    }
                    Ok(_) => {}
                    Err(err) => debug!(error = %err, "log poll failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(LOG_POLL_INTERVAL) => {}
                    _ = stop_rx.changed() => {}
                }
            }
        })
    }

    fn spawn_gc(driver: Arc<dyn ProviderDriver>, retention_in_days: f64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let cache = match PersistentCache::open_scoped(
                driver.provider_name(),
                "gc",
                GC_MIN_INTERVAL * 24,
            )
            .await
            {
                Ok(cache) => cache,
                Err(err) => {
                    warn!(error = %err, "garbage collection disabled: cache unavailable");
                    return;
                }
            };
            let collector = GarbageCollector::new(driver, cache, retention_in_days);
            if let Err(err) = collector.run().await {
                warn!(error = %err, "garbage collection pass failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ReturnPayload;
    use crate::testing::ScriptedDriver;
    use serde_json::json;

    fn options() -> InstanceOptions {
        InstanceOptions {
            gc: false,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_resolves_auto_mode() {
        let instance = Instance::initialize(ScriptedDriver::queue_mode(), options())
            .await
            .unwrap();
        assert_eq!(instance.mode(), Mode::Queue);
        assert!(instance.reconciler_phase().is_some());
        instance.cleanup(CleanupOptions::default()).await.unwrap();
        assert_eq!(instance.reconciler_phase(), Some(ReconcilerPhase::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_https_mode_has_no_reconciler() {
        let instance = Instance::initialize(ScriptedDriver::https_mode(), options())
            .await
            .unwrap();
        assert_eq!(instance.mode(), Mode::Https);
        assert!(instance.reconciler_phase().is_none());
        instance.cleanup(CleanupOptions::default()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_deletes_resources_once() {
        let driver = Arc::new(ScriptedDriver::queue_mode());
        let instance = Instance::initialize_shared(
            Arc::clone(&driver) as Arc<dyn ProviderDriver>,
            options(),
        )
        .await
        .unwrap();

        instance
            .cleanup(CleanupOptions {
                delete_resources: false,
            })
            .await
            .unwrap();
        assert!(driver.deleted_resource_names().is_empty());

        instance.cleanup(CleanupOptions::default()).await.unwrap();
        assert_eq!(driver.deleted_resource_names(), vec!["cumulus-test"]);

        // A third cleanup must not delete again.
        instance.cleanup(CleanupOptions::default()).await.unwrap();
        assert_eq!(driver.deleted_resource_names().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_after_stop_is_rejected() {
        let instance = Instance::initialize(ScriptedDriver::queue_mode(), options())
            .await
            .unwrap();
        instance.stop().await;
        let err = instance.invoke("f", json!([])).await.unwrap_err();
        assert!(matches!(err, crate::error::CumulusError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_invoke_through_instance() {
        let driver = ScriptedDriver::https_mode();
        driver.on_invoke_sync(|call| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Some(ReturnPayload::returned(call.call_id, json!(7))))
        });
        let instance = Instance::initialize(driver, options()).await.unwrap();

        let value = instance.invoke("seven", json!([])).await.unwrap();
        assert_eq!(value, json!(7));
        let counters = instance.function_counters("seven");
        assert_eq!(counters.invocations, 1);
        assert_eq!(counters.completed, 1);

        instance.cleanup(CleanupOptions::default()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_follower_broadcasts_stitched_events() {
        let driver = ScriptedDriver::queue_mode();
        driver.add_log_page(vec![
            LogEvent::new(1000, "e-1", "starting"),
            LogEvent::new(1010, "e-2", "working"),
        ]);
        // Overlapping second page.
        driver.add_log_page(vec![
            LogEvent::new(1010, "e-2", "working"),
            LogEvent::new(1020, "e-3", "done"),
        ]);

        let instance = Instance::initialize(driver, options()).await.unwrap();
        let mut events = instance.log_events();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(events.recv().await.unwrap().event_id);
        }
        assert_eq!(seen, vec!["e-1", "e-2", "e-3"]);

        instance.cleanup(CleanupOptions::default()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_ticker_emits_deltas() {
        let driver = ScriptedDriver::https_mode();
        driver.on_invoke_sync(|call| async move {
            Ok(Some(ReturnPayload::returned(call.call_id, json!(null))))
        });
        let instance = Instance::initialize(driver, options()).await.unwrap();
        let mut events = instance.stats_events();

        instance.invoke("tick", json!([])).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.function, "tick");
        assert_eq!(event.counters.invocations, 1);
        assert_eq!(event.counters.completed, 1);

        // Second invocation: the next emission carries only the delta.
        instance.invoke("tick", json!([])).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.counters.invocations, 1);

        instance.cleanup(CleanupOptions::default()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_estimate_reflects_usage() {
        let driver = ScriptedDriver::https_mode();
        driver.on_invoke_sync(|call| async move {
            let now = crate::stats::epoch_millis();
            Ok(Some(
                ReturnPayload::returned(call.call_id, json!(null))
                    .with_timings(now, now + 250.0),
            ))
        });
        let instance = Instance::initialize(driver, options()).await.unwrap();
        instance.invoke("bill", json!([])).await.unwrap();

        let estimate = instance.cost_estimate();
        assert_eq!(estimate.invocations, 1);
        assert!(estimate.billed_time_secs > 0.0);
        assert!(estimate.total() > 0.0);

        instance.cleanup(CleanupOptions::default()).await.unwrap();
    }
}
