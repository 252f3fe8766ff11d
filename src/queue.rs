//! Queue reconciler
//!
//! One reconciler per queue-mode instance multiplexes a single response
//! queue across every outstanding call. A small pool of pollers long-polls
//! the driver, decodes each message, and routes it to the pending entry it
//! correlates with; the pool grows with the number of outstanding calls and
//! shrinks again when load drops. Shutdown is coordinated by a `stopqueue`
//! sentinel the client publishes to its own queue.

use crate::driver::ProviderDriver;
use crate::engine::{PendingCalls, SlotOutcome};
use crate::funnel::retry_backoff;
use crate::message::{QueueMessage, RawQueueMessage, ReturnPayload};
use crate::skew::ClockSkewEstimator;
use crate::stats::{epoch_millis, MetricsRegistry};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outstanding calls served per poller
const CALLS_PER_POLLER: usize = 20;

/// Pollers kept alive regardless of load
const MIN_POLLERS: usize = 2;

/// Default ceiling on the poller pool
pub const DEFAULT_MAX_POLLERS: usize = 32;

/// How often the supervisor reconsiders the poller pool size
const RESIZE_INTERVAL: Duration = Duration::from_millis(250);

/// Reconciler lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerPhase {
    /// Created, pollers not yet running
    Idle,
    /// Pollers running
    Polling,
    /// Stop observed, waiting for pollers to exit
    Draining,
    /// All pollers exited
    Stopped,
}

impl fmt::Display for ReconcilerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcilerPhase::Idle => write!(f, "idle"),
            ReconcilerPhase::Polling => write!(f, "polling"),
            ReconcilerPhase::Draining => write!(f, "draining"),
            ReconcilerPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Multiplexes the response queue back onto pending calls
pub struct QueueReconciler {
    driver: Arc<dyn ProviderDriver>,
    pending: Arc<PendingCalls>,
    metrics: Arc<MetricsRegistry>,
    skew: Arc<ClockSkewEstimator>,
    deadline_window: Duration,
    max_pollers: usize,
    stop_rx: watch::Receiver<bool>,
    active_pollers: AtomicUsize,
    phase_tx: watch::Sender<ReconcilerPhase>,
    phase_rx: watch::Receiver<ReconcilerPhase>,
}

impl QueueReconciler {
    pub(crate) fn new(
        driver: Arc<dyn ProviderDriver>,
        pending: Arc<PendingCalls>,
        metrics: Arc<MetricsRegistry>,
        skew: Arc<ClockSkewEstimator>,
        deadline_window: Duration,
        max_pollers: usize,
        stop_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (phase_tx, phase_rx) = watch::channel(ReconcilerPhase::Idle);
        Arc::new(Self {
            driver,
            pending,
            metrics,
            skew,
            deadline_window,
            max_pollers: max_pollers.max(MIN_POLLERS),
            stop_rx,
            active_pollers: AtomicUsize::new(0),
            phase_tx,
            phase_rx,
        })
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ReconcilerPhase {
        *self.phase_rx.borrow()
    }

    /// Pollers currently alive
    pub fn active_pollers(&self) -> usize {
        self.active_pollers.load(Ordering::SeqCst)
    }

    /// One poller per [`CALLS_PER_POLLER`] outstanding calls, clamped
    fn target_pollers(&self) -> usize {
        self.pending
            .len()
            .div_ceil(CALLS_PER_POLLER)
            .clamp(MIN_POLLERS, self.max_pollers)
    }

    /// Run the supervisor until stop: keeps the poller pool at its target
    /// size, then drains every poller and transitions to `Stopped`.
    pub(crate) async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_rx.clone();
        let mut pollers = JoinSet::new();
        let _ = self.phase_tx.send(ReconcilerPhase::Polling);

        loop {
            if *stop_rx.borrow() {
                break;
            }
            let target = self.target_pollers();
            while self.active_pollers.load(Ordering::SeqCst) < target {
                self.active_pollers.fetch_add(1, Ordering::SeqCst);
                let reconciler = Arc::clone(&self);
                pollers.spawn(async move { reconciler.poll_loop().await });
            }
            tokio::select! {
                _ = tokio::time::sleep(RESIZE_INTERVAL) => {}
                _ = stop_rx.changed() => {}
            }
        }

        let _ = self.phase_tx.send(ReconcilerPhase::Draining);
        debug!(pollers = self.active_pollers(), "draining queue pollers");
        while pollers.join_next().await.is_some() {}
        let _ = self.phase_tx.send(ReconcilerPhase::Stopped);
        info!("queue reconciler stopped");
    }

    /// One poller: long-poll, dispatch, adapt, repeat.
    async fn poll_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_rx.clone();
        let mut failures: u32 = 0;

        loop {
            if *stop_rx.borrow() {
                break;
            }
            let batch = tokio::select! {
                batch = self.driver.poll_response_queue() => batch,
                _ = stop_rx.changed() => break,
            };
            match batch {
                Ok(poll) => {
                    failures = 0;
                    let mut saw_stop = false;
                    for message in poll.messages {
                        saw_stop |= self.dispatch(message);
                    }
                    if saw_stop {
                        break;
                    }
                    // A truncated batch means more messages are ready; skip
                    // the downscale check and poll again immediately.
                    if poll.is_full {
                        continue;
                    }
                }
                Err(err) => {
                    // Transient poll failures back off and retry forever.
                    failures = failures.saturating_add(1);
                    warn!(error = %err, failures, "response queue poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(retry_backoff(failures)) => {}
                        _ = stop_rx.changed() => break,
                    }
                }
            }

            // Excess pollers exit once the outstanding count drops.
            if self.active_pollers.load(Ordering::SeqCst) > self.target_pollers() {
                break;
            }
        }
        self.active_pollers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Route one raw message. Returns true for the stop sentinel.
    pub(crate) fn dispatch(&self, raw: RawQueueMessage) -> bool {
        let message = match raw.decode() {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping undecodable response message");
                return false;
            }
        };
        match message {
            QueueMessage::Response { call_id, body } => {
                match serde_json::from_str::<ReturnPayload>(&body) {
                    Ok(payload) => self.complete(&call_id, payload),
                    Err(err) => {
                        warn!(call_id, error = %err, "dropping undecodable return payload");
                    }
                }
                false
            }
            QueueMessage::DeadLetter { call_id, message } => {
                if let Some(entry) = self.pending.remove(&call_id) {
                    entry.slot.complete(SlotOutcome::DeadLetter {
                        message: message
                            .unwrap_or_else(|| "request could not be delivered".to_string()),
                    });
                } else {
                    debug!(call_id, "dead letter for unknown call");
                }
                false
            }
            QueueMessage::FunctionStarted { call_id, timestamp } => {
                if let Some(entry) = self.pending.get(&call_id) {
                    entry.extend_deadline(self.deadline_window);
                    if let Some(remote_start) = timestamp {
                        if entry.slot.mark_started() {
                            let latency =
                                self.skew.remote_start_latency(remote_start, entry.call.start);
                            let fn_metrics = self.metrics.function(&entry.call.name);
                            let aggregate = self.metrics.aggregate();
                            for metrics in [&fn_metrics, &aggregate] {
                                metrics
                                    .update_stats(|s| s.remote_start_latency.update(latency));
                            }
                        }
                    }
                }
                false
            }
            QueueMessage::CpuMetrics { call_id, metrics } => {
                if let Some(entry) = self.pending.get(&call_id) {
                    entry.slot.push_metrics(metrics);
                }
                false
            }
            QueueMessage::StopQueue => true,
        }
    }

    fn complete(&self, call_id: &str, payload: ReturnPayload) {
        match self.pending.remove(call_id) {
            Some(entry) => {
                entry.slot.complete(SlotOutcome::Payload {
                    payload,
                    local_end: epoch_millis(),
                });
            }
            None => {
                // Either a speculative sibling already won, or the caller
                // timed out and unregistered. Dropped either way.
                debug!(call_id, "response for unknown call");
            }
        }
    }
}
