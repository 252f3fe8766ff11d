//! Invocation engine
//!
//! The client-side state machine behind `invoke`: serializes arguments,
//! registers the pending call, routes between the synchronous and queued
//! transports, applies the retry and speculative tail-latency retry
//! policies, and reconciles the terminal response into counters, latency
//! statistics, and the caller's result.

use crate::config::{InstanceOptions, Mode};
use crate::error::{CumulusError, Result, UserError, LOG_URL_PROPERTY};
use crate::funnel::{retry_backoff, Funnel};
use crate::message::{round_trip_warnings, Call, CpuMetricsSample, ReturnKind, ReturnPayload};
use crate::skew::{ClockSkewEstimator, ResponseTimings};
use crate::stats::{epoch_millis, FunctionMetrics, MetricsRegistry};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Terminal outcome delivered to the task awaiting a completion slot
#[derive(Debug)]
pub(crate) enum SlotOutcome {
    /// A terminal response arrived on the queue (or sync path)
    Payload {
        /// The decoded return
        payload: ReturnPayload,
        /// Local receipt time, epoch milliseconds
        local_end: f64,
    },
    /// The provider reported delivery failure after its own retries
    DeadLetter {
        /// Provider-supplied detail
        message: String,
    },
    /// The instance is stopping
    Cancelled,
}

/// Shared completion state for one logical call.
///
/// Speculative attempts register separate pending entries under distinct
/// call ids, all pointing at one slot; the first terminal outcome wins.
pub(crate) struct CompletionSlot {
    tx: Mutex<Option<oneshot::Sender<SlotOutcome>>>,
    started_recorded: AtomicBool,
    metrics_series: Mutex<Vec<CpuMetricsSample>>,
}

impl CompletionSlot {
    pub(crate) fn channel() -> (Arc<Self>, oneshot::Receiver<SlotOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
                started_recorded: AtomicBool::new(false),
                metrics_series: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    /// Deliver the terminal outcome. Returns false if the slot already
    /// completed (a later response for the same logical call is dropped).
    pub(crate) fn complete(&self, outcome: SlotOutcome) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Mark that a remote-start latency sample has been recorded for this
    /// logical call. Returns true on the first marking only.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started_recorded.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn started_recorded(&self) -> bool {
        self.started_recorded.load(Ordering::SeqCst)
    }

    pub(crate) fn push_metrics(&self, sample: CpuMetricsSample) {
        self.metrics_series.lock().push(sample);
    }

    pub(crate) fn metrics(&self) -> Vec<CpuMetricsSample> {
        self.metrics_series.lock().clone()
    }
}

/// One registered attempt awaiting a terminal outcome
pub(crate) struct PendingEntry {
    /// The published call
    pub(crate) call: Call,
    /// Shared completion state for the logical call
    pub(crate) slot: Arc<CompletionSlot>,
    /// Absolute deadline, extended by function-started notifications
    pub(crate) deadline: Mutex<Instant>,
}

impl PendingEntry {
    pub(crate) fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Push the deadline out to `now + window`
    pub(crate) fn extend_deadline(&self, window: Duration) {
        let mut deadline = self.deadline.lock();
        let extended = Instant::now() + window;
        if extended > *deadline {
            *deadline = extended;
        }
    }
}

/// The map of outstanding attempts, shared between the engine and the
/// queue reconciler. An entry is present iff a caller awaits it and it has
/// neither completed nor been cancelled.
#[derive(Default)]
pub(crate) struct PendingCalls {
    map: DashMap<String, Arc<PendingEntry>>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, entry: Arc<PendingEntry>) {
        self.map.insert(entry.call.call_id.clone(), entry);
    }

    pub(crate) fn get(&self, call_id: &str) -> Option<Arc<PendingEntry>> {
        self.map.get(call_id).map(|e| Arc::clone(&e))
    }

    pub(crate) fn remove(&self, call_id: &str) -> Option<Arc<PendingEntry>> {
        self.map.remove(call_id).map(|(_, e)| e)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Remove and return every outstanding entry (shutdown path)
    pub(crate) fn drain(&self) -> Vec<Arc<PendingEntry>> {
        let ids: Vec<String> = self.map.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }
}

/// Provider-agnostic invocation engine for one instance
pub struct InvocationEngine {
    driver: Arc<dyn crate::driver::ProviderDriver>,
    options: InstanceOptions,
    mode: Mode,
    funnel: Funnel,
    pending: Arc<PendingCalls>,
    metrics: Arc<MetricsRegistry>,
    skew: Arc<ClockSkewEstimator>,
    accepting: AtomicBool,
}

impl InvocationEngine {
    pub(crate) fn new(
        driver: Arc<dyn crate::driver::ProviderDriver>,
        options: InstanceOptions,
        mode: Mode,
        pending: Arc<PendingCalls>,
        metrics: Arc<MetricsRegistry>,
        skew: Arc<ClockSkewEstimator>,
    ) -> Self {
        let funnel = match options.rate_limit {
            Some(rate) => Funnel::with_rate_limit(options.concurrency, rate.target_rps, rate.burst),
            None => Funnel::new(options.concurrency),
        };
        Self {
            driver,
            options,
            mode,
            funnel,
            pending,
            metrics,
            skew,
            accepting: AtomicBool::new(true),
        }
    }

    /// The resolved transport mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Outstanding attempts
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Invoke `name` with the given serialized arguments and wait for the
    /// terminal outcome.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(CumulusError::Cancelled);
        }
        if self.options.validate_serialization {
            for warning in round_trip_warnings(&args) {
                warn!(function = name, %warning, "argument serialization warning");
            }
        }
        match self.mode {
            Mode::Https => self.invoke_sync(name, args).await,
            Mode::Queue => self.invoke_queued(name, args).await,
            Mode::Auto => Err(CumulusError::internal("mode was not resolved at startup")),
        }
    }

    /// Stop accepting calls, reject queued funnel waiters, and cancel every
    /// outstanding attempt.
    pub fn stop(&self) {
        self.stop_accepting();
        self.cancel_pending();
    }

    /// Refuse new calls and reject every waiter queued behind the funnel
    pub(crate) fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.funnel.fail_pending();
    }

    /// Resolve every still-outstanding attempt with the cancellation error
    pub(crate) fn cancel_pending(&self) {
        for entry in self.pending.drain() {
            entry.slot.complete(SlotOutcome::Cancelled);
        }
    }

    fn build_call(
        &self,
        name: &str,
        args: Value,
        response_queue_id: Option<String>,
        attempt: u32,
    ) -> Call {
        Call {
            call_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            args,
            response_queue_id,
            start: epoch_millis(),
            attempt,
        }
    }

    // ------------------------------------------------------------------
    // Sync (HTTP-like) path
    // ------------------------------------------------------------------

    async fn invoke_sync(&self, name: &str, args: Value) -> Result<Value> {
        let invoke_start = epoch_millis();
        let fn_metrics = self.metrics.function(name);
        let aggregate = self.metrics.aggregate();
        let max_retries = self.options.max_retries;

        let outcome = self
            .funnel
            .push_retry(
                {
                    let fn_metrics = Arc::clone(&fn_metrics);
                    let aggregate = Arc::clone(&aggregate);
                    move |err: &CumulusError, attempt: u32| {
                        let retry = attempt < max_retries && err.is_transient();
                        if retry {
                            debug!(attempt, error = %err, "retrying sync invocation");
                            fn_metrics.counters.record_retry();
                            aggregate.counters.record_retry();
                        }
                        retry
                    }
                },
                |attempt| {
                    let call = self.build_call(name, args.clone(), None, attempt);
                    let fn_metrics = Arc::clone(&fn_metrics);
                    let aggregate = Arc::clone(&aggregate);
                    async move {
                        let local_sent = call.start;
                        fn_metrics.counters.record_invocation();
                        aggregate.counters.record_invocation();
                        let start_latency = (local_sent - invoke_start).max(0.0);
                        for metrics in [&fn_metrics, &aggregate] {
                            metrics.update_stats(|s| s.local_start_latency.update(start_latency));
                        }

                        let payload = self.driver.invoke_sync(&call).await?.ok_or_else(|| {
                            CumulusError::internal("sync invocation returned no payload")
                        })?;
                        Ok((payload, local_sent, epoch_millis()))
                    }
                },
            )
            .await;

        match outcome {
            Ok((payload, local_sent, local_end)) => {
                self.finish(name, payload, local_sent, local_end, false, &[])
            }
            Err(err) => {
                fn_metrics.counters.record_error();
                aggregate.counters.record_error();
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Queued path
    // ------------------------------------------------------------------

    async fn invoke_queued(&self, name: &str, args: Value) -> Result<Value> {
        let invoke_start = epoch_millis();
        let fn_metrics = self.metrics.function(name);
        let aggregate = self.metrics.aggregate();
        let max_retries = self.options.max_retries;
        let deadline_window = self.options.call_deadline();

        let _permit = self.funnel.acquire().await?;
        let (slot, mut rx) = CompletionSlot::channel();
        let mut issued: Vec<String> = Vec::new();
        let mut attempt: u32 = 0;
        let mut speculative_issued = false;

        let mut local_sent = self
            .issue_attempt(name, &args, &slot, &mut attempt, invoke_start, &mut issued)
            .await
            .map_err(|err| {
                fn_metrics.counters.record_error();
                aggregate.counters.record_error();
                err
            })?;

        loop {
            let deadline = self.effective_deadline(&issued, deadline_window);
            let speculative_at = if speculative_issued {
                None
            } else {
                self.speculative_deadline(&fn_metrics, local_sent)
            };
            let speculative_sleep =
                speculative_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                outcome = &mut rx => {
                    self.unregister(&issued);
                    let outcome = outcome
                        .map_err(|_| CumulusError::internal("completion slot dropped"))?;
                    return match outcome {
                        SlotOutcome::Payload { payload, local_end } => self.finish(
                            name,
                            payload,
                            local_sent,
                            local_end,
                            slot.started_recorded(),
                            &slot.metrics(),
                        ),
                        SlotOutcome::DeadLetter { message } => {
                            fn_metrics.counters.record_error();
                            aggregate.counters.record_error();
                            Err(CumulusError::DeadLetter(message))
                        }
                        SlotOutcome::Cancelled => {
                            fn_metrics.counters.record_error();
                            aggregate.counters.record_error();
                            Err(CumulusError::Cancelled)
                        }
                    };
                }

                _ = tokio::time::sleep_until(deadline) => {
                    // A function-started notification may have pushed the
                    // deadline out while we slept.
                    if self.effective_deadline(&issued, deadline_window) > Instant::now() {
                        continue;
                    }
                    let elapsed_ms = (epoch_millis() - local_sent).max(0.0) as u64;
                    let timeout = CumulusError::FunctionTimeout {
                        call_id: issued.last().cloned().unwrap_or_default(),
                        elapsed_ms,
                    };
                    if attempt >= max_retries + u32::from(speculative_issued) {
                        self.unregister(&issued);
                        fn_metrics.counters.record_error();
                        aggregate.counters.record_error();
                        return Err(timeout);
                    }
                    debug!(function = name, attempt, "call timed out, reissuing");
                    self.unregister(&issued);
                    issued.clear();
                    attempt += 1;
                    fn_metrics.counters.record_retry();
                    aggregate.counters.record_retry();
                    local_sent = self
                        .issue_attempt(name, &args, &slot, &mut attempt, invoke_start, &mut issued)
                        .await
                        .map_err(|err| {
                            fn_metrics.counters.record_error();
                            aggregate.counters.record_error();
                            err
                        })?;
                }

                _ = tokio::time::sleep_until(speculative_sleep), if speculative_at.is_some() => {
                    speculative_issued = true;
                    attempt += 1;
                    fn_metrics.counters.record_retry();
                    aggregate.counters.record_retry();
                    debug!(function = name, "issuing speculative tail-latency retry");
                    // The duplicate shares the slot; whichever terminal
                    // response arrives first wins.
                    if let Err(err) = self
                        .issue_attempt(name, &args, &slot, &mut attempt, invoke_start, &mut issued)
                        .await
                    {
                        warn!(function = name, error = %err,
                            "speculative attempt failed to publish");
                    }
                }
            }
        }
    }

    /// Register a pending entry and publish it, retrying transient publish
    /// failures against the shared attempt budget. Returns the send time.
    async fn issue_attempt(
        &self,
        name: &str,
        args: &Value,
        slot: &Arc<CompletionSlot>,
        attempt: &mut u32,
        invoke_start: f64,
        issued: &mut Vec<String>,
    ) -> Result<f64> {
        let fn_metrics = self.metrics.function(name);
        let aggregate = self.metrics.aggregate();

        loop {
            // A reissue racing shutdown must not slip past cancel_pending.
            if !self.accepting.load(Ordering::SeqCst) {
                return Err(CumulusError::Cancelled);
            }
            let call = self.build_call(
                name,
                args.clone(),
                self.driver.response_queue_id(),
                *attempt,
            );
            let call_id = call.call_id.clone();
            let local_sent = call.start;

            let entry = Arc::new(PendingEntry {
                call: call.clone(),
                slot: Arc::clone(slot),
                deadline: Mutex::new(Instant::now() + self.options.call_deadline()),
            });
            self.pending.insert(entry);
            fn_metrics.counters.record_invocation();
            aggregate.counters.record_invocation();
            let start_latency = (local_sent - invoke_start).max(0.0);
            for metrics in [&fn_metrics, &aggregate] {
                metrics.update_stats(|s| s.local_start_latency.update(start_latency));
            }

            match self.driver.publish_request(&call).await {
                Ok(()) => {
                    issued.push(call_id);
                    return Ok(local_sent);
                }
                Err(err) => {
                    self.pending.remove(&call_id);
                    if *attempt < self.options.max_retries && err.is_transient() {
                        debug!(function = name, error = %err, "publish failed, retrying");
                        *attempt += 1;
                        fn_metrics.counters.record_retry();
                        aggregate.counters.record_retry();
                        tokio::time::sleep(retry_backoff(*attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    fn unregister(&self, issued: &[String]) {
        for call_id in issued {
            self.pending.remove(call_id);
        }
    }

    fn effective_deadline(&self, issued: &[String], window: Duration) -> Instant {
        issued
            .iter()
            .filter_map(|id| self.pending.get(id))
            .map(|entry| entry.deadline())
            .max()
            .unwrap_or_else(|| Instant::now() + window)
    }

    /// When the speculative tail-latency retry should fire, if the trigger
    /// is armed for this function.
    fn speculative_deadline(
        &self,
        fn_metrics: &Arc<FunctionMetrics>,
        local_sent: f64,
    ) -> Option<Instant> {
        let stats = fn_metrics.stats();
        let series = stats.execution_time;
        if series.samples() < self.options.speculative_min_samples {
            return None;
        }
        let threshold_ms =
            series.mean() + self.options.speculative_retry_threshold * series.stddev();
        let elapsed_ms = (epoch_millis() - local_sent).max(0.0);
        let remaining = (threshold_ms - elapsed_ms).max(0.0);
        Some(Instant::now() + Duration::from_secs_f64(remaining / 1000.0))
    }

    // ------------------------------------------------------------------
    // Terminal outcome handling
    // ------------------------------------------------------------------

    /// Fold the terminal payload into counters and statistics, then map it
    /// to the caller's result.
    fn finish(
        &self,
        name: &str,
        mut payload: ReturnPayload,
        local_sent: f64,
        local_end: f64,
        remote_start_recorded: bool,
        cpu_series: &[CpuMetricsSample],
    ) -> Result<Value> {
        let fn_metrics = self.metrics.function(name);
        let aggregate = self.metrics.aggregate();

        if let (Some(remote_start), Some(remote_end)) =
            (payload.remote_execution_start, payload.remote_execution_end)
        {
            let adjusted = self.skew.observe(&ResponseTimings {
                local_sent,
                local_end,
                remote_start,
                remote_end,
                remote_sent: payload.remote_response_sent,
            });
            let billed = adjusted.execution_time.max(1.0);
            for metrics in [&fn_metrics, &aggregate] {
                metrics.update_stats(|s| {
                    if !remote_start_recorded {
                        s.remote_start_latency.update(adjusted.remote_start_latency);
                    }
                    s.execution_time.update(adjusted.execution_time);
                    s.send_response_latency
                        .update(adjusted.send_response_latency);
                    s.return_latency.update(adjusted.return_latency);
                    s.estimated_billed_time.update(billed);
                });
            }
        }

        if payload.memory_usage.is_none() {
            payload.memory_usage = cpu_series
                .iter()
                .map(|sample| sample.memory)
                .fold(None, |acc: Option<f64>, m| {
                    Some(acc.map_or(m, |a| a.max(m)))
                });
        }

        match payload.kind {
            ReturnKind::Returned => {
                fn_metrics.counters.record_completed();
                aggregate.counters.record_completed();
                Ok(payload.value.unwrap_or(Value::Null))
            }
            ReturnKind::Error => {
                fn_metrics.counters.record_error();
                aggregate.counters.record_error();
                let mut user = payload
                    .error
                    .unwrap_or_else(|| UserError::new("Error", "remote function failed"));
                if let Some(url) = payload.log_url {
                    user.properties
                        .entry(LOG_URL_PROPERTY.to_string())
                        .or_insert(url);
                }
                Err(CumulusError::User(user))
            }
        }
    }
}
