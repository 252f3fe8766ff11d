//! Clock-skew estimation for remote timestamps
//!
//! Remote functions report execution timestamps on their own clocks, which
//! drift from the local clock by anywhere from milliseconds to minutes. The
//! estimator aligns them: each completed round trip yields a skew
//! observation, folded into an exponentially decaying average, which is then
//! applied so that the derived start and return latencies stay non-negative
//! and meaningful.

use crate::stats::DecayingAverage;
use parking_lot::Mutex;

/// Floor applied to skew-corrected latencies, in milliseconds
const LATENCY_FLOOR_MS: f64 = 1.0;

/// Raw timestamps for one completed call. All values are epoch milliseconds;
/// `local_*` on the local clock, `remote_*` on the remote one.
#[derive(Debug, Clone, Copy)]
pub struct ResponseTimings {
    /// When the request left the client
    pub local_sent: f64,
    /// When the terminal response was observed locally
    pub local_end: f64,
    /// When the remote function began executing
    pub remote_start: f64,
    /// When the remote function finished executing
    pub remote_end: f64,
    /// When the remote side published its response, if reported
    pub remote_sent: Option<f64>,
}

/// Skew-corrected latency breakdown for one completed call, milliseconds
#[derive(Debug, Clone, Copy)]
pub struct AdjustedLatencies {
    /// Full local round trip
    pub round_trip: f64,
    /// Remote execution time
    pub execution_time: f64,
    /// Time the remote side spent publishing its response
    pub send_response_latency: f64,
    /// Estimated one-way-and-back network share of the round trip
    pub network_latency: f64,
    /// Invoke-to-remote-start, skew-corrected, at least 1
    pub remote_start_latency: f64,
    /// Remote-end-to-local-receipt, skew-corrected, at least 1
    pub return_latency: f64,
}

/// EWMA-based estimator of the remote-minus-local clock offset
#[derive(Debug, Default)]
pub struct ClockSkewEstimator {
    skew: Mutex<DecayingAverage>,
}

impl ClockSkewEstimator {
    /// Create an empty estimator
    pub fn new() -> Self {
        Self::default()
    }

    /// Current skew estimate in milliseconds, if any call has completed.
    ///
    /// Added to a remote timestamp, the estimate expresses it on the local
    /// clock.
    pub fn estimate(&self) -> Option<f64> {
        self.skew.lock().value()
    }

    /// Fold one completed round trip into the estimate and return the
    /// skew-corrected latency breakdown.
    pub fn observe(&self, timings: &ResponseTimings) -> AdjustedLatencies {
        let round_trip = timings.local_end - timings.local_sent;
        let execution_time = timings.remote_end - timings.remote_start;
        let send_response_latency = timings
            .remote_sent
            .map(|sent| (sent - timings.remote_end).max(0.0))
            .unwrap_or(0.0);
        let network_latency = round_trip - execution_time - send_response_latency;

        let estimated_remote_start = timings.local_sent + network_latency / 2.0;
        let this_skew = estimated_remote_start - timings.remote_start;

        let skew = {
            let mut avg = self.skew.lock();
            avg.update(this_skew);
            avg.value().unwrap_or(this_skew)
        };

        AdjustedLatencies {
            round_trip,
            execution_time,
            send_response_latency,
            network_latency,
            remote_start_latency: (timings.remote_start + skew - timings.local_sent)
                .max(LATENCY_FLOOR_MS),
            return_latency: (timings.local_end - (timings.remote_end + skew))
                .max(LATENCY_FLOOR_MS),
        }
    }

    /// Skew-correct a bare remote start timestamp (function-started
    /// notifications), at least 1 ms. Uses the current estimate, or the raw
    /// difference when no call has completed yet.
    pub fn remote_start_latency(&self, remote_start: f64, local_sent: f64) -> f64 {
        let skew = self.estimate().unwrap_or(0.0);
        (remote_start + skew - local_sent).max(LATENCY_FLOOR_MS)
    }
}
