//! Log event stitching
//!
//! Cloud log APIs return paged, overlapping windows of events. The stitcher
//! turns that into a stream where each event appears exactly once, in
//! approximate timestamp order: a bounded set of recently seen event ids
//! suppresses duplicates, and a monotonic cursor (trailing the newest page
//! by a safety window) is handed back to the provider as the next page's
//! start-time filter so the overlap shrinks over time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How far behind the newest observed event the cursor trails, so that
/// events delivered late and out of order are not filtered by start time
/// before the dedup set has seen them.
pub const DEFAULT_SAFETY_WINDOW_MS: i64 = 1_000;

/// One remote log event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Event timestamp, epoch milliseconds (remote clock)
    pub timestamp: i64,
    /// Provider-assigned unique event identifier
    pub event_id: String,
    /// Log line
    pub message: String,
}

impl LogEvent {
    /// Construct a log event
    pub fn new(timestamp: i64, event_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            event_id: event_id.into(),
            message: message.into(),
        }
    }
}

/// Deduplicating, monotonic follower over paged log streams
#[derive(Debug)]
pub struct LogStitcher {
    last_event_time: i64,
    seen: HashMap<String, i64>,
    safety_window_ms: i64,
}

impl LogStitcher {
    /// Create a stitcher with the default safety window
    pub fn new() -> Self {
        Self::with_safety_window(DEFAULT_SAFETY_WINDOW_MS)
    }

    /// Create a stitcher with a custom safety window in milliseconds
    pub fn with_safety_window(safety_window_ms: i64) -> Self {
        Self {
            last_event_time: 0,
            seen: HashMap::new(),
            safety_window_ms,
        }
    }

    /// The start-time filter to pass to the provider for the next page
    pub fn start_time(&self) -> i64 {
        self.last_event_time
    }

    /// Number of event ids currently held for deduplication
    pub fn tracked_ids(&self) -> usize {
        self.seen.len()
    }

    /// Process one page: returns the events not yet emitted, sorted by
    /// timestamp, and advances the cursor.
    pub fn filter_page(&mut self, page: Vec<LogEvent>) -> Vec<LogEvent> {
        if page.is_empty() {
            return Vec::new();
        }

        let page_max = page.iter().map(|e| e.timestamp).max().unwrap_or(0);

        let mut fresh: Vec<LogEvent> = page
            .into_iter()
            .filter(|event| !self.seen.contains_key(&event.event_id))
            .collect();
        for event in &fresh {
            self.seen.insert(event.event_id.clone(), event.timestamp);
        }
        fresh.sort_by_key(|event| event.timestamp);

        // Advance monotonically; a stale page never moves the cursor back.
        let candidate = page_max - self.safety_window_ms;
        if candidate > self.last_event_time {
            self.last_event_time = candidate;
            let cursor = self.last_event_time;
            self.seen.retain(|_, ts| *ts >= cursor);
        }

        fresh
    }
}

impl Default for LogStitcher {
    fn default() -> Self {
        Self::new()
    }
}
