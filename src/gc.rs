//! Residual-resource garbage collection
//!
//! A crashed or killed client leaves functions, queues, and log groups
//! behind. Each process therefore scans the provider namespace for
//! framework-prefixed resources older than the retention threshold and
//! deletes them. The scan runs at most once per hour per machine (the gate
//! lives in the persistent cache) and deletions flow through a dedicated
//! funnel so collection never competes with live invocations for API quota.

use crate::cache::PersistentCache;
use crate::driver::{ProviderDriver, RESOURCE_NAME_PREFIX};
use crate::error::Result;
use crate::funnel::Funnel;
use crate::stats::epoch_millis;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache key recording the last collection time (epoch millis)
pub const GC_LAST_RUN_KEY: &str = "gc-last-run";

/// Minimum interval between collections on one machine
pub const GC_MIN_INTERVAL: Duration = Duration::from_secs(3600);

/// Deletions issued concurrently
const GC_CONCURRENCY: usize = 4;

/// Outcome of one collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcSummary {
    /// True when the hourly gate suppressed the scan
    pub skipped: bool,
    /// Residual resources seen in the namespace scan
    pub scanned: usize,
    /// Resources deleted
    pub collected: usize,
    /// Deletions that failed (logged, not retried until the next pass)
    pub failed: usize,
}

/// Scans for and deletes residual framework resources
pub struct GarbageCollector {
    driver: Arc<dyn ProviderDriver>,
    cache: PersistentCache,
    retention_in_days: f64,
    funnel: Funnel,
}

impl GarbageCollector {
    /// Create a collector.
    ///
    /// `retention_in_days == 0.0` collects every framework resource found,
    /// including resources owned by other live processes. Dangerous;
    /// reserved for explicit opt-in.
    pub fn new(
        driver: Arc<dyn ProviderDriver>,
        cache: PersistentCache,
        retention_in_days: f64,
    ) -> Self {
        Self {
            driver,
            cache,
            retention_in_days,
            funnel: Funnel::new(GC_CONCURRENCY),
        }
    }

    /// Run one collection pass, honoring the hourly gate
    pub async fn run(&self) -> Result<GcSummary> {
        if self.ran_recently().await {
            debug!("garbage collection ran recently, skipping");
            return Ok(GcSummary {
                skipped: true,
                ..Default::default()
            });
        }
        self.cache
            .set(GC_LAST_RUN_KEY, format!("{}", epoch_millis()).into_bytes())
            .await?;

        let candidates = self.driver.list_residual_resources().await?;
        let scanned = candidates.len();
        let cutoff = Utc::now()
            - ChronoDuration::milliseconds((self.retention_in_days * 86_400_000.0) as i64);

        let mut deletions = Vec::new();
        for candidate in candidates {
            if !candidate.name.starts_with(RESOURCE_NAME_PREFIX) {
                continue;
            }
            if candidate.created_at >= cutoff {
                continue;
            }
            let Some(resources) = self.driver.resources_from_name(&candidate.name) else {
                debug!(name = %candidate.name, "unparseable residual resource name");
                continue;
            };
            let driver = Arc::clone(&self.driver);
            let name = candidate.name.clone();
            deletions.push(self.funnel.push(async move {
                driver.delete_resources(&resources).await.map(|()| name)
            }));
        }

        let mut summary = GcSummary {
            scanned,
            ..Default::default()
        };
        for outcome in join_all(deletions).await {
            match outcome {
                Ok(name) => {
                    debug!(name = %name, "collected residual resources");
                    summary.collected += 1;
                }
                Err(err) => {
                    warn!(error = %err, "failed to collect residual resources");
                    summary.failed += 1;
                }
            }
        }
        info!(
            scanned = summary.scanned,
            collected = summary.collected,
            failed = summary.failed,
            "garbage collection pass complete"
        );
        Ok(summary)
    }

    async fn ran_recently(&self) -> bool {
        let last_run = match self.cache.get(GC_LAST_RUN_KEY).await {
            Ok(Some(bytes)) => String::from_utf8_lossy(&bytes).parse::<f64>().ok(),
            _ => None,
        };
        match last_run {
            Some(last) => epoch_millis() - last < GC_MIN_INTERVAL.as_millis() as f64,
            None => false,
        }
    }
}
