//! Concurrency, rate, and retry admission primitive
//!
//! Every outbound network operation flows through a [`Funnel`]: a FIFO
//! admission gate with a concurrency ceiling, an optional token-bucket rate
//! limit, a retry wrapper with exponential backoff, and a memoizing variant
//! that collapses bursts of identical work onto a single in-flight future.
//!
//! Admission is permit-based. A permit is released when the admitted task's
//! future completes or is dropped, so failing or cancelled tasks never leak
//! capacity.

use crate::error::{CumulusError, Result};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// First retry backoff delay
pub const RETRY_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Retry backoff ceiling
pub const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Exponential backoff for attempt `n` (1-based), capped and jittered
/// downward by up to 20%.
pub(crate) fn retry_backoff(attempt: u32) -> Duration {
    let base = RETRY_BACKOFF_INITIAL.as_millis() as u64;
    let shift = attempt.saturating_sub(1).min(3);
    let capped = (base << shift).min(RETRY_BACKOFF_CAP.as_millis() as u64);
    let jitter = rand::thread_rng().gen_range(0..=capped / 5);
    Duration::from_millis(capped - jitter)
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(target_rps: f64, burst: u32) -> Self {
        Self {
            capacity: burst as f64,
            tokens: burst as f64,
            rate: target_rps,
            last_refill: Instant::now(),
        }
    }

    /// Take one token, or report how long until one is available.
    fn poll_take(&mut self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.rate))
        }
    }
}

type WaiterTx = oneshot::Sender<std::result::Result<Permit, CumulusError>>;

struct FunnelState {
    max_concurrency: usize,
    running: usize,
    waiters: VecDeque<WaiterTx>,
    bucket: Option<TokenBucket>,
    closed: bool,
}

struct FunnelShared {
    state: Mutex<FunnelState>,
}

/// A held admission slot. Dropping it admits the oldest waiter.
pub struct Permit {
    shared: Arc<FunnelShared>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            while state.max_concurrency == 0 || state.running <= state.max_concurrency {
                let Some(tx) = state.waiters.pop_front() else {
                    break;
                };
                let transferred = Permit {
                    shared: Arc::clone(&self.shared),
                };
                match tx.send(Ok(transferred)) {
                    // Slot handed over; our count stays.
                    Ok(()) => return,
                    Err(returned) => {
                        // The waiter gave up. Reclaim the slot without
                        // re-entering this drop under the lock.
                        if let Ok(permit) = returned {
                            std::mem::forget(permit);
                        }
                    }
                }
            }
        }
        state.running -= 1;
    }
}

/// FIFO concurrency gate with optional rate limiting.
///
/// `max_concurrency == 0` means unlimited. Cloning shares the gate.
#[derive(Clone)]
pub struct Funnel {
    shared: Arc<FunnelShared>,
}

impl Funnel {
    /// Create a funnel with a concurrency ceiling (0 = unlimited)
    pub fn new(max_concurrency: usize) -> Self {
        Self::build(max_concurrency, None)
    }

    /// Create a funnel that additionally gates admission on a token bucket
    /// of `burst` tokens refilled at `target_rps`.
    pub fn with_rate_limit(max_concurrency: usize, target_rps: f64, burst: u32) -> Self {
        Self::build(max_concurrency, Some(TokenBucket::new(target_rps, burst)))
    }

    fn build(max_concurrency: usize, bucket: Option<TokenBucket>) -> Self {
        Self {
            shared: Arc::new(FunnelShared {
                state: Mutex::new(FunnelState {
                    max_concurrency,
                    running: 0,
                    waiters: VecDeque::new(),
                    bucket,
                    closed: false,
                }),
            }),
        }
    }

    /// Wait for admission. The returned permit holds the slot until dropped.
    pub async fn acquire(&self) -> Result<Permit> {
        let waiter = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(CumulusError::Cancelled);
            }
            if state.max_concurrency == 0 || state.running < state.max_concurrency {
                state.running += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        let permit = match waiter {
            None => Permit {
                shared: Arc::clone(&self.shared),
            },
            Some(rx) => match rx.await {
                Ok(Ok(permit)) => permit,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(CumulusError::Cancelled),
            },
        };

        // Rate gate, entered only once the slot is held.
        loop {
            let wait = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(CumulusError::Cancelled);
                }
                match state.bucket.as_mut() {
                    None => None,
                    Some(bucket) => bucket.poll_take(Instant::now()),
                }
            };
            match wait {
                None => return Ok(permit),
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Run `task` under admission
    pub async fn push<T, F>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self.acquire().await?;
        task.await
    }

    /// Run a retryable task under a single admission.
    ///
    /// `make_task` is invoked with the attempt number (0-based). On failure,
    /// `should_retry(err, attempt)` decides whether to reissue after
    /// exponential backoff; retries hold the original permit and do not
    /// re-enter the admission queue.
    pub async fn push_retry<T, R, F, Fut>(&self, mut should_retry: R, mut make_task: F) -> Result<T>
    where
        R: FnMut(&CumulusError, u32) -> bool,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.acquire().await?;
        let mut attempt = 0u32;
        loop {
            match make_task(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !should_retry(&err, attempt) {
                        return Err(err);
                    }
                    attempt += 1;
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
            }
        }
    }

    /// Raise or lower the concurrency ceiling, retroactively admitting
    /// waiters that now fit.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        let mut admitted = Vec::new();
        {
            let mut state = self.shared.state.lock();
            state.max_concurrency = max_concurrency;
            while !state.closed
                && (max_concurrency == 0 || state.running < max_concurrency)
                && !state.waiters.is_empty()
            {
                if let Some(tx) = state.waiters.pop_front() {
                    state.running += 1;
                    admitted.push(tx);
                }
            }
        }
        for tx in admitted {
            let permit = Permit {
                shared: Arc::clone(&self.shared),
            };
            // A dropped waiter releases the slot through the permit's own
            // drop, outside the lock.
            let _ = tx.send(Ok(permit));
        }
    }

    /// The configured concurrency ceiling
    pub fn max_concurrency(&self) -> usize {
        self.shared.state.lock().max_concurrency
    }

    /// Tasks currently admitted
    pub fn running(&self) -> usize {
        self.shared.state.lock().running
    }

    /// Tasks queued behind the gate
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    /// Reject every queued waiter with a cancellation error and refuse all
    /// future admissions. Called by the lifecycle controller during stop.
    pub fn fail_pending(&self) {
        let waiters = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        for tx in waiters {
            let _ = tx.send(Err(CumulusError::Cancelled));
        }
    }
}

/// Memoizing funnel: one in-flight (or completed) future per key.
///
/// Concurrent pushes for the same key share a single execution; distinct
/// keys run concurrently subject to the inner funnel's ceiling. Failures are
/// shared with every caller as [`CumulusError::Shared`].
pub struct MemoFunnel<T>
where
    T: Clone + Send + Sync + 'static,
{
    funnel: Funnel,
    memo: Mutex<HashMap<String, Shared<BoxFuture<'static, std::result::Result<T, Arc<CumulusError>>>>>>,
}

impl<T> MemoFunnel<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a memoizing funnel with a concurrency ceiling (0 = unlimited)
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            funnel: Funnel::new(max_concurrency),
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Return the single shared future for `key`, starting `task` only if
    /// no earlier push created one.
    pub async fn push_memoized<F>(&self, key: &str, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = {
            let mut memo = self.memo.lock();
            match memo.get(key) {
                Some(existing) => existing.clone(),
                None => {
                    let funnel = self.funnel.clone();
                    let fut = async move { funnel.push(task).await.map_err(Arc::new) }
                        .boxed()
                        .shared();
                    memo.insert(key.to_string(), fut.clone());
                    fut
                }
            }
        };
        shared.await.map_err(CumulusError::from)
    }

    /// Drop the memoized result for `key`, forcing the next push to rerun
    pub fn forget(&self, key: &str) {
        self.memo.lock().remove(key);
    }

    /// Number of memoized keys
    pub fn len(&self) -> usize {
        self.memo.lock().len()
    }

    /// True if no key has been pushed yet
    pub fn is_empty(&self) -> bool {
        self.memo.lock().is_empty()
    }
}
