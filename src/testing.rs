//! Testing utilities for Cumulus integration tests
//!
//! Provides [`ScriptedDriver`], a fully in-process [`ProviderDriver`] whose
//! sync path, response queue, logs, and residual-resource namespace are
//! scripted by the test. No network, no cloud account, deterministic under
//! tokio's paused clock.
//!
//! # Example
//!
//! ```ignore
//! use cumulus::testing::ScriptedDriver;
//! use cumulus::message::ReturnPayload;
//! use serde_json::json;
//!
//! let driver = ScriptedDriver::https_mode();
//! driver.on_invoke_sync(|call| async move {
//!     Ok(Some(ReturnPayload::returned(call.call_id, json!("hello world"))))
//! });
//! ```

use crate::config::{InstanceOptions, Mode};
use crate::driver::{
    ControlKind, ProviderDriver, ResourceCandidate, Resources, RESOURCE_NAME_PREFIX,
};
use crate::error::{CumulusError, Result};
use crate::logs::LogEvent;
use crate::message::{Call, PollResult, QueueMessage, RawQueueMessage, ReturnPayload};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// Messages returned per poll batch
const POLL_BATCH_SIZE: usize = 10;

/// How long an empty poll waits before returning an empty batch
const POLL_WINDOW: Duration = Duration::from_millis(500);

type SyncHandler =
    dyn Fn(Call) -> BoxFuture<'static, Result<Option<ReturnPayload>>> + Send + Sync;
type PublishHandler = dyn Fn(&Call) -> Vec<(Duration, QueueMessage)> + Send + Sync;

/// The scripted response queue, shared with delayed-delivery tasks
#[derive(Clone, Default)]
struct SharedQueue {
    state: Arc<QueueState>,
}

#[derive(Default)]
struct QueueState {
    messages: Mutex<VecDeque<RawQueueMessage>>,
    notify: Notify,
}

impl SharedQueue {
    fn push(&self, message: RawQueueMessage) {
        self.state.messages.lock().push_back(message);
        self.state.notify.notify_one();
    }

    async fn pull_batch(&self) -> PollResult {
        let window = tokio::time::sleep(POLL_WINDOW);
        tokio::pin!(window);
        loop {
            {
                let mut messages = self.state.messages.lock();
                if !messages.is_empty() {
                    let take = messages.len().min(POLL_BATCH_SIZE);
                    let batch: Vec<RawQueueMessage> = messages.drain(..take).collect();
                    let is_full = !messages.is_empty();
                    return PollResult {
                        messages: batch,
                        is_full,
                    };
                }
            }
            tokio::select! {
                _ = self.state.notify.notified() => {}
                _ = &mut window => return PollResult::default(),
            }
        }
    }
}

/// A scriptable in-process provider driver
pub struct ScriptedDriver {
    mode: Mode,
    resources: Resources,
    sync_handler: Mutex<Option<Arc<SyncHandler>>>,
    publish_handler: Mutex<Option<Arc<PublishHandler>>>,
    published: Mutex<Vec<Call>>,
    queue: SharedQueue,
    log_pages: Mutex<VecDeque<Vec<LogEvent>>>,
    residual: Mutex<Vec<ResourceCandidate>>,
    deleted: Mutex<Vec<String>>,
    fail_deletions: AtomicBool,
    fail_publishes: AtomicU32,
    provisioned: AtomicBool,
}

impl ScriptedDriver {
    fn new(mode: Mode) -> Self {
        let mut resources = Resources::named(format!("{}test", RESOURCE_NAME_PREFIX));
        resources.function_id = Some("fn-test".into());
        if mode == Mode::Queue {
            resources.request_queue_id = Some("req-queue-test".into());
            resources.response_queue_id = Some("resp-queue-test".into());
        }
        Self {
            mode,
            resources,
            sync_handler: Mutex::new(None),
            publish_handler: Mutex::new(None),
            published: Mutex::new(Vec::new()),
            queue: SharedQueue::default(),
            log_pages: Mutex::new(VecDeque::new()),
            residual: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            fail_deletions: AtomicBool::new(false),
            fail_publishes: AtomicU32::new(0),
            provisioned: AtomicBool::new(false),
        }
    }

    /// A driver whose preferred transport is the response queue
    pub fn queue_mode() -> Self {
        Self::new(Mode::Queue)
    }

    /// A driver whose preferred transport is the synchronous path
    pub fn https_mode() -> Self {
        Self::new(Mode::Https)
    }

    /// Script the synchronous invocation path
    pub fn on_invoke_sync<F, Fut>(&self, handler: F)
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<ReturnPayload>>> + Send + 'static,
    {
        *self.sync_handler.lock() = Some(Arc::new(move |call| handler(call).boxed()));
    }

    /// Script queued-mode delivery: for each published call, the handler
    /// returns the messages to enqueue and their delays.
    pub fn on_publish<F>(&self, handler: F)
    where
        F: Fn(&Call) -> Vec<(Duration, QueueMessage)> + Send + Sync + 'static,
    {
        *self.publish_handler.lock() = Some(Arc::new(handler));
    }

    /// Enqueue a message onto the response queue directly
    pub fn enqueue(&self, message: QueueMessage) -> Result<()> {
        self.queue.push(message.encode()?);
        Ok(())
    }

    /// Calls published so far (queued mode)
    pub fn published_calls(&self) -> Vec<Call> {
        self.published.lock().clone()
    }

    /// Fail the next `n` publishes with a throttling error
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Add a page of log events for `poll_logs` to hand out
    pub fn add_log_page(&self, page: Vec<LogEvent>) {
        self.log_pages.lock().push_back(page);
    }

    /// Seed the residual-resource namespace scan
    pub fn add_residual_resource(&self, candidate: ResourceCandidate) {
        self.residual.lock().push(candidate);
    }

    /// Make `delete_resources` fail
    pub fn fail_deletions(&self, fail: bool) {
        self.fail_deletions.store(fail, Ordering::SeqCst);
    }

    /// Names whose resources have been deleted
    pub fn deleted_resource_names(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// True once `provision` has run
    pub fn is_provisioned(&self) -> bool {
        self.provisioned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderDriver for ScriptedDriver {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    async fn provision(&self, options: &InstanceOptions) -> Result<Resources> {
        options.validate()?;
        self.provisioned.store(true, Ordering::SeqCst);
        Ok(self.resources.clone())
    }

    fn preferred_mode(&self) -> Mode {
        self.mode
    }

    async fn invoke_sync(&self, call: &Call) -> Result<Option<ReturnPayload>> {
        let handler = self.sync_handler.lock().clone();
        match handler {
            Some(handler) => handler(call.clone()).await,
            None => Err(CumulusError::internal("no sync handler scripted")),
        }
    }

    async fn publish_request(&self, call: &Call) -> Result<()> {
        if self.fail_publishes.load(Ordering::SeqCst) > 0 {
            self.fail_publishes.fetch_sub(1, Ordering::SeqCst);
            return Err(CumulusError::throttling("scripted publish failure"));
        }
        self.published.lock().push(call.clone());

        let handler = self.publish_handler.lock().clone();
        if let Some(handler) = handler {
            let deliveries = handler(call);
            let queue = self.queue.clone();
            tokio::spawn(async move {
                for (delay, message) in deliveries {
                    tokio::time::sleep(delay).await;
                    match message.encode() {
                        Ok(raw) => queue.push(raw),
                        Err(err) => warn!(error = %err, "scripted delivery failed to encode"),
                    }
                }
            });
        }
        Ok(())
    }

    async fn poll_response_queue(&self) -> Result<PollResult> {
        Ok(self.queue.pull_batch().await)
    }

    async fn publish_control(&self, kind: ControlKind) -> Result<()> {
        match kind {
            ControlKind::StopQueue => self.enqueue(QueueMessage::StopQueue),
        }
    }

    fn response_queue_id(&self) -> Option<String> {
        self.resources.response_queue_id.clone()
    }

    fn log_url(&self) -> Option<String> {
        Some(format!(
            "https://logs.example.com/{}",
            self.resources.name
        ))
    }

    async fn poll_logs(&self, start_time: i64) -> Result<Vec<LogEvent>> {
        let page = self.log_pages.lock().pop_front().unwrap_or_default();
        Ok(page
            .into_iter()
            .filter(|event| event.timestamp >= start_time)
            .collect())
    }

    async fn list_residual_resources(&self) -> Result<Vec<ResourceCandidate>> {
        Ok(self.residual.lock().clone())
    }

    fn resources_from_name(&self, name: &str) -> Option<Resources> {
        name.starts_with(RESOURCE_NAME_PREFIX)
            .then(|| Resources::named(name))
    }

    async fn delete_resources(&self, resources: &Resources) -> Result<()> {
        if self.fail_deletions.load(Ordering::SeqCst) {
            return Err(CumulusError::server_error("scripted deletion failure"));
        }
        self.deleted.lock().push(resources.name.clone());
        Ok(())
    }
}
