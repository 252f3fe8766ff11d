//! End-to-end scenarios against the scripted in-process driver
//!
//! Each test drives a full [`Instance`] (engine, funnel, reconciler, stats)
//! with provider behavior scripted per scenario: sync returns, queued
//! delivery with function-started notifications, dead letters, transient
//! failures, tail-latency speculation, and shutdown.

use cumulus::config::{InstanceOptions, Mode};
use cumulus::error::CumulusError;
use cumulus::instance::{CleanupOptions, Instance};
use cumulus::message::{QueueMessage, ReturnPayload};
use cumulus::queue::ReconcilerPhase;
use cumulus::testing::ScriptedDriver;
use cumulus::UserError;
use cumulus::ProviderDriver;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Honor `RUST_LOG` when a test needs tracing output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

fn options(mode: Mode) -> InstanceOptions {
    InstanceOptions {
        mode,
        gc: false,
        ..Default::default()
    }
}

fn response_message(call_id: &str, value: serde_json::Value, exec_ms: f64) -> QueueMessage {
    let start = now_ms();
    let payload =
        ReturnPayload::returned(call_id, value).with_timings(start, start + exec_ms);
    QueueMessage::Response {
        call_id: call_id.to_string(),
        body: serde_json::to_string(&payload).expect("payload serializes"),
    }
}

// Scenario A: sync path resolves and counts.
#[tokio::test(start_paused = true)]
async fn sync_invocation_resolves_and_counts() {
    init_tracing();
    let driver = ScriptedDriver::https_mode();
    driver.on_invoke_sync(|call| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let start = now_ms();
        Ok(Some(
            ReturnPayload::returned(call.call_id, json!("hello world"))
                .with_timings(start, start + 50.0),
        ))
    });

    let instance = Instance::initialize(driver, options(Mode::Https))
        .await
        .unwrap();
    let value = instance.invoke("hello", json!(["world"])).await.unwrap();
    assert_eq!(value, json!("hello world"));

    let counters = instance.function_counters("hello");
    assert_eq!(counters.invocations, 1);
    assert_eq!(counters.completed, 1);
    assert_eq!(counters.errors, 0);
    assert_eq!(instance.function_stats("hello").execution_time.samples(), 1);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

// Scenario B: queued call observes functionstarted, then the response.
#[tokio::test(start_paused = true)]
async fn queued_function_started_then_response() {
    let driver = ScriptedDriver::queue_mode();
    driver.on_publish(|call| {
        vec![
            (
                Duration::from_millis(100),
                QueueMessage::FunctionStarted {
                    call_id: call.call_id.clone(),
                    timestamp: Some(now_ms()),
                },
            ),
            (
                Duration::from_millis(500),
                response_message(&call.call_id, json!(42), 300.0),
            ),
        ]
    });

    let instance = Instance::initialize(driver, options(Mode::Queue))
        .await
        .unwrap();
    let value = instance.invoke("compute", json!([6, 7])).await.unwrap();
    assert_eq!(value, json!(42));

    let stats = instance.function_stats("compute");
    // Recorded once by the functionstarted notification, not again at
    // completion.
    assert_eq!(stats.remote_start_latency.samples(), 1);
    assert_eq!(stats.execution_time.samples(), 1);

    let counters = instance.function_counters("compute");
    assert_eq!(counters.completed, 1);
    assert_eq!(counters.errors, 0);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

// Scenario C: a dead letter fails the call without retrying.
#[tokio::test(start_paused = true)]
async fn dead_letter_fails_without_retry() {
    let driver = ScriptedDriver::queue_mode();
    driver.on_publish(|call| {
        vec![(
            Duration::from_millis(20),
            QueueMessage::DeadLetter {
                call_id: call.call_id.clone(),
                message: Some("handler crashed during init".into()),
            },
        )]
    });

    let instance = Instance::initialize(driver, options(Mode::Queue))
        .await
        .unwrap();

    let err = instance.invoke("doomed", json!([])).await.unwrap_err();
    assert!(matches!(err, CumulusError::DeadLetter(_)));
    assert!(err.to_string().contains("handler crashed"));

    let counters = instance.function_counters("doomed");
    assert_eq!(counters.errors, 1);
    assert_eq!(counters.completed, 0);
    // maxRetries is 2, but a dead letter is never retried.
    assert_eq!(counters.retries, 0);
    assert_eq!(counters.invocations, 1);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

// Scenario D: transient sync failures retry until success.
#[tokio::test(start_paused = true)]
async fn transient_sync_failures_retry_until_success() {
    let driver = ScriptedDriver::https_mode();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_seen = Arc::clone(&attempts);
    driver.on_invoke_sync(move |call| {
        let attempts = Arc::clone(&attempts_seen);
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(CumulusError::server_error("503 from provider"));
            }
            Ok(Some(ReturnPayload::returned(call.call_id, json!("ok"))))
        }
    });

    let instance = Instance::initialize(driver, options(Mode::Https))
        .await
        .unwrap();
    let value = instance.invoke("flaky", json!([])).await.unwrap();
    assert_eq!(value, json!("ok"));

    let counters = instance.function_counters("flaky");
    assert_eq!(counters.retries, 2);
    assert_eq!(counters.completed, 1);
    assert_eq!(counters.errors, 0);
    assert_eq!(counters.invocations, 3);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

// A fatal sync failure is surfaced immediately.
#[tokio::test(start_paused = true)]
async fn fatal_sync_failure_not_retried() {
    let driver = ScriptedDriver::https_mode();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_seen = Arc::clone(&attempts);
    driver.on_invoke_sync(move |_call| {
        let attempts = Arc::clone(&attempts_seen);
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(CumulusError::authentication("credentials rejected"))
        }
    });

    let instance = Instance::initialize(driver, options(Mode::Https))
        .await
        .unwrap();
    let err = instance.invoke("denied", json!([])).await.unwrap_err();
    assert!(matches!(
        err,
        CumulusError::Transport { .. }
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(instance.function_counters("denied").errors, 1);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

// A remote user error carries name, message, and the provider log URL.
#[tokio::test(start_paused = true)]
async fn user_error_preserved_with_log_url() {
    let driver = ScriptedDriver::https_mode();
    driver.on_invoke_sync(|call| async move {
        let mut payload = ReturnPayload::failed(
            call.call_id,
            UserError::new("RangeError", "index out of bounds")
                .with_stack("at work (handler.js:3:9)"),
        );
        payload.log_url = Some("https://logs.example.com/exec/123".into());
        Ok(Some(payload))
    });

    let instance = Instance::initialize(driver, options(Mode::Https))
        .await
        .unwrap();
    let err = instance.invoke("broken", json!([])).await.unwrap_err();
    match &err {
        CumulusError::User(user) => {
            assert_eq!(user.name, "RangeError");
            assert_eq!(user.stack.as_deref(), Some("at work (handler.js:3:9)"));
        }
        other => panic!("expected user error, got {:?}", other),
    }
    assert_eq!(err.log_url(), Some("https://logs.example.com/exec/123"));

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

// Scenario E: speculative retry issues a second attempt and the first
// terminal response wins.
#[tokio::test(start_paused = true)]
async fn speculative_retry_first_response_wins() {
    let driver = ScriptedDriver::queue_mode();
    let published = Arc::new(AtomicUsize::new(0));
    let published_seen = Arc::clone(&published);
    driver.on_publish(move |call| {
        match published_seen.fetch_add(1, Ordering::SeqCst) {
            // Priming traffic: quick responses with steady 100ms timings,
            // enough history to arm the speculative trigger.
            0..=4 => vec![(
                Duration::from_millis(10),
                response_message(&call.call_id, json!("primed"), 100.0),
            )],
            // The straggler: its first attempt hangs forever.
            5 => Vec::new(),
            // The speculative duplicate lands promptly.
            _ => vec![(
                Duration::from_millis(20),
                response_message(&call.call_id, json!("rescued"), 100.0),
            )],
        }
    });

    let driver = Arc::new(driver);
    let instance = Instance::initialize_shared(
        Arc::clone(&driver) as Arc<dyn ProviderDriver>,
        options(Mode::Queue),
    )
    .await
    .unwrap();

    for _ in 0..5 {
        instance.invoke("slow", json!([])).await.unwrap();
    }
    let primed = instance.function_counters("slow");
    assert_eq!(primed.completed, 5);

    let value = instance.invoke("slow", json!([])).await.unwrap();
    assert_eq!(value, json!("rescued"));

    let calls = driver.published_calls();
    assert_eq!(calls.len(), 7);
    let straggler_ids: HashSet<&str> =
        calls[5..].iter().map(|c| c.call_id.as_str()).collect();
    assert_eq!(
        straggler_ids.len(),
        2,
        "speculative attempt must use a fresh call id"
    );

    let counters = instance.function_counters("slow");
    assert_eq!(counters.invocations - primed.invocations, 2);
    assert_eq!(counters.retries - primed.retries, 1);
    assert_eq!(counters.completed - primed.completed, 1);
    assert_eq!(counters.errors, 0);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

// Queued timeout consumes the retry budget, then a reissued attempt lands.
#[tokio::test(start_paused = true)]
async fn queued_timeout_retries_then_succeeds() {
    let driver = ScriptedDriver::queue_mode();
    let published = Arc::new(AtomicUsize::new(0));
    let published_seen = Arc::clone(&published);
    driver.on_publish(move |call| {
        if published_seen.fetch_add(1, Ordering::SeqCst) == 0 {
            // First attempt is lost in transit.
            Vec::new()
        } else {
            vec![(
                Duration::from_millis(30),
                response_message(&call.call_id, json!("second time lucky"), 40.0),
            )]
        }
    });

    let instance = Instance::initialize(
        driver,
        InstanceOptions {
            mode: Mode::Queue,
            timeout_secs: 1,
            gc: false,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let value = instance.invoke("lossy", json!([])).await.unwrap();
    assert_eq!(value, json!("second time lucky"));

    let counters = instance.function_counters("lossy");
    assert_eq!(counters.invocations, 2);
    assert_eq!(counters.retries, 1);
    assert_eq!(counters.completed, 1);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

// A queued call that never answers times out for good once the budget is
// spent.
#[tokio::test(start_paused = true)]
async fn queued_timeout_exhausts_budget() {
    let driver = ScriptedDriver::queue_mode();
    driver.on_publish(|_| Vec::new());

    let instance = Instance::initialize(
        driver,
        InstanceOptions {
            mode: Mode::Queue,
            timeout_secs: 1,
            max_retries: 1,
            gc: false,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let err = instance.invoke("void", json!([])).await.unwrap_err();
    assert!(matches!(err, CumulusError::FunctionTimeout { .. }));

    let counters = instance.function_counters("void");
    assert_eq!(counters.invocations, 2);
    assert_eq!(counters.retries, 1);
    assert_eq!(counters.errors, 1);
    assert_eq!(counters.completed, 0);
    assert_eq!(instance.pending_count(), 0);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

// Scenario F: cleanup cancels everything outstanding and drains the
// reconciler.
#[tokio::test(start_paused = true)]
async fn cleanup_cancels_outstanding_calls() {
    init_tracing();
    let driver = ScriptedDriver::queue_mode();
    driver.on_publish(|_| Vec::new());

    let instance = Arc::new(
        Instance::initialize(driver, options(Mode::Queue))
            .await
            .unwrap(),
    );

    let mut calls = Vec::new();
    for i in 0..5 {
        let instance = Arc::clone(&instance);
        calls.push(tokio::spawn(async move {
            instance.invoke("stuck", json!([i])).await
        }));
    }
    // Let every call publish before shutting down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(instance.pending_count(), 5);

    instance.cleanup(CleanupOptions::default()).await.unwrap();

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CumulusError::Cancelled));
        assert_eq!(err.to_string(), "Rejected pending request");
    }

    let counters = instance.function_counters("stuck");
    assert_eq!(counters.completed, 0);
    assert_eq!(counters.errors, 5);
    assert_eq!(instance.pending_count(), 0);
    assert_eq!(instance.reconciler_phase(), Some(ReconcilerPhase::Stopped));
}

// Call ids are unique across every attempt an instance issues.
#[tokio::test(start_paused = true)]
async fn call_ids_are_pairwise_distinct() {
    let driver = ScriptedDriver::queue_mode();
    driver.on_publish(|call| {
        vec![(
            Duration::from_millis(5),
            response_message(&call.call_id, json!(null), 10.0),
        )]
    });

    let driver = Arc::new(driver);
    let instance = Arc::new(
        Instance::initialize_shared(Arc::clone(&driver) as Arc<dyn ProviderDriver>, options(Mode::Queue))
            .await
            .unwrap(),
    );

    let mut calls = Vec::new();
    for i in 0..25 {
        let instance = Arc::clone(&instance);
        calls.push(tokio::spawn(async move {
            instance.invoke("unique", json!([i])).await
        }));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }

    let ids: Vec<String> = driver
        .published_calls()
        .into_iter()
        .map(|c| c.call_id)
        .collect();
    let distinct: HashSet<&String> = ids.iter().collect();
    assert_eq!(distinct.len(), ids.len());

    let counters = instance.counters();
    assert_eq!(counters.completed, 25);
    assert!(counters.completed + counters.errors <= counters.invocations);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

// Transient publish failures are retried inside the attempt budget.
#[tokio::test(start_paused = true)]
async fn transient_publish_failure_retried() {
    let driver = ScriptedDriver::queue_mode();
    driver.fail_next_publishes(1);
    driver.on_publish(|call| {
        vec![(
            Duration::from_millis(5),
            response_message(&call.call_id, json!("delivered"), 10.0),
        )]
    });

    let instance = Instance::initialize(driver, options(Mode::Queue))
        .await
        .unwrap();
    let value = instance.invoke("retry-publish", json!([])).await.unwrap();
    assert_eq!(value, json!("delivered"));

    let counters = instance.function_counters("retry-publish");
    assert_eq!(counters.retries, 1);
    assert_eq!(counters.completed, 1);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}
