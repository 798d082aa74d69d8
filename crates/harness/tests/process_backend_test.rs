// End-to-end tests for the process backend
//
// Every worker is a real `workerfarm-child` process speaking base64 frame
// lines over its stdio.

use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use workerfarm::{BackendKind, BusEvent, Farm, FarmError, FarmOptions, Value};
use workerfarm_harness::{registry, FIXTURE, MISSING_SHARED};

// =============================================================================
// Fixtures
// =============================================================================

fn options(workers: usize) -> FarmOptions {
    FarmOptions::new(FIXTURE)
        .with_max_concurrent_workers(workers)
        .with_backend(BackendKind::Process)
        .with_child_executable(env!("CARGO_BIN_EXE_workerfarm-child"))
        .with_forced_kill_time(Duration::from_secs(2))
}

fn farm(workers: usize) -> Farm {
    Farm::new(options(workers), registry()).unwrap()
}

fn marker() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("workerfarm-crash-{}", uuid::Uuid::now_v7()))
}

// =============================================================================
// Calls
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_echoes() {
    let farm = farm(2);
    assert_eq!(farm.run(vec![json!(5)]).await.unwrap(), json!(5));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_thousand_concurrent_calls() {
    let farm = farm(2);
    let calls = (0..1000).map(|i| {
        let farm = farm.clone();
        async move { farm.run(vec![json!(i)]).await }
    });

    for (i, result) in join_all(calls).await.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(i));
    }
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_calls_run_in_other_processes() {
    let farm = farm(1);
    let pid = farm.call("pid", vec![]).await.unwrap();
    assert_ne!(pid, json!(std::process::id()));
    farm.end().await.unwrap();
}

// =============================================================================
// Handles and shared references
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reverse_handle_crosses_the_process_boundary() {
    let farm = farm(1);
    let handle = farm.create_reverse_handle(|_args: Vec<Value>| async move { Ok(json!(42)) });

    let value = farm.call("invoke", vec![handle.to_value()]).await.unwrap();
    assert_eq!(value, json!(42));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_reference_read_and_dispose() {
    let farm = farm(2);
    let shared = farm.create_shared_reference(json!("X")).await.unwrap();
    let id = shared.to_value();

    assert_eq!(farm.call("readShared", vec![id.clone()]).await.unwrap(), json!("X"));

    shared.dispose().await.unwrap();
    assert_eq!(
        farm.call("readShared", vec![id]).await.unwrap(),
        json!(MISSING_SHARED)
    );
    farm.end().await.unwrap();
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashed_process_call_is_retried() {
    let farm = farm(1);
    let first_pid = farm.call("pid", vec![]).await.unwrap();
    let marker = marker();

    let value = farm
        .call("crashOnce", vec![json!("survived"), json!(marker.to_string_lossy())])
        .await
        .unwrap();

    assert_eq!(value["value"], json!("survived"));
    assert_ne!(value["pid"], first_pid);
    let _ = std::fs::remove_file(&marker);
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closed_output_call_is_retried() {
    let farm = farm(1);
    let first_pid = farm.call("pid", vec![]).await.unwrap();
    let marker = marker();

    let value = tokio::time::timeout(
        Duration::from_secs(20),
        farm.call(
            "closeOutputOnce",
            vec![json!("survived"), json!(marker.to_string_lossy())],
        ),
    )
    .await
    .expect("call hung after the executor closed its output")
    .unwrap();

    assert_eq!(value["value"], json!("survived"));
    assert_ne!(value["pid"], first_pid);

    let stats = farm.stats().await;
    assert_eq!(stats.inflight_calls, 0);
    assert_eq!(stats.queued_calls, 0);
    let _ = std::fs::remove_file(&marker);
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashing_call_exhausts_retries() {
    let farm = Farm::new(options(1).with_max_call_retries(2), registry()).unwrap();

    let err = tokio::time::timeout(Duration::from_secs(30), farm.call("crash", vec![]))
        .await
        .expect("retries were not bounded")
        .unwrap_err();
    match err {
        FarmError::RetriesExhausted { method, retries, .. } => {
            assert_eq!(method, "crash");
            assert_eq!(retries, 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    // The pool settles on one fresh worker that still serves calls
    assert_eq!(farm.run(vec![json!(3)]).await.unwrap(), json!(3));
    let stats = farm.stats().await;
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.queued_calls, 0);
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_logs_reach_the_bus() {
    let farm = farm(1);
    let mut events = farm.subscribe();

    farm.call("log", vec![json!("hello from a process")])
        .await
        .unwrap();

    let log = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(BusEvent::Log(log)) if log.message == "hello from a process" => break log,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("bus closed"),
            }
        }
    })
    .await
    .unwrap();
    assert!(log.child_id.is_some());
    farm.end().await.unwrap();
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_after_end_started_rejects() {
    let farm = farm(1);
    farm.run(vec![json!(0)]).await.unwrap();

    let slow = tokio::spawn({
        let farm = farm.clone();
        async move { farm.call("slow", vec![json!("done")]).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ending = tokio::spawn({
        let farm = farm.clone();
        async move { farm.end().await }
    });
    while !farm.is_ending() {
        tokio::task::yield_now().await;
    }

    let err = farm.run(vec![json!(1)]).await.unwrap_err();
    assert!(err.is_ending());

    assert_eq!(slow.await.unwrap().unwrap(), json!("done"));
    ending.await.unwrap().unwrap();
    assert_eq!(farm.stats().await.workers, 0);
}
