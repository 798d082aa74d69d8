// Integration tests for the worker farm on in-process backends
//
// Workers run on the thread backend; crash scenarios wrap it in a backend
// that drops requests and reports the executor as exited.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use workerfarm::backend::{BackendEvents, ThreadBackend};
use workerfarm::protocol::{Message, Target};
use workerfarm::{
    Backend, BackendContext, BackendError, BackendEvent, BackendFactory, BackendKind, BusEvent,
    Diagnostic, Farm, FarmError, FarmOptions, LogLevel, ModuleRegistry, SharedRefId, Value,
    WorkerModule,
};

// =============================================================================
// Fixtures
// =============================================================================

fn registry(order: Arc<Mutex<Vec<i64>>>) -> ModuleRegistry {
    ModuleRegistry::new().with_module("fixture", move || {
        let order = order.clone();
        WorkerModule::builder("fixture")
            .method("run", |_api, args| async move {
                Ok(args.into_iter().next().unwrap_or_default())
            })
            .method("where", |api, _args| async move { Ok(json!(api.child_id())) })
            .method("fail", |_api, _args| async move {
                Err(Diagnostic::new("boom").with_kind("fixture"))
            })
            .method("invoke", |api, args| async move {
                api.run_handle_value(&args[0], vec![]).await
            })
            .method("readShared", |api, args| async move {
                let id: SharedRefId = serde_json::from_value(args[0].clone())?;
                Ok(api
                    .get_shared_reference(id)
                    .unwrap_or_else(|| json!("Shared reference does not exist")))
            })
            .method("makeHandle", |api, _args| async move {
                let handle = api.create_reverse_handle(|args: Vec<Value>| async move {
                    let name = args.into_iter().next().unwrap_or_default();
                    Ok(json!(format!("hello {name}")))
                });
                Ok(handle.to_value())
            })
            .method("double", |api, args| async move {
                api.call_master("test", "double", args).await
            })
            .method("log", |api, _args| async move {
                api.log(LogLevel::Info, "fixture", "hello from a worker");
                Ok(Value::Null)
            })
            .method("slow", |_api, args| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(args.into_iter().next().unwrap_or_default())
            })
            .method("flaky", |_api, args| async move {
                Ok(args.into_iter().next().unwrap_or_default())
            })
            .method("record", move |_api, args| {
                let order = order.clone();
                async move {
                    let n = args[0].as_i64().unwrap_or_default();
                    order.lock().push(n);
                    Ok(json!(n))
                }
            })
            .build()
    })
}

fn options() -> FarmOptions {
    FarmOptions::new("fixture")
        .with_max_concurrent_workers(2)
        .with_backend(BackendKind::Threads)
        .with_forced_kill_time(Duration::from_millis(200))
}

fn farm(options: FarmOptions) -> Farm {
    Farm::builder(options, registry(Arc::default()))
        .master_function("test", "double", |args| async move {
            let n = args.first().and_then(Value::as_i64).unwrap_or_default();
            Ok(json!(n * 2))
        })
        .build()
        .unwrap()
}

/// Thread backend that loses `flaky` requests and reports an exit instead
struct CrashingBackend {
    inner: ThreadBackend,
    events: BackendEvents,
    crashes: Arc<AtomicUsize>,
    dead: AtomicBool,
}

#[async_trait]
impl Backend for CrashingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Threads
    }

    async fn start(&self) -> Result<(), BackendError> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.inner.stop().await
    }

    fn send(&self, message: Message) -> Result<(), BackendError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        let flaky = matches!(
            &message,
            Message::Request(request) if request.target == Target::method("flaky")
        );
        if flaky
            && self
                .crashes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            self.dead.store(true, Ordering::SeqCst);
            let _ = self.events.send(BackendEvent::Exit(Some(1)));
            return Ok(());
        }
        self.inner.send(message)
    }
}

struct CrashingFactory {
    crashes: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
}

impl BackendFactory for CrashingFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Threads
    }

    fn create(&self, context: BackendContext) -> Arc<dyn Backend> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(CrashingBackend {
            events: context.events.clone(),
            inner: ThreadBackend::new(context),
            crashes: self.crashes.clone(),
            dead: AtomicBool::new(false),
        })
    }
}

async fn wait_ready(farm: &Farm, workers: usize) {
    for _ in 0..200 {
        if farm.stats().await.ready_workers >= workers {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workers never became ready");
}

fn crashing_farm(options: FarmOptions, crashes: usize) -> (Farm, Arc<AtomicUsize>) {
    let created = Arc::new(AtomicUsize::new(0));
    let farm = Farm::builder(options, registry(Arc::default()))
        .backend_factory(CrashingFactory {
            crashes: Arc::new(AtomicUsize::new(crashes)),
            created: created.clone(),
        })
        .build()
        .unwrap();
    (farm, created)
}

// =============================================================================
// Calls
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_echoes() {
    let farm = farm(options());
    assert_eq!(farm.run(vec![json!(5)]).await.unwrap(), json!(5));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_thousand_concurrent_calls() {
    let farm = farm(options().with_max_concurrent_calls_per_worker(10));
    let calls = (0..1000).map(|i| {
        let farm = farm.clone();
        async move { (i, farm.run(vec![json!(i)]).await) }
    });

    for (i, result) in join_all(calls).await {
        assert_eq!(result.unwrap(), json!(i));
    }
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_calls_run_in_workers() {
    let farm = farm(options());
    let child = farm.call("where", vec![]).await.unwrap();
    assert!(child.as_u64().is_some(), "expected a child id, got {child}");
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_execution_error_reaches_the_caller() {
    let farm = farm(options());
    let err = farm.call("fail", vec![]).await.unwrap_err();
    let diagnostic = err.diagnostic().unwrap();
    assert_eq!(diagnostic.message, "boom");
    assert_eq!(diagnostic.origin.as_deref(), Some("fixture"));

    // The worker survives
    assert_eq!(farm.run(vec![json!(1)]).await.unwrap(), json!(1));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_method_fails_fast() {
    let farm = farm(options());
    let err = farm.call("nope", vec![]).await.unwrap_err();
    assert!(matches!(err, FarmError::UnknownMethod { .. }));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_arrival_order_with_one_slot() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let options = options()
        .with_max_concurrent_workers(1)
        .with_max_concurrent_calls_per_worker(1);
    let farm = Farm::new(options, registry(order.clone())).unwrap();

    let handle = farm.create_handle("record");
    let calls = (0..20).map(|i| {
        let handle = handle.clone();
        async move { handle.call(vec![json!(i)]).await }
    });
    for result in join_all(calls).await {
        result.unwrap();
    }

    assert_eq!(*order.lock(), (0..20).collect::<Vec<i64>>());
    farm.end().await.unwrap();
}

#[test]
fn test_unknown_module_fails_construction() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let err = Farm::new(FarmOptions::new("missing"), registry(Arc::default())).unwrap_err();
        assert!(matches!(err, FarmError::Registry(_)));

        let err = Farm::new(FarmOptions::default(), registry(Arc::default())).unwrap_err();
        assert!(matches!(err, FarmError::MissingWorkerPath));
    });
}

// =============================================================================
// Handles, shared references, master calls, bus
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reverse_handle_runs_in_the_coordinator() {
    let farm = farm(options());
    let handle = farm.create_reverse_handle(|_args| async move { Ok(json!(42)) });

    let result = farm.call("invoke", vec![handle.to_value()]).await.unwrap();
    assert_eq!(result, json!(42));

    assert!(farm.dispose_handle(&handle));
    let err = farm.call("invoke", vec![handle.to_value()]).await.unwrap_err();
    assert!(err
        .diagnostic()
        .is_some_and(|d| d.is_kind(workerfarm::protocol::diagnostic::kind::UNKNOWN_HANDLE)));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_handle_runs_in_its_owner() {
    let farm = farm(options());
    let value = farm.call("makeHandle", vec![]).await.unwrap();
    let handle = workerfarm::Handle::from_value(&value).unwrap();
    assert!(!handle.is_coordinator_owned());

    let result = farm.run_handle(&handle, vec![json!("farm")]).await.unwrap();
    assert_eq!(result, json!("hello \"farm\""));

    // Another worker, or the same one, reaches it through the coordinator
    let result = farm.call("invoke", vec![value]).await.unwrap();
    assert_eq!(result, json!("hello null"));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_reference_read_and_dispose() {
    let farm = farm(options());
    let shared = farm.create_shared_reference(json!("X")).await.unwrap();
    assert_eq!(farm.get_shared_reference(shared.id()), Some(json!("X")));
    assert_eq!(farm.resolve_shared_reference(&json!("X")), Some(shared.id()));

    let value = farm.call("readShared", vec![shared.to_value()]).await.unwrap();
    assert_eq!(value, json!("X"));

    let id = shared.id();
    shared.dispose().await.unwrap();
    let value = farm.call("readShared", vec![json!(id)]).await.unwrap();
    assert_eq!(value, json!("Shared reference does not exist"));
    assert_eq!(farm.get_shared_reference(id), None);
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_reference_reaches_replacement_workers() {
    let (farm, created) = crashing_farm(options().with_max_concurrent_workers(1), 1);
    let shared = farm.create_shared_reference(json!({"big": [1, 2, 3]})).await.unwrap();

    // The first worker dies on this call; its replacement serves the retry
    assert_eq!(farm.call("flaky", vec![json!(1)]).await.unwrap(), json!(1));
    assert_eq!(created.load(Ordering::SeqCst), 2);

    let value = farm.call("readShared", vec![shared.to_value()]).await.unwrap();
    assert_eq!(value, json!({"big": [1, 2, 3]}));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_master_function() {
    let farm = farm(options());
    assert_eq!(farm.call("double", vec![json!(21)]).await.unwrap(), json!(42));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_logs_reach_the_bus() {
    let farm = farm(options());
    let mut events = farm.subscribe();
    farm.call("log", vec![]).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        BusEvent::Log(log) => {
            assert_eq!(log.message, "hello from a worker");
            assert!(log.child_id.is_some());
        }
        other => panic!("unexpected {other:?}"),
    }
    farm.end().await.unwrap();
}

// =============================================================================
// Failures and retries
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashed_call_is_retried() {
    let (farm, created) = crashing_farm(options().with_max_concurrent_workers(1), 1);
    assert_eq!(farm.call("flaky", vec![json!(7)]).await.unwrap(), json!(7));
    assert_eq!(created.load(Ordering::SeqCst), 2);
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retries_are_bounded() {
    let (farm, _) = crashing_farm(options().with_max_call_retries(2), usize::MAX);
    let err = farm.call("flaky", vec![json!(7)]).await.unwrap_err();
    match err {
        FarmError::RetriesExhausted { method, retries, .. } => {
            assert_eq!(method, "flaky");
            assert_eq!(retries, 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Other calls still work
    assert_eq!(farm.run(vec![json!(1)]).await.unwrap(), json!(1));
    farm.end().await.unwrap();
}

// =============================================================================
// Local path and warm-up
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_only_farm() {
    let farm = farm(options().with_max_concurrent_workers(0));
    assert_eq!(farm.call("where", vec![]).await.unwrap(), Value::Null);
    assert_eq!(farm.run(vec![json!("local")]).await.unwrap(), json!("local"));
    assert_eq!(farm.stats().await.workers, 0);
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_warm_workers_take_over_from_local() {
    let farm = farm(options().with_warm_workers(true));
    assert_eq!(farm.call("where", vec![]).await.unwrap(), Value::Null);

    // Warm-up copies land on the pool until every worker has served one
    let mut remote = Value::Null;
    for _ in 0..200 {
        remote = farm.call("where", vec![]).await.unwrap();
        if !remote.is_null() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(remote.as_u64().is_some());
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_and_remote_agree() {
    let local = farm(options().with_max_concurrent_workers(0));
    let remote = farm(options());
    let args = vec![json!({"nested": [1, "two", null]})];
    assert_eq!(
        local.run(args.clone()).await.unwrap(),
        remote.run(args).await.unwrap()
    );
    local.end().await.unwrap();
    remote.end().await.unwrap();
}

// =============================================================================
// Profiling, snapshots, stats
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_profile_covers_workers() {
    let farm = farm(options());
    wait_ready(&farm, 2).await;

    farm.start_profile().await.unwrap();
    for i in 0..4 {
        farm.run(vec![json!(i)]).await.unwrap();
    }
    let profiles = farm.end_profile().await.unwrap();

    let samples: usize = profiles.iter().map(|p| p.samples.len()).sum();
    assert_eq!(samples, 4);
    // The coordinator profiles too but served nothing
    assert_eq!(profiles.iter().filter(|p| p.child_id.is_some()).count(), 2);
    assert!(profiles
        .iter()
        .filter(|p| p.child_id.is_none())
        .all(|p| p.samples.is_empty()));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heap_snapshot_writes_reports() {
    let farm = farm(options());
    farm.run(vec![json!(0)]).await.unwrap();
    let dir = std::env::temp_dir().join(format!("workerfarm-{}", uuid::Uuid::now_v7()));

    let paths = farm.take_heap_snapshot(&dir).await.unwrap();
    assert!(!paths.is_empty());
    for path in &paths {
        assert!(path.exists(), "{} missing", path.display());
    }

    let _ = std::fs::remove_dir_all(&dir);
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stats() {
    let farm = farm(options());
    farm.run(vec![json!(0)]).await.unwrap();
    farm.create_shared_reference(json!(1)).await.unwrap();

    let stats = farm.stats().await;
    assert_eq!(stats.backend, BackendKind::Threads);
    assert_eq!(stats.workers, 2);
    assert!(stats.warm_workers >= 1);
    assert_eq!(stats.queued_calls, 0);
    assert_eq!(stats.shared_references, 1);
    farm.end().await.unwrap();
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_after_end_rejects() {
    let farm = farm(options());
    farm.run(vec![json!(1)]).await.unwrap();
    farm.end().await.unwrap();

    let err = farm.run(vec![json!(1)]).await.unwrap_err();
    assert!(err.is_ending());
    assert!(farm
        .create_shared_reference(json!(1))
        .await
        .unwrap_err()
        .is_ending());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_is_idempotent_and_empties_the_pool() {
    let farm = farm(options());
    farm.run(vec![json!(1)]).await.unwrap();

    let (a, b) = tokio::join!(farm.end(), farm.end());
    a.unwrap();
    b.unwrap();
    farm.end().await.unwrap();

    let stats = farm.stats().await;
    assert_eq!(stats.workers, 0);
    assert_eq!(stats.handles, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_drains_in_flight_calls() {
    let farm = farm(options());
    farm.run(vec![json!(0)]).await.unwrap();

    let slow = tokio::spawn({
        let farm = farm.clone();
        async move { farm.call("slow", vec![json!("done")]).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    farm.end().await.unwrap();

    assert_eq!(slow.await.unwrap().unwrap(), json!("done"));
}
