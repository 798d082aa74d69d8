//! Executor runtime
//!
//! Runs inside every worker, whatever the backend. It owns one module
//! instance, the executor's handle table and its shared reference mirror.
//!
//! Requests are started in arrival order on a single task. Control methods
//! run inline, so a shared reference sent before a call is always visible to
//! that call. Module methods, handles and `childInit` run as futures that
//! interleave at their await points; several may be outstanding at once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use workerfarm_protocol::diagnostic::kind;
use workerfarm_protocol::{
    methods, BusEvent, CallIdx, ChildId, Diagnostic, Frame, Message, Request, Response,
    SharedRefId, Target, Value,
};

use crate::api::WorkerApi;
use crate::module::{ModuleRegistry, WorkerModule};
use crate::profiler::{MemorySnapshot, Profiler};

mod host;
pub mod process;

pub(crate) use host::ChildHost;
pub use process::{is_child_process, run_process_child, CHILD_ENV, CHILD_ID_ENV};

enum ModuleState {
    Pending,
    Ready(Arc<WorkerModule>),
    Failed(Diagnostic),
}

/// The request loop of one executor
pub struct ChildRuntime {
    child_id: ChildId,
    registry: ModuleRegistry,
    bus_events: Option<mpsc::UnboundedReceiver<BusEvent>>,
}

impl ChildRuntime {
    pub fn new(child_id: ChildId, registry: ModuleRegistry) -> Self {
        Self {
            child_id,
            registry,
            bus_events: None,
        }
    }

    /// Relay events from this receiver to the coordinator's bus
    pub fn with_bus_events(mut self, events: mpsc::UnboundedReceiver<BusEvent>) -> Self {
        self.bus_events = Some(events);
        self
    }

    /// Serve requests until `Die` arrives or the inbound channel closes
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<Frame>, outbound: mpsc::UnboundedSender<Frame>) {
        let host = Arc::new(ChildHost::new(self.child_id, outbound));
        let (module, _) = watch::channel(ModuleState::Pending);
        let executor = Arc::new(Executor {
            child_id: self.child_id,
            api: WorkerApi::new(host.clone()),
            host,
            registry: self.registry,
            module,
            profiler: Mutex::new(Profiler::default()),
        });

        let mut running: FuturesUnordered<BoxFuture<'static, Option<Response>>> =
            FuturesUnordered::new();
        let mut bus_events = self
            .bus_events
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        let mut bus_open = true;

        debug!(child_id = %self.child_id, "Executor started");

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(Frame::Message(Message::Request(request))) => {
                        if let Some(task) = executor.handle_request(request) {
                            running.push(task);
                        }
                    }
                    Some(Frame::Message(Message::Response(response))) => {
                        executor.host.resolve(response);
                    }
                    Some(Frame::Die) | None => break,
                    Some(other) => trace!(frame = ?other, "Ignoring control frame"),
                },
                Some(response) = running.next(), if !running.is_empty() => {
                    if let Some(response) = response {
                        executor.host.send(response);
                    }
                }
                event = bus_events.recv(), if bus_open => match event {
                    Some(event) => executor.host.forward_bus_event(event),
                    None => bus_open = false,
                },
            }
        }

        drop(running);
        executor.host.fail_pending();
        // Handles may capture the API, which keeps the outbound channel alive
        executor.host.handles.clear();
        debug!(child_id = %self.child_id, "Executor stopped");
    }
}

struct Executor {
    child_id: ChildId,
    host: Arc<ChildHost>,
    api: WorkerApi,
    registry: ModuleRegistry,
    module: watch::Sender<ModuleState>,
    profiler: Mutex<Profiler>,
}

fn respond(
    idx: CallIdx,
    child_id: Option<ChildId>,
    await_response: bool,
    result: Result<Value, Diagnostic>,
) -> Option<Response> {
    await_response.then(|| Response {
        idx,
        child_id,
        content: result.into(),
    })
}

impl Executor {
    /// Handle control requests inline; return a future for everything else
    fn handle_request(
        self: &Arc<Self>,
        request: Request,
    ) -> Option<BoxFuture<'static, Option<Response>>> {
        let Request {
            idx,
            child_id,
            target,
            args,
            await_response,
            warmup,
        } = request;

        let inline = |result: Result<Value, Diagnostic>| {
            if let Some(response) = respond(idx, child_id, await_response, result) {
                self.host.send(response);
            }
            None
        };

        match target {
            Target::Handle(handle) => {
                if !self.host.handles.owns(&handle) {
                    return inline(Err(Diagnostic::new(format!(
                        "{} is owned by {}, not {}",
                        handle.id,
                        handle
                            .child_id
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "the coordinator".to_string()),
                        self.child_id
                    ))
                    .with_kind(kind::UNKNOWN_HANDLE)));
                }
                let executor = self.clone();
                Some(Box::pin(async move {
                    let result = executor.host.handles.run(&handle, args).await;
                    respond(idx, child_id, await_response, result)
                }))
            }
            Target::Master { location, method } => inline(Err(Diagnostic::new(format!(
                "executor cannot serve master call {location}.{method}"
            )))),
            Target::Method(method) => match method.as_str() {
                methods::CHILD_INIT => {
                    let executor = self.clone();
                    Some(Box::pin(async move {
                        let result = executor.init(args).await;
                        respond(idx, child_id, await_response, result)
                    }))
                }
                methods::CREATE_SHARED_REFERENCE => inline(self.create_shared_reference(args)),
                methods::DELETE_SHARED_REFERENCE => inline(self.delete_shared_reference(&args)),
                methods::START_PROFILE => {
                    self.profiler.lock().start();
                    inline(Ok(Value::Null))
                }
                methods::END_PROFILE => {
                    let profile = self.profiler.lock().finish(Some(self.child_id));
                    inline(serde_json::to_value(profile).map_err(Diagnostic::from))
                }
                methods::TAKE_HEAP_SNAPSHOT => {
                    let executor = self.clone();
                    Some(Box::pin(async move {
                        let result = executor.take_heap_snapshot(args).await;
                        respond(idx, child_id, await_response, result)
                    }))
                }
                _ => {
                    let executor = self.clone();
                    Some(Box::pin(async move {
                        let result = executor.invoke(&method, args, warmup).await;
                        respond(idx, child_id, await_response, result)
                    }))
                }
            },
        }
    }

    /// `childInit(workerPath, childId, shouldTrace)`
    async fn init(&self, args: Vec<Value>) -> Result<Value, Diagnostic> {
        let worker_path = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Diagnostic::new("childInit requires a worker path"))?
            .to_string();
        let should_trace = args.get(2).and_then(Value::as_bool).unwrap_or(false);
        self.host.set_should_trace(should_trace);

        if matches!(*self.module.borrow(), ModuleState::Ready(_)) {
            return Ok(Value::Null);
        }

        let loaded = match self.registry.create(&worker_path) {
            Ok(module) => match module.init(self.api.clone()).await {
                Ok(()) => Ok(Arc::new(module)),
                Err(diagnostic) => Err(diagnostic),
            },
            Err(e) => Err(Diagnostic::new(e.to_string()).with_kind(kind::NOT_INITIALIZED)),
        };

        match loaded {
            Ok(module) => {
                debug!(child_id = %self.child_id, worker_path = %worker_path, "Module loaded");
                self.module.send_replace(ModuleState::Ready(module));
                Ok(Value::Null)
            }
            Err(diagnostic) => {
                warn!(child_id = %self.child_id, error = %diagnostic, "Module failed to load");
                self.module.send_replace(ModuleState::Failed(diagnostic.clone()));
                Err(diagnostic)
            }
        }
    }

    async fn module(&self) -> Result<Arc<WorkerModule>, Diagnostic> {
        let mut rx = self.module.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, ModuleState::Pending))
            .await
            .map_err(|_| not_initialized())?;
        match &*state {
            ModuleState::Ready(module) => Ok(module.clone()),
            ModuleState::Failed(diagnostic) => Err(diagnostic.clone()),
            ModuleState::Pending => Err(not_initialized()),
        }
    }

    async fn invoke(&self, method: &str, args: Vec<Value>, warmup: bool) -> Result<Value, Diagnostic> {
        let module = self.module().await?;
        let started_at = Utc::now();
        let clock = Instant::now();

        let result = module.invoke(self.api.for_call(warmup), method, args).await;

        self.profiler
            .lock()
            .record(method, started_at, clock.elapsed(), result.is_ok());
        self.api.trace(method, started_at, clock.elapsed(), Value::Null);
        result
    }

    /// `createSharedReference(ref, value)`
    fn create_shared_reference(&self, args: Vec<Value>) -> Result<Value, Diagnostic> {
        let mut args = args.into_iter();
        let id: SharedRefId = serde_json::from_value(args.next().unwrap_or_default())?;
        let value = args.next().unwrap_or_default();
        self.host.shared.write().insert(id, value);
        trace!(child_id = %self.child_id, shared_ref = %id, "Shared reference stored");
        Ok(Value::Null)
    }

    /// `deleteSharedReference(ref)`
    fn delete_shared_reference(&self, args: &[Value]) -> Result<Value, Diagnostic> {
        let id: SharedRefId = serde_json::from_value(args.first().cloned().unwrap_or_default())?;
        self.host.shared.write().remove(id);
        Ok(Value::Null)
    }

    /// `takeHeapSnapshot(snapshotId, dir)`
    async fn take_heap_snapshot(&self, args: Vec<Value>) -> Result<Value, Diagnostic> {
        let snapshot_id = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("snapshot")
            .to_string();
        let dir = args
            .get(1)
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let child_id = self.child_id;
        let shared_references = self.host.shared.read().len();
        let handles = self.host.handles.len();

        let path = tokio::task::spawn_blocking(move || {
            MemorySnapshot::capture(snapshot_id, Some(child_id), shared_references, handles)
                .write_to(&dir)
        })
        .await
        .map_err(|e| Diagnostic::new(e.to_string()))?
        .map_err(|e| Diagnostic::new(format!("failed to write memory snapshot: {e}")))?;

        Ok(Value::String(path.display().to_string()))
    }
}

fn not_initialized() -> Diagnostic {
    Diagnostic::new("worker module is not initialized").with_kind(kind::NOT_INITIALIZED)
}

/// Run an executor on a dedicated OS thread with its own single-threaded runtime
pub(crate) fn spawn_executor_thread<F, Fut>(
    name: String,
    body: F,
) -> std::io::Result<std::thread::JoinHandle<()>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()>,
{
    std::thread::Builder::new().name(name).spawn(move || {
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime.block_on(body()),
            Err(e) => warn!(error = %e, "Failed to build executor runtime"),
        }
    })
}
