//! Coordinator
//!
//! A [`Farm`] owns a pool of executors behind one backend and a FIFO call
//! queue. Calls run either in the pool or, while workers warm up, in the
//! coordinator itself through the same module.
//!
//! All queue and pool state lives in a dispatcher task; the farm talks to it
//! through commands. Cloning a farm is cheap and every clone drives the same
//! pool. The farm ends when [`Farm::end`] is called or the last clone is
//! dropped.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use workerfarm_protocol::diagnostic::kind;
use workerfarm_protocol::{methods, BusEvent, ChildId, Diagnostic, Handle, SharedRefId, Value};

use crate::backend::{select_backend, BackendEnvironment, BackendFactory, StandardBackendFactory};
use crate::bus::{Bus, MasterRegistry, DEFAULT_BUS_CAPACITY};
use crate::config::{BackendKind, FarmOptions};
use crate::error::{FarmError, Result};
use crate::handles::handle_fn;
use crate::module::ModuleRegistry;
use crate::profiler::{MemorySnapshot, Profile};
use crate::worker::Call;

mod cell;
mod dispatcher;
mod local;
mod services;

pub use cell::FarmCell;
pub(crate) use dispatcher::Command;
pub(crate) use services::Services;

use dispatcher::{Acks, Dispatcher, Gauges};
use local::LocalExecutor;

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmStats {
    pub backend: BackendKind,
    /// Workers not stopping
    pub workers: usize,
    pub ready_workers: usize,
    /// Ready workers that completed at least one call
    pub warm_workers: usize,
    pub queued_calls: usize,
    pub inflight_calls: usize,
    pub shared_references: usize,
    /// Coordinator-owned handles
    pub handles: usize,
}

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`Farm`]
pub struct FarmBuilder {
    options: FarmOptions,
    registry: ModuleRegistry,
    backend_factory: Option<Arc<dyn BackendFactory>>,
    master: MasterRegistry,
    bus_capacity: usize,
}

impl FarmBuilder {
    pub fn new(options: FarmOptions, registry: ModuleRegistry) -> Self {
        Self {
            options,
            registry,
            backend_factory: None,
            master: MasterRegistry::new(),
            bus_capacity: DEFAULT_BUS_CAPACITY,
        }
    }

    /// Use a custom backend factory instead of the detected backend
    pub fn backend_factory(mut self, factory: impl BackendFactory + 'static) -> Self {
        self.backend_factory = Some(Arc::new(factory));
        self
    }

    /// Register a function executors can reach with `callMaster`
    pub fn master_function<F, Fut>(
        self,
        location: impl Into<String>,
        method: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Diagnostic>> + Send + 'static,
    {
        self.master.register(location, method, f);
        self
    }

    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    /// Validate the options, load the module once and start the pool
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<Farm> {
        self.options.validate()?;
        let worker_path = self
            .options
            .worker_path
            .clone()
            .ok_or(FarmError::MissingWorkerPath)?;
        let module = self.registry.create(&worker_path)?;
        let methods: HashSet<String> = module
            .method_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            FarmError::configuration("a worker farm must be built inside a Tokio runtime")
        })?;

        let options = self.options;
        let factory = self.backend_factory.unwrap_or_else(|| {
            let kind = options
                .backend
                .unwrap_or_else(|| select_backend(&BackendEnvironment::probe()));
            Arc::new(StandardBackendFactory::new(kind))
        });
        let backend = factory.kind();

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let services = Services::new(self.master, Bus::new(self.bus_capacity), commands);
        let gauges = Arc::new(Gauges::default());
        if options.allows_remote_workers() {
            // The pool is started eagerly; count it before the dispatcher runs
            gauges
                .pool_size
                .store(options.max_concurrent_workers, Ordering::Relaxed);
        }
        let local = LocalExecutor::new(
            worker_path.clone(),
            self.registry.clone(),
            services.clone(),
            options.should_trace,
        );
        let dispatcher = Dispatcher::new(
            options.clone(),
            worker_path.clone(),
            self.registry,
            factory,
            services.clone(),
            gauges.clone(),
        );
        runtime.spawn(dispatcher.run(commands_rx));

        info!(
            worker_path = %worker_path,
            %backend,
            max_workers = options.max_concurrent_workers,
            max_calls_per_worker = options.max_concurrent_calls_per_worker,
            "Worker farm started"
        );

        Ok(Farm {
            inner: Arc::new(Inner {
                options,
                worker_path,
                methods,
                backend,
                services,
                gauges,
                local,
            }),
        })
    }
}

// =============================================================================
// Farm
// =============================================================================

struct Inner {
    options: FarmOptions,
    worker_path: String,
    methods: HashSet<String>,
    backend: BackendKind,
    services: Arc<Services>,
    gauges: Arc<Gauges>,
    local: LocalExecutor,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.gauges.ending.load(Ordering::SeqCst) {
            self.services.send(Command::End(None));
        }
    }
}

/// The coordinator
#[derive(Clone)]
pub struct Farm {
    inner: Arc<Inner>,
}

impl Farm {
    /// Build a farm with the detected backend
    pub fn new(options: FarmOptions, registry: ModuleRegistry) -> Result<Self> {
        FarmBuilder::new(options, registry).build()
    }

    pub fn builder(options: FarmOptions, registry: ModuleRegistry) -> FarmBuilder {
        FarmBuilder::new(options, registry)
    }

    pub fn options(&self) -> &FarmOptions {
        &self.inner.options
    }

    pub fn worker_path(&self) -> &str {
        &self.inner.worker_path
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend
    }

    /// Whether `end()` has started
    pub fn is_ending(&self) -> bool {
        self.inner.gauges.ending.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_ending() {
            return Err(FarmError::Ending);
        }
        Ok(())
    }

    fn should_use_remote(&self) -> bool {
        let options = &self.inner.options;
        if !options.use_local_worker {
            return true;
        }
        if !options.allows_remote_workers() {
            return false;
        }
        let gauges = &self.inner.gauges;
        !options.warm_workers
            || gauges.warm_workers.load(Ordering::Relaxed) >= gauges.pool_size.load(Ordering::Relaxed)
    }

    /// Call a module method
    ///
    /// Rejects immediately once the farm is ending or when the module has no
    /// such method.
    #[instrument(skip(self, args))]
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.ensure_running()?;
        if !self.inner.methods.contains(method) {
            return Err(FarmError::unknown_method(&self.inner.worker_path, method));
        }

        if self.should_use_remote() {
            return self.call_remote(method, args).await;
        }

        if self.inner.options.warm_workers && self.inner.options.allows_remote_workers() {
            self.inner
                .services
                .send(Command::Call(Call::warmup(method, args.clone())));
        }
        self.inner.local.call(method, args).await
    }

    async fn call_remote(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let (call, rx) = Call::new(method, args);
        if !self.inner.services.send(Command::Call(call)) {
            return Err(FarmError::Ending);
        }
        rx.await.unwrap_or(Err(FarmError::Ending))
    }

    /// Call the module's `run` method
    pub async fn run(&self, args: Vec<Value>) -> Result<Value> {
        self.call("run", args).await
    }

    /// A callable proxy for one method
    pub fn create_handle(&self, method: impl Into<String>) -> MethodHandle {
        MethodHandle {
            farm: self.clone(),
            method: method.into(),
        }
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// Register a coordinator callback executors can invoke
    pub fn create_reverse_handle<F, Fut>(&self, f: F) -> Handle
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Diagnostic>> + Send + 'static,
    {
        self.inner.services.handles.register(handle_fn(f))
    }

    /// Drop a coordinator-owned handle; returns whether it existed
    pub fn dispose_handle(&self, handle: &Handle) -> bool {
        handle.is_coordinator_owned() && self.inner.services.handles.dispose(handle.id)
    }

    /// Invoke a handle wherever its owner lives
    pub async fn run_handle(&self, handle: &Handle, args: Vec<Value>) -> Result<Value> {
        self.inner
            .services
            .run_handle(*handle, args)
            .await
            .map_err(|diagnostic| {
                if diagnostic.is_kind(kind::UNKNOWN_HANDLE) {
                    FarmError::HandleNotFound(*handle)
                } else {
                    FarmError::Execution(diagnostic)
                }
            })
    }

    // =========================================================================
    // Shared references
    // =========================================================================

    /// Register a value and replicate it to every started worker
    ///
    /// Returns once every started worker has acknowledged the value.
    #[instrument(skip(self, value))]
    pub async fn create_shared_reference(&self, value: Value) -> Result<SharedReference> {
        self.ensure_running()?;
        let (reply, rx) = oneshot::channel();
        if !self
            .inner
            .services
            .send(Command::CreateSharedReference { value, reply })
        {
            return Err(FarmError::Ending);
        }
        let (id, acks) = rx.await.map_err(|_| FarmError::Ending)?;
        log_failures(methods::CREATE_SHARED_REFERENCE, settle(acks).await);
        Ok(SharedReference {
            id,
            farm: self.clone(),
        })
    }

    /// Remove a shared reference from the coordinator and every worker
    #[instrument(skip(self))]
    pub async fn dispose_shared_reference(&self, id: SharedRefId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if !self
            .inner
            .services
            .send(Command::DisposeSharedReference { id, reply })
        {
            // Ended farms hold no references
            return Ok(());
        }
        if let Ok(acks) = rx.await {
            log_failures(methods::DELETE_SHARED_REFERENCE, settle(acks).await);
        }
        Ok(())
    }

    pub fn get_shared_reference(&self, id: SharedRefId) -> Option<Value> {
        self.inner.services.shared.read().get(id).cloned()
    }

    pub fn resolve_shared_reference(&self, value: &Value) -> Option<SharedRefId> {
        self.inner.services.shared.read().resolve(value)
    }

    // =========================================================================
    // Bus
    // =========================================================================

    /// Receive log and trace events from every executor
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.services.bus.subscribe()
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.services.bus
    }

    /// Functions reachable from executors through `callMaster`
    pub fn master(&self) -> &MasterRegistry {
        &self.inner.services.master
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    async fn broadcast(
        &self,
        method: &'static str,
        args: Vec<Value>,
    ) -> Result<Vec<(ChildId, std::result::Result<Value, Diagnostic>)>> {
        self.ensure_running()?;
        let (reply, rx) = oneshot::channel();
        if !self.inner.services.send(Command::Broadcast {
            method,
            args,
            reply,
        }) {
            return Err(FarmError::Ending);
        }
        let acks = rx.await.map_err(|_| FarmError::Ending)?;
        Ok(settle(acks).await)
    }

    /// Start collecting call timings in every ready worker and locally
    pub async fn start_profile(&self) -> Result<()> {
        self.inner.local.start_profile();
        let results = self.broadcast(methods::START_PROFILE, Vec::new()).await?;
        log_failures(methods::START_PROFILE, results);
        Ok(())
    }

    /// Stop profiling and return the profile of every executor that has one
    pub async fn end_profile(&self) -> Result<Vec<Profile>> {
        let mut profiles: Vec<Profile> = self.inner.local.end_profile().into_iter().collect();
        for (child_id, result) in self.broadcast(methods::END_PROFILE, Vec::new()).await? {
            match result.map(serde_json::from_value::<Option<Profile>>) {
                Ok(Ok(Some(profile))) => profiles.push(profile),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(%child_id, error = %e, "Malformed profile"),
                Err(e) => warn!(%child_id, error = %e, "Failed to end profile"),
            }
        }
        Ok(profiles)
    }

    /// Write a memory report for the coordinator and every ready worker into `dir`
    pub async fn take_heap_snapshot(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FarmError::Internal(anyhow::Error::new(e).context("create snapshot dir")))?;

        let snapshot_id = Uuid::now_v7().to_string();
        let shared_references = self.inner.services.shared.read().len();
        let handles = self.inner.services.handles.len();
        let local_dir = dir.clone();
        let local_id = snapshot_id.clone();
        let local = tokio::task::spawn_blocking(move || {
            MemorySnapshot::capture(local_id, None, shared_references, handles).write_to(&local_dir)
        })
        .await
        .map_err(|e| FarmError::Internal(e.into()))?
        .map_err(|e| FarmError::Internal(anyhow::Error::new(e).context("write memory snapshot")))?;

        let mut paths = vec![local];
        let args = vec![json!(snapshot_id), json!(dir.display().to_string())];
        for (child_id, result) in self.broadcast(methods::TAKE_HEAP_SNAPSHOT, args).await? {
            match result {
                Ok(Value::String(path)) => paths.push(PathBuf::from(path)),
                Ok(other) => warn!(%child_id, value = %other, "Unexpected snapshot result"),
                Err(e) => warn!(%child_id, error = %e, "Failed to take snapshot"),
            }
        }
        Ok(paths)
    }

    /// Current pool statistics
    pub async fn stats(&self) -> FarmStats {
        let (reply, rx) = oneshot::channel();
        if self.inner.services.send(Command::Stats(reply)) {
            if let Ok(stats) = rx.await {
                return stats;
            }
        }
        FarmStats {
            backend: self.inner.backend,
            workers: 0,
            ready_workers: 0,
            warm_workers: 0,
            queued_calls: 0,
            inflight_calls: 0,
            shared_references: 0,
            handles: 0,
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Reject new calls, drain in-flight ones and stop every worker
    ///
    /// Safe to call more than once; later calls wait for the same shutdown.
    #[instrument(skip(self))]
    pub async fn end(&self) -> Result<()> {
        self.inner.gauges.ending.store(true, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        if !self.inner.services.send(Command::End(Some(reply))) {
            return Ok(());
        }
        // A dropped reply means the dispatcher already finished
        let _ = rx.await;
        Ok(())
    }
}

impl std::fmt::Debug for Farm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Farm")
            .field("worker_path", &self.inner.worker_path)
            .field("backend", &self.inner.backend)
            .field("ending", &self.is_ending())
            .finish()
    }
}

async fn settle(acks: Acks) -> Vec<(ChildId, std::result::Result<Value, Diagnostic>)> {
    join_all(acks.into_iter().map(|(child_id, rx)| async move {
        let result = rx.await.unwrap_or_else(|_| {
            Err(Diagnostic::new(format!("{child_id} went away")).with_kind(kind::DISCONNECTED))
        });
        (child_id, result)
    }))
    .await
}

fn log_failures(method: &str, results: Vec<(ChildId, std::result::Result<Value, Diagnostic>)>) {
    for (child_id, result) in results {
        if let Err(e) = result {
            // A worker that died is replaced and replicated on start
            warn!(%child_id, %method, error = %e, "Worker did not acknowledge");
        }
    }
}

// =============================================================================
// Proxies
// =============================================================================

/// Callable proxy for one module method
#[derive(Debug, Clone)]
pub struct MethodHandle {
    farm: Farm,
    method: String,
}

impl MethodHandle {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.farm.call(&self.method, args).await
    }
}

/// A registered shared reference
#[derive(Debug, Clone)]
pub struct SharedReference {
    id: SharedRefId,
    farm: Farm,
}

impl SharedReference {
    pub fn id(&self) -> SharedRefId {
        self.id
    }

    /// The id as it is passed to module methods
    pub fn to_value(&self) -> Value {
        json!(self.id)
    }

    /// Remove the reference everywhere; later reads see "not found"
    pub async fn dispose(self) -> Result<()> {
        self.farm.dispose_shared_reference(self.id).await
    }
}
