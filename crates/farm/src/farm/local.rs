// Local worker: runs the module inside the coordinator

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;
use workerfarm_protocol::{BusEvent, ChildId, Diagnostic, Handle, SharedRefId, Value};

use super::services::Services;
use crate::api::{WorkerApi, WorkerHost};
use crate::error::{FarmError, Result};
use crate::handles::HandleFn;
use crate::module::{ModuleRegistry, WorkerModule};
use crate::profiler::{Profile, Profiler};

/// Host for module code running in the coordinator
struct LocalHost {
    services: Arc<Services>,
    should_trace: bool,
}

#[async_trait]
impl WorkerHost for LocalHost {
    fn child_id(&self) -> Option<ChildId> {
        None
    }

    async fn call_master(
        &self,
        location: &str,
        method: &str,
        args: Vec<Value>,
        await_response: bool,
    ) -> std::result::Result<Value, Diagnostic> {
        if await_response {
            return self.services.call_master(None, location, method, args).await;
        }
        let services = self.services.clone();
        let (location, method) = (location.to_string(), method.to_string());
        tokio::spawn(async move {
            let _ = services.call_master(None, &location, &method, args).await;
        });
        Ok(Value::Null)
    }

    fn create_reverse_handle(&self, f: HandleFn) -> Handle {
        self.services.handles.register(f)
    }

    async fn run_handle(&self, handle: Handle, args: Vec<Value>) -> std::result::Result<Value, Diagnostic> {
        self.services.run_handle(handle, args).await
    }

    fn get_shared_reference(&self, id: SharedRefId) -> Option<Value> {
        self.services.shared.read().get(id).cloned()
    }

    fn resolve_shared_reference(&self, value: &Value) -> Option<SharedRefId> {
        self.services.shared.read().resolve(value)
    }

    fn emit(&self, event: BusEvent) {
        self.services.bus.emit(event);
    }

    fn should_trace(&self) -> bool {
        self.should_trace
    }
}

/// The module instance used by the local path, loaded on first use
pub(crate) struct LocalExecutor {
    worker_path: String,
    registry: ModuleRegistry,
    api: WorkerApi,
    module: OnceCell<std::result::Result<Arc<WorkerModule>, Diagnostic>>,
    profiler: Mutex<Profiler>,
}

impl LocalExecutor {
    pub(crate) fn new(
        worker_path: String,
        registry: ModuleRegistry,
        services: Arc<Services>,
        should_trace: bool,
    ) -> Self {
        let host = Arc::new(LocalHost {
            services,
            should_trace,
        });
        Self {
            worker_path,
            registry,
            api: WorkerApi::new(host),
            module: OnceCell::new(),
            profiler: Mutex::new(Profiler::default()),
        }
    }

    async fn module(&self) -> std::result::Result<Arc<WorkerModule>, Diagnostic> {
        self.module
            .get_or_init(|| async {
                let module = self
                    .registry
                    .create(&self.worker_path)
                    .map_err(|e| Diagnostic::new(e.to_string()))?;
                module.init(self.api.clone()).await?;
                debug!(worker_path = %self.worker_path, "Local worker loaded");
                Ok(Arc::new(module))
            })
            .await
            .clone()
    }

    /// Run a method in the coordinator
    pub(crate) async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let module = self.module().await.map_err(FarmError::Execution)?;
        let started_at = Utc::now();
        let clock = Instant::now();

        let result = module.invoke(self.api.clone(), method, args).await;

        self.profiler
            .lock()
            .record(method, started_at, clock.elapsed(), result.is_ok());
        self.api.trace(method, started_at, clock.elapsed(), Value::Null);
        result.map_err(FarmError::Execution)
    }

    pub(crate) fn start_profile(&self) {
        self.profiler.lock().start();
    }

    pub(crate) fn end_profile(&self) -> Option<Profile> {
        self.profiler.lock().finish(None)
    }
}
