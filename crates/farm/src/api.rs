//! The API a worker module sees
//!
//! The same [`WorkerApi`] is handed to module methods whether they run in a
//! child executor or in the coordinator's local worker. What differs is the
//! [`WorkerHost`] behind it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use workerfarm_protocol::{
    BusEvent, ChildId, Diagnostic, Handle, LogEvent, LogLevel, SharedRefId, TraceEvent, Value,
};

use crate::handles::{handle_fn, HandleFn};

/// Services an executor provides to module code
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// The executor id; `None` in the coordinator
    fn child_id(&self) -> Option<ChildId>;

    /// Call a coordinator function. With `await_response == false` the call
    /// is fire-and-forget and resolves to `Null` once sent.
    async fn call_master(
        &self,
        location: &str,
        method: &str,
        args: Vec<Value>,
        await_response: bool,
    ) -> Result<Value, Diagnostic>;

    /// Register a callback others can invoke through the returned handle
    fn create_reverse_handle(&self, f: HandleFn) -> Handle;

    /// Invoke a handle wherever its owner lives
    async fn run_handle(&self, handle: Handle, args: Vec<Value>) -> Result<Value, Diagnostic>;

    fn get_shared_reference(&self, id: SharedRefId) -> Option<Value>;

    fn resolve_shared_reference(&self, value: &Value) -> Option<SharedRefId>;

    /// Relay an event to the coordinator's bus
    fn emit(&self, event: BusEvent);

    fn should_trace(&self) -> bool;
}

/// Handle given to module methods
#[derive(Clone)]
pub struct WorkerApi {
    host: Arc<dyn WorkerHost>,
    warmup: bool,
}

impl WorkerApi {
    pub fn new(host: Arc<dyn WorkerHost>) -> Self {
        Self {
            host,
            warmup: false,
        }
    }

    /// Copy of this API for one call
    pub(crate) fn for_call(&self, warmup: bool) -> Self {
        Self {
            host: self.host.clone(),
            warmup,
        }
    }

    /// The executor running this code; `None` when running locally
    pub fn child_id(&self) -> Option<ChildId> {
        self.host.child_id()
    }

    /// Whether the code runs in the coordinator
    pub fn is_local(&self) -> bool {
        self.host.child_id().is_none()
    }

    /// Whether this call is a warm-up copy whose result is discarded
    pub fn is_warmup(&self) -> bool {
        self.warmup
    }

    /// Call a coordinator function and wait for its result
    pub async fn call_master(
        &self,
        location: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Diagnostic> {
        self.host.call_master(location, method, args, true).await
    }

    /// Call a coordinator function without waiting for a result
    pub async fn notify_master(
        &self,
        location: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), Diagnostic> {
        self.host
            .call_master(location, method, args, false)
            .await
            .map(|_| ())
    }

    /// Register an async callback and return its handle
    pub fn create_reverse_handle<F, Fut>(&self, f: F) -> Handle
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Diagnostic>> + Send + 'static,
    {
        self.host.create_reverse_handle(handle_fn(f))
    }

    /// Invoke a handle; remote handles are a round trip to their owner
    pub async fn run_handle(&self, handle: &Handle, args: Vec<Value>) -> Result<Value, Diagnostic> {
        self.host.run_handle(*handle, args).await
    }

    /// Invoke a handle received inside an argument tree
    pub async fn run_handle_value(
        &self,
        value: &Value,
        args: Vec<Value>,
    ) -> Result<Value, Diagnostic> {
        let handle = Handle::from_value(value)
            .ok_or_else(|| Diagnostic::new(format!("expected a handle, got {value}")))?;
        self.run_handle(&handle, args).await
    }

    /// Look up a shared reference; `None` once it has been disposed
    pub fn get_shared_reference(&self, id: SharedRefId) -> Option<Value> {
        self.host.get_shared_reference(id)
    }

    /// Find the reference id of a value registered as a shared reference
    pub fn resolve_shared_reference(&self, value: &Value) -> Option<SharedRefId> {
        self.host.resolve_shared_reference(value)
    }

    /// Relay an event to the coordinator's bus
    pub fn emit(&self, event: BusEvent) {
        self.host.emit(event);
    }

    /// Relay a log line to the coordinator's bus
    pub fn log(&self, level: LogLevel, target: &str, message: impl Into<String>) {
        self.emit(BusEvent::Log(LogEvent::new(level, target, message)));
    }

    /// Relay a timed span when tracing is enabled
    pub fn trace(&self, name: impl Into<String>, started_at: DateTime<Utc>, duration: Duration, args: Value) {
        if !self.host.should_trace() {
            return;
        }
        self.emit(BusEvent::Trace(TraceEvent {
            name: name.into(),
            started_at_ms: started_at.timestamp_millis(),
            duration_ms: duration.as_secs_f64() * 1000.0,
            args,
            child_id: self.child_id(),
        }));
    }

    pub fn should_trace(&self) -> bool {
        self.host.should_trace()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::DetachedHost;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reverse_handle_round_trip() {
        let api = WorkerApi::new(Arc::new(DetachedHost::default()));
        let handle = api.create_reverse_handle(|_args| async { Ok(json!(42)) });

        assert!(api.is_local());
        assert_eq!(api.run_handle(&handle, vec![]).await.unwrap(), json!(42));
        assert_eq!(
            api.run_handle_value(&handle.to_value(), vec![]).await.unwrap(),
            json!(42)
        );
        assert!(api.run_handle_value(&json!(7), vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_trace_respects_flag() {
        let host = Arc::new(DetachedHost::default());
        let api = WorkerApi::new(host.clone());
        api.trace("transform", Utc::now(), Duration::from_millis(3), Value::Null);
        assert!(host.events.lock().is_empty());

        let host = Arc::new(DetachedHost {
            trace: true,
            ..Default::default()
        });
        let api = WorkerApi::new(host.clone());
        api.trace("transform", Utc::now(), Duration::from_millis(3), Value::Null);
        api.log(LogLevel::Info, "fixture", "hello");

        let events = host.events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], BusEvent::Trace(t) if t.name == "transform"));
    }

    #[test]
    fn test_warmup_flag_is_per_call() {
        let api = WorkerApi::new(Arc::new(DetachedHost::default()));
        assert!(!api.is_warmup());
        assert!(api.for_call(true).is_warmup());
    }
}
