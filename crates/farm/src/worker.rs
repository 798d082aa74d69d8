// Coordinator-side proxy for one executor
// Decision: the proxy only tracks in-flight requests; queueing and retry live in the dispatcher
// Decision: the event pump holds a weak reference so dropping the worker ends it

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use workerfarm_protocol::diagnostic::kind;
use workerfarm_protocol::{
    CallIdx, ChildId, Diagnostic, Message, Request, Response, ResponseContent, SharedRefId, Target,
    Value,
};

use crate::backend::{Backend, BackendEvent};
use crate::error::{BackendError, FarmError};
use crate::farm::{Command, Services};

/// Reply channel of a control request
pub(crate) type ControlReply = oneshot::Sender<Result<Value, Diagnostic>>;

/// A queued or in-flight module call
pub(crate) struct Call {
    pub(crate) method: String,
    pub(crate) args: Vec<Value>,
    /// Times the call was requeued after a worker failure
    pub(crate) retries: u32,
    /// Warm-up copy; nobody waits for the result
    pub(crate) warmup: bool,
    reply: oneshot::Sender<Result<Value, FarmError>>,
}

impl Call {
    pub(crate) fn new(
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> (Self, oneshot::Receiver<Result<Value, FarmError>>) {
        let (reply, rx) = oneshot::channel();
        let call = Self {
            method: method.into(),
            args,
            retries: 0,
            warmup: false,
            reply,
        };
        (call, rx)
    }

    pub(crate) fn warmup(method: impl Into<String>, args: Vec<Value>) -> Self {
        let (mut call, _) = Self::new(method, args);
        call.warmup = true;
        call
    }

    /// Settle the caller's future. A caller that went away is ignored.
    pub(crate) fn settle(self, result: Result<Value, FarmError>) {
        let _ = self.reply.send(result);
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.method)
            .field("args", &self.args.len())
            .field("retries", &self.retries)
            .field("warmup", &self.warmup)
            .finish()
    }
}

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    /// Backend starting
    Spawning,
    /// Backend up, `childInit` and shared references in flight
    Initializing,
    /// Accepting calls
    Ready,
    Stopping,
    Stopped,
}

enum Inflight {
    Call(Call),
    Control(ControlReply),
}

/// Proxy for one executor
pub(crate) struct Worker {
    id: ChildId,
    backend: Arc<dyn Backend>,
    state: Mutex<WorkerState>,
    next_idx: AtomicU64,
    inflight: Mutex<HashMap<CallIdx, Inflight>>,
    shared_references: Mutex<HashSet<SharedRefId>>,
    completed_calls: AtomicU64,
}

impl Worker {
    pub(crate) fn new(id: ChildId, backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            id,
            backend,
            state: Mutex::new(WorkerState::Spawning),
            next_idx: AtomicU64::new(1),
            inflight: Mutex::new(HashMap::new()),
            shared_references: Mutex::new(HashSet::new()),
            completed_calls: AtomicU64::new(0),
        })
    }

    pub(crate) fn id(&self) -> ChildId {
        self.id
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Move to `next` unless the worker is already stopping
    pub(crate) fn advance(&self, next: WorkerState) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, WorkerState::Stopping | WorkerState::Stopped) {
            return false;
        }
        *state = next;
        true
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    /// Started and not stopping: messages sent now will be processed
    pub(crate) fn is_started(&self) -> bool {
        matches!(self.state(), WorkerState::Initializing | WorkerState::Ready)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        matches!(self.state(), WorkerState::Stopping | WorkerState::Stopped)
    }

    /// Has completed at least one call
    pub(crate) fn is_warm(&self) -> bool {
        self.completed_calls.load(Ordering::Relaxed) > 0
    }

    /// Module calls currently in flight
    pub(crate) fn inflight_calls(&self) -> usize {
        self.inflight
            .lock()
            .values()
            .filter(|entry| matches!(entry, Inflight::Call(_)))
            .count()
    }

    fn next_idx(&self) -> CallIdx {
        CallIdx(self.next_idx.fetch_add(1, Ordering::Relaxed))
    }

    /// Send a module call. On transport failure the call is handed back.
    pub(crate) fn call(&self, call: Call) -> std::result::Result<(), Call> {
        let idx = self.next_idx();
        let request = Request::new(idx, Some(self.id), Target::method(&call.method), call.args.clone())
            .as_warmup(call.warmup);
        trace!(child_id = %self.id, %idx, method = %call.method, retries = call.retries, "Dispatching call");

        // Registered before sending so a fast response finds it
        self.inflight.lock().insert(idx, Inflight::Call(call));
        match self.backend.send(Message::Request(request)) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(child_id = %self.id, %idx, error = %e, "Send failed");
                match self.inflight.lock().remove(&idx) {
                    Some(Inflight::Call(call)) => Err(call),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Send a control request and route its response to `reply`
    pub(crate) fn control_into(&self, target: Target, args: Vec<Value>, reply: ControlReply) {
        let idx = self.next_idx();
        let request = Request::new(idx, Some(self.id), target, args);
        self.inflight.lock().insert(idx, Inflight::Control(reply));
        if let Err(e) = self.backend.send(Message::Request(request)) {
            if let Some(Inflight::Control(reply)) = self.inflight.lock().remove(&idx) {
                let _ = reply.send(Err(disconnected(self.id, &e.to_string())));
            }
        }
    }

    /// Send a control request
    pub(crate) fn control(
        &self,
        target: Target,
        args: Vec<Value>,
    ) -> oneshot::Receiver<Result<Value, Diagnostic>> {
        let (reply, rx) = oneshot::channel();
        self.control_into(target, args, reply);
        rx
    }

    /// Settle the request a response answers
    ///
    /// Returns `Some(true)` when a module call settled, `Some(false)` for a
    /// control request and `None` for an unknown idx, which is ignored.
    pub(crate) fn receive(&self, response: Response) -> Option<bool> {
        let Some(entry) = self.inflight.lock().remove(&response.idx) else {
            trace!(child_id = %self.id, idx = %response.idx, "Ignoring response for unknown idx");
            return None;
        };
        match entry {
            Inflight::Call(call) => {
                self.completed_calls.fetch_add(1, Ordering::Relaxed);
                let result = match response.content {
                    ResponseContent::Data(value) => Ok(value),
                    ResponseContent::Error(diagnostic) => Err(FarmError::Execution(diagnostic)),
                };
                call.settle(result);
                Some(true)
            }
            Inflight::Control(reply) => {
                let _ = reply.send(response.content.into_result());
                Some(false)
            }
        }
    }

    /// Answer a request the executor sent to the coordinator
    pub(crate) fn respond(&self, response: Response) -> std::result::Result<(), BackendError> {
        self.backend.send(Message::Response(response))
    }

    /// Remove every in-flight entry
    ///
    /// Module calls are returned in dispatch order for requeueing; control
    /// requests are failed on the spot.
    pub(crate) fn take_inflight_calls(&self, reason: &str) -> Vec<Call> {
        let mut entries: Vec<(CallIdx, Inflight)> = self.inflight.lock().drain().collect();
        entries.sort_by_key(|(idx, _)| *idx);
        entries
            .into_iter()
            .filter_map(|(_, entry)| match entry {
                Inflight::Call(call) => Some(call),
                Inflight::Control(reply) => {
                    let _ = reply.send(Err(disconnected(self.id, reason)));
                    None
                }
            })
            .collect()
    }

    pub(crate) fn mark_shared_reference_sent(&self, id: SharedRefId) {
        self.shared_references.lock().insert(id);
    }

    /// Forget a shared reference; returns whether this worker had received it
    pub(crate) fn forget_shared_reference(&self, id: SharedRefId) -> bool {
        self.shared_references.lock().remove(&id)
    }

    /// Enter `Stopping`; returns false if already stopping
    pub(crate) fn begin_stopping(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, WorkerState::Stopping | WorkerState::Stopped) {
            return false;
        }
        *state = WorkerState::Stopping;
        true
    }

    /// Stop the backend, bounded by its forced-kill time
    pub(crate) async fn stop(&self) {
        self.begin_stopping();
        if let Err(e) = self.backend.stop().await {
            warn!(child_id = %self.id, error = %e, "Failed to stop worker");
        }
        *self.state.lock() = WorkerState::Stopped;
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("backend", &self.backend.kind())
            .field("state", &self.state())
            .field("inflight", &self.inflight.lock().len())
            .finish()
    }
}

fn disconnected(child_id: ChildId, reason: &str) -> Diagnostic {
    Diagnostic::new(format!("{child_id} disconnected: {reason}")).with_kind(kind::DISCONNECTED)
}

/// Translate backend events of one worker into dispatcher commands
pub(crate) async fn pump(
    worker: Weak<Worker>,
    mut events: mpsc::UnboundedReceiver<BackendEvent>,
    services: Arc<Services>,
) {
    while let Some(event) = events.recv().await {
        let Some(current) = worker.upgrade() else {
            break;
        };
        let id = current.id();
        match event {
            BackendEvent::Message(Message::Response(response)) => {
                if current.receive(response) == Some(true) {
                    services.send(Command::CallSettled(id));
                }
            }
            BackendEvent::Message(Message::Request(request)) => {
                services.serve(current, request);
            }
            BackendEvent::Error(error) => {
                warn!(child_id = %id, %error, "Worker transport error");
                services.send(Command::WorkerFailed { id, error });
            }
            BackendEvent::Exit(code) => {
                debug!(child_id = %id, ?code, "Worker exited");
                services.send(Command::WorkerExited { id, code });
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::config::BackendKind;

    /// Records what was sent; can be switched to fail
    #[derive(Default)]
    struct RecordingBackend {
        sent: Mutex<Vec<Message>>,
        closed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Threads
        }

        async fn start(&self) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        async fn stop(&self) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        fn send(&self, message: Message) -> std::result::Result<(), BackendError> {
            if self.closed.load(Ordering::Relaxed) {
                return Err(BackendError::Closed);
            }
            self.sent.lock().push(message);
            Ok(())
        }
    }

    fn worker() -> (Arc<Worker>, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        (Worker::new(ChildId(1), backend.clone()), backend)
    }

    fn sent_idx(backend: &RecordingBackend, n: usize) -> CallIdx {
        match &backend.sent.lock()[n] {
            Message::Request(request) => request.idx,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_settles_once() {
        let (worker, backend) = worker();
        let (call, rx) = Call::new("run", vec![json!(5)]);
        worker.call(call).unwrap();
        assert_eq!(worker.inflight_calls(), 1);

        let idx = sent_idx(&backend, 0);
        let response = Response {
            idx,
            child_id: Some(ChildId(1)),
            content: ResponseContent::Data(json!(5)),
        };
        assert_eq!(worker.receive(response.clone()), Some(true));
        assert_eq!(worker.receive(response), None);

        assert_eq!(rx.await.unwrap().unwrap(), json!(5));
        assert!(worker.is_warm());
        assert_eq!(worker.inflight_calls(), 0);
    }

    #[tokio::test]
    async fn test_error_response_rejects_the_caller() {
        let (worker, backend) = worker();
        let (call, rx) = Call::new("run", vec![]);
        worker.call(call).unwrap();

        worker.receive(Response {
            idx: sent_idx(&backend, 0),
            child_id: Some(ChildId(1)),
            content: ResponseContent::Error(Diagnostic::new("boom")),
        });
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.diagnostic().map(|d| d.message.as_str()), Some("boom"));
    }

    #[test]
    fn test_failed_send_hands_the_call_back() {
        let (worker, backend) = worker();
        backend.closed.store(true, Ordering::Relaxed);
        let (call, _rx) = Call::new("run", vec![json!(1)]);
        let call = worker.call(call).unwrap_err();
        assert_eq!(call.method, "run");
        assert_eq!(worker.inflight_calls(), 0);
    }

    #[tokio::test]
    async fn test_take_inflight_keeps_dispatch_order_and_fails_controls() {
        let (worker, _backend) = worker();
        let (first, _a) = Call::new("first", vec![]);
        let (second, _b) = Call::new("second", vec![]);
        worker.call(first).unwrap();
        let control = worker.control(Target::method("startProfile"), vec![]);
        worker.call(second).unwrap();

        let calls = worker.take_inflight_calls("exit");
        let methods: Vec<&str> = calls.iter().map(|c| c.method.as_str()).collect();
        assert_eq!(methods, vec!["first", "second"]);
        assert!(control.await.unwrap().unwrap_err().is_kind(kind::DISCONNECTED));
    }

    #[test]
    fn test_stopping_is_sticky() {
        let (worker, _backend) = worker();
        assert!(worker.advance(WorkerState::Initializing));
        assert!(worker.begin_stopping());
        assert!(!worker.begin_stopping());
        assert!(!worker.advance(WorkerState::Ready));
        assert!(worker.is_stopping());
    }

    #[test]
    fn test_shared_reference_tracking() {
        let (worker, _backend) = worker();
        worker.mark_shared_reference_sent(SharedRefId(1));
        assert!(worker.forget_shared_reference(SharedRefId(1)));
        assert!(!worker.forget_shared_reference(SharedRefId(1)));
    }
}
