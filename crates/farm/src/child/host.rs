// Executor side of the worker API
//
// Requests from module code to the coordinator get their own correlation
// index space; responses are matched back through `pending`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;
use workerfarm_protocol::diagnostic::kind;
use workerfarm_protocol::{
    locations, BusEvent, CallIdx, ChildId, Diagnostic, Frame, Handle, Request, Response,
    SharedRefId, Target, Value,
};

use crate::api::WorkerHost;
use crate::handles::{HandleFn, HandleTable};
use crate::shared::SharedReferenceTable;

type Reply = oneshot::Sender<Result<Value, Diagnostic>>;

pub(crate) struct ChildHost {
    child_id: ChildId,
    outbound: mpsc::UnboundedSender<Frame>,
    next_idx: AtomicU64,
    pending: Mutex<HashMap<CallIdx, Reply>>,
    pub(crate) handles: HandleTable,
    pub(crate) shared: RwLock<SharedReferenceTable>,
    should_trace: AtomicBool,
}

impl ChildHost {
    pub(crate) fn new(child_id: ChildId, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            child_id,
            outbound,
            next_idx: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            handles: HandleTable::new(Some(child_id)),
            shared: RwLock::new(SharedReferenceTable::new()),
            should_trace: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_should_trace(&self, enabled: bool) {
        self.should_trace.store(enabled, Ordering::Relaxed);
    }

    /// Send a response or any other frame to the coordinator
    pub(crate) fn send(&self, frame: impl Into<Frame>) -> bool {
        self.outbound.send(frame.into()).is_ok()
    }

    /// Send a request; the receiver is `None` for fire-and-forget requests
    fn send_request(
        &self,
        target: Target,
        args: Vec<Value>,
        await_response: bool,
    ) -> Result<Option<oneshot::Receiver<Result<Value, Diagnostic>>>, Diagnostic> {
        let idx = CallIdx(self.next_idx.fetch_add(1, Ordering::Relaxed));
        let mut request = Request::new(idx, Some(self.child_id), target, args);

        let receiver = if await_response {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(idx, tx);
            Some(rx)
        } else {
            request = request.without_response();
            None
        };

        if !self.send(request) {
            self.pending.lock().remove(&idx);
            return Err(disconnected());
        }
        Ok(receiver)
    }

    async fn request(
        &self,
        target: Target,
        args: Vec<Value>,
        await_response: bool,
    ) -> Result<Value, Diagnostic> {
        match self.send_request(target, args, await_response)? {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(disconnected())),
            None => Ok(Value::Null),
        }
    }

    /// Settle the request a response belongs to
    pub(crate) fn resolve(&self, response: Response) {
        let reply = self.pending.lock().remove(&response.idx);
        match reply {
            Some(reply) => {
                let _ = reply.send(response.content.into_result());
            }
            None => trace!(idx = %response.idx, "Ignoring response for unknown request"),
        }
    }

    /// Relay a bus event without waiting
    pub(crate) fn forward_bus_event(&self, event: BusEvent) {
        let Ok(value) = serde_json::to_value(event.with_origin(self.child_id)) else {
            return;
        };
        let _ = self.send_request(
            Target::master(locations::BUS, locations::BUS_EMIT),
            vec![value],
            false,
        );
    }

    /// Fail every outstanding request
    pub(crate) fn fail_pending(&self) {
        for (_, reply) in self.pending.lock().drain() {
            let _ = reply.send(Err(disconnected()));
        }
    }
}

fn disconnected() -> Diagnostic {
    Diagnostic::new("connection to the coordinator closed").with_kind(kind::DISCONNECTED)
}

#[async_trait]
impl WorkerHost for ChildHost {
    fn child_id(&self) -> Option<ChildId> {
        Some(self.child_id)
    }

    async fn call_master(
        &self,
        location: &str,
        method: &str,
        args: Vec<Value>,
        await_response: bool,
    ) -> Result<Value, Diagnostic> {
        self.request(Target::master(location, method), args, await_response)
            .await
    }

    fn create_reverse_handle(&self, f: HandleFn) -> Handle {
        self.handles.register(f)
    }

    async fn run_handle(&self, handle: Handle, args: Vec<Value>) -> Result<Value, Diagnostic> {
        if self.handles.owns(&handle) {
            self.handles.run(&handle, args).await
        } else {
            self.request(Target::Handle(handle), args, true).await
        }
    }

    fn get_shared_reference(&self, id: SharedRefId) -> Option<Value> {
        self.shared.read().get(id).cloned()
    }

    fn resolve_shared_reference(&self, value: &Value) -> Option<SharedRefId> {
        self.shared.read().resolve(value)
    }

    fn emit(&self, event: BusEvent) {
        self.forward_bus_event(event);
    }

    fn should_trace(&self) -> bool {
        self.should_trace.load(Ordering::Relaxed)
    }
}
