// Coordinator services shared by the dispatcher, the worker pumps and the local executor

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};
use workerfarm_protocol::diagnostic::kind;
use workerfarm_protocol::{locations, BusEvent, ChildId, Diagnostic, Handle, Request, Response, Target, Value};

use super::dispatcher::Command;
use crate::bus::{Bus, MasterRegistry};
use crate::handles::HandleTable;
use crate::shared::SharedReferenceTable;
use crate::worker::Worker;

pub(crate) struct Services {
    /// Handles owned by the coordinator
    pub(crate) handles: HandleTable,
    pub(crate) master: MasterRegistry,
    pub(crate) bus: Bus,
    /// Written only by the dispatcher
    pub(crate) shared: RwLock<SharedReferenceTable>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Services {
    pub(crate) fn new(
        master: MasterRegistry,
        bus: Bus,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handles: HandleTable::new(None),
            master,
            bus,
            shared: RwLock::new(SharedReferenceTable::new()),
            commands,
        })
    }

    /// Send a command; returns false once the dispatcher is gone
    pub(crate) fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Call a master function on behalf of `origin`
    pub(crate) async fn call_master(
        &self,
        origin: Option<ChildId>,
        location: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Diagnostic> {
        if location == locations::BUS && method == locations::BUS_EMIT {
            let payload = args.into_iter().next().unwrap_or_default();
            let mut event: BusEvent = serde_json::from_value(payload)?;
            if let Some(child_id) = origin {
                event = event.with_origin(child_id);
            }
            self.bus.emit(event);
            return Ok(Value::Null);
        }
        self.master.call(location, method, args).await
    }

    /// Run a handle wherever its owner lives
    pub(crate) async fn run_handle(&self, handle: Handle, args: Vec<Value>) -> Result<Value, Diagnostic> {
        if handle.is_coordinator_owned() {
            return self.handles.run(&handle, args).await;
        }
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::RunHandle {
            handle,
            args,
            reply,
        }) {
            return Err(Diagnostic::new("worker farm has ended").with_kind(kind::DISCONNECTED));
        }
        rx.await.unwrap_or_else(|_| {
            Err(Diagnostic::new(format!("owner of {} went away", handle.id))
                .with_kind(kind::DISCONNECTED))
        })
    }

    /// Serve a request an executor sent to the coordinator
    pub(crate) fn serve(self: &Arc<Self>, worker: Arc<Worker>, request: Request) {
        let services = self.clone();
        tokio::spawn(async move {
            let origin = worker.id();
            let result = match &request.target {
                Target::Master { location, method } => {
                    services
                        .call_master(Some(origin), location, method, request.args.clone())
                        .await
                }
                Target::Handle(handle) => services.run_handle(*handle, request.args.clone()).await,
                Target::Method(method) => Err(Diagnostic::new(format!(
                    "coordinator does not serve method '{method}'"
                ))
                .with_kind(kind::UNKNOWN_METHOD)),
            };

            if !request.await_response {
                if let Err(e) = result {
                    trace!(child_id = %origin, request = %request.target.label(), error = %e, "Fire-and-forget request failed");
                }
                return;
            }
            if let Err(e) = worker.respond(Response::to(&request, result)) {
                warn!(
                    child_id = %origin,
                    idx = %request.idx,
                    request = %request.target.label(),
                    error = %e,
                    "Failed to answer worker request"
                );
            }
        });
    }
}
