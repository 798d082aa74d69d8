//! Web-worker backend
//!
//! Models a worker reachable only through a message port: every frame is
//! serialized on `post` (the structured-clone step), and the coordinator
//! cannot see the worker terminate. The worker therefore announces itself
//! with `Online` and acknowledges `Die` with `Stopped`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, trace, warn};
use workerfarm_protocol::{ChildId, Frame, Message, ProtocolError};

use super::{Backend, BackendContext, BackendEvent, ExitNotifier};
use crate::child::{spawn_executor_thread, ChildRuntime};
use crate::config::BackendKind;
use crate::error::BackendError;
use crate::module::ModuleRegistry;

/// How long `start` waits for the worker's `Online`
pub const ONLINE_TIMEOUT: Duration = Duration::from_secs(10);

/// Posting half of a message port
#[derive(Clone)]
pub(crate) struct PortSender(mpsc::UnboundedSender<String>);

impl PortSender {
    pub(crate) fn post(&self, frame: &Frame) -> Result<(), BackendError> {
        let cloned = serde_json::to_string(frame).map_err(ProtocolError::from)?;
        self.0.send(cloned).map_err(|_| BackendError::Closed)
    }
}

/// Receiving half of a message port
pub(crate) struct PortReceiver(mpsc::UnboundedReceiver<String>);

impl PortReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Result<Frame, ProtocolError>> {
        let message = self.0.recv().await?;
        Some(serde_json::from_str(&message).map_err(ProtocolError::from))
    }
}

/// An entangled pair of ports
pub(crate) fn message_channel() -> ((PortSender, PortReceiver), (PortSender, PortReceiver)) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        (PortSender(a_tx), PortReceiver(b_rx)),
        (PortSender(b_tx), PortReceiver(a_rx)),
    )
}

/// The worker's side: bridges its port to an executor runtime
pub(crate) async fn run_web_worker(
    child_id: ChildId,
    registry: ModuleRegistry,
    port: (PortSender, PortReceiver),
) {
    let (post, mut incoming) = port;
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

    if post.post(&Frame::Online).is_err() {
        return;
    }

    let runtime = ChildRuntime::new(child_id, registry).run(inbound_rx, outbound_tx);
    tokio::pin!(runtime);

    let mut inbound_tx = Some(inbound_tx);
    loop {
        tokio::select! {
            _ = &mut runtime => break,
            frame = incoming.recv(), if inbound_tx.is_some() => match frame {
                Some(Ok(frame)) => {
                    if let Some(tx) = &inbound_tx {
                        let _ = tx.send(frame);
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Dropping undecodable message"),
                // Port closed: let the runtime wind down
                None => inbound_tx = None,
            },
            Some(frame) = outbound_rx.recv() => {
                let _ = post.post(&frame);
            }
        }
    }

    while let Ok(frame) = outbound_rx.try_recv() {
        let _ = post.post(&frame);
    }
    let _ = post.post(&Frame::Stopped);
}

struct Running {
    post: Option<PortSender>,
    exited: watch::Receiver<bool>,
    listener: tokio::task::JoinHandle<()>,
}

/// Message-port worker
pub struct WebBackend {
    context: BackendContext,
    notifier: Arc<ExitNotifier>,
    running: Mutex<Option<Running>>,
}

impl WebBackend {
    pub fn new(context: BackendContext) -> Self {
        let notifier = ExitNotifier::new(context.events.clone());
        Self {
            context,
            notifier,
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Backend for WebBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Web
    }

    #[instrument(skip(self), fields(child_id = %self.context.child_id))]
    async fn start(&self) -> Result<(), BackendError> {
        let (coordinator, worker) = message_channel();
        let child_id = self.context.child_id;
        let registry = self.context.registry.clone();
        spawn_executor_thread(format!("workerfarm-web-{child_id}"), move || {
            run_web_worker(child_id, registry, worker)
        })
        .map_err(|e| BackendError::Spawn(e.to_string()))?;

        let (post, mut incoming) = coordinator;
        match tokio::time::timeout(ONLINE_TIMEOUT, incoming.recv()).await {
            Ok(Some(Ok(Frame::Online))) => debug!("Web worker online"),
            Ok(Some(Ok(other))) => {
                return Err(BackendError::Spawn(format!(
                    "expected online from web worker, got {other:?}"
                )))
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => {
                return Err(BackendError::Spawn(
                    "web worker closed its port before coming online".into(),
                ))
            }
            Err(_) => return Err(BackendError::StartTimeout(ONLINE_TIMEOUT)),
        }

        let (exited_tx, exited) = watch::channel(false);
        let events = self.context.events.clone();
        let notifier = self.notifier.clone();
        let listener = tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Some(Ok(Frame::Message(message))) => {
                        let _ = events.send(BackendEvent::Message(message));
                    }
                    Some(Ok(Frame::Stopped)) => {
                        debug!("Web worker stopped");
                        break;
                    }
                    Some(Ok(other)) => trace!(frame = ?other, "Ignoring control frame"),
                    Some(Err(e)) => notifier.error(format!("undecodable message: {e}")),
                    None => {
                        notifier.error("web worker port closed");
                        break;
                    }
                }
            }
            notifier.exit(None);
            exited_tx.send_replace(true);
        });

        *self.running.lock() = Some(Running {
            post: Some(post),
            exited,
            listener,
        });
        Ok(())
    }

    #[instrument(skip(self), fields(child_id = %self.context.child_id))]
    async fn stop(&self) -> Result<(), BackendError> {
        let mut exited = {
            let mut running = self.running.lock();
            let Some(running) = running.as_mut() else {
                return Ok(());
            };
            if let Some(post) = running.post.take() {
                let _ = post.post(&Frame::Die);
            }
            running.exited.clone()
        };

        let graceful = tokio::time::timeout(
            self.context.forced_kill_time,
            exited.wait_for(|exited| *exited),
        )
        .await
        .is_ok();

        if !graceful {
            warn!("Web worker did not acknowledge die, terminating it");
            if let Some(running) = self.running.lock().as_ref() {
                running.listener.abort();
            }
            self.notifier.exit(None);
        }
        Ok(())
    }

    fn send(&self, message: Message) -> Result<(), BackendError> {
        let running = self.running.lock();
        let post = running
            .as_ref()
            .and_then(|running| running.post.as_ref())
            .ok_or(BackendError::NotRunning)?;
        post.post(&Frame::Message(message))
    }
}
