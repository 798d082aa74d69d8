//! Thread backend
//!
//! Runs the executor on its own OS thread with a single-threaded runtime.
//! Frames cross an in-process channel as values, so nothing is re-encoded.
//! A thread cannot be killed: one that ignores `Die` past the forced-kill
//! time is detached and reported as exited.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, trace, warn};
use workerfarm_protocol::{Frame, Message};

use super::{Backend, BackendContext, BackendEvent, ExitNotifier};
use crate::child::{spawn_executor_thread, ChildRuntime};
use crate::config::BackendKind;
use crate::error::BackendError;

struct Running {
    inbound: Option<mpsc::UnboundedSender<Frame>>,
    exited: watch::Receiver<bool>,
}

/// One thread per worker inside the coordinator process
pub struct ThreadBackend {
    context: BackendContext,
    notifier: Arc<ExitNotifier>,
    running: Mutex<Option<Running>>,
}

impl ThreadBackend {
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
impl Backend for ThreadBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Threads
    }

    #[instrument(skip(self), fields(child_id = %self.context.child_id))]
    async fn start(&self) -> Result<(), BackendError> {
        let (inbound, inbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (exited_tx, exited) = watch::channel(false);

        let child_id = self.context.child_id;
        let registry = self.context.registry.clone();
        spawn_executor_thread(format!("workerfarm-{child_id}"), move || {
            ChildRuntime::new(child_id, registry).run(inbound_rx, outbound)
        })
        .map_err(|e| BackendError::Spawn(e.to_string()))?;

        let events = self.context.events.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            // Ends when the executor drops its sender, i.e. when the thread is done
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Frame::Message(message) => {
                        let _ = events.send(BackendEvent::Message(message));
                    }
                    other => trace!(frame = ?other, "Ignoring control frame from executor"),
                }
            }
            debug!(%child_id, "Executor thread finished");
            notifier.exit(None);
            exited_tx.send_replace(true);
        });

        *self.running.lock() = Some(Running {
            inbound: Some(inbound),
            exited,
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
            if let Some(inbound) = running.inbound.take() {
                let _ = inbound.send(Frame::Die);
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
            warn!("Executor thread ignored die, detaching it");
            self.notifier.exit(None);
        }
        Ok(())
    }

    fn send(&self, message: Message) -> Result<(), BackendError> {
        let running = self.running.lock();
        let inbound = running
            .as_ref()
            .and_then(|running| running.inbound.as_ref())
            .ok_or(BackendError::NotRunning)?;
        inbound
            .send(Frame::Message(message))
            .map_err(|_| BackendError::Closed)
    }
}
