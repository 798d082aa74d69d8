//! Process backend
//!
//! Spawns the child executable with [`CHILD_ENV`] set and exchanges base64
//! frame lines over its stdin and stdout. Stderr is inherited, so executor
//! logs show up next to the coordinator's.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, instrument, trace, warn};
use workerfarm_protocol::{decode_frame, encode_frame, Frame, Message};

use super::{Backend, BackendContext, BackendEvent, ExitNotifier};
use crate::child::{CHILD_ENV, CHILD_ID_ENV};
use crate::config::BackendKind;
use crate::error::BackendError;

/// How long the exit report waits for stdout to drain after the child died
const STDOUT_DRAIN: Duration = Duration::from_secs(1);

struct Running {
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

/// One OS process per worker
pub struct ProcessBackend {
    context: BackendContext,
    notifier: Arc<ExitNotifier>,
    running: Mutex<Option<Running>>,
}

impl ProcessBackend {
    pub fn new(context: BackendContext) -> Self {
        let notifier = ExitNotifier::new(context.events.clone());
        Self {
            context,
            notifier,
            running: Mutex::new(None),
        }
    }

    fn command(&self) -> Result<Command, BackendError> {
        let executable = match &self.context.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        let mut command = Command::new(executable);
        command
            .env(CHILD_ENV, "1")
            .env(CHILD_ID_ENV, self.context.child_id.0.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    #[instrument(skip(self), fields(child_id = %self.context.child_id))]
    async fn start(&self) -> Result<(), BackendError> {
        let mut child = self
            .command()?
            .spawn()
            .map_err(|e| BackendError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Spawn("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Spawn("child stdout unavailable".into()))?;
        debug!(pid = ?child.id(), "Spawned executor process");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (kill, kill_rx) = oneshot::channel();
        let (exited_tx, exited) = watch::channel(false);

        tokio::spawn(write_frames(stdin, outbound_rx, self.notifier.clone()));
        let reader = tokio::spawn(read_frames(
            stdout,
            self.context.events.clone(),
            self.notifier.clone(),
        ));
        tokio::spawn(watch_exit(
            child,
            kill_rx,
            reader,
            exited_tx,
            self.notifier.clone(),
        ));

        *self.running.lock() = Some(Running {
            outbound: Some(outbound),
            kill: Some(kill),
            exited,
        });
        Ok(())
    }

    #[instrument(skip(self), fields(child_id = %self.context.child_id))]
    async fn stop(&self) -> Result<(), BackendError> {
        let (mut exited, kill) = {
            let mut running = self.running.lock();
            let Some(running) = running.as_mut() else {
                return Ok(());
            };
            if let Some(outbound) = running.outbound.take() {
                // Dropping the sender closes stdin after the die frame
                let _ = outbound.send(Frame::Die);
            }
            (running.exited.clone(), running.kill.take())
        };

        let graceful = tokio::time::timeout(
            self.context.forced_kill_time,
            exited.wait_for(|exited| *exited),
        )
        .await
        .is_ok();

        if !graceful {
            warn!(
                forced_kill_time_ms = self.context.forced_kill_time.as_millis() as u64,
                "Executor did not exit in time, killing it"
            );
            if let Some(kill) = kill {
                let _ = kill.send(());
            }
            let _ = exited.wait_for(|exited| *exited).await;
        }
        Ok(())
    }

    fn send(&self, message: Message) -> Result<(), BackendError> {
        // The writer outlives the child until stdin errors
        if self.notifier.has_exited() {
            return Err(BackendError::Closed);
        }
        let running = self.running.lock();
        let outbound = running
            .as_ref()
            .and_then(|running| running.outbound.as_ref())
            .ok_or(BackendError::NotRunning)?;
        outbound
            .send(Frame::Message(message))
            .map_err(|_| BackendError::Closed)
    }
}

async fn write_frames(
    mut stdin: tokio::process::ChildStdin,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    notifier: Arc<ExitNotifier>,
) {
    while let Some(frame) = frames.recv().await {
        let mut line = match encode_frame(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Dropping unencodable frame");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            notifier.error(format!("write to executor failed: {e}"));
            return;
        }
        if let Err(e) = stdin.flush().await {
            notifier.error(format!("flush to executor failed: {e}"));
            return;
        }
    }
}

async fn read_frames(
    stdout: tokio::process::ChildStdout,
    events: mpsc::UnboundedSender<BackendEvent>,
    notifier: Arc<ExitNotifier>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_frame(&line) {
                Ok(Frame::Message(message)) => {
                    let _ = events.send(BackendEvent::Message(message));
                }
                Ok(other) => trace!(frame = ?other, "Ignoring control frame from executor"),
                // Anything else on stdout is stray output, not a frame
                Err(e) => trace!(error = %e, "Skipping non-frame output"),
            },
            // A live executor that closed its output can no longer answer
            Ok(None) => {
                notifier.error("executor closed its output");
                return;
            }
            Err(e) => {
                notifier.error(format!("read from executor failed: {e}"));
                return;
            }
        }
    }
}

async fn watch_exit(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    reader: tokio::task::JoinHandle<()>,
    exited: watch::Sender<bool>,
    notifier: Arc<ExitNotifier>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to kill executor");
            }
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(error = %e, "Failed to wait for executor");
            None
        }
    };

    // Deliver the responses that were written before the exit
    let _ = tokio::time::timeout(STDOUT_DRAIN, reader).await;

    debug!(?code, "Executor process exited");
    notifier.exit(code);
    exited.send_replace(true);
}
