//! Executor transports
//!
//! A backend starts one executor, carries messages to it and reports what
//! comes back as [`BackendEvent`]s. Every backend reports exactly one
//! [`BackendEvent::Exit`] per started executor, however it ended.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use workerfarm_protocol::{ChildId, Message};

use crate::config::BackendKind;
use crate::error::BackendError;
use crate::module::ModuleRegistry;

pub mod detect;
pub mod process;
pub mod thread;
pub mod web;

pub use detect::{select_backend, BackendEnvironment};
pub use process::ProcessBackend;
pub use thread::ThreadBackend;
pub use web::WebBackend;

/// Notifications from a running executor
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A request or response from the executor
    Message(Message),
    /// The transport failed; the executor may still be running
    Error(String),
    /// The executor is gone
    Exit(Option<i32>),
}

/// Sender half backends report into
pub type BackendEvents = mpsc::UnboundedSender<BackendEvent>;

/// Everything a backend needs to start one executor
#[derive(Clone)]
pub struct BackendContext {
    pub child_id: ChildId,
    pub worker_path: String,
    /// Modules available to in-process executors
    pub registry: ModuleRegistry,
    /// Binary spawned by the process backend
    pub executable: Option<PathBuf>,
    pub forced_kill_time: Duration,
    pub events: BackendEvents,
}

/// Transport contract shared by the process, thread and web backends
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start the executor; returns once it accepts messages
    async fn start(&self) -> Result<(), BackendError>;

    /// Ask the executor to die, killing it after the forced-kill time
    async fn stop(&self) -> Result<(), BackendError>;

    /// Deliver a message
    fn send(&self, message: Message) -> Result<(), BackendError>;
}

/// Creates backends for new workers
pub trait BackendFactory: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn create(&self, context: BackendContext) -> Arc<dyn Backend>;
}

/// Factory for the built-in backends
#[derive(Debug, Clone, Copy)]
pub struct StandardBackendFactory {
    kind: BackendKind,
}

impl StandardBackendFactory {
    pub fn new(kind: BackendKind) -> Self {
        Self { kind }
    }
}

impl BackendFactory for StandardBackendFactory {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn create(&self, context: BackendContext) -> Arc<dyn Backend> {
        match self.kind {
            BackendKind::Process => Arc::new(ProcessBackend::new(context)),
            BackendKind::Threads => Arc::new(ThreadBackend::new(context)),
            BackendKind::Web => Arc::new(WebBackend::new(context)),
        }
    }
}

/// Reports the exit of an executor at most once
///
/// Both the transport task and `stop()` may observe the end of an executor;
/// whichever gets there first reports it.
pub(crate) struct ExitNotifier {
    events: BackendEvents,
    reported: AtomicBool,
}

impl ExitNotifier {
    pub(crate) fn new(events: BackendEvents) -> Arc<Self> {
        Arc::new(Self {
            events,
            reported: AtomicBool::new(false),
        })
    }

    pub(crate) fn error(&self, message: impl Into<String>) {
        if !self.reported.load(Ordering::Acquire) {
            let _ = self.events.send(BackendEvent::Error(message.into()));
        }
    }

    pub(crate) fn exit(&self, code: Option<i32>) {
        if !self.reported.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(BackendEvent::Exit(code));
        }
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }
}
