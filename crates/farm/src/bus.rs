//! Coordinator-side event bus and master functions
//!
//! Executors relay log and trace events as fire-and-forget master calls to
//! `bus.emit`. The coordinator re-emits them to its subscribers and mirrors
//! them into its own `tracing` output.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use workerfarm_protocol::diagnostic::kind;
use workerfarm_protocol::{BusEvent, Diagnostic, LogLevel, Value};

use crate::handles::{handle_fn, HandleFn};
use crate::module::guarded;

/// Events kept for slow subscribers before they start lagging
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Broadcast relay for events coming from executors and the local worker
#[derive(Clone)]
pub struct Bus {
    sender: broadcast::Sender<BusEvent>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Re-emit an event. Having no subscribers is fine.
    pub fn emit(&self, event: BusEvent) {
        mirror(&event);
        let _ = self.sender.send(event);
    }
}

fn mirror(event: &BusEvent) {
    match event {
        BusEvent::Log(log) => {
            let child_id = log.child_id.map(|c| c.to_string());
            let child_id = child_id.as_deref().unwrap_or("local");
            let target = log.target.as_str();
            let message = log.message.as_str();
            match log.level {
                LogLevel::Error => error!(child_id, source = target, "{message}"),
                LogLevel::Warn => warn!(child_id, source = target, "{message}"),
                LogLevel::Info => info!(child_id, source = target, "{message}"),
                LogLevel::Debug => debug!(child_id, source = target, "{message}"),
                LogLevel::Trace => trace!(child_id, source = target, "{message}"),
            }
        }
        BusEvent::Trace(span) => {
            debug!(
                child_id = ?span.child_id,
                name = %span.name,
                duration_ms = span.duration_ms,
                "Trace event"
            );
        }
    }
}

/// Coordinator functions executors may call by `{location, method}`
#[derive(Clone, Default)]
pub struct MasterRegistry {
    functions: Arc<DashMap<(String, String), HandleFn>>,
}

impl MasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function
    pub fn register<F, Fut>(&self, location: impl Into<String>, method: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Diagnostic>> + Send + 'static,
    {
        self.functions
            .insert((location.into(), method.into()), handle_fn(f));
    }

    pub fn contains(&self, location: &str, method: &str) -> bool {
        self.functions
            .contains_key(&(location.to_string(), method.to_string()))
    }

    /// Call a registered function
    pub async fn call(
        &self,
        location: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Diagnostic> {
        let f = self
            .functions
            .get(&(location.to_string(), method.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                Diagnostic::new(format!("No master function {location}.{method}"))
                    .with_kind(kind::UNKNOWN_METHOD)
            })?;
        guarded(f(args)).await
    }
}

impl fmt::Debug for MasterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self
            .functions
            .iter()
            .map(|entry| format!("{}.{}", entry.key().0, entry.key().1))
            .collect();
        names.sort();
        f.debug_struct("MasterRegistry")
            .field("functions", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use workerfarm_protocol::{ChildId, LogEvent};

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = Bus::default();
        let mut rx = bus.subscribe();

        let event = BusEvent::Log(LogEvent::new(LogLevel::Info, "fixture", "hello"))
            .with_origin(ChildId(1));
        bus.emit(event.clone());

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_emit_without_subscribers() {
        Bus::new(0).emit(BusEvent::Log(LogEvent::new(LogLevel::Warn, "t", "m")));
    }

    #[tokio::test]
    async fn test_master_registry() {
        let registry = MasterRegistry::new();
        registry.register("fs", "read", |args| async move {
            Ok(json!(format!("contents of {}", args[0].as_str().unwrap_or(""))))
        });

        assert!(registry.contains("fs", "read"));
        assert_eq!(
            registry.call("fs", "read", vec![json!("a.js")]).await.unwrap(),
            json!("contents of a.js")
        );

        let err = registry.call("fs", "write", vec![]).await.unwrap_err();
        assert!(err.is_kind(kind::UNKNOWN_METHOD));
    }
}
