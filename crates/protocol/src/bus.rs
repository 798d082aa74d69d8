//! Log and trace events relayed from executors to the coordinator

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ChildId;

/// Severity of a relayed log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// A log line emitted inside an executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub level: LogLevel,
    /// Module path or logical source of the event
    pub target: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    /// Executor that produced the event; filled in by the coordinator
    #[serde(default)]
    pub child_id: Option<ChildId>,
}

impl LogEvent {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            target: target.into(),
            message: message.into(),
            fields: Map::new(),
            child_id: None,
        }
    }

    /// Attach a structured field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// A timed span emitted inside an executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub name: String,
    /// Start time in milliseconds since the Unix epoch
    pub started_at_ms: i64,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
    #[serde(default)]
    pub child_id: Option<ChildId>,
}

/// Everything the bus relays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BusEvent {
    Log(LogEvent),
    Trace(TraceEvent),
}

impl BusEvent {
    /// The executor that produced the event, if any
    pub fn child_id(&self) -> Option<ChildId> {
        match self {
            BusEvent::Log(event) => event.child_id,
            BusEvent::Trace(event) => event.child_id,
        }
    }

    /// Stamp the event with its origin, keeping an existing stamp
    pub fn with_origin(mut self, child_id: ChildId) -> Self {
        let slot = match &mut self {
            BusEvent::Log(event) => &mut event.child_id,
            BusEvent::Trace(event) => &mut event.child_id,
        };
        slot.get_or_insert(child_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_event_shape() {
        let event = BusEvent::Log(
            LogEvent::new(LogLevel::Warn, "transformer", "slow file").with_field("ms", 812),
        );
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["kind"], json!("log"));
        assert_eq!(value["level"], json!("warn"));
        assert_eq!(value["fields"], json!({"ms": 812}));
        assert_eq!(value["childId"], json!(null));
    }

    #[test]
    fn test_with_origin_keeps_existing() {
        let event = BusEvent::Log(LogEvent::new(LogLevel::Info, "t", "m")).with_origin(ChildId(2));
        assert_eq!(event.child_id(), Some(ChildId(2)));

        let event = event.with_origin(ChildId(9));
        assert_eq!(event.child_id(), Some(ChildId(2)));
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Debug);
        assert_eq!(LogLevel::Trace.as_str(), "trace");
    }
}
