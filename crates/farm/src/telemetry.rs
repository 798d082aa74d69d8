// Telemetry setup for coordinators and executors
//
// The coordinator logs to stderr through a `tracing-subscriber` registry.
// Process executors install the same fmt layer plus a `BusLayer`, which turns
// every tracing event into a `BusEvent` relayed to the coordinator.

use std::fmt::Debug;

use serde_json::{Map, Number, Value};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;
use workerfarm_protocol::{BusEvent, LogEvent, LogLevel};

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to startup logs
    pub service_name: String,

    /// Log filter directive (e.g. "info", "workerfarm=debug")
    pub log_filter: Option<String>,

    /// Colored output
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "workerfarm".to_string(),
            log_filter: None,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Create config from environment variables
    ///
    /// Reads:
    /// - `RUST_LOG` or `LOG_LEVEL`: log filter
    /// - `NO_COLOR`: disables ANSI colors when set
    pub fn from_env() -> Self {
        let log_filter = std::env::var("RUST_LOG")
            .or_else(|_| std::env::var("LOG_LEVEL"))
            .ok();

        Self {
            log_filter,
            ansi: std::env::var_os("NO_COLOR").is_none(),
            ..Default::default()
        }
    }

    /// Set the service name
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global subscriber for a coordinator
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(config.filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(config.ansi)
                .with_writer(std::io::stderr),
        )
        .try_init()?;

    tracing::debug!(service = %config.service_name, "Telemetry initialized");
    Ok(())
}

/// Install the global subscriber for a process executor
///
/// Executor stdout carries frames, so human-readable logs go to stderr and
/// every event is also forwarded to the coordinator through `bus`.
pub fn init_child_telemetry(config: TelemetryConfig, bus: BusLayer) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(config.filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .with(bus)
        .try_init()
}

/// Layer forwarding tracing events as [`BusEvent::Log`]
pub struct BusLayer {
    sender: mpsc::UnboundedSender<BusEvent>,
}

impl BusLayer {
    /// Create a layer and the receiver the executor runtime drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BusEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl<S: Subscriber> Layer<S> for BusLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let log = LogEvent {
            level: level_of(metadata.level()),
            target: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            child_id: None,
        };
        // The runtime is gone once the receiver is dropped; nothing to relay to
        let _ = self.sender.send(BusEvent::Log(log));
    }
}

fn level_of(level: &Level) -> LogLevel {
    match *level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warn,
        Level::INFO => LogLevel::Info,
        Level::DEBUG => LogLevel::Debug,
        Level::TRACE => LogLevel::Trace,
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    fn record_value(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        let value = Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null);
        self.record_value(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, Value::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.record_value(field, Value::String(format!("{value:?}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "workerfarm");
        assert!(config.log_filter.is_none());
        assert!(config.ansi);
    }

    #[test]
    fn test_bus_layer_forwards_events() {
        let (layer, mut rx) = BusLayer::channel();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(file = "a.js", attempt = 2, "slow transform");
        });

        let Some(BusEvent::Log(log)) = rx.try_recv().ok() else {
            panic!("expected a log event");
        };
        assert_eq!(log.level, LogLevel::Warn);
        assert_eq!(log.message, "slow transform");
        assert_eq!(log.fields["file"], json!("a.js"));
        assert_eq!(log.fields["attempt"], json!(2));
        assert!(log.child_id.is_none());
    }
}
