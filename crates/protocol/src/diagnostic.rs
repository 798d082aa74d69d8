//! Structured execution errors

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known diagnostic kinds
pub mod kind {
    /// The executor code panicked
    pub const PANIC: &str = "panic";
    /// Arguments or results could not be (de)serialized
    pub const SERIALIZATION: &str = "serialization";
    /// The requested method is not registered
    pub const UNKNOWN_METHOD: &str = "unknown_method";
    /// The requested handle does not exist in its owner
    pub const UNKNOWN_HANDLE: &str = "unknown_handle";
    /// The request arrived before the module was initialised
    pub const NOT_INITIALIZED: &str = "not_initialized";
    /// The connection to the other side went away mid-call
    pub const DISCONNECTED: &str = "disconnected";
}

/// Serializable description of a failed call
///
/// This is what a caller sees when the method it invoked fails. It is built
/// from whatever error the executor produced and carries enough context to
/// report it without access to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    /// Human readable message
    pub message: String,

    /// Error kind for programmatic handling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Where the error came from (module name, `child-3`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Error chain or backtrace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Suggestions for fixing the problem
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

impl Diagnostic {
    /// Create a diagnostic with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            origin: None,
            stack: None,
            hints: Vec::new(),
        }
    }

    /// Set the kind
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the origin, keeping an existing one
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        if self.origin.is_none() {
            self.origin = Some(origin.into());
        }
        self
    }

    /// Set the stack
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Add a hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    /// Whether the diagnostic has the given kind
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }

    /// Build a diagnostic from a caught panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "executor panicked".to_string()
        };
        Self::new(message).with_kind(kind::PANIC)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "[{}] {}", origin, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for Diagnostic {}

impl From<anyhow::Error> for Diagnostic {
    fn from(err: anyhow::Error) -> Self {
        let chain: Vec<String> = err.chain().skip(1).map(|cause| cause.to_string()).collect();
        let diagnostic = Self::new(err.to_string());
        if chain.is_empty() {
            diagnostic
        } else {
            diagnostic.with_stack(chain.join("\n"))
        }
    }
}

impl From<serde_json::Error> for Diagnostic {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_kind(kind::SERIALIZATION)
    }
}

impl From<String> for Diagnostic {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for Diagnostic {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_from_anyhow_keeps_chain() {
        let err = Err::<(), _>(anyhow::anyhow!("disk full"))
            .context("writing bundle")
            .unwrap_err();
        let diagnostic = Diagnostic::from(err);

        assert_eq!(diagnostic.message, "writing bundle");
        assert_eq!(diagnostic.stack.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_from_panic_payloads() {
        let d = Diagnostic::from_panic(Box::new("static message"));
        assert_eq!(d.message, "static message");
        assert!(d.is_kind(kind::PANIC));

        let d = Diagnostic::from_panic(Box::new(String::from("owned message")));
        assert_eq!(d.message, "owned message");

        let d = Diagnostic::from_panic(Box::new(42_u8));
        assert_eq!(d.message, "executor panicked");
    }

    #[test]
    fn test_origin_is_not_overwritten() {
        let d = Diagnostic::new("boom").with_origin("echo").with_origin("child-2");
        assert_eq!(d.origin.as_deref(), Some("echo"));
        assert_eq!(d.to_string(), "[echo] boom");
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let value = serde_json::to_value(Diagnostic::new("boom")).unwrap();
        assert_eq!(value, serde_json::json!({"message": "boom"}));
    }
}
