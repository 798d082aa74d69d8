// Error types for the worker farm

use thiserror::Error;
use workerfarm_protocol::{Diagnostic, Handle, ProtocolError};

/// Result type alias for farm operations
pub type Result<T> = std::result::Result<T, FarmError>;

/// Errors returned by the farm to its callers
#[derive(Debug, Error)]
pub enum FarmError {
    /// The farm is ending or has ended
    #[error("Cannot add a worker call if workerfarm is ending")]
    Ending,

    /// No worker module configured
    #[error("Please provide a worker path")]
    MissingWorkerPath,

    /// The module registry could not provide the worker module
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The worker module has no such method
    #[error("Unknown method '{method}' on worker module '{module}'")]
    UnknownMethod { module: String, method: String },

    /// The method ran and failed
    #[error("{0}")]
    Execution(Diagnostic),

    /// The call was requeued too often after worker failures
    #[error("Call to '{method}' abandoned after {retries} retries: {reason}")]
    RetriesExhausted {
        method: String,
        retries: u32,
        reason: String,
    },

    /// Workers keep failing to start
    #[error("Worker failed to start: {0}")]
    WorkerStartup(String),

    /// Transport failure outside of a call
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// The handle is not registered
    #[error("Handle not found: {}", .0.id)]
    HandleNotFound(Handle),

    /// Invalid options
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FarmError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        FarmError::Configuration(msg.into())
    }

    /// Create an unknown method error
    pub fn unknown_method(module: impl Into<String>, method: impl Into<String>) -> Self {
        FarmError::UnknownMethod {
            module: module.into(),
            method: method.into(),
        }
    }

    /// Whether the error comes from the farm shutting down
    pub fn is_ending(&self) -> bool {
        matches!(self, FarmError::Ending)
    }

    /// The execution diagnostic, if the method itself failed
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            FarmError::Execution(diagnostic) => Some(diagnostic),
            _ => None,
        }
    }
}

impl From<Diagnostic> for FarmError {
    fn from(diagnostic: Diagnostic) -> Self {
        FarmError::Execution(diagnostic)
    }
}

impl From<FarmError> for Diagnostic {
    fn from(err: FarmError) -> Self {
        match err {
            FarmError::Execution(diagnostic) => diagnostic,
            other => Diagnostic::new(other.to_string()),
        }
    }
}

/// Transport errors raised by backends
#[derive(Debug, Error)]
pub enum BackendError {
    /// The executor could not be started
    #[error("failed to spawn executor: {0}")]
    Spawn(String),

    /// `send` before `start` or after `stop`
    #[error("backend is not running")]
    NotRunning,

    /// The channel to the executor is gone
    #[error("channel to executor closed")]
    Closed,

    /// The executor did not report itself online in time
    #[error("executor did not come online within {0:?}")]
    StartTimeout(std::time::Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors raised while building or resolving worker modules
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No module registered under the path
    #[error("Unknown worker module '{0}'")]
    UnknownModule(String),

    /// A method uses a name the executor runtime handles itself
    #[error("Method '{method}' on module '{module}' uses a reserved name")]
    ReservedMethod { module: String, method: String },

    /// A method was registered twice
    #[error("Method '{method}' registered twice on module '{module}'")]
    DuplicateMethod { module: String, method: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use workerfarm_protocol::{HandleId, ChildId};

    #[test]
    fn test_ending_message() {
        let err = FarmError::Ending;
        assert!(err.is_ending());
        assert_eq!(
            err.to_string(),
            "Cannot add a worker call if workerfarm is ending"
        );
    }

    #[test]
    fn test_execution_diagnostic_round_trip() {
        let err = FarmError::from(Diagnostic::new("boom").with_origin("echo"));
        assert_eq!(err.to_string(), "[echo] boom");
        assert_eq!(err.diagnostic().map(|d| d.message.as_str()), Some("boom"));

        let back = Diagnostic::from(err);
        assert_eq!(back.origin.as_deref(), Some("echo"));
    }

    #[test]
    fn test_other_errors_become_plain_diagnostics() {
        let handle = Handle::new(HandleId(3), Some(ChildId(1)));
        let diagnostic = Diagnostic::from(FarmError::HandleNotFound(handle));
        assert_eq!(diagnostic.message, "Handle not found: handle-3");
    }

    #[test]
    fn test_registry_error_converts() {
        let err: FarmError = RegistryError::UnknownModule("nope".into()).into();
        assert_eq!(err.to_string(), "Unknown worker module 'nope'");
    }
}
