// Backend selection
//
// The environment is probed once; the choice itself is a pure function so it
// can be tested without touching the host.

use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, BACKEND_ENV};

/// Host facts relevant to choosing a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEnvironment {
    /// Value of `WORKERFARM_BACKEND`, unparsed
    pub forced: Option<String>,
    /// Threads can be spawned
    pub threads_available: bool,
    /// Running on a wasm host, where only message-port workers exist
    pub wasm_host: bool,
}

impl BackendEnvironment {
    /// Read the facts from the running host
    pub fn probe() -> Self {
        Self {
            forced: std::env::var(BACKEND_ENV).ok().filter(|v| !v.trim().is_empty()),
            threads_available: cfg!(not(target_family = "wasm"))
                && std::thread::available_parallelism().is_ok(),
            wasm_host: cfg!(target_family = "wasm"),
        }
    }
}

/// Choose a backend: forced, then web on wasm, then threads, then process
///
/// An unparseable override is ignored.
pub fn select_backend(env: &BackendEnvironment) -> BackendKind {
    if let Some(kind) = env.forced.as_deref().and_then(|v| v.parse().ok()) {
        return kind;
    }
    if env.wasm_host {
        BackendKind::Web
    } else if env.threads_available {
        BackendKind::Threads
    } else {
        BackendKind::Process
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(forced: Option<&str>, threads: bool, wasm: bool) -> BackendEnvironment {
        BackendEnvironment {
            forced: forced.map(str::to_string),
            threads_available: threads,
            wasm_host: wasm,
        }
    }

    #[test]
    fn test_prefers_threads() {
        assert_eq!(select_backend(&env(None, true, false)), BackendKind::Threads);
    }

    #[test]
    fn test_falls_back_to_process() {
        assert_eq!(select_backend(&env(None, false, false)), BackendKind::Process);
    }

    #[test]
    fn test_wasm_host_uses_web() {
        assert_eq!(select_backend(&env(None, false, true)), BackendKind::Web);
    }

    #[test]
    fn test_override_wins() {
        assert_eq!(
            select_backend(&env(Some("process"), true, false)),
            BackendKind::Process
        );
        assert_eq!(
            select_backend(&env(Some("threads"), false, false)),
            BackendKind::Threads
        );
    }

    #[test]
    fn test_invalid_override_is_ignored() {
        assert_eq!(
            select_backend(&env(Some("fork"), true, false)),
            BackendKind::Threads
        );
    }

    #[test]
    fn test_probe_on_native_host() {
        let probed = BackendEnvironment::probe();
        assert!(!probed.wasm_host);
    }
}
