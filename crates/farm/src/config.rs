//! Farm configuration
//!
//! Every option has a default derived from the environment and the host, and
//! every option can be overridden through the `with_*` builders.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FarmError, Result};

/// Environment variable overriding the number of workers
pub const WORKERS_ENV: &str = "WORKERFARM_WORKERS";
/// Environment variable overriding the per-worker concurrency
pub const MAX_CONCURRENT_CALLS_ENV: &str = "WORKERFARM_MAX_CONCURRENT_CALLS";
/// Environment variable forcing a backend
pub const BACKEND_ENV: &str = "WORKERFARM_BACKEND";

/// Transport used to run executors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One OS process per worker
    Process,
    /// One thread per worker inside the coordinator process
    Threads,
    /// Message-port worker that reports its own lifecycle
    Web,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::Threads => "threads",
            BackendKind::Web => "web",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(BackendKind::Process),
            "threads" | "thread" => Ok(BackendKind::Threads),
            "web" => Ok(BackendKind::Web),
            other => Err(FarmError::configuration(format!(
                "unknown backend '{other}', expected process, threads or web"
            ))),
        }
    }
}

/// Options for constructing a [`crate::Farm`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmOptions {
    /// Module loaded inside every executor
    pub worker_path: Option<String>,

    /// Upper bound on the pool size
    pub max_concurrent_workers: usize,

    /// Upper bound on outstanding calls per worker
    pub max_concurrent_calls_per_worker: usize,

    /// Allow executing calls inside the coordinator
    pub use_local_worker: bool,

    /// Run calls locally until every worker is warm
    pub warm_workers: bool,

    /// Grace period between asking an executor to die and killing it
    #[serde(with = "duration_millis")]
    pub forced_kill_time: Duration,

    /// Upper bound on waiting for in-flight calls during `end()`
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,

    /// How often a call may be requeued after worker failures
    pub max_call_retries: u32,

    /// Whether executors emit trace events
    pub should_trace: bool,

    /// Forced backend; `None` means detect
    pub backend: Option<BackendKind>,

    /// Executable spawned by the process backend; defaults to the current one
    pub child_executable: Option<PathBuf>,
}

impl Default for FarmOptions {
    fn default() -> Self {
        Self {
            worker_path: None,
            max_concurrent_workers: default_worker_count(),
            max_concurrent_calls_per_worker: 30,
            use_local_worker: true,
            warm_workers: false,
            forced_kill_time: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(30),
            max_call_retries: 3,
            should_trace: false,
            backend: None,
            child_executable: None,
        }
    }
}

impl FarmOptions {
    /// Create options for a worker module
    pub fn new(worker_path: impl Into<String>) -> Self {
        Self {
            worker_path: Some(worker_path.into()),
            ..Default::default()
        }
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(workers) = env_parse::<usize>(WORKERS_ENV) {
            options.max_concurrent_workers = workers;
        }
        if let Some(calls) = env_parse::<usize>(MAX_CONCURRENT_CALLS_ENV) {
            options.max_concurrent_calls_per_worker = calls;
        }
        if let Some(backend) = env_parse::<BackendKind>(BACKEND_ENV) {
            options.backend = Some(backend);
        }
        options
    }

    /// Set the worker module
    pub fn with_worker_path(mut self, worker_path: impl Into<String>) -> Self {
        self.worker_path = Some(worker_path.into());
        self
    }

    /// Set the maximum number of workers
    pub fn with_max_concurrent_workers(mut self, max: usize) -> Self {
        self.max_concurrent_workers = max;
        self
    }

    /// Set the maximum outstanding calls per worker
    pub fn with_max_concurrent_calls_per_worker(mut self, max: usize) -> Self {
        self.max_concurrent_calls_per_worker = max;
        self
    }

    /// Allow or forbid local execution
    pub fn with_use_local_worker(mut self, enabled: bool) -> Self {
        self.use_local_worker = enabled;
        self
    }

    /// Enable warm-up through the local worker
    pub fn with_warm_workers(mut self, enabled: bool) -> Self {
        self.warm_workers = enabled;
        self
    }

    /// Set the forced kill grace period
    pub fn with_forced_kill_time(mut self, duration: Duration) -> Self {
        self.forced_kill_time = duration;
        self
    }

    /// Set the drain timeout used by `end()`
    pub fn with_drain_timeout(mut self, duration: Duration) -> Self {
        self.drain_timeout = duration;
        self
    }

    /// Set the retry bound
    pub fn with_max_call_retries(mut self, retries: u32) -> Self {
        self.max_call_retries = retries;
        self
    }

    /// Enable trace events
    pub fn with_should_trace(mut self, enabled: bool) -> Self {
        self.should_trace = enabled;
        self
    }

    /// Force a backend
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the executable spawned by the process backend
    pub fn with_child_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.child_executable = Some(path.into());
        self
    }

    /// Reject configurations that can never run a call
    pub fn validate(&self) -> Result<()> {
        match &self.worker_path {
            None => return Err(FarmError::MissingWorkerPath),
            Some(path) if path.trim().is_empty() => return Err(FarmError::MissingWorkerPath),
            Some(_) => {}
        }
        if self.max_concurrent_calls_per_worker == 0 {
            return Err(FarmError::configuration(
                "max_concurrent_calls_per_worker must be at least 1",
            ));
        }
        if self.max_concurrent_workers == 0 && !self.use_local_worker {
            return Err(FarmError::configuration(
                "no workers and no local worker: calls could never run",
            ));
        }
        Ok(())
    }

    /// Whether the pool may start remote workers at all
    pub fn allows_remote_workers(&self) -> bool {
        self.max_concurrent_workers > 0
    }
}

/// `min(4, ceil(cpus / 2))`, at least one
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.div_ceil(2).clamp(1, 4)
}

fn env_parse<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(variable = name, value = %raw, error = %e, "Ignoring invalid environment override");
            None
        }
    }
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
