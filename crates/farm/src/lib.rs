// Worker farm
//
// Runs module methods on a pool of parallel executors (OS processes, threads
// or message-port workers) and lets executors call back into the coordinator.
//
// Key design decisions:
// - Modules are registered by name with typed handlers; nothing is loaded by path at runtime
// - One dispatcher task owns the queue, the pool and the shared reference table
// - Backends share one trait; selection is a pure function of a probed environment
// - Handles are tagged capability references; callbacks never leave their owner
// - Transport failures are retried a bounded number of times, execution errors never are

// Configuration and errors
pub mod config;
pub mod error;
pub mod telemetry;

// Module side: what runs inside an executor
pub mod api;
pub mod handles;
pub mod module;
pub mod profiler;
pub mod shared;

// Executors and transports
pub mod backend;
pub mod child;

// Coordinator
pub mod bus;
pub mod farm;
mod worker;

// Re-exports for convenience
pub use api::{WorkerApi, WorkerHost};
pub use backend::{Backend, BackendContext, BackendEvent, BackendFactory, StandardBackendFactory};
pub use bus::{Bus, MasterRegistry};
pub use child::{is_child_process, run_process_child, ChildRuntime};
pub use config::{BackendKind, FarmOptions};
pub use error::{BackendError, FarmError, RegistryError, Result};
pub use farm::{Farm, FarmBuilder, FarmCell, FarmStats, MethodHandle, SharedReference};
pub use module::{ModuleRegistry, WorkerModule, WorkerModuleBuilder};
pub use profiler::{MemorySnapshot, Profile};
pub use telemetry::{init_telemetry, TelemetryConfig};

pub use workerfarm_protocol as protocol;
pub use workerfarm_protocol::{BusEvent, ChildId, Diagnostic, Handle, LogLevel, SharedRefId, Value};
