//! # workerfarm wire protocol
//!
//! Types exchanged between the coordinator and its executors.
//!
//! ```text
//! coordinator                                   executor
//!     │  Frame::Message(Request { idx, target })     │
//!     │ ───────────────────────────────────────────▶ │
//!     │                                              │
//!     │  Frame::Message(Response { idx, content })   │
//!     │ ◀─────────────────────────────────────────── │
//!     │                                              │
//!     │  Frame::Die                                  │
//!     │ ───────────────────────────────────────────▶ │
//! ```
//!
//! Requests flow both ways: the coordinator calls module methods and
//! executor-owned handles, executors call coordinator handles and master
//! functions (including the bus).

pub mod bus;
pub mod codec;
pub mod diagnostic;
pub mod handle;
pub mod message;

pub use bus::{BusEvent, LogEvent, LogLevel, TraceEvent};
pub use codec::{decode_frame, encode_frame, ProtocolError};
pub use diagnostic::Diagnostic;
pub use handle::{Handle, HANDLE_TAG};
pub use message::{
    CallIdx, ChildId, Frame, HandleId, Message, Request, Response, ResponseContent, SharedRefId,
    Target,
};

/// Re-export of the value type carried in arguments and results
pub use serde_json::Value;

/// Method names the executor runtime handles itself
pub mod methods {
    /// Loads the target module and runs its init hook
    pub const CHILD_INIT: &str = "childInit";
    /// Stores a shared reference in the executor
    pub const CREATE_SHARED_REFERENCE: &str = "createSharedReference";
    /// Drops a shared reference from the executor
    pub const DELETE_SHARED_REFERENCE: &str = "deleteSharedReference";
    /// Starts collecting call timings
    pub const START_PROFILE: &str = "startProfile";
    /// Stops collecting call timings and returns the profile
    pub const END_PROFILE: &str = "endProfile";
    /// Writes a memory report for the executor
    pub const TAKE_HEAP_SNAPSHOT: &str = "takeHeapSnapshot";

    /// All reserved names. Modules may not register methods with these names.
    pub const RESERVED: [&str; 6] = [
        CHILD_INIT,
        CREATE_SHARED_REFERENCE,
        DELETE_SHARED_REFERENCE,
        START_PROFILE,
        END_PROFILE,
        TAKE_HEAP_SNAPSHOT,
    ];

    /// Check whether a method name is reserved
    pub fn is_reserved(method: &str) -> bool {
        RESERVED.contains(&method)
    }
}

/// Master call locations built into the coordinator
pub mod locations {
    /// The event bus; its only method is [`BUS_EMIT`]
    pub const BUS: &str = "bus";
    /// Re-emits a [`crate::BusEvent`] on the coordinator
    pub const BUS_EMIT: &str = "emit";
}
