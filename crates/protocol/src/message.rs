//! Request/response messages and transport frames

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Diagnostic, Handle};

/// Identifier of one executor, assigned by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildId(pub u64);

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "child-{}", self.0)
    }
}

/// Correlation index of a request on one connection
///
/// Allocated from a monotonically increasing counter per connection, so an
/// index is never handed out again while its response is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallIdx(pub u64);

impl fmt::Display for CallIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a reverse handle, unique within its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// Identifier of a shared reference, allocated by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedRefId(pub u64);

impl fmt::Display for SharedRefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref-{}", self.0)
    }
}

/// What a request addresses on the receiving side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Target {
    /// A module method (or a reserved control method) inside the executor
    Method(String),
    /// A reverse handle; executed only by its owner
    Handle(Handle),
    /// A coordinator function registered under `location`
    Master { location: String, method: String },
}

impl Target {
    /// Create a method target
    pub fn method(name: impl Into<String>) -> Self {
        Target::Method(name.into())
    }

    /// Create a master target
    pub fn master(location: impl Into<String>, method: impl Into<String>) -> Self {
        Target::Master {
            location: location.into(),
            method: method.into(),
        }
    }

    /// Short label for logs
    pub fn label(&self) -> String {
        match self {
            Target::Method(name) => name.clone(),
            Target::Handle(handle) => handle.id.to_string(),
            Target::Master { location, method } => format!("{location}.{method}"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A call travelling across the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub idx: CallIdx,
    pub child_id: Option<ChildId>,
    pub target: Target,
    #[serde(default)]
    pub args: Vec<Value>,
    /// When false the receiver must not send a response
    #[serde(default = "default_true")]
    pub await_response: bool,
    /// Set on warm-up copies of locally executed calls
    #[serde(default, skip_serializing_if = "is_false")]
    pub warmup: bool,
}

impl Request {
    /// Create a request that expects a response
    pub fn new(idx: CallIdx, child_id: Option<ChildId>, target: Target, args: Vec<Value>) -> Self {
        Self {
            idx,
            child_id,
            target,
            args,
            await_response: true,
            warmup: false,
        }
    }

    /// Mark the request as fire-and-forget
    pub fn without_response(mut self) -> Self {
        self.await_response = false;
        self
    }

    /// Mark the request as a warm-up copy
    pub fn as_warmup(mut self, warmup: bool) -> Self {
        self.warmup = warmup;
        self
    }
}

/// Payload of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "contentType", content = "content", rename_all = "lowercase")]
pub enum ResponseContent {
    Data(Value),
    Error(Diagnostic),
}

impl ResponseContent {
    /// Convert into a `Result`
    pub fn into_result(self) -> Result<Value, Diagnostic> {
        match self {
            ResponseContent::Data(value) => Ok(value),
            ResponseContent::Error(diagnostic) => Err(diagnostic),
        }
    }
}

impl From<Result<Value, Diagnostic>> for ResponseContent {
    fn from(result: Result<Value, Diagnostic>) -> Self {
        match result {
            Ok(value) => ResponseContent::Data(value),
            Err(diagnostic) => ResponseContent::Error(diagnostic),
        }
    }
}

/// The answer to exactly one [`Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub idx: CallIdx,
    pub child_id: Option<ChildId>,
    pub content: ResponseContent,
}

impl Response {
    /// Build the response for a request
    pub fn to(request: &Request, result: Result<Value, Diagnostic>) -> Self {
        Self {
            idx: request.idx,
            child_id: request.child_id,
            content: result.into(),
        }
    }
}

/// A request or a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Request(Request),
    Response(Response),
}

/// Unit of transport between a backend and its executor
///
/// `Online` and `Stopped` are only produced by executors behind a
/// message-port backend, which cannot observe the executor's exit directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "camelCase")]
pub enum Frame {
    Message(Message),
    /// Asks the executor to shut down
    Die,
    /// The executor is running and accepts messages
    Online,
    /// The executor finished shutting down
    Stopped,
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Frame::Message(message)
    }
}

impl From<Request> for Frame {
    fn from(request: Request) -> Self {
        Frame::Message(Message::Request(request))
    }
}

impl From<Response> for Frame {
    fn from(response: Response) -> Self {
        Frame::Message(Message::Response(response))
    }
}
