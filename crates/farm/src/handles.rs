//! Reverse handle table
//!
//! Each side of the boundary keeps one table of the callbacks it owns. A
//! [`Handle`] only names an entry; the callback never leaves its table.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use workerfarm_protocol::diagnostic::kind;
use workerfarm_protocol::{ChildId, Diagnostic, Handle, HandleId, Value};

use crate::module::guarded;

/// Future returned by a handle callback
pub type HandleFuture = BoxFuture<'static, Result<Value, Diagnostic>>;

/// A callback registered behind a handle
pub type HandleFn = Arc<dyn Fn(Vec<Value>) -> HandleFuture + Send + Sync>;

/// Box an async closure as a [`HandleFn`]
pub fn handle_fn<F, Fut>(f: F) -> HandleFn
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Diagnostic>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Callbacks owned by one side of the boundary
pub struct HandleTable {
    owner: Option<ChildId>,
    next_id: AtomicU64,
    handles: DashMap<HandleId, HandleFn>,
}

impl HandleTable {
    /// Create a table; `owner` is `None` in the coordinator
    pub fn new(owner: Option<ChildId>) -> Self {
        Self {
            owner,
            next_id: AtomicU64::new(1),
            handles: DashMap::new(),
        }
    }

    /// Register a callback and return its handle
    pub fn register(&self, f: HandleFn) -> Handle {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handles.insert(id, f);
        Handle::new(id, self.owner)
    }

    /// Whether this table owns the handle
    pub fn owns(&self, handle: &Handle) -> bool {
        handle.child_id == self.owner
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.handles.contains_key(&id)
    }

    /// Remove a callback; returns whether it existed
    pub fn dispose(&self, id: HandleId) -> bool {
        self.handles.remove(&id).is_some()
    }

    pub fn clear(&self) {
        self.handles.clear();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Run an owned handle. Panics in the callback become diagnostics.
    pub async fn run(&self, handle: &Handle, args: Vec<Value>) -> Result<Value, Diagnostic> {
        // Clone out of the map so no shard lock is held across the await
        let callback = self
            .handles
            .get(&handle.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| unknown_handle(handle))?;
        guarded(callback(args)).await
    }
}

pub(crate) fn unknown_handle(handle: &Handle) -> Diagnostic {
    let owner = handle
        .child_id
        .map(|c| c.to_string())
        .unwrap_or_else(|| "coordinator".to_string());
    Diagnostic::new(format!("{} is not registered in {}", handle.id, owner))
        .with_kind(kind::UNKNOWN_HANDLE)
}
