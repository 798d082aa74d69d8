//! Reverse handles as tagged capability references
//!
//! A handle never carries code across the boundary. On the wire it is an
//! object tagged with [`HANDLE_TAG`]:
//!
//! ```json
//! { "$$handle": 3, "childId": 1 }
//! ```
//!
//! `childId` names the owning executor; a handle without it is owned by the
//! coordinator. Any side holding the value can ask the owner to run it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ChildId, HandleId};

/// Tag recognising a handle inside an arbitrary argument tree
pub const HANDLE_TAG: &str = "$$handle";

/// Capability reference to a callback living in its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    #[serde(rename = "$$handle")]
    pub id: HandleId,

    /// Owning executor; `None` means the coordinator
    #[serde(rename = "childId", default, skip_serializing_if = "Option::is_none")]
    pub child_id: Option<ChildId>,
}

impl Handle {
    pub fn new(id: HandleId, child_id: Option<ChildId>) -> Self {
        Self { id, child_id }
    }

    /// Whether the coordinator owns this handle
    pub fn is_coordinator_owned(&self) -> bool {
        self.child_id.is_none()
    }

    /// Recognise a handle value. Returns `None` for anything without the tag.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if !object.contains_key(HANDLE_TAG) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Convert into its wire representation
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<Handle> for Value {
    fn from(handle: Handle) -> Self {
        handle.to_value()
    }
}
