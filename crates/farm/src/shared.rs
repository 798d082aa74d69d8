//! Shared reference tables
//!
//! The coordinator allocates reference ids and keeps the authoritative table.
//! Every executor keeps a mirror with the same ids, plus a reverse index so
//! module code can map a value it received back to its reference.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use workerfarm_protocol::{SharedRefId, Value};

/// `{ref -> value}` and `{value -> refs}`
///
/// The reverse index is bucketed by a structural hash of the value; a bucket
/// lists every live id with that hash in allocation order, so equal values
/// stay resolvable until the last of them is removed.
#[derive(Debug, Default)]
pub struct SharedReferenceTable {
    next_id: u64,
    values: HashMap<SharedRefId, Value>,
    by_value: HashMap<u64, Vec<SharedRefId>>,
}

impl SharedReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value under a fresh id. Ids are never reused.
    pub fn allocate(&mut self, value: Value) -> SharedRefId {
        self.next_id += 1;
        let id = SharedRefId(self.next_id);
        self.insert(id, value);
        id
    }

    /// Store a value under an id chosen elsewhere
    pub fn insert(&mut self, id: SharedRefId, value: Value) {
        if let Some(previous) = self.values.remove(&id) {
            self.forget_value(&previous, id);
        }
        self.by_value.entry(value_hash(&value)).or_default().push(id);
        self.values.insert(id, value);
    }

    /// Drop a reference, returning its value
    pub fn remove(&mut self, id: SharedRefId) -> Option<Value> {
        let value = self.values.remove(&id)?;
        self.forget_value(&value, id);
        Some(value)
    }

    pub fn get(&self, id: SharedRefId) -> Option<&Value> {
        self.values.get(&id)
    }

    /// Find the id a value was registered under, the latest one if several
    pub fn resolve(&self, value: &Value) -> Option<SharedRefId> {
        self.by_value
            .get(&value_hash(value))?
            .iter()
            .rev()
            .copied()
            .find(|id| self.values.get(id) == Some(value))
    }

    pub fn contains(&self, id: SharedRefId) -> bool {
        self.values.contains_key(&id)
    }

    /// All references, ordered by id
    pub fn entries(&self) -> Vec<(SharedRefId, Value)> {
        let mut entries: Vec<_> = self
            .values
            .iter()
            .map(|(id, value)| (*id, value.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.by_value.clear();
    }

    fn forget_value(&mut self, value: &Value, id: SharedRefId) {
        let key = value_hash(value);
        if let Some(ids) = self.by_value.get_mut(&key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_value.remove(&key);
            }
        }
    }
}

fn value_hash(value: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_value(value, &mut hasher);
    hasher.finish()
}

// Equal values hash equally; object entries are combined order-independently
fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => {
            2u8.hash(state);
            n.as_f64().map(f64::to_bits).hash(state);
        }
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Object(map) => {
            5u8.hash(state);
            map.len().hash(state);
            let combined = map.iter().fold(0u64, |acc, (key, item)| {
                let mut entry = DefaultHasher::new();
                key.hash(&mut entry);
                hash_value(item, &mut entry);
                acc.wrapping_add(entry.finish())
            });
            combined.hash(state);
        }
    }
}
