//! Module and mock registries.
//!
//! The module registry caches real module records by absolute path with a
//! placeholder-first insertion protocol: the record (with an empty exports
//! bag) is inserted before the module body runs, so a re-entrant require of
//! the same path during a dependency cycle observes the partially populated
//! exports instead of recursing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::{ObjectHandle, Value, ValueHeap};

/// Filename every executed module reports for its parent.
pub const SENTINEL_PARENT_FILENAME: &str = "mock.js";

/// Module id every executed module reports for its parent.
pub const SENTINEL_PARENT_ID: &str = "mockParent";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// The shared parent record: a stable identity user code can observe
/// through `module.parent`, never meaningfully mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelParent {
    pub exports: ObjectHandle,
}

impl SentinelParent {
    /// Allocate the sentinel's (frozen) empty exports bag on a heap.
    pub fn install(heap: &mut ValueHeap) -> Self {
        let exports = heap.alloc_object();
        heap.freeze(exports);
        Self { exports }
    }
}

/// Identity fields of the sentinel parent as observed by user code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub filename: String,
    pub id: String,
}

impl ParentLink {
    pub fn sentinel() -> Self {
        Self {
            filename: SENTINEL_PARENT_FILENAME.to_string(),
            id: SENTINEL_PARENT_ID.to_string(),
        }
    }
}

/// Per-file require capability handed to a module body. The `cache` and
/// `extensions` mappings exist for host compatibility and stay empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundRequire {
    pub from: String,
    pub cache: BTreeMap<String, Value>,
    pub extensions: BTreeMap<String, Value>,
}

impl BoundRequire {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            cache: BTreeMap::new(),
            extensions: BTreeMap::new(),
        }
    }
}

/// Cached record of one loaded module. Identity is stable once inserted;
/// the exports value is mutated by the module body during first execution
/// and thereafter only by the module itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub filename: String,
    pub exports: Value,
    pub parent: ParentLink,
    pub children: Vec<String>,
    pub paths: Vec<String>,
    pub require: BoundRequire,
}

impl ModuleRecord {
    /// Placeholder record inserted before execution.
    pub fn placeholder(filename: impl Into<String>, exports: Value) -> Self {
        let filename = filename.into();
        Self {
            exports,
            parent: ParentLink::sentinel(),
            children: Vec::new(),
            paths: Vec::new(),
            require: BoundRequire::new(filename.clone()),
            filename,
        }
    }
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// Absolute path → module record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleRegistry {
    records: BTreeMap<String, ModuleRecord>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.records.contains_key(filename)
    }

    pub fn get(&self, filename: &str) -> Option<&ModuleRecord> {
        self.records.get(filename)
    }

    pub fn get_mut(&mut self, filename: &str) -> Option<&mut ModuleRecord> {
        self.records.get_mut(filename)
    }

    /// Placeholder-first insertion; the record must be present before the
    /// module body runs.
    pub fn insert(&mut self, record: ModuleRecord) {
        self.records.insert(record.filename.clone(), record);
    }

    pub fn remove(&mut self, filename: &str) -> Option<ModuleRecord> {
        self.records.remove(filename)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Serialized module identifier → delivered mock value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockRegistry {
    entries: BTreeMap<String, Value>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, value: Value) {
        self.entries.insert(id.into(), value);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_records_carry_the_sentinel_parent() {
        let mut heap = ValueHeap::new();
        let exports = Value::Object(heap.alloc_object());
        let record = ModuleRecord::placeholder("/t/a.js", exports);
        assert_eq!(record.parent.filename, "mock.js");
        assert_eq!(record.parent.id, "mockParent");
        assert!(record.children.is_empty());
        assert!(record.require.cache.is_empty());
        assert!(record.require.extensions.is_empty());
        assert_eq!(record.require.from, "/t/a.js");
    }

    #[test]
    fn registry_round_trips_and_clears() {
        let mut heap = ValueHeap::new();
        let mut registry = ModuleRegistry::new();
        let exports = Value::Object(heap.alloc_object());
        registry.insert(ModuleRecord::placeholder("/t/a.js", exports.clone()));

        assert!(registry.contains("/t/a.js"));
        assert_eq!(registry.get("/t/a.js").unwrap().exports, exports);
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn sentinel_exports_bag_is_frozen() {
        let mut heap = ValueHeap::new();
        let sentinel = SentinelParent::install(&mut heap);
        heap.set_property(sentinel.exports, "poke", Value::Int(1));
        assert_eq!(heap.property(sentinel.exports, "poke"), Value::Undefined);
    }
}
