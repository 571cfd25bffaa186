//! Mock-metadata library: introspects a live exports value into a
//! serialisable shape and re-materialises a mock from it.
//!
//! Metadata is deliberately lossy: a function's behaviour is discarded and
//! regenerates as a recording no-op, which is the whole point of automock.
//! Extraction is cycle-safe — revisiting an object already on the walk
//! yields empty-object metadata instead of recursing.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::value::{FunctionData, ObjectHandle, ObjectKind, Value, ValueHeap};

/// Serialisable shape of a live value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MockMetadata {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Callable with its own enumerable members.
    Function { members: BTreeMap<String, MockMetadata> },
    /// Plain bag of members.
    Object { members: BTreeMap<String, MockMetadata> },
}

impl MockMetadata {
    /// Metadata of an empty object; seeds the metadata cache to terminate
    /// self-requiring modules.
    pub fn empty_object() -> Self {
        Self::Object {
            members: BTreeMap::new(),
        }
    }
}

/// Extract metadata from a live value. `None` for undefined values — the
/// caller turns that into an automock failure naming the module.
pub fn get_metadata(heap: &ValueHeap, value: &Value) -> Option<MockMetadata> {
    let mut visiting = BTreeSet::new();
    extract(heap, value, &mut visiting)
}

fn extract(
    heap: &ValueHeap,
    value: &Value,
    visiting: &mut BTreeSet<ObjectHandle>,
) -> Option<MockMetadata> {
    match value {
        Value::Undefined => None,
        Value::Null => Some(MockMetadata::Null),
        Value::Bool(b) => Some(MockMetadata::Bool(*b)),
        Value::Int(n) => Some(MockMetadata::Int(*n)),
        Value::Str(s) => Some(MockMetadata::Str(s.clone())),
        Value::Object(handle) => {
            let object = heap.get(*handle)?;
            if !visiting.insert(*handle) {
                return Some(MockMetadata::empty_object());
            }

            let mut members = BTreeMap::new();
            for (key, member) in &object.properties {
                if let Some(metadata) = extract(heap, member, visiting) {
                    members.insert(key.clone(), metadata);
                }
            }
            visiting.remove(handle);

            Some(match object.kind {
                ObjectKind::Function(_) => MockMetadata::Function { members },
                ObjectKind::Plain => MockMetadata::Object { members },
            })
        }
    }
}

/// Materialise a fresh mock value from metadata. Functions come back as
/// recording no-ops; everything else is rebuilt structurally.
pub fn generate_from_metadata(heap: &mut ValueHeap, metadata: &MockMetadata) -> Value {
    match metadata {
        MockMetadata::Null => Value::Null,
        MockMetadata::Bool(b) => Value::Bool(*b),
        MockMetadata::Int(n) => Value::Int(*n),
        MockMetadata::Str(s) => Value::Str(s.clone()),
        MockMetadata::Function { members } => {
            let handle = heap.alloc_function(FunctionData::mock());
            populate(heap, handle, members);
            Value::Object(handle)
        }
        MockMetadata::Object { members } => {
            let handle = heap.alloc_object();
            populate(heap, handle, members);
            Value::Object(handle)
        }
    }
}

fn populate(heap: &mut ValueHeap, handle: ObjectHandle, members: &BTreeMap<String, MockMetadata>) {
    for (key, metadata) in members {
        let member = generate_from_metadata(heap, metadata);
        heap.set_property(handle, key.clone(), member);
    }
}

/// A fresh recording no-op mock function.
pub fn mock_function(heap: &mut ValueHeap) -> Value {
    Value::Object(heap.alloc_function(FunctionData::mock()))
}

/// A fresh mock function preloaded with an implementation value.
pub fn mock_function_returning(heap: &mut ValueHeap, value: Value) -> Value {
    Value::Object(heap.alloc_function(FunctionData::mock_returning(value)))
}

/// Whether the value carries the mock-function marker.
pub fn is_mock_function(heap: &ValueHeap, value: &Value) -> bool {
    heap.function_data_of(value)
        .is_some_and(|data| data.mock.is_some())
}
