//! Heap-addressed runtime value model for sandboxed module execution.
//!
//! Exports bags, mock objects, and the sandbox global all live on a single
//! [`ValueHeap`] owned by the sandbox environment.  Values reference heap
//! objects through copyable [`ObjectHandle`]s, so two modules holding the
//! same handle observe each other's mutations — the property that makes
//! circular requires work.
//!
//! `BTreeMap` property bags for deterministic ordering.  Arrays are modelled
//! as plain objects with decimal index keys plus a `length` property.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ObjectHandle — typed reference into the heap
// ---------------------------------------------------------------------------

/// Opaque handle referencing an object on the value heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub u32);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Runtime value representation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// Undefined.
    Undefined,
    /// Null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer (i64). Fixed-point integers avoid floating-point
    /// non-determinism.
    Int(i64),
    /// String.
    Str(String),
    /// Object or function reference (heap handle).
    Object(ObjectHandle),
}

impl Value {
    /// Truthiness: Undefined, Null, Bool(false), Int(0), Str("") are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Str(s) => !s.is_empty(),
            Self::Object(_) => true,
        }
    }

    /// Type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "number",
            Self::Str(_) => "string",
            Self::Object(_) => "object",
        }
    }

    /// Handle accessor for object values.
    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            Self::Object(handle) => Some(*handle),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Object(handle) => write!(f, "[{handle}]"),
        }
    }
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

/// Host entry points installable on the sandbox global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostFunction {
    /// Clears every scheduled fake timer (the global `mockClearTimers`
    /// entry point consulted during registry reset).
    ClearAllTimers,
}

/// What a function does when invoked.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FunctionBody {
    /// Returns `Undefined`.
    Empty,
    /// Returns a fixed value.
    Constant(Box<Value>),
    /// Dispatches to a host entry point.
    Host(HostFunction),
}

/// Recorded state of a mock function: the marker the registry-reset walk
/// looks for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct MockState {
    /// Argument lists of every recorded invocation, in call order.
    pub calls: Vec<Vec<Value>>,
    /// Return values of every recorded invocation, in call order.
    pub results: Vec<Value>,
}

impl MockState {
    /// Record one invocation.
    pub fn record(&mut self, args: Vec<Value>, result: Value) {
        self.calls.push(args);
        self.results.push(result);
    }

    /// Drop all recorded calls and results.
    pub fn clear(&mut self) {
        self.calls.clear();
        self.results.clear();
    }
}

/// Callable payload of a function object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionData {
    pub body: FunctionBody,
    /// Present iff this function is a mock function.
    pub mock: Option<MockState>,
}

impl FunctionData {
    /// A plain (non-mock) function returning a fixed value.
    pub fn returning(value: Value) -> Self {
        Self {
            body: FunctionBody::Constant(Box::new(value)),
            mock: None,
        }
    }

    /// A recording no-op mock function.
    pub fn mock() -> Self {
        Self {
            body: FunctionBody::Empty,
            mock: Some(MockState::default()),
        }
    }

    /// A mock function preloaded with an implementation value.
    pub fn mock_returning(value: Value) -> Self {
        Self {
            body: FunctionBody::Constant(Box::new(value)),
            mock: Some(MockState::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Heap objects
// ---------------------------------------------------------------------------

/// Classification of a heap object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Plain property bag.
    Plain,
    /// Callable object.
    Function(FunctionData),
}

/// One object on the heap: a kind plus an ordered property bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapObject {
    pub kind: ObjectKind,
    pub properties: BTreeMap<String, Value>,
    /// Frozen objects silently ignore property writes.
    pub frozen: bool,
}

impl HeapObject {
    fn plain() -> Self {
        Self {
            kind: ObjectKind::Plain,
            properties: BTreeMap::new(),
            frozen: false,
        }
    }

    fn function(data: FunctionData) -> Self {
        Self {
            kind: ObjectKind::Function(data),
            properties: BTreeMap::new(),
            frozen: false,
        }
    }
}

// ---------------------------------------------------------------------------
// ValueHeap
// ---------------------------------------------------------------------------

/// Arena of heap objects. Handles are stable for the lifetime of the heap;
/// there is no collection — a heap lives exactly as long as one sandbox
/// environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValueHeap {
    objects: Vec<HeapObject>,
}

impl ValueHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Allocate an empty plain object.
    pub fn alloc_object(&mut self) -> ObjectHandle {
        self.alloc(HeapObject::plain())
    }

    /// Allocate a function object.
    pub fn alloc_function(&mut self, data: FunctionData) -> ObjectHandle {
        self.alloc(HeapObject::function(data))
    }

    fn alloc(&mut self, object: HeapObject) -> ObjectHandle {
        let handle = ObjectHandle(self.objects.len() as u32);
        self.objects.push(object);
        handle
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&HeapObject> {
        self.objects.get(handle.0 as usize)
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut HeapObject> {
        self.objects.get_mut(handle.0 as usize)
    }

    /// Read a property; `Undefined` when the handle or property is absent.
    pub fn property(&self, handle: ObjectHandle, name: &str) -> Value {
        self.get(handle)
            .and_then(|object| object.properties.get(name).cloned())
            .unwrap_or(Value::Undefined)
    }

    /// Whether the object carries the property as its own key.
    pub fn has_property(&self, handle: ObjectHandle, name: &str) -> bool {
        self.get(handle)
            .is_some_and(|object| object.properties.contains_key(name))
    }

    /// Write a property. Writes to frozen objects and dangling handles are
    /// ignored, matching non-strict assignment semantics.
    pub fn set_property(&mut self, handle: ObjectHandle, name: impl Into<String>, value: Value) {
        if let Some(object) = self.get_mut(handle) {
            if !object.frozen {
                object.properties.insert(name.into(), value);
            }
        }
    }

    /// Remove a property, returning the previous value if any.
    pub fn delete_property(&mut self, handle: ObjectHandle, name: &str) -> Option<Value> {
        let object = self.get_mut(handle)?;
        if object.frozen {
            return None;
        }
        object.properties.remove(name)
    }

    /// Own property keys in deterministic (sorted) order.
    pub fn own_keys(&self, handle: ObjectHandle) -> Vec<String> {
        self.get(handle)
            .map(|object| object.properties.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Mark an object frozen.
    pub fn freeze(&mut self, handle: ObjectHandle) {
        if let Some(object) = self.get_mut(handle) {
            object.frozen = true;
        }
    }

    pub fn is_frozen(&self, handle: ObjectHandle) -> bool {
        self.get(handle).is_some_and(|object| object.frozen)
    }

    /// Allocate a new plain object carrying a copy of the source object's
    /// own properties. The clone is never frozen.
    pub fn shallow_clone(&mut self, handle: ObjectHandle) -> ObjectHandle {
        let properties = self
            .get(handle)
            .map(|object| object.properties.clone())
            .unwrap_or_default();
        let clone = self.alloc_object();
        if let Some(object) = self.get_mut(clone) {
            object.properties = properties;
        }
        clone
    }

    /// Whether the value is a callable heap object.
    pub fn is_callable(&self, value: &Value) -> bool {
        self.function_data_of(value).is_some()
    }

    /// Function payload of a value, when it is a function object.
    pub fn function_data_of(&self, value: &Value) -> Option<&FunctionData> {
        let handle = value.as_object()?;
        match &self.get(handle)?.kind {
            ObjectKind::Function(data) => Some(data),
            ObjectKind::Plain => None,
        }
    }

    /// Mock state of a function object, when it is a mock function.
    pub fn mock_state(&self, handle: ObjectHandle) -> Option<&MockState> {
        match &self.get(handle)?.kind {
            ObjectKind::Function(data) => data.mock.as_ref(),
            ObjectKind::Plain => None,
        }
    }

    pub fn mock_state_mut(&mut self, handle: ObjectHandle) -> Option<&mut MockState> {
        match &mut self.get_mut(handle)?.kind {
            ObjectKind::Function(data) => data.mock.as_mut(),
            ObjectKind::Plain => None,
        }
    }
}

// ---------------------------------------------------------------------------
// JSON bridging
// ---------------------------------------------------------------------------

/// Materialise a JSON document on the heap. Arrays become plain objects with
/// decimal index keys and a `length` property. Numbers outside the i64 range
/// fall back to their string rendering.
pub fn value_from_json(heap: &mut ValueHeap, json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Str(n.to_string()),
        },
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => {
            let handle = heap.alloc_object();
            for (index, item) in items.iter().enumerate() {
                let element = value_from_json(heap, item);
                heap.set_property(handle, index.to_string(), element);
            }
            heap.set_property(handle, "length", Value::Int(items.len() as i64));
            Value::Object(handle)
        }
        serde_json::Value::Object(members) => {
            let handle = heap.alloc_object();
            for (key, member) in members {
                let value = value_from_json(heap, member);
                heap.set_property(handle, key.clone(), value);
            }
            Value::Object(handle)
        }
    }
}

/// Project a heap value back into JSON. Functions render as the string
/// `"[function]"`; dangling handles as null.
pub fn value_to_json(heap: &ValueHeap, value: &Value) -> serde_json::Value {
    match value {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Object(handle) => {
            let Some(object) = heap.get(*handle) else {
                return serde_json::Value::Null;
            };
            if matches!(object.kind, ObjectKind::Function(_)) {
                return serde_json::Value::String("[function]".to_string());
            }
            let mut members = serde_json::Map::new();
            for (key, member) in &object.properties {
                members.insert(key.clone(), value_to_json(heap, member));
            }
            serde_json::Value::Object(members)
        }
    }
}
