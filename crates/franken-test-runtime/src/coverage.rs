//! Coverage collection: per-file collectors and instrumentation.
//!
//! Instrumentation is cooperative: the collector prefixes the source with a
//! coverage directive naming the data store and the file, and the module
//! evaluator bumps a per-line hit counter in the store object as each
//! statement runs.  The store lives on the sandbox heap and is exposed on
//! the global under a fixed symbol, so user code (and extraction) can reach
//! it the same way instrumented code does.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::transformer::{Instrumenter, COVERAGE_DIRECTIVE};
use crate::value::{ObjectHandle, Value, ValueHeap};

/// Global symbol under which coverage data stores are exposed.
pub const COVERAGE_STORE_GLOBAL: &str = "__coverage__";

/// Extracted runtime coverage for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CoverageInfo {
    /// 1-based source line → execution count.
    pub line_hits: BTreeMap<u32, u64>,
}

/// Collector contract: one instance per instrumented file.
pub trait CoverageCollector {
    /// The heap object instrumented code records hits into; allocated on
    /// first use.
    fn coverage_data_store(&mut self, heap: &mut ValueHeap) -> ObjectHandle;

    /// Annotate a file's source so its execution records into the store.
    fn instrumented_source(&self, source: &str, filename: &str, store_key: &str) -> String;

    /// Read the recorded hits back out of the heap.
    fn extract_runtime_coverage_info(&self, heap: &ValueHeap) -> CoverageInfo;
}

/// Line-hit collector.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LineCoverageCollector {
    store: Option<ObjectHandle>,
}

impl LineCoverageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> Option<ObjectHandle> {
        self.store
    }
}

impl CoverageCollector for LineCoverageCollector {
    fn coverage_data_store(&mut self, heap: &mut ValueHeap) -> ObjectHandle {
        match self.store {
            Some(handle) => handle,
            None => {
                let handle = heap.alloc_object();
                self.store = Some(handle);
                handle
            }
        }
    }

    fn instrumented_source(&self, source: &str, filename: &str, store_key: &str) -> String {
        format!("{COVERAGE_DIRECTIVE} {store_key} {filename}\n{source}")
    }

    fn extract_runtime_coverage_info(&self, heap: &ValueHeap) -> CoverageInfo {
        let mut info = CoverageInfo::default();
        let Some(store) = self.store else {
            return info;
        };
        for key in heap.own_keys(store) {
            let (Ok(line), Value::Int(count)) = (key.parse::<u32>(), heap.property(store, &key))
            else {
                continue;
            };
            if count >= 0 {
                info.line_hits.insert(line, count as u64);
            }
        }
        info
    }
}

impl Instrumenter for LineCoverageCollector {
    fn annotate(&self, source: &str, filename: &str) -> String {
        self.instrumented_source(source, filename, COVERAGE_STORE_GLOBAL)
    }
}

/// Bump the hit counter for a line in a store object.
pub fn record_line_hit(heap: &mut ValueHeap, store: ObjectHandle, line: u32) {
    let key = line.to_string();
    let next = match heap.property(store, &key) {
        Value::Int(count) => count.saturating_add(1),
        _ => 1,
    };
    heap.set_property(store, key, Value::Int(next));
}
