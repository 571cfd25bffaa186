//! Sandbox environment: the isolated evaluation context modules run in.
//!
//! Owns the value heap, the global object, and the fake-timer subsystem.
//! `run_script` evaluates a transformed script into its module wrapper;
//! after teardown the global becomes unavailable and the runtime treats
//! further execution as a no-op.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::timers::FakeTimers;
use crate::transformer::{parse_module_source, ModuleProgram, Script, MODULE_WRAPPER_PROPERTY};
use crate::value::{value_from_json, FunctionBody, FunctionData, HostFunction, ObjectHandle, Value, ValueHeap};

/// Global property under which the environment exposes its timer-clearing
/// entry point; consulted by registry reset.
pub const MOCK_CLEAR_TIMERS_GLOBAL: &str = "mockClearTimers";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxErrorCode {
    /// The script's source failed to parse.
    Syntax,
    /// The environment has been torn down.
    TornDown,
}

impl SandboxErrorCode {
    pub const fn stable_code(self) -> &'static str {
        match self {
            Self::Syntax => "FE-SANDBOX-0001",
            Self::TornDown => "FE-SANDBOX-0002",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxError {
    pub code: SandboxErrorCode,
    pub message: String,
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.stable_code(), self.message)
    }
}

impl std::error::Error for SandboxError {}

// ---------------------------------------------------------------------------
// Script evaluation results
// ---------------------------------------------------------------------------

/// Result of evaluating a script: a property bag on which the module
/// wrapper appears under [`MODULE_WRAPPER_PROPERTY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptEvaluation {
    properties: BTreeMap<String, ModuleProgram>,
}

impl ScriptEvaluation {
    /// Fetch the wrapper at a property name.
    pub fn wrapper(&self, property: &str) -> Option<&ModuleProgram> {
        self.properties.get(property)
    }
}

// ---------------------------------------------------------------------------
// SandboxEnvironment
// ---------------------------------------------------------------------------

/// The evaluation context shared by every module of one test file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEnvironment {
    heap: ValueHeap,
    global: Option<ObjectHandle>,
    fake_timers: FakeTimers,
}

impl SandboxEnvironment {
    /// Fresh environment with an empty global carrying the
    /// `mockClearTimers` host entry point.
    pub fn new() -> Self {
        let mut heap = ValueHeap::new();
        let global = heap.alloc_object();
        let clear_timers = heap.alloc_function(FunctionData {
            body: FunctionBody::Host(HostFunction::ClearAllTimers),
            mock: None,
        });
        heap.set_property(global, MOCK_CLEAR_TIMERS_GLOBAL, Value::Object(clear_timers));

        Self {
            heap,
            global: Some(global),
            fake_timers: FakeTimers::new(),
        }
    }

    /// The global bag; `None` after teardown.
    pub fn global(&self) -> Option<ObjectHandle> {
        self.global
    }

    pub fn is_torn_down(&self) -> bool {
        self.global.is_none()
    }

    /// Tear the environment down. Scripts evaluated afterwards are a
    /// caller-side no-op.
    pub fn teardown(&mut self) {
        self.global = None;
    }

    pub fn heap(&self) -> &ValueHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut ValueHeap {
        &mut self.heap
    }

    pub fn fake_timers(&self) -> &FakeTimers {
        &self.fake_timers
    }

    pub fn fake_timers_mut(&mut self) -> &mut FakeTimers {
        &mut self.fake_timers
    }

    /// Evaluate a script. The evaluation result exposes the module wrapper
    /// under the transformer's wrapper property; a malformed source is a
    /// syntax error.
    pub fn run_script(&self, script: &Script) -> Result<ScriptEvaluation, Box<SandboxError>> {
        if self.is_torn_down() {
            return Err(Box::new(SandboxError {
                code: SandboxErrorCode::TornDown,
                message: "sandbox environment has been torn down".to_string(),
            }));
        }

        let program = parse_module_source(&script.source).map_err(|err| {
            Box::new(SandboxError {
                code: SandboxErrorCode::Syntax,
                message: err.to_string(),
            })
        })?;

        let mut properties = BTreeMap::new();
        properties.insert(MODULE_WRAPPER_PROPERTY.to_string(), program);
        Ok(ScriptEvaluation { properties })
    }

    /// Parse JSON text onto the heap (the sandbox's parser, used for JSON
    /// data modules).
    pub fn parse_json(&mut self, text: &str) -> Result<Value, Box<SandboxError>> {
        let json: serde_json::Value = serde_json::from_str(text).map_err(|err| {
            Box::new(SandboxError {
                code: SandboxErrorCode::Syntax,
                message: format!("invalid JSON: {err}"),
            })
        })?;
        Ok(value_from_json(&mut self.heap, &json))
    }
}

impl Default for SandboxEnvironment {
    fn default() -> Self {
        Self::new()
    }
}
