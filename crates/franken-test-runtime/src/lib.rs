//! Sandboxed module loader and mocking engine for the FrankenEngine test
//! harness.
//!
//! Executes a test file and every module it transitively requires inside a
//! controlled sandbox, deciding per import whether to deliver the real
//! module, a hand-written replacement, or a machine-generated stand-in.
//! Cycle-tolerant caching, a per-file test-control facade, deterministic
//! fake timers, and per-file coverage instrumentation ride along.
//!
//! `BTreeMap`/`BTreeSet` for deterministic ordering throughout.

#![forbid(unsafe_code)]

pub mod config;
pub mod coverage;
pub mod facade;
pub mod mock_metadata;
pub mod module_id;
pub mod paths;
pub mod policy;
pub mod process;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod sandbox;
pub mod timers;
pub mod transformer;
pub mod value;

pub use config::RuntimeConfig;
pub use coverage::{CoverageCollector, CoverageInfo, LineCoverageCollector, COVERAGE_STORE_GLOBAL};
pub use facade::TestFacade;
pub use mock_metadata::MockMetadata;
pub use module_id::{ModuleId, ModuleIdKind};
pub use policy::{ExplicitMockDecision, MockFactory, PatternSet};
pub use process::ProcessCaches;
pub use registry::{
    BoundRequire, MockRegistry, ModuleRecord, ModuleRegistry, SentinelParent,
    SENTINEL_PARENT_FILENAME, SENTINEL_PARENT_ID,
};
pub use resolver::{
    build_haste_map, BuildHasteMapOptions, DeterministicFileResolver, FileResolver, HasteContext,
    HasteMapError, ResolveError, ResolveErrorCode,
};
pub use runtime::{
    MockOptions, RequireMode, Runtime, RuntimeContext, RuntimeError, RuntimeErrorCode,
    RuntimeEvent, RuntimeResult, SPEC_FRAMEWORK_GLOBAL,
};
pub use sandbox::{SandboxEnvironment, SandboxError, SandboxErrorCode, MOCK_CLEAR_TIMERS_GLOBAL};
pub use timers::{FakeTimers, TimerHandle, TimerMode, VirtualClock};
pub use transformer::{
    CachingTransformer, ContentHash, Script, SourceTransformer, MODULE_WRAPPER_PROPERTY,
};
pub use value::{ObjectHandle, Value, ValueHeap};
