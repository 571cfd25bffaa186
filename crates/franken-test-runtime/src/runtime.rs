//! The test runtime core: sandboxed module loading and mock interposition.
//!
//! For every specifier required from a test file the runtime decides
//! whether to deliver the real module, a user-registered replacement, or a
//! machine-generated stand-in.  Real modules execute placeholder-first so
//! dependency cycles resolve; mock synthesis isolates the real module's
//! execution behind swapped registries; and the per-file facade gives test
//! code control over all of it.
//!
//! Ordering inside one module execution is fixed: registry insert →
//! transform → sandbox evaluate → wrapper invocation.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::coverage::{
    record_line_hit, CoverageCollector, CoverageInfo, LineCoverageCollector, COVERAGE_STORE_GLOBAL,
};
use crate::mock_metadata::{self, MockMetadata};
use crate::module_id::{virtual_mock_path, ModuleId};
use crate::paths;
use crate::policy::{ExplicitMockDecision, MockFactory, MockPolicyTables, PatternSet};
use crate::process::ProcessCaches;
use crate::registry::{
    BoundRequire, MockRegistry, ModuleRecord, ModuleRegistry, SentinelParent,
};
use crate::resolver::{DeterministicFileResolver, FileResolver, ResolveError};
use crate::sandbox::{SandboxEnvironment, SandboxErrorCode, MOCK_CLEAR_TIMERS_GLOBAL};
use crate::transformer::{
    CachingTransformer, Expr, Instrumenter, ModuleOpKind, ModuleProgram, SourceTransformer,
    MODULE_WRAPPER_PROPERTY,
};
use crate::value::{value_from_json, FunctionBody, FunctionData, HostFunction, ObjectHandle, Value};

pub type RuntimeResult<T> = Result<T, Box<RuntimeError>>;

/// File extension treated as JSON data.
const JSON_EXTENSION: &str = ".json";

/// File extension treated as a native binary, delivered by the host loader
/// as an opaque passthrough.
const NATIVE_EXTENSION: &str = ".node";

/// Global property naming the test-spec framework object matchers install
/// into.
pub const SPEC_FRAMEWORK_GLOBAL: &str = "specFramework";

/// Upper bound on exhaustive timer sweeps before the drain is declared
/// runaway.
const MAX_TIMER_SWEEPS: u32 = 1_000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorCode {
    Configuration,
    Resolution,
    ModuleSyntax,
    AutomockMetadata,
    WrapperMissing,
    NotCallable,
    TimerFlood,
    HostModule,
}

impl RuntimeErrorCode {
    pub const fn stable_code(self) -> &'static str {
        match self {
            Self::Configuration => "FE-TESTRT-0001",
            Self::Resolution => "FE-TESTRT-0002",
            Self::ModuleSyntax => "FE-TESTRT-0003",
            Self::AutomockMetadata => "FE-TESTRT-0004",
            Self::WrapperMissing => "FE-TESTRT-0005",
            Self::NotCallable => "FE-TESTRT-0006",
            Self::TimerFlood => "FE-TESTRT-0007",
            Self::HostModule => "FE-TESTRT-0008",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeError {
    pub code: RuntimeErrorCode,
    pub message: String,
}

impl RuntimeError {
    fn boxed(code: RuntimeErrorCode, message: impl Into<String>) -> Box<Self> {
        Box::new(Self {
            code,
            message: message.into(),
        })
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.stable_code(), self.message)
    }
}

impl std::error::Error for RuntimeError {}

impl From<Box<ResolveError>> for Box<RuntimeError> {
    fn from(err: Box<ResolveError>) -> Self {
        RuntimeError::boxed(RuntimeErrorCode::Resolution, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Identifiers stamped onto every telemetry event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeContext {
    pub trace_id: String,
    pub decision_id: String,
    pub policy_id: String,
}

impl RuntimeContext {
    pub fn new(
        trace_id: impl Into<String>,
        decision_id: impl Into<String>,
        policy_id: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            decision_id: decision_id.into(),
            policy_id: policy_id.into(),
        }
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new("trace-local", "decision-local", "policy-local")
    }
}

/// Structured telemetry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub trace_id: String,
    pub decision_id: String,
    pub policy_id: String,
    pub component: String,
    pub event: String,
    pub outcome: String,
    pub error_code: String,
}

// ---------------------------------------------------------------------------
// Load modes
// ---------------------------------------------------------------------------

/// How a specifier is loaded. `require`, `require_actual`, and
/// `require_mock` are fixed-mode views of one `load` pathway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequireMode {
    /// Consult the mock-policy oracle.
    Auto,
    /// Deliver the real module, bypassing the oracle.
    Real,
    /// Deliver a mock, bypassing the oracle.
    Mock,
}

/// Options on `facade.mock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MockOptions {
    /// Register the computed virtual path so the specifier never needs to
    /// exist on disk.
    pub virtual_mock: bool,
}

/// Arguments a module wrapper is invoked with, in their fixed positional
/// order: context, module, exports, require, dirname, filename, global,
/// facade, coverage store.
#[derive(Debug, Clone)]
pub struct WrapperInvocation {
    pub context: Value,
    pub module: String,
    pub exports: Value,
    pub require: BoundRequire,
    pub dirname: String,
    pub filename: String,
    pub global: Option<ObjectHandle>,
    pub facade_from: String,
    pub coverage_store: Option<ObjectHandle>,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// The owned runtime. The per-file test facade is a handle borrowing it.
pub struct Runtime {
    config: RuntimeConfig,
    context: RuntimeContext,
    resolver: Box<dyn FileResolver>,
    transformer: Box<dyn SourceTransformer>,
    environment: SandboxEnvironment,
    process: ProcessCaches,
    sentinel: SentinelParent,
    module_registry: ModuleRegistry,
    mock_registry: MockRegistry,
    tables: MockPolicyTables,
    metadata_cache: BTreeMap<String, MockMetadata>,
    collectors: BTreeMap<String, LineCoverageCollector>,
    host_modules: BTreeMap<String, serde_json::Value>,
    host_module_cache: BTreeMap<String, Value>,
    unmock_matcher: PatternSet,
    mocks_matcher: PatternSet,
    test_matcher: PatternSet,
    coverage_ignore_matcher: PatternSet,
    automock: bool,
    current_executing_path: Option<String>,
    current_executing_manual_mock: Option<String>,
    telemetry: Vec<RuntimeEvent>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("automock", &self.automock)
            .field("current_executing_path", &self.current_executing_path)
            .field(
                "current_executing_manual_mock",
                &self.current_executing_manual_mock,
            )
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Build a runtime: compile the configured matchers, flag installed
    /// setup files transitive-unmocked, reset the registries, then run each
    /// setup file.
    pub fn new(
        config: RuntimeConfig,
        resolver: Box<dyn FileResolver>,
        transformer: Box<dyn SourceTransformer>,
        environment: SandboxEnvironment,
        mut process: ProcessCaches,
        context: RuntimeContext,
    ) -> RuntimeResult<Self> {
        let configuration_error =
            |err: regex::Error| RuntimeError::boxed(RuntimeErrorCode::Configuration, err.to_string());

        if !config.coverage_collector.is_empty() && config.coverage_collector != "line" {
            return Err(RuntimeError::boxed(
                RuntimeErrorCode::Configuration,
                format!(
                    "unknown coverage collector '{}'; only 'line' is available",
                    config.coverage_collector
                ),
            ));
        }

        let unmock_matcher = process
            .unmock_matcher_for(&config)
            .map_err(configuration_error)?;
        let mocks_matcher =
            PatternSet::compile(&[config.mocks_pattern.clone()]).map_err(configuration_error)?;
        let test_matcher =
            PatternSet::compile(&[config.host_test_regex()]).map_err(configuration_error)?;
        let coverage_ignore_matcher = PatternSet::compile(&config.coverage_path_ignore_patterns)
            .map_err(configuration_error)?;

        let mut environment = environment;
        let sentinel = SentinelParent::install(environment.heap_mut());
        let automock = config.automock;

        let mut runtime = Self {
            config,
            context,
            resolver,
            transformer,
            environment,
            process,
            sentinel,
            module_registry: ModuleRegistry::new(),
            mock_registry: MockRegistry::new(),
            tables: MockPolicyTables::new(),
            metadata_cache: BTreeMap::new(),
            collectors: BTreeMap::new(),
            host_modules: BTreeMap::new(),
            host_module_cache: BTreeMap::new(),
            unmock_matcher,
            mocks_matcher,
            test_matcher,
            coverage_ignore_matcher,
            automock,
            current_executing_path: None,
            current_executing_manual_mock: None,
            telemetry: Vec::new(),
        };

        for setup_file in runtime.config.setup_files.clone() {
            if paths::in_node_modules(&setup_file) {
                let id = runtime.normalize(&setup_file, None)?;
                runtime
                    .tables
                    .transitive_unmock
                    .insert(id.serialized(), false);
            }
        }

        runtime.reset_module_registry()?;

        for setup_file in runtime.config.setup_files.clone() {
            runtime.require_module(&setup_file, None)?;
        }

        Ok(runtime)
    }

    /// Convenience constructor wiring the deterministic collaborators.
    pub fn with_resolver(
        config: RuntimeConfig,
        resolver: DeterministicFileResolver,
    ) -> RuntimeResult<Self> {
        Self::new(
            config,
            Box::new(resolver),
            Box::new(CachingTransformer::new()),
            SandboxEnvironment::new(),
            ProcessCaches::new(),
            RuntimeContext::default(),
        )
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn environment(&self) -> &SandboxEnvironment {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut SandboxEnvironment {
        &mut self.environment
    }

    pub fn sentinel_parent(&self) -> SentinelParent {
        self.sentinel
    }

    pub fn module_registry(&self) -> &ModuleRegistry {
        &self.module_registry
    }

    pub fn mock_registry(&self) -> &MockRegistry {
        &self.mock_registry
    }

    pub fn telemetry_events(&self) -> &[RuntimeEvent] {
        &self.telemetry
    }

    pub fn automock_enabled(&self) -> bool {
        self.automock
    }

    /// File whose body is currently executing, if any.
    pub fn current_executing_path(&self) -> Option<&str> {
        self.current_executing_path.as_deref()
    }

    /// Manual-mock file currently executing, if any; compared against
    /// resolved manual-mock paths to stop a mock from requiring itself
    /// forever.
    pub fn current_executing_manual_mock(&self) -> Option<&str> {
        self.current_executing_manual_mock.as_deref()
    }

    /// Recover the process-wide caches for the next runtime instance.
    pub fn into_process_caches(self) -> ProcessCaches {
        self.process
    }

    /// Register a host module delivered outside the sandbox: built-ins by
    /// name, native binaries by absolute path.
    pub fn register_host_module(&mut self, key: impl Into<String>, shape: serde_json::Value) {
        self.host_modules.insert(key.into(), shape);
    }

    fn emit(&mut self, event: &str, outcome: &str, error_code: &str) {
        self.telemetry.push(RuntimeEvent {
            trace_id: self.context.trace_id.clone(),
            decision_id: self.context.decision_id.clone(),
            policy_id: self.context.policy_id.clone(),
            component: "test_runtime".to_string(),
            event: event.to_string(),
            outcome: outcome.to_string(),
            error_code: error_code.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Normalisation
    // -----------------------------------------------------------------------

    /// Compute the normalized identifier for a `(from, specifier)` pair.
    /// With no specifier the identifier names `from` itself.
    pub fn normalize(&mut self, from: &str, specifier: Option<&str>) -> RuntimeResult<ModuleId> {
        let specifier = specifier.unwrap_or("");
        if let Some(id) = self.process.normalized_ids.get(from, specifier) {
            return Ok(id.clone());
        }

        let id = self.compute_id(from, specifier);
        self.process.normalized_ids.insert(from, specifier, id.clone());
        Ok(id)
    }

    fn compute_id(&mut self, from: &str, specifier: &str) -> ModuleId {
        if specifier.is_empty() {
            return ModuleId::user(paths::normalize_absolute(from), "");
        }

        if self.resolver.is_core_module(specifier) {
            return ModuleId::built_in(specifier);
        }

        let manual_path = self.resolver.get_mock_module(specifier);
        if manual_path.is_none() && self.resolver.get_module(specifier).is_none() {
            let candidate = virtual_mock_path(from, specifier);
            if self.tables.virtual_mocks.contains(&candidate) {
                return ModuleId::user(candidate, "");
            }
        }

        let absolute_path = self
            .resolver
            .resolve_module(from, specifier)
            .unwrap_or_default();
        ModuleId::user(absolute_path, manual_path.unwrap_or_default())
    }

    // -----------------------------------------------------------------------
    // Mock-policy oracle
    // -----------------------------------------------------------------------

    /// Decide whether the delivered module for `(from, specifier)` must be
    /// a mock.
    pub fn should_mock(&mut self, from: &str, specifier: &str) -> RuntimeResult<bool> {
        // Virtual mocks win outright.
        if self
            .tables
            .virtual_mocks
            .contains(&virtual_mock_path(from, specifier))
        {
            return Ok(true);
        }

        let id = self.normalize(from, Some(specifier))?;
        let key = id.serialized();

        if let Some(decision) = self.tables.explicit.get(&key) {
            return Ok(*decision == ExplicitMockDecision::ForceMock);
        }

        if !self.automock
            || self.resolver.is_core_module(specifier)
            || self
                .tables
                .transitive_exempt_memo
                .contains(&(from.to_string(), key.clone()))
        {
            return Ok(false);
        }

        if let Some(&cached) = self.tables.should_mock_memo.get(&key) {
            return Ok(cached);
        }

        let module_path = match self.resolver.resolve_module(from, specifier) {
            Ok(path) => path,
            Err(err) => {
                // A manual mock renders the resolution failure irrelevant.
                if id.has_mock_path() || self.resolver.get_mock_module(specifier).is_some() {
                    self.tables.should_mock_memo.insert(key, true);
                    return Ok(true);
                }
                return Err(err.into());
            }
        };

        if self.unmock_matcher.matches(&module_path) {
            self.tables.should_mock_memo.insert(key, false);
            return Ok(false);
        }

        // Flat-layout installs place transitive dependencies next to their
        // parents; an unmocked package under node_modules drags its
        // siblings along.
        let current_key = self.normalize(from, None)?.serialized();
        let exempt = self.tables.transitive_unmock.get(&current_key) == Some(&false)
            || (paths::in_node_modules(from)
                && paths::in_node_modules(&module_path)
                && (self.unmock_matcher.matches(from)
                    || self.tables.explicit.get(&current_key)
                        == Some(&ExplicitMockDecision::ForceReal)));
        if exempt {
            self.tables.transitive_unmock.insert(key.clone(), false);
            self.tables
                .transitive_exempt_memo
                .insert((from.to_string(), key.clone()));
            self.tables.should_mock_memo.insert(key, false);
            return Ok(false);
        }

        self.tables.should_mock_memo.insert(key, true);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Single dynamic load pathway; the public requires are fixed-mode
    /// views.
    pub fn load(&mut self, from: &str, specifier: &str, mode: RequireMode) -> RuntimeResult<Value> {
        match mode {
            RequireMode::Real => self.require_module(from, Some(specifier)),
            RequireMode::Mock => self.require_mock(from, specifier),
            RequireMode::Auto => {
                if self.should_mock(from, specifier)? {
                    self.require_mock(from, specifier)
                } else {
                    self.require_module(from, Some(specifier))
                }
            }
        }
    }

    /// Oracle-consulting require: what a module body's `require` does.
    pub fn require(&mut self, from: &str, specifier: &str) -> RuntimeResult<Value> {
        self.load(from, specifier, RequireMode::Auto)
    }

    /// Oracle-bypassing require of the real module.
    pub fn require_actual(&mut self, from: &str, specifier: &str) -> RuntimeResult<Value> {
        self.load(from, specifier, RequireMode::Real)
    }

    /// Resolver passthrough exposed on the bound require.
    pub fn resolve(&mut self, from: &str, specifier: &str) -> RuntimeResult<String> {
        Ok(self.resolver.resolve_module(from, specifier)?)
    }

    /// Load a real module. With no specifier, `from` itself is loaded (the
    /// test-entry pathway).
    pub fn require_module(
        &mut self,
        from: &str,
        specifier: Option<&str>,
    ) -> RuntimeResult<Value> {
        let id = self.normalize(from, specifier)?;

        // Ghost manual mocks: a module that exists only as a manual mock is
        // delivered through the real-module pathway, unless that manual
        // mock is the caller currently executing, or the identifier is
        // pinned force-real.
        let mut module_path: Option<String> = None;
        if let Some(specifier) = specifier {
            if let Some(manual_path) = self.resolver.get_mock_module(specifier) {
                let real_exists = self.resolver.resolve_module(from, specifier).is_ok();
                let executing_it =
                    self.current_executing_manual_mock.as_deref() == Some(manual_path.as_str());
                let force_real = self.tables.explicit.get(&id.serialized())
                    == Some(&ExplicitMockDecision::ForceReal);
                if !real_exists && !executing_it && !force_real {
                    module_path = Some(manual_path);
                }
            }

            if module_path.is_none() && self.resolver.is_core_module(specifier) {
                return self.require_host_module(specifier);
            }
        }

        let path = match module_path {
            Some(path) => path,
            None => match specifier {
                Some(specifier) => self.resolver.resolve_module(from, specifier)?,
                None => paths::normalize_absolute(from),
            },
        };

        if !self.module_registry.contains(&path) {
            let exports = Value::Object(self.environment.heap_mut().alloc_object());
            self.module_registry
                .insert(ModuleRecord::placeholder(path.clone(), exports));

            match paths::extension(&path) {
                JSON_EXTENSION => {
                    let text = self.resolver.source_text(&path).ok_or_else(|| {
                        RuntimeError::boxed(
                            RuntimeErrorCode::Resolution,
                            format!("cannot read JSON module '{path}'"),
                        )
                    })?;
                    let parsed = self.environment.parse_json(&text).map_err(|err| {
                        self.module_syntax_error(&path, &err.message)
                    })?;
                    if let Some(record) = self.module_registry.get_mut(&path) {
                        record.exports = parsed;
                    }
                    self.emit("module_load", "json", "none");
                }
                NATIVE_EXTENSION => {
                    let exports = self.require_host_module(&path)?;
                    if let Some(record) = self.module_registry.get_mut(&path) {
                        record.exports = exports;
                    }
                    self.emit("module_load", "native", "none");
                }
                _ => {
                    self.exec_module(&path)?;
                    self.emit("module_load", "real", "none");
                }
            }
        }

        Ok(self
            .module_registry
            .get(&path)
            .map(|record| record.exports.clone())
            .unwrap_or(Value::Undefined))
    }

    fn require_host_module(&mut self, key: &str) -> RuntimeResult<Value> {
        if let Some(cached) = self.host_module_cache.get(key) {
            return Ok(cached.clone());
        }
        let shape = self.host_modules.get(key).cloned().ok_or_else(|| {
            RuntimeError::boxed(
                RuntimeErrorCode::HostModule,
                format!("host loader has no module '{key}'"),
            )
        })?;
        let value = value_from_json(self.environment.heap_mut(), &shape);
        self.host_module_cache.insert(key.to_string(), value.clone());
        self.emit("module_load", "builtin", "none");
        Ok(value)
    }

    /// Deliver a mock for the specifier: registered factory, manual mock
    /// (with the per-directory sidecar probe), or automock synthesis.
    pub fn require_mock(&mut self, from: &str, specifier: &str) -> RuntimeResult<Value> {
        let key = self.normalize(from, Some(specifier))?.serialized();

        if let Some(mock) = self.mock_registry.get(&key) {
            return Ok(mock.clone());
        }

        if let Some(factory) = self.tables.factories.get(&key).cloned() {
            let value = factory.materialize(self.environment.heap_mut());
            self.mock_registry.insert(key, value.clone());
            self.emit("mock_delivery", "factory", "none");
            return Ok(value);
        }

        let mut manual_path = self.resolver.get_mock_module(specifier);
        if manual_path.is_none() {
            if let Ok(real_path) = self.resolver.resolve_module(from, specifier) {
                // Sidecar rule: same-basename files in different directories
                // get per-directory mocks.
                let sidecar = paths::normalize_absolute(&format!(
                    "{}/__mocks__/{}",
                    paths::dirname(&real_path),
                    paths::basename(&real_path)
                ));
                if self.resolver.has_file(&sidecar) {
                    manual_path = Some(sidecar);
                }
            }
        }

        if let Some(mock_path) = manual_path {
            // The manual mock executes as a real module into a scratch
            // record; only the mock registry keeps its exports.
            let preexisting = self.module_registry.contains(&mock_path);
            if !preexisting {
                let exports = Value::Object(self.environment.heap_mut().alloc_object());
                self.module_registry
                    .insert(ModuleRecord::placeholder(mock_path.clone(), exports));
                self.exec_module(&mock_path)?;
            }
            let exports = self
                .module_registry
                .get(&mock_path)
                .map(|record| record.exports.clone())
                .unwrap_or(Value::Undefined);
            if !preexisting {
                self.module_registry.remove(&mock_path);
            }
            self.mock_registry.insert(key, exports.clone());
            self.emit("mock_delivery", "manual", "none");
            return Ok(exports);
        }

        let generated = self.generate_mock(from, specifier)?;
        self.mock_registry.insert(key, generated.clone());
        self.emit("mock_delivery", "automock", "none");
        Ok(generated)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Execute a registered module record inside the sandbox. Silently a
    /// no-op once the environment is torn down.
    fn exec_module(&mut self, path: &str) -> RuntimeResult<()> {
        if self.environment.is_torn_down() {
            return Ok(());
        }

        let coverage_store = if self.should_collect_coverage(path) {
            let collector = self.collectors.entry(path.to_string()).or_default();
            let store = collector.coverage_data_store(self.environment.heap_mut());
            if let Some(global) = self.environment.global() {
                self.environment.heap_mut().set_property(
                    global,
                    COVERAGE_STORE_GLOBAL,
                    Value::Object(store),
                );
            }
            Some(store)
        } else {
            None
        };

        let saved_path = self.current_executing_path.take();
        let saved_manual = self.current_executing_manual_mock.take();
        self.current_executing_path = Some(path.to_string());
        self.current_executing_manual_mock = Some(path.to_string());

        let result = self.exec_module_inner(path, coverage_store);

        self.current_executing_path = saved_path;
        self.current_executing_manual_mock = saved_manual;
        result
    }

    fn exec_module_inner(
        &mut self,
        path: &str,
        coverage_store: Option<ObjectHandle>,
    ) -> RuntimeResult<()> {
        let dirname = paths::dirname(path);
        let module_paths = self.resolver.module_paths(&dirname);
        if let Some(record) = self.module_registry.get_mut(path) {
            record.children = Vec::new();
            record.paths = module_paths;
            record.require = BoundRequire::new(path);
        }

        let source = self.resolver.source_text(path).ok_or_else(|| {
            RuntimeError::boxed(
                RuntimeErrorCode::Resolution,
                format!("cannot read module source '{path}'"),
            )
        })?;

        let instrument: Option<&dyn Instrumenter> = if coverage_store.is_some() {
            self.collectors.get(path).map(|c| c as &dyn Instrumenter)
        } else {
            None
        };
        let script = self
            .transformer
            .transform(path, &source, &self.config, instrument);

        let evaluation = match self.environment.run_script(&script) {
            Ok(evaluation) => evaluation,
            Err(err) if err.code == SandboxErrorCode::TornDown => return Ok(()),
            Err(err) => {
                self.emit("module_load", "syntax_error", err.code.stable_code());
                return Err(self.module_syntax_error(path, &err.message));
            }
        };

        let wrapper = evaluation
            .wrapper(MODULE_WRAPPER_PROPERTY)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::boxed(
                    RuntimeErrorCode::WrapperMissing,
                    format!(
                        "script evaluation for '{path}' exposes no wrapper at '{MODULE_WRAPPER_PROPERTY}'"
                    ),
                )
            })?;

        let record_exports = self
            .module_registry
            .get(path)
            .map(|record| record.exports.clone())
            .unwrap_or(Value::Undefined);
        let invocation = WrapperInvocation {
            context: record_exports.clone(),
            module: path.to_string(),
            exports: record_exports,
            require: BoundRequire::new(path),
            dirname,
            filename: path.to_string(),
            global: self.environment.global(),
            facade_from: path.to_string(),
            coverage_store,
        };
        self.invoke_wrapper(&wrapper, &invocation)
    }

    fn module_syntax_error(&self, path: &str, detail: &str) -> Box<RuntimeError> {
        RuntimeError::boxed(
            RuntimeErrorCode::ModuleSyntax,
            format!(
                "syntax error in '{}': {detail}; check the 'script_preprocessor' configuration \
                 if this file should have been transformed",
                paths::relative_to(&self.config.root_dir, path),
            ),
        )
    }

    fn invoke_wrapper(
        &mut self,
        program: &ModuleProgram,
        invocation: &WrapperInvocation,
    ) -> RuntimeResult<()> {
        let exports_handle = invocation.exports.as_object();

        for op in &program.ops {
            if let (Some(_annotation), Some(store)) = (&program.coverage, invocation.coverage_store)
            {
                record_line_hit(self.environment.heap_mut(), store, op.line);
            }

            match &op.kind {
                ModuleOpKind::Export { name, expr } => {
                    let value = self.eval_expr(&invocation.filename, expr)?;
                    if let Some(handle) = exports_handle {
                        self.environment
                            .heap_mut()
                            .set_property(handle, name.clone(), value);
                    }
                }
                ModuleOpKind::Global { name, expr } => {
                    let value = self.eval_expr(&invocation.filename, expr)?;
                    if let Some(global) = invocation.global {
                        self.environment
                            .heap_mut()
                            .set_property(global, name.clone(), value);
                    }
                }
                ModuleOpKind::Import { specifier } => {
                    self.require(&invocation.require.from, specifier)?;
                }
                ModuleOpKind::Mock { specifier } => {
                    self.facade_mock(
                        &invocation.facade_from,
                        specifier,
                        None,
                        MockOptions::default(),
                    )?;
                }
                ModuleOpKind::Unmock { specifier } => {
                    self.facade_unmock(&invocation.facade_from, specifier)?;
                }
            }
        }

        Ok(())
    }

    fn eval_expr(&mut self, filename: &str, expr: &Expr) -> RuntimeResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Function { returns } => {
                let data = match returns {
                    Some(value) => FunctionData::returning(value.clone()),
                    None => FunctionData {
                        body: FunctionBody::Empty,
                        mock: None,
                    },
                };
                Ok(Value::Object(self.environment.heap_mut().alloc_function(data)))
            }
            Expr::Require { specifier, member } => {
                let value = self.require(filename, specifier)?;
                match member {
                    None => Ok(value),
                    Some(member) => Ok(match value.as_object() {
                        Some(handle) => self.environment.heap().property(handle, member),
                        None => Value::Undefined,
                    }),
                }
            }
        }
    }

    /// Invoke a callable heap value, recording the call when it is a mock
    /// function.
    pub fn call_function(&mut self, callee: Value, args: Vec<Value>) -> RuntimeResult<Value> {
        let handle = callee.as_object().ok_or_else(|| {
            RuntimeError::boxed(
                RuntimeErrorCode::NotCallable,
                format!("value of type {} is not callable", callee.type_name()),
            )
        })?;
        let data = self
            .environment
            .heap()
            .function_data_of(&callee)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::boxed(RuntimeErrorCode::NotCallable, "object is not callable")
            })?;

        let result = match data.body {
            FunctionBody::Empty => Value::Undefined,
            FunctionBody::Constant(value) => *value,
            FunctionBody::Host(HostFunction::ClearAllTimers) => {
                self.environment.fake_timers_mut().clear_all_timers();
                Value::Undefined
            }
        };

        if data.mock.is_some() {
            if let Some(state) = self.environment.heap_mut().mock_state_mut(handle) {
                state.record(args, result.clone());
            }
        }

        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Automock synthesis
    // -----------------------------------------------------------------------

    /// Synthesise a mock from the real module's live exports. Metadata is
    /// cached per absolute path and survives registry resets; regeneration
    /// from cached metadata is cheap.
    pub fn generate_mock(&mut self, from: &str, specifier: &str) -> RuntimeResult<Value> {
        let path = self.resolver.resolve_module(from, specifier)?;

        if !self.metadata_cache.contains_key(&path) {
            // Seed with trivial metadata so a module requiring itself while
            // being mocked terminates.
            self.metadata_cache
                .insert(path.clone(), MockMetadata::empty_object());

            // Executing the real module must not pollute the caller's
            // registries.
            let saved_modules = mem::take(&mut self.module_registry);
            let saved_mocks = mem::take(&mut self.mock_registry);
            let isolated = self.require_module(from, Some(specifier));
            self.module_registry = saved_modules;
            self.mock_registry = saved_mocks;
            let exports = isolated?;

            let metadata = mock_metadata::get_metadata(self.environment.heap(), &exports)
                .ok_or_else(|| {
                    RuntimeError::boxed(
                        RuntimeErrorCode::AutomockMetadata,
                        format!(
                            "failed to extract mock metadata for module '{path}'; \
                             see docs/automock.md for writing a manual mock instead"
                        ),
                    )
                })?;
            self.metadata_cache.insert(path.clone(), metadata);
            self.emit("automock_generate", "ok", "none");
        }

        let metadata = self
            .metadata_cache
            .get(&path)
            .cloned()
            .unwrap_or_else(MockMetadata::empty_object);
        Ok(mock_metadata::generate_from_metadata(
            self.environment.heap_mut(),
            &metadata,
        ))
    }

    // -----------------------------------------------------------------------
    // Facade operations (per-file controls)
    // -----------------------------------------------------------------------

    pub fn enable_automock(&mut self) {
        self.automock = true;
    }

    pub fn disable_automock(&mut self) {
        self.automock = false;
    }

    /// Pin a specifier force-mock, optionally registering a factory; with
    /// `virtual_mock` the computed virtual path is registered before
    /// identifier normalisation so the specifier never needs a file.
    pub fn facade_mock(
        &mut self,
        from: &str,
        specifier: &str,
        factory: Option<MockFactory>,
        options: MockOptions,
    ) -> RuntimeResult<()> {
        if options.virtual_mock {
            self.tables
                .virtual_mocks
                .insert(virtual_mock_path(from, specifier));
        }

        let key = self.normalize(from, Some(specifier))?.serialized();
        if let Some(factory) = factory {
            self.tables.factories.insert(key.clone(), factory);
        }
        self.tables
            .explicit
            .insert(key, ExplicitMockDecision::ForceMock);
        Ok(())
    }

    /// `set_mock(name, value)` is `mock(name, || value)`.
    pub fn facade_set_mock(
        &mut self,
        from: &str,
        specifier: &str,
        value: Value,
    ) -> RuntimeResult<()> {
        self.facade_mock(
            from,
            specifier,
            Some(MockFactory::Fixed(value)),
            MockOptions::default(),
        )
    }

    pub fn facade_unmock(&mut self, from: &str, specifier: &str) -> RuntimeResult<()> {
        let key = self.normalize(from, Some(specifier))?.serialized();
        self.tables
            .explicit
            .insert(key, ExplicitMockDecision::ForceReal);
        Ok(())
    }

    /// Force-real plus exempting the module's dependency subtree from
    /// automock.
    pub fn facade_deep_unmock(&mut self, from: &str, specifier: &str) -> RuntimeResult<()> {
        let key = self.normalize(from, Some(specifier))?.serialized();
        self.tables
            .explicit
            .insert(key.clone(), ExplicitMockDecision::ForceReal);
        self.tables.transitive_unmock.insert(key, false);
        Ok(())
    }

    /// Drop every module and mock record, clear every mock function
    /// reachable as an own property of the sandbox global, and invoke the
    /// global timer-clearing entry point when present.
    pub fn reset_module_registry(&mut self) -> RuntimeResult<()> {
        self.module_registry.clear();
        self.mock_registry.clear();

        if let Some(global) = self.environment.global() {
            for key in self.environment.heap().own_keys(global) {
                let value = self.environment.heap().property(global, &key);
                if let Some(handle) = value.as_object() {
                    if let Some(state) = self.environment.heap_mut().mock_state_mut(handle) {
                        state.clear();
                    }
                }
            }

            let entry = self
                .environment
                .heap()
                .property(global, MOCK_CLEAR_TIMERS_GLOBAL);
            if self.environment.heap().is_callable(&entry) {
                self.call_function(entry, Vec::new())?;
            }
        }

        self.emit("registry_reset", "ok", "none");
        Ok(())
    }

    /// Create a fresh mock function, optionally preloaded with an
    /// implementation value.
    pub fn create_mock_function(&mut self, implementation: Option<Value>) -> Value {
        match implementation {
            Some(value) => {
                mock_metadata::mock_function_returning(self.environment.heap_mut(), value)
            }
            None => mock_metadata::mock_function(self.environment.heap_mut()),
        }
    }

    pub fn is_mock_function(&self, value: &Value) -> bool {
        mock_metadata::is_mock_function(self.environment.heap(), value)
    }

    /// Install assertion matchers into the globally exposed test-spec
    /// framework object.
    pub fn add_matchers(&mut self, matchers: BTreeMap<String, Value>) {
        let Some(global) = self.environment.global() else {
            return;
        };
        let heap = self.environment.heap_mut();
        let framework = match heap.property(global, SPEC_FRAMEWORK_GLOBAL).as_object() {
            Some(handle) => handle,
            None => {
                let handle = heap.alloc_object();
                heap.set_property(global, SPEC_FRAMEWORK_GLOBAL, Value::Object(handle));
                handle
            }
        };
        let bag = match heap.property(framework, "matchers").as_object() {
            Some(handle) => handle,
            None => {
                let handle = heap.alloc_object();
                heap.set_property(framework, "matchers", Value::Object(handle));
                handle
            }
        };
        for (name, matcher) in matchers {
            heap.set_property(bag, name, matcher);
        }
    }

    /// Frozen shallow clone of the configured test-env data.
    pub fn get_test_env_data(&mut self) -> Value {
        let shape = serde_json::Value::Object(
            self.config
                .test_env_data
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        );
        let value = value_from_json(self.environment.heap_mut(), &shape);
        if let Some(handle) = value.as_object() {
            self.environment.heap_mut().freeze(handle);
        }
        value
    }

    // -----------------------------------------------------------------------
    // Timer delegation
    // -----------------------------------------------------------------------

    pub fn use_fake_timers(&mut self) {
        self.environment.fake_timers_mut().use_fake_timers();
    }

    pub fn use_real_timers(&mut self) {
        self.environment.fake_timers_mut().use_real_timers();
    }

    pub fn clear_all_timers(&mut self) {
        self.environment.fake_timers_mut().clear_all_timers();
    }

    pub fn run_all_ticks(&mut self) -> RuntimeResult<()> {
        let batch = self.environment.fake_timers_mut().take_ticks();
        self.run_callbacks(batch)
    }

    pub fn run_all_immediates(&mut self) -> RuntimeResult<()> {
        let batch = self.environment.fake_timers_mut().take_immediates();
        self.run_callbacks(batch)
    }

    /// Run timers until none remain, including timers scheduled while
    /// draining.
    pub fn run_all_timers(&mut self) -> RuntimeResult<()> {
        let mut sweeps = 0u32;
        loop {
            let batch = self.environment.fake_timers_mut().take_scheduled_timers();
            if batch.is_empty() {
                return Ok(());
            }
            sweeps += 1;
            if sweeps > MAX_TIMER_SWEEPS {
                return Err(RuntimeError::boxed(
                    RuntimeErrorCode::TimerFlood,
                    format!("timers still pending after {MAX_TIMER_SWEEPS} exhaustive sweeps"),
                ));
            }
            self.run_callbacks(batch)?;
        }
    }

    /// Run only the timers pending at call time.
    pub fn run_only_pending_timers(&mut self) -> RuntimeResult<()> {
        let batch = self.environment.fake_timers_mut().take_scheduled_timers();
        self.run_callbacks(batch)
    }

    fn run_callbacks(&mut self, callbacks: Vec<Value>) -> RuntimeResult<()> {
        for callback in callbacks {
            self.call_function(callback, Vec::new())?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Coverage wiring
    // -----------------------------------------------------------------------

    /// Whether execution of this file should be instrumented.
    pub fn should_collect_coverage(&self, filename: &str) -> bool {
        self.config.collect_coverage
            && self
                .config
                .collect_coverage_only_from
                .as_ref()
                .map_or(true, |allow| allow.contains(filename))
            && !self.coverage_ignore_matcher.matches(filename)
            && !self.mocks_matcher.matches(filename)
            && !self.test_matcher.matches(filename)
    }

    /// Extracted coverage for every instrumented file.
    pub fn get_all_coverage_info(&self) -> BTreeMap<String, CoverageInfo> {
        self.collectors
            .iter()
            .map(|(filename, collector)| {
                (
                    filename.clone(),
                    collector.extract_runtime_coverage_info(self.environment.heap()),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_resolver() -> DeterministicFileResolver {
        let mut resolver = DeterministicFileResolver::new();
        resolver.register_file("/t/a.js", "export n = 1\nexport b = require \"./b\"\n");
        resolver.register_file("/t/b.js", "export n = 2\n");
        resolver
    }

    #[test]
    fn normalized_ids_are_deterministic_and_memoised() {
        let mut runtime =
            Runtime::with_resolver(RuntimeConfig::default(), basic_resolver()).unwrap();
        let first = runtime.normalize("/t/a.js", Some("./b")).unwrap();
        let second = runtime.normalize("/t/a.js", Some("./b")).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.absolute_path, "/t/b.js");

        let caches = runtime.into_process_caches();
        assert!(caches.normalized_ids.get("/t/a.js", "./b").is_some());
    }

    #[test]
    fn explicit_decisions_override_the_automock_default() {
        let mut runtime =
            Runtime::with_resolver(RuntimeConfig::default(), basic_resolver()).unwrap();
        assert!(runtime.should_mock("/t/a.js", "./b").unwrap());

        runtime.facade_unmock("/t/a.js", "./b").unwrap();
        assert!(!runtime.should_mock("/t/a.js", "./b").unwrap());

        runtime
            .facade_mock("/t/a.js", "./b", None, MockOptions::default())
            .unwrap();
        assert!(runtime.should_mock("/t/a.js", "./b").unwrap());
    }

    #[test]
    fn automock_off_delivers_real_modules() {
        let config = RuntimeConfig {
            automock: false,
            ..RuntimeConfig::default()
        };
        let mut runtime = Runtime::with_resolver(config, basic_resolver()).unwrap();
        assert!(!runtime.should_mock("/t/a.js", "./b").unwrap());

        let exports = runtime.require("/t/a.js", "./b").unwrap();
        let handle = exports.as_object().unwrap();
        assert_eq!(runtime.environment().heap().property(handle, "n"), Value::Int(2));
    }

    #[test]
    fn unresolvable_specifiers_surface_the_resolver_failure() {
        let mut runtime =
            Runtime::with_resolver(RuntimeConfig::default(), basic_resolver()).unwrap();
        let err = runtime.should_mock("/t/a.js", "./missing").unwrap_err();
        assert_eq!(err.code, RuntimeErrorCode::Resolution);

        let err = runtime.require_module("/t/a.js", Some("./missing")).unwrap_err();
        assert_eq!(err.code, RuntimeErrorCode::Resolution);
    }

    #[test]
    fn setup_files_run_during_construction() {
        let mut resolver = basic_resolver();
        resolver.register_file("/t/setup.js", "global prepared = true\n");
        let config = RuntimeConfig {
            setup_files: vec!["/t/setup.js".to_string()],
            ..RuntimeConfig::default()
        };
        let runtime = Runtime::with_resolver(config, resolver).unwrap();
        let global = runtime.environment().global().unwrap();
        assert_eq!(
            runtime.environment().heap().property(global, "prepared"),
            Value::Bool(true)
        );
        assert!(runtime
            .telemetry_events()
            .iter()
            .any(|event| event.event == "registry_reset"));
    }

    #[test]
    fn syntax_errors_name_the_file_and_the_preprocessor() {
        let mut resolver = DeterministicFileResolver::new();
        resolver.register_file("/repo/bad.js", "definitely not a statement\n");
        let config = RuntimeConfig {
            root_dir: "/repo".to_string(),
            automock: false,
            ..RuntimeConfig::default()
        };
        let mut runtime = Runtime::with_resolver(config, resolver).unwrap();
        let err = runtime.require_module("/repo/bad.js", None).unwrap_err();
        assert_eq!(err.code, RuntimeErrorCode::ModuleSyntax);
        assert!(err.message.contains("bad.js"));
        assert!(!err.message.contains("/repo/bad.js"));
        assert!(err.message.contains("script_preprocessor"));
    }

    #[test]
    fn a_failed_execution_leaves_the_placeholder_record() {
        let mut resolver = DeterministicFileResolver::new();
        resolver.register_file("/t/bad.js", "broken ++\n");
        let config = RuntimeConfig {
            automock: false,
            ..RuntimeConfig::default()
        };
        let mut runtime = Runtime::with_resolver(config, resolver).unwrap();
        assert!(runtime.require_module("/t/bad.js", None).is_err());
        assert!(runtime.module_registry().contains("/t/bad.js"));

        // A second require returns the empty placeholder exports instead of
        // re-entering execution.
        let exports = runtime.require_module("/t/bad.js", None).unwrap();
        let handle = exports.as_object().unwrap();
        assert!(runtime.environment().heap().own_keys(handle).is_empty());
    }

    #[test]
    fn torn_down_environments_make_execution_a_silent_noop() {
        let mut runtime =
            Runtime::with_resolver(RuntimeConfig::default(), basic_resolver()).unwrap();
        runtime.environment_mut().teardown();
        let exports = runtime.require_module("/t/b.js", None).unwrap();
        // The placeholder bag comes back untouched.
        let handle = exports.as_object().unwrap();
        assert!(runtime.environment().heap().own_keys(handle).is_empty());
    }

    #[test]
    fn host_modules_deliver_registered_builtins() {
        let mut resolver = basic_resolver();
        resolver.register_core_module("path");
        let mut runtime =
            Runtime::with_resolver(RuntimeConfig::default(), resolver).unwrap();
        runtime.register_host_module("path", serde_json::json!({"sep": "/"}));

        let first = runtime.require_module("/t/a.js", Some("path")).unwrap();
        let second = runtime.require_module("/t/a.js", Some("path")).unwrap();
        assert_eq!(first, second);
        let handle = first.as_object().unwrap();
        assert_eq!(
            runtime.environment().heap().property(handle, "sep"),
            Value::Str("/".to_string())
        );

        let err = runtime.require_module("/t/a.js", Some("path2")).unwrap_err();
        assert_eq!(err.code, RuntimeErrorCode::Resolution);
    }

    #[test]
    fn mock_functions_record_calls_through_the_runtime() {
        let mut runtime =
            Runtime::with_resolver(RuntimeConfig::default(), basic_resolver()).unwrap();
        let mock = runtime.create_mock_function(Some(Value::Int(9)));
        assert!(runtime.is_mock_function(&mock));

        let result = runtime.call_function(mock.clone(), vec![Value::Int(1)]).unwrap();
        assert_eq!(result, Value::Int(9));
        let state = runtime
            .environment()
            .heap()
            .mock_state(mock.as_object().unwrap())
            .unwrap();
        assert_eq!(state.calls, vec![vec![Value::Int(1)]]);
        assert_eq!(state.results, vec![Value::Int(9)]);

        let err = runtime.call_function(Value::Int(3), Vec::new()).unwrap_err();
        assert_eq!(err.code, RuntimeErrorCode::NotCallable);
    }

    #[test]
    fn test_env_data_comes_back_frozen() {
        let mut config = RuntimeConfig::default();
        config
            .test_env_data
            .insert("flag".to_string(), serde_json::json!(true));
        let mut runtime = Runtime::with_resolver(config, basic_resolver()).unwrap();

        let data = runtime.get_test_env_data();
        let handle = data.as_object().unwrap();
        assert_eq!(
            runtime.environment().heap().property(handle, "flag"),
            Value::Bool(true)
        );
        runtime
            .environment_mut()
            .heap_mut()
            .set_property(handle, "flag", Value::Bool(false));
        assert_eq!(
            runtime.environment().heap().property(handle, "flag"),
            Value::Bool(true)
        );
    }

    #[test]
    fn matchers_install_into_the_spec_framework_global() {
        let mut runtime =
            Runtime::with_resolver(RuntimeConfig::default(), basic_resolver()).unwrap();
        let matcher = runtime.create_mock_function(None);
        let mut matchers = BTreeMap::new();
        matchers.insert("toBeClose".to_string(), matcher);
        runtime.add_matchers(matchers);

        let global = runtime.environment().global().unwrap();
        let heap = runtime.environment().heap();
        let framework = heap.property(global, SPEC_FRAMEWORK_GLOBAL).as_object().unwrap();
        let bag = heap.property(framework, "matchers").as_object().unwrap();
        assert!(heap.is_callable(&heap.property(bag, "toBeClose")));
    }

    #[test]
    fn run_all_timers_drains_rescheduling_callbacks() {
        let mut runtime =
            Runtime::with_resolver(RuntimeConfig::default(), basic_resolver()).unwrap();
        let callback = runtime.create_mock_function(None);
        runtime
            .environment_mut()
            .fake_timers_mut()
            .schedule_timer(5, callback.clone());
        runtime.run_all_timers().unwrap();
        let state = runtime
            .environment()
            .heap()
            .mock_state(callback.as_object().unwrap())
            .unwrap();
        assert_eq!(state.calls.len(), 1);
        assert_eq!(
            runtime.environment().fake_timers().pending_timer_count(),
            0
        );
    }

    #[test]
    fn unknown_coverage_collectors_are_a_configuration_error() {
        let config = RuntimeConfig {
            coverage_collector: "branch".to_string(),
            ..RuntimeConfig::default()
        };
        let err = Runtime::with_resolver(config, basic_resolver()).unwrap_err();
        assert_eq!(err.code, RuntimeErrorCode::Configuration);
        assert!(err.message.contains("branch"));
    }

    #[test]
    fn coverage_filters_respect_the_configured_patterns() {
        let config = RuntimeConfig {
            collect_coverage: true,
            ..RuntimeConfig::default()
        };
        let runtime = Runtime::with_resolver(config, basic_resolver()).unwrap();
        assert!(runtime.should_collect_coverage("/t/a.js"));
        assert!(!runtime.should_collect_coverage("/t/node_modules/dep/index.js"));
        assert!(!runtime.should_collect_coverage("/t/__mocks__/a.js"));
        assert!(!runtime.should_collect_coverage("/t/__tests__/a-test.js"));
    }
}
