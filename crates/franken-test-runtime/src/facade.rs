//! Per-file test-control facade.
//!
//! Every executed module receives a facade bound to its own filename; test
//! code drives mocking, timers, matchers, and registry resets through it.
//! Mutating methods return the facade handle so calls chain.

use std::collections::BTreeMap;

use crate::policy::MockFactory;
use crate::runtime::{MockOptions, Runtime, RuntimeResult};
use crate::value::Value;

/// Handle borrowing the runtime on behalf of one requesting file.
pub struct TestFacade<'rt> {
    runtime: &'rt mut Runtime,
    from: String,
}

impl Runtime {
    /// The facade for a requesting file.
    pub fn facade_for(&mut self, from: impl Into<String>) -> TestFacade<'_> {
        TestFacade {
            from: from.into(),
            runtime: self,
        }
    }
}

impl<'rt> TestFacade<'rt> {
    /// The file this facade is bound to.
    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn runtime(&mut self) -> &mut Runtime {
        self.runtime
    }

    // -----------------------------------------------------------------------
    // Automock switch
    // -----------------------------------------------------------------------

    pub fn enable_automock(&mut self) -> &mut Self {
        self.runtime.enable_automock();
        self
    }

    pub fn disable_automock(&mut self) -> &mut Self {
        self.runtime.disable_automock();
        self
    }

    // -----------------------------------------------------------------------
    // Mock pins
    // -----------------------------------------------------------------------

    /// Pin a specifier force-mock.
    pub fn mock(&mut self, name: &str) -> RuntimeResult<&mut Self> {
        self.mock_with(name, None, MockOptions::default())
    }

    /// Pin a specifier force-mock with a factory and options.
    pub fn mock_with(
        &mut self,
        name: &str,
        factory: Option<MockFactory>,
        options: MockOptions,
    ) -> RuntimeResult<&mut Self> {
        self.runtime.facade_mock(&self.from, name, factory, options)?;
        Ok(self)
    }

    /// `set_mock(name, value)` is `mock(name, || value)`.
    pub fn set_mock(&mut self, name: &str, value: Value) -> RuntimeResult<&mut Self> {
        self.runtime.facade_set_mock(&self.from, name, value)?;
        Ok(self)
    }

    /// Pin a specifier force-real.
    pub fn unmock(&mut self, name: &str) -> RuntimeResult<&mut Self> {
        self.runtime.facade_unmock(&self.from, name)?;
        Ok(self)
    }

    /// Pin force-real and exempt the module's dependency subtree from
    /// automock.
    pub fn deep_unmock(&mut self, name: &str) -> RuntimeResult<&mut Self> {
        self.runtime.facade_deep_unmock(&self.from, name)?;
        Ok(self)
    }

    /// Wipe the module and mock registries.
    pub fn reset_module_registry(&mut self) -> RuntimeResult<&mut Self> {
        self.runtime.reset_module_registry()?;
        Ok(self)
    }

    /// Automock synthesis without caching in the mock registry.
    pub fn gen_mock_from_module(&mut self, name: &str) -> RuntimeResult<Value> {
        self.runtime.generate_mock(&self.from, name)
    }

    // -----------------------------------------------------------------------
    // Mock functions
    // -----------------------------------------------------------------------

    /// Create a mock function, optionally preloaded with an implementation
    /// value.
    pub fn mock_fn(&mut self, implementation: Option<Value>) -> Value {
        self.runtime.create_mock_function(implementation)
    }

    /// Alias for the mock-function factory.
    pub fn gen_mock_function(&mut self) -> Value {
        self.mock_fn(None)
    }

    /// Alias for the mock-function factory.
    pub fn gen_mock_fn(&mut self) -> Value {
        self.mock_fn(None)
    }

    pub fn is_mock_function(&self, value: &Value) -> bool {
        self.runtime.is_mock_function(value)
    }

    // -----------------------------------------------------------------------
    // Timer control
    // -----------------------------------------------------------------------

    pub fn use_fake_timers(&mut self) -> &mut Self {
        self.runtime.use_fake_timers();
        self
    }

    pub fn use_real_timers(&mut self) -> &mut Self {
        self.runtime.use_real_timers();
        self
    }

    pub fn clear_all_timers(&mut self) -> &mut Self {
        self.runtime.clear_all_timers();
        self
    }

    pub fn run_all_ticks(&mut self) -> RuntimeResult<&mut Self> {
        self.runtime.run_all_ticks()?;
        Ok(self)
    }

    pub fn run_all_immediates(&mut self) -> RuntimeResult<&mut Self> {
        self.runtime.run_all_immediates()?;
        Ok(self)
    }

    pub fn run_all_timers(&mut self) -> RuntimeResult<&mut Self> {
        self.runtime.run_all_timers()?;
        Ok(self)
    }

    pub fn run_only_pending_timers(&mut self) -> RuntimeResult<&mut Self> {
        self.runtime.run_only_pending_timers()?;
        Ok(self)
    }

    // -----------------------------------------------------------------------
    // Environment surface
    // -----------------------------------------------------------------------

    /// Install assertion matchers into the globally exposed test-spec
    /// framework.
    pub fn add_matchers(&mut self, matchers: BTreeMap<String, Value>) -> &mut Self {
        self.runtime.add_matchers(matchers);
        self
    }

    /// Frozen shallow clone of the configured test-env data.
    pub fn get_test_env_data(&mut self) -> Value {
        self.runtime.get_test_env_data()
    }

    // -----------------------------------------------------------------------
    // Bound requires
    // -----------------------------------------------------------------------

    /// Oracle-consulting require from this facade's file.
    pub fn require(&mut self, specifier: &str) -> RuntimeResult<Value> {
        let from = self.from.clone();
        self.runtime.require(&from, specifier)
    }

    /// Oracle-bypassing require of the real module.
    pub fn require_actual(&mut self, specifier: &str) -> RuntimeResult<Value> {
        let from = self.from.clone();
        self.runtime.require_actual(&from, specifier)
    }

    /// Mock-mode require.
    pub fn require_mock(&mut self, specifier: &str) -> RuntimeResult<Value> {
        let from = self.from.clone();
        self.runtime.require_mock(&from, specifier)
    }
}
