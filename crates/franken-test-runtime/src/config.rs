//! Typed configuration surface consumed by the runtime.
//!
//! Configuration loading (file discovery, argv merging) happens upstream;
//! the runtime consumes this already-materialised struct.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::paths::PATH_LIST_SEPARATOR;

/// Runtime configuration. Field defaults match an empty project: automock
/// on, caching on, no coverage, no setup files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Project root; error messages render module paths relative to it.
    pub root_dir: String,
    /// Global automock switch at construction time.
    pub automock: bool,
    /// When false, the haste-map cache directory is reset on build.
    pub cache: bool,
    /// Directory for build caches; created on demand.
    pub cache_directory: String,
    /// Pattern matching manual-mock files.
    pub mocks_pattern: String,
    /// Pattern matching test files; `/` is replaced with the host path
    /// separator before compilation.
    pub test_regex: String,
    /// Paths matching any of these patterns are excluded from coverage.
    pub coverage_path_ignore_patterns: Vec<String>,
    /// Modules whose resolved path matches any of these patterns are
    /// delivered real under automock.
    pub unmocked_module_path_patterns: Vec<String>,
    /// Master coverage switch.
    pub collect_coverage: bool,
    /// When present, only these files are instrumented.
    pub collect_coverage_only_from: Option<BTreeSet<String>>,
    /// Collector selection; empty selects the built-in line collector.
    pub coverage_collector: String,
    /// Modules required before the test file, with mocking disabled for
    /// them.
    pub setup_files: Vec<String>,
    /// Preprocessor identifier surfaced in syntax-error guidance.
    pub script_preprocessor: String,
    /// Opaque per-project data exposed through the facade as a frozen
    /// shallow clone.
    pub test_env_data: BTreeMap<String, serde_json::Value>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root_dir: "/".to_string(),
            automock: true,
            cache: true,
            cache_directory: String::new(),
            mocks_pattern: "__mocks__".to_string(),
            test_regex: "__tests__/.*\\.js$".to_string(),
            coverage_path_ignore_patterns: vec!["/node_modules/".to_string()],
            unmocked_module_path_patterns: Vec::new(),
            collect_coverage: false,
            collect_coverage_only_from: None,
            coverage_collector: String::new(),
            setup_files: Vec::new(),
            script_preprocessor: String::new(),
            test_env_data: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Test pattern with `/` rewritten to the host path separator.
    pub fn host_test_regex(&self) -> String {
        self.test_regex
            .replace('/', &std::path::MAIN_SEPARATOR.to_string())
    }

    /// Memo key under which the compiled unmock matcher is shared between
    /// runtime instances on the same configuration.
    pub fn unmock_patterns_key(&self) -> String {
        self.unmocked_module_path_patterns
            .join(&PATH_LIST_SEPARATOR.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_automock_and_caching() {
        let config = RuntimeConfig::default();
        assert!(config.automock);
        assert!(config.cache);
        assert!(!config.collect_coverage);
        assert_eq!(config.mocks_pattern, "__mocks__");
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"root_dir":"/repo","unmocked_module_path_patterns":["/repo/vendor/"]}"#,
        )
        .unwrap();
        assert_eq!(config.root_dir, "/repo");
        assert_eq!(config.unmock_patterns_key(), "/repo/vendor/");
        assert!(config.automock);
    }

    #[test]
    fn unmock_key_is_stable_over_pattern_order() {
        let mut config = RuntimeConfig::default();
        config.unmocked_module_path_patterns =
            vec!["a".to_string(), "b".to_string()];
        assert_eq!(config.unmock_patterns_key(), "a:b");
    }
}
