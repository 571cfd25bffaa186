//! Process-wide caches shared across runtime instances.
//!
//! Normalized identifiers are a function of resolver state, and the unmock
//! matcher is a function of configuration, so both outlive any single
//! runtime.  Rather than true globals, the caches are an owned value the
//! caller threads into each runtime and can recover afterwards.

use std::collections::BTreeMap;

use crate::config::RuntimeConfig;
use crate::module_id::NormalizedIdCache;
use crate::policy::PatternSet;

/// The shared cache registry.
#[derive(Debug, Clone, Default)]
pub struct ProcessCaches {
    /// Memoised `(from, specifier)` → identifier table.
    pub normalized_ids: NormalizedIdCache,
    unmock_matchers: BTreeMap<String, PatternSet>,
}

impl ProcessCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiled unmock matcher for a configuration; two runtimes on the
    /// same configuration share one compilation.
    pub fn unmock_matcher_for(
        &mut self,
        config: &RuntimeConfig,
    ) -> Result<PatternSet, regex::Error> {
        let key = config.unmock_patterns_key();
        if let Some(matcher) = self.unmock_matchers.get(&key) {
            return Ok(matcher.clone());
        }
        let matcher = PatternSet::compile(&config.unmocked_module_path_patterns)?;
        self.unmock_matchers.insert(key, matcher.clone());
        Ok(matcher)
    }

    /// Number of distinct configurations with a compiled matcher.
    pub fn compiled_matcher_count(&self) -> usize {
        self.unmock_matchers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matchers_are_shared_per_configuration() {
        let mut caches = ProcessCaches::new();
        let config = RuntimeConfig {
            unmocked_module_path_patterns: vec!["/vendor/".to_string()],
            ..RuntimeConfig::default()
        };

        let first = caches.unmock_matcher_for(&config).unwrap();
        let second = caches.unmock_matcher_for(&config).unwrap();
        assert_eq!(caches.compiled_matcher_count(), 1);
        assert_eq!(first.sources(), second.sources());

        let other = RuntimeConfig::default();
        caches.unmock_matcher_for(&other).unwrap();
        assert_eq!(caches.compiled_matcher_count(), 2);
    }
}
