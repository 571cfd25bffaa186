//! Normalized module identity.
//!
//! A module identifier is the `(kind, absolute_path, mock_path)` triple that
//! keys every mock-policy and mock-storage table.  For a fixed resolver
//! state the identifier is a pure function of the requesting file and the
//! specifier, so computed identifiers are memoised process-wide in a
//! [`NormalizedIdCache`] shared across runtime instances.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::paths::{self, PATH_LIST_SEPARATOR};

// ---------------------------------------------------------------------------
// ModuleId
// ---------------------------------------------------------------------------

/// Classification of a normalized module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleIdKind {
    /// Host built-in, loaded outside the sandbox.
    BuiltIn,
    /// Ordinary user module addressed by absolute path.
    User,
}

impl ModuleIdKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BuiltIn => "builtin",
            Self::User => "user",
        }
    }
}

/// Normalized module identifier. Either path may be empty: a built-in has no
/// mock path, and a module that exists only as a manual mock has no real
/// absolute path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId {
    pub kind: ModuleIdKind,
    pub absolute_path: String,
    pub mock_path: String,
}

impl ModuleId {
    pub fn built_in(specifier: impl Into<String>) -> Self {
        Self {
            kind: ModuleIdKind::BuiltIn,
            absolute_path: specifier.into(),
            mock_path: String::new(),
        }
    }

    pub fn user(absolute_path: impl Into<String>, mock_path: impl Into<String>) -> Self {
        Self {
            kind: ModuleIdKind::User,
            absolute_path: absolute_path.into(),
            mock_path: mock_path.into(),
        }
    }

    /// Canonical string form: the triple joined by the host path-list
    /// separator. Used as the key of every identifier-indexed table.
    pub fn serialized(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.kind.as_str(),
            self.absolute_path,
            self.mock_path,
            sep = PATH_LIST_SEPARATOR,
        )
    }

    /// Whether a manual mock path was recorded for this module.
    pub fn has_mock_path(&self) -> bool {
        !self.mock_path.is_empty()
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialized())
    }
}

// ---------------------------------------------------------------------------
// Virtual-mock candidate paths
// ---------------------------------------------------------------------------

/// Candidate path under which a virtual mock for `(from, specifier)` would
/// be registered. Bare names pass through unchanged; relative and absolute
/// specifiers normalize against the requesting file's directory.
pub fn virtual_mock_path(from: &str, specifier: &str) -> String {
    if !specifier.starts_with('.') && !specifier.starts_with('/') {
        return specifier.to_string();
    }
    paths::normalize_absolute(&paths::join(&paths::dirname(from), specifier))
}

// ---------------------------------------------------------------------------
// NormalizedIdCache — process-wide memo table
// ---------------------------------------------------------------------------

/// Memo table for normalized identifiers, keyed by the requesting file and
/// the specifier. Sound because resolver state is immutable during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedIdCache {
    entries: BTreeMap<(String, String), ModuleId>,
}

impl NormalizedIdCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, from: &str, specifier: &str) -> Option<&ModuleId> {
        self.entries
            .get(&(from.to_string(), specifier.to_string()))
    }

    pub fn insert(&mut self, from: &str, specifier: &str, id: ModuleId) {
        self.entries
            .insert((from.to_string(), specifier.to_string()), id);
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
    fn serialized_form_joins_the_triple() {
        let id = ModuleId::user("/t/a.js", "/t/__mocks__/a.js");
        assert_eq!(id.serialized(), "user:/t/a.js:/t/__mocks__/a.js");
        let builtin = ModuleId::built_in("fs");
        assert_eq!(builtin.serialized(), "builtin:fs:");
        assert!(!builtin.has_mock_path());
    }

    #[test]
    fn virtual_paths_keep_bare_names_and_normalize_relative_ones() {
        assert_eq!(virtual_mock_path("/t/x.js", "nope"), "nope");
        assert_eq!(virtual_mock_path("/t/x.js", "./ghost"), "/t/ghost");
        assert_eq!(virtual_mock_path("/t/sub/x.js", "../ghost"), "/t/ghost");
        assert_eq!(virtual_mock_path("/t/x.js", "/abs/ghost"), "/abs/ghost");
    }

    #[test]
    fn cache_round_trips_by_pair() {
        let mut cache = NormalizedIdCache::new();
        assert!(cache.get("/t/a.js", "./b").is_none());
        cache.insert("/t/a.js", "./b", ModuleId::user("/t/b.js", ""));
        assert_eq!(
            cache.get("/t/a.js", "./b").unwrap().absolute_path,
            "/t/b.js"
        );
        assert_eq!(cache.len(), 1);
    }
}
