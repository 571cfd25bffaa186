//! Mock-policy state: the tables the oracle and the facade mutate.
//!
//! Everything here survives a registry reset except nothing — that is the
//! point: explicit decisions, factories, transitive-unmock marks, and the
//! virtual-mock set persist across `reset_module_registry`, while the
//! module and mock registries themselves are wiped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::mock_metadata::{generate_from_metadata, MockMetadata};
use crate::value::{Value, ValueHeap};

// ---------------------------------------------------------------------------
// Explicit decisions and factories
// ---------------------------------------------------------------------------

/// User-pinned delivery decision for one module identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplicitMockDecision {
    ForceMock,
    ForceReal,
}

/// Zero-argument mock producer registered through the facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MockFactory {
    /// Deliver this exact value on every request.
    Fixed(Value),
    /// Materialise a fresh value from metadata on every request.
    FromMetadata(MockMetadata),
}

impl MockFactory {
    pub fn materialize(&self, heap: &mut ValueHeap) -> Value {
        match self {
            Self::Fixed(value) => value.clone(),
            Self::FromMetadata(metadata) => generate_from_metadata(heap, metadata),
        }
    }
}

/// The mutable policy tables. Keys are serialized module identifiers except
/// where noted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockPolicyTables {
    /// Tri-state force-mock / force-real pins (absent = unset).
    pub explicit: BTreeMap<String, ExplicitMockDecision>,
    /// User-registered mock factories.
    pub factories: BTreeMap<String, MockFactory>,
    /// `false` marks a module and its dependency subtree exempt from
    /// automock.
    pub transitive_unmock: BTreeMap<String, bool>,
    /// Paths registered through `mock(..., virtual)`; no file need exist.
    pub virtual_mocks: BTreeSet<String>,
    /// Memoised oracle verdicts by identifier.
    pub should_mock_memo: BTreeMap<String, bool>,
    /// `(requesting_file, identifier)` pairs already ruled exempt by the
    /// transitive-unmock rule; consulted at the top of the oracle and never
    /// cleared during a run.
    pub transitive_exempt_memo: BTreeSet<(String, String)>,
}

impl MockPolicyTables {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

/// A compiled set of path patterns; a path matches when any pattern does.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    sources: Vec<String>,
    regexes: Vec<Regex>,
}

impl PatternSet {
    /// Compile a pattern list. Empty lists (and empty pattern strings)
    /// yield a set that matches nothing.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let mut sources = Vec::new();
        let mut regexes = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.is_empty() {
                continue;
            }
            regexes.push(Regex::new(pattern)?);
            sources.push(pattern.to_string());
        }
        Ok(Self { sources, regexes })
    }

    pub fn is_empty(&self) -> bool {
        self.regexes.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regexes.iter().any(|regex| regex.is_match(path))
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }
}

impl fmt::Display for PatternSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sources.join(", "))
    }
}
