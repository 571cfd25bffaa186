//! File resolution: specifier → absolute path, plus haste-name and
//! manual-mock lookup.
//!
//! The contract the loader consumes is [`FileResolver`];
//! [`DeterministicFileResolver`] is the in-memory implementation used by the
//! runtime and its tests.  Resolution probes candidate paths in a fixed
//! order (exact, `.js`, `.json`, `/index.js`), walking `node_modules`
//! directories for bare specifiers the way flat package layouts expect.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::paths;

pub type ResolveResult<T> = Result<T, Box<ResolveError>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveErrorCode {
    EmptySpecifier,
    ModuleNotFound,
}

impl ResolveErrorCode {
    pub const fn stable_code(self) -> &'static str {
        match self {
            Self::EmptySpecifier => "FE-RESOLVE-0001",
            Self::ModuleNotFound => "FE-RESOLVE-0002",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveError {
    pub code: ResolveErrorCode,
    pub message: String,
}

impl ResolveError {
    fn not_found(from: &str, specifier: &str) -> Box<Self> {
        Box::new(Self {
            code: ResolveErrorCode::ModuleNotFound,
            message: format!("cannot resolve module '{specifier}' from '{from}'"),
        })
    }

    fn empty_specifier(from: &str) -> Box<Self> {
        Box::new(Self {
            code: ResolveErrorCode::EmptySpecifier,
            message: format!("empty module specifier required from '{from}'"),
        })
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.stable_code(), self.message)
    }
}

impl std::error::Error for ResolveError {}

// ---------------------------------------------------------------------------
// FileResolver contract
// ---------------------------------------------------------------------------

/// Resolution operations the loader consumes. `source_text` and `has_file`
/// extend the contract so the loader and transformer can fetch module text
/// without a filesystem round trip.
pub trait FileResolver {
    /// Resolve a specifier from a requesting file to an absolute path.
    fn resolve_module(&self, from: &str, specifier: &str) -> ResolveResult<String>;

    /// Haste-map lookup: registered module name → absolute path.
    fn get_module(&self, specifier: &str) -> Option<String>;

    /// Registered manual mock for a module name → absolute path.
    fn get_mock_module(&self, specifier: &str) -> Option<String>;

    /// Whether the specifier names a host built-in.
    fn is_core_module(&self, specifier: &str) -> bool;

    /// Search-path list (`node_modules` ancestry) for a directory.
    fn module_paths(&self, dir: &str) -> Vec<String>;

    /// Whether an exact file exists.
    fn has_file(&self, path: &str) -> bool;

    /// Source text of an exact file.
    fn source_text(&self, path: &str) -> Option<String>;
}

// ---------------------------------------------------------------------------
// DeterministicFileResolver
// ---------------------------------------------------------------------------

/// In-memory resolver over registered files, haste names, manual mocks, and
/// core-module names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeterministicFileResolver {
    files: BTreeMap<String, String>,
    haste: BTreeMap<String, String>,
    mocks: BTreeMap<String, String>,
    core_modules: BTreeSet<String>,
}

impl DeterministicFileResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file with its source text. The path is normalized.
    pub fn register_file(&mut self, path: impl Into<String>, source: impl Into<String>) {
        let path = paths::normalize_absolute(&path.into());
        self.files.insert(path, source.into());
    }

    /// Register a haste name for an absolute path.
    pub fn register_haste_name(&mut self, name: impl Into<String>, path: impl Into<String>) {
        self.haste
            .insert(name.into(), paths::normalize_absolute(&path.into()));
    }

    /// Register a manual mock for a module name.
    pub fn register_manual_mock(&mut self, name: impl Into<String>, path: impl Into<String>) {
        self.mocks
            .insert(name.into(), paths::normalize_absolute(&path.into()));
    }

    /// Mark a specifier as a host built-in.
    pub fn register_core_module(&mut self, name: impl Into<String>) {
        self.core_modules.insert(name.into());
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Registered haste names and their paths.
    pub fn haste_map(&self) -> &BTreeMap<String, String> {
        &self.haste
    }

    fn probe(&self, base: &str) -> Option<String> {
        for candidate in candidate_paths(base) {
            if self.files.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

impl FileResolver for DeterministicFileResolver {
    fn resolve_module(&self, from: &str, specifier: &str) -> ResolveResult<String> {
        let specifier = specifier.trim();
        if specifier.is_empty() {
            return Err(ResolveError::empty_specifier(from));
        }

        if self.core_modules.contains(specifier) {
            return Ok(specifier.to_string());
        }

        if paths::is_relative_specifier(specifier) {
            let base = paths::normalize_absolute(&paths::join(&paths::dirname(from), specifier));
            return self
                .probe(&base)
                .ok_or_else(|| ResolveError::not_found(from, specifier));
        }

        if specifier.starts_with('/') {
            let base = paths::normalize_absolute(specifier);
            return self
                .probe(&base)
                .ok_or_else(|| ResolveError::not_found(from, specifier));
        }

        if let Some(path) = self.haste.get(specifier) {
            return Ok(path.clone());
        }

        for dir in self.module_paths(&paths::dirname(from)) {
            let base = paths::join(&dir, specifier);
            if let Some(path) = self.probe(&base) {
                return Ok(path);
            }
        }

        Err(ResolveError::not_found(from, specifier))
    }

    fn get_module(&self, specifier: &str) -> Option<String> {
        self.haste.get(specifier).cloned()
    }

    fn get_mock_module(&self, specifier: &str) -> Option<String> {
        self.mocks.get(specifier).cloned()
    }

    fn is_core_module(&self, specifier: &str) -> bool {
        self.core_modules.contains(specifier)
    }

    fn module_paths(&self, dir: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut current = paths::normalize_absolute(dir);
        loop {
            if paths::basename(&current) != paths::NODE_MODULES_SEGMENT {
                result.push(paths::join(&current, paths::NODE_MODULES_SEGMENT));
            }
            if current == "/" {
                break;
            }
            current = paths::dirname(&current);
        }
        result
    }

    fn has_file(&self, path: &str) -> bool {
        self.files.contains_key(&paths::normalize_absolute(path))
    }

    fn source_text(&self, path: &str) -> Option<String> {
        self.files.get(&paths::normalize_absolute(path)).cloned()
    }
}

fn candidate_paths(base: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut seen = BTreeSet::new();
    let mut push = |candidate: String| {
        if seen.insert(candidate.clone()) {
            candidates.push(candidate);
        }
    };

    push(base.to_string());
    for suffix in [".js", ".json", "/index.js"] {
        push(format!("{base}{suffix}"));
    }
    candidates
}

// ---------------------------------------------------------------------------
// Haste map building
// ---------------------------------------------------------------------------

/// Haste-name pragma recognised on the first line of a scanned file.
const HASTE_PRAGMA: &str = "# @haste ";

/// Workers hint for the scan; the deterministic builder scans sequentially
/// regardless, the option is part of the entry-point contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildHasteMapOptions {
    pub max_workers: usize,
}

impl Default for BuildHasteMapOptions {
    fn default() -> Self {
        Self { max_workers: 1 }
    }
}

/// Summary of one haste-map build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasteMapInstance {
    pub root_dir: String,
    pub file_count: usize,
}

/// Result of [`build_haste_map`]: the scan summary, the name → path map,
/// and a resolver primed with every scanned file.
#[derive(Debug, Clone)]
pub struct HasteContext {
    pub instance: HasteMapInstance,
    pub module_map: BTreeMap<String, String>,
    pub resolver: DeterministicFileResolver,
}

/// I/O failure while preparing the cache directory or scanning the root.
#[derive(Debug, thiserror::Error)]
pub enum HasteMapError {
    #[error("cache directory '{path}': {source}")]
    CacheDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("scanning '{path}': {source}")]
    Scan {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Scan `config.root_dir` into a resolver. Ensures the cache directory
/// exists, resetting it first when `config.cache` is false. Files under a
/// `__mocks__` directory register as manual mocks for their basename; a
/// first-line `# @haste NAME` pragma registers a haste name.
pub fn build_haste_map(
    config: &RuntimeConfig,
    options: &BuildHasteMapOptions,
) -> Result<HasteContext, HasteMapError> {
    let _ = options.max_workers;

    if !config.cache_directory.is_empty() {
        let cache_dir = Path::new(&config.cache_directory);
        if !config.cache && cache_dir.exists() {
            fs::remove_dir_all(cache_dir).map_err(|source| HasteMapError::CacheDirectory {
                path: config.cache_directory.clone(),
                source,
            })?;
        }
        fs::create_dir_all(cache_dir).map_err(|source| HasteMapError::CacheDirectory {
            path: config.cache_directory.clone(),
            source,
        })?;
    }

    let mut resolver = DeterministicFileResolver::new();
    let root = Path::new(&config.root_dir);
    if root.is_dir() {
        scan_directory(root, &mut resolver)?;
    }

    Ok(HasteContext {
        instance: HasteMapInstance {
            root_dir: config.root_dir.clone(),
            file_count: resolver.file_count(),
        },
        module_map: resolver.haste_map().clone(),
        resolver,
    })
}

fn scan_directory(
    dir: &Path,
    resolver: &mut DeterministicFileResolver,
) -> Result<(), HasteMapError> {
    let read_error = |source| HasteMapError::Scan {
        path: dir.display().to_string(),
        source,
    };

    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(read_error)?
        .collect::<Result<_, _>>()
        .map_err(read_error)?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            scan_directory(&path, resolver)?;
            continue;
        }

        let display = path.display().to_string();
        let extension = paths::extension(&display);
        if extension != ".js" && extension != ".json" {
            continue;
        }

        let text = fs::read_to_string(&path).map_err(|source| HasteMapError::Scan {
            path: display.clone(),
            source,
        })?;

        if let Some(name) = text
            .lines()
            .next()
            .and_then(|line| line.trim().strip_prefix(HASTE_PRAGMA))
        {
            resolver.register_haste_name(name.trim(), &display);
        }

        let parent_is_mocks = path
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|name| name == "__mocks__");
        if parent_is_mocks {
            let name = paths::basename(&display);
            let stem = name.strip_suffix(extension).unwrap_or(name).to_string();
            resolver.register_manual_mock(stem, &display);
        }

        resolver.register_file(&display, text);
    }

    Ok(())
}
