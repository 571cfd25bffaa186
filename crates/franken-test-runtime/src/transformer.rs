//! Source transformation: module text → evaluable script.
//!
//! Module sources are written in a small line-oriented statement language;
//! the transformer turns a file's text into a [`Script`] that the sandbox
//! evaluates to a module wrapper.  Parsing is deferred to evaluation so that
//! malformed sources surface as sandbox syntax errors, and transforms are
//! memoised under a content digest so repeated requires of the same file do
//! not re-do the work.
//!
//! Statement grammar (one statement per line, `#` starts a comment):
//!
//! ```text
//! export NAME = EXPR
//! global NAME = EXPR
//! import "SPECIFIER"
//! mock "SPECIFIER"
//! unmock "SPECIFIER"
//! ```
//!
//! with `EXPR` one of: an integer, a quoted string, `true`, `false`,
//! `null`, `undefined`, `fn` (optionally followed by a literal return
//! value), or `require "SPECIFIER"` (optionally followed by `.member`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RuntimeConfig;
use crate::value::Value;

/// Property name under which a script's evaluation result exposes the
/// module wrapper.
pub const MODULE_WRAPPER_PROPERTY: &str = "frankenModuleWrapper";

/// Directive line emitted by coverage instrumentation.
pub const COVERAGE_DIRECTIVE: &str = "@coverage";

// ---------------------------------------------------------------------------
// ContentHash
// ---------------------------------------------------------------------------

/// SHA-256 digest of source bytes; the transform-cache key component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for byte in &self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Module programs
// ---------------------------------------------------------------------------

/// Expression on the right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Literal value (never an object reference).
    Literal(Value),
    /// Function declaration, optionally returning a literal.
    Function { returns: Option<Value> },
    /// Require another module, optionally projecting one member of its
    /// exports.
    Require {
        specifier: String,
        member: Option<String>,
    },
}

/// One executable statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModuleOpKind {
    /// Assign into the module's exports bag.
    Export { name: String, expr: Expr },
    /// Assign onto the sandbox global.
    Global { name: String, expr: Expr },
    /// Bare require for its side effects.
    Import { specifier: String },
    /// Force-mock a specifier through the per-file facade.
    Mock { specifier: String },
    /// Force-real a specifier through the per-file facade.
    Unmock { specifier: String },
}

/// A statement with its 1-based source line, kept for coverage accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleOp {
    pub kind: ModuleOpKind,
    pub line: u32,
}

/// Coverage annotation injected by instrumentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageAnnotation {
    /// Global key of the coverage data store.
    pub store_key: String,
    /// File the hits belong to.
    pub filename: String,
}

/// The module wrapper: the parsed statement list plus any coverage
/// annotation. Invoked by the runtime with the module-local environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModuleProgram {
    pub ops: Vec<ModuleOp>,
    pub coverage: Option<CoverageAnnotation>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse failure, surfaced as a sandbox syntax error at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSyntaxError {
    pub line: u32,
    pub message: String,
}

impl fmt::Display for ModuleSyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ModuleSyntaxError {}

fn syntax_error(line: u32, message: impl Into<String>) -> Box<ModuleSyntaxError> {
    Box::new(ModuleSyntaxError {
        line,
        message: message.into(),
    })
}

/// Parse module source text into its program.
pub fn parse_module_source(source: &str) -> Result<ModuleProgram, Box<ModuleSyntaxError>> {
    let mut program = ModuleProgram::default();

    for (index, raw_line) in source.lines().enumerate() {
        let line = (index + 1) as u32;
        let text = raw_line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        if let Some(rest) = text.strip_prefix(COVERAGE_DIRECTIVE) {
            let mut parts = rest.split_whitespace();
            let store_key = parts
                .next()
                .ok_or_else(|| syntax_error(line, "coverage directive missing store key"))?;
            let filename = parts
                .next()
                .ok_or_else(|| syntax_error(line, "coverage directive missing filename"))?;
            program.coverage = Some(CoverageAnnotation {
                store_key: store_key.to_string(),
                filename: filename.to_string(),
            });
            continue;
        }

        let kind = parse_statement(text, line)?;
        program.ops.push(ModuleOp { kind, line });
    }

    Ok(program)
}

fn parse_statement(text: &str, line: u32) -> Result<ModuleOpKind, Box<ModuleSyntaxError>> {
    if let Some(rest) = text.strip_prefix("export ") {
        let (name, expr) = parse_assignment(rest, line)?;
        return Ok(ModuleOpKind::Export { name, expr });
    }
    if let Some(rest) = text.strip_prefix("global ") {
        let (name, expr) = parse_assignment(rest, line)?;
        return Ok(ModuleOpKind::Global { name, expr });
    }
    if let Some(rest) = text.strip_prefix("import ") {
        let (specifier, rest) = parse_quoted(rest.trim(), line)?;
        expect_end(rest, line)?;
        return Ok(ModuleOpKind::Import { specifier });
    }
    if let Some(rest) = text.strip_prefix("mock ") {
        let (specifier, rest) = parse_quoted(rest.trim(), line)?;
        expect_end(rest, line)?;
        return Ok(ModuleOpKind::Mock { specifier });
    }
    if let Some(rest) = text.strip_prefix("unmock ") {
        let (specifier, rest) = parse_quoted(rest.trim(), line)?;
        expect_end(rest, line)?;
        return Ok(ModuleOpKind::Unmock { specifier });
    }

    Err(syntax_error(
        line,
        format!("unrecognised statement '{text}'"),
    ))
}

fn parse_assignment(rest: &str, line: u32) -> Result<(String, Expr), Box<ModuleSyntaxError>> {
    let (name, tail) = rest
        .split_once('=')
        .ok_or_else(|| syntax_error(line, "assignment missing '='"))?;
    let name = name.trim();
    if !is_identifier(name) {
        return Err(syntax_error(line, format!("invalid identifier '{name}'")));
    }
    let expr = parse_expr(tail.trim(), line)?;
    Ok((name.to_string(), expr))
}

fn parse_expr(text: &str, line: u32) -> Result<Expr, Box<ModuleSyntaxError>> {
    if text.starts_with('"') {
        let (value, rest) = parse_quoted(text, line)?;
        expect_end(rest, line)?;
        return Ok(Expr::Literal(Value::Str(value)));
    }

    if let Some(rest) = text.strip_prefix("require ") {
        let (specifier, rest) = parse_quoted(rest.trim(), line)?;
        let rest = rest.trim();
        if rest.is_empty() {
            return Ok(Expr::Require {
                specifier,
                member: None,
            });
        }
        let member = rest
            .strip_prefix('.')
            .map(str::trim)
            .filter(|member| is_identifier(member))
            .ok_or_else(|| {
                syntax_error(line, format!("invalid member projection '{rest}'"))
            })?;
        return Ok(Expr::Require {
            specifier,
            member: Some(member.to_string()),
        });
    }

    if text == "fn" {
        return Ok(Expr::Function { returns: None });
    }
    if let Some(rest) = text.strip_prefix("fn ") {
        let value = parse_literal(rest.trim(), line)?;
        return Ok(Expr::Function {
            returns: Some(value),
        });
    }

    parse_literal(text, line).map(Expr::Literal)
}

fn parse_literal(text: &str, line: u32) -> Result<Value, Box<ModuleSyntaxError>> {
    match text {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        "undefined" => return Ok(Value::Undefined),
        _ => {}
    }

    if text.starts_with('"') {
        let (value, rest) = parse_quoted(text, line)?;
        expect_end(rest, line)?;
        return Ok(Value::Str(value));
    }

    text.parse::<i64>()
        .map(Value::Int)
        .map_err(|_| syntax_error(line, format!("invalid literal '{text}'")))
}

fn parse_quoted<'a>(
    text: &'a str,
    line: u32,
) -> Result<(String, &'a str), Box<ModuleSyntaxError>> {
    let rest = text
        .strip_prefix('"')
        .ok_or_else(|| syntax_error(line, format!("expected quoted string at '{text}'")))?;
    let end = rest
        .find('"')
        .ok_or_else(|| syntax_error(line, "unterminated string literal"))?;
    Ok((rest[..end].to_string(), &rest[end + 1..]))
}

fn expect_end(rest: &str, line: u32) -> Result<(), Box<ModuleSyntaxError>> {
    let rest = rest.trim();
    if rest.is_empty() || rest.starts_with('#') {
        Ok(())
    } else {
        Err(syntax_error(line, format!("unexpected trailing '{rest}'")))
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Scripts and the transformer contract
// ---------------------------------------------------------------------------

/// Evaluable script: transformed source plus its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub filename: String,
    pub source: String,
    pub digest: ContentHash,
    pub instrumented: bool,
}

/// Hook through which the transformer asks the coverage collector to
/// annotate a file's source.
pub trait Instrumenter {
    fn annotate(&self, source: &str, filename: &str) -> String;
}

/// Source-transformation contract consumed by the loader.
pub trait SourceTransformer {
    fn transform(
        &mut self,
        filename: &str,
        source: &str,
        config: &RuntimeConfig,
        instrument: Option<&dyn Instrumenter>,
    ) -> Script;
}

/// Transformer with a content-addressed memo: re-transforming an unchanged
/// file is a map lookup.
#[derive(Debug, Default)]
pub struct CachingTransformer {
    cache: BTreeMap<(String, ContentHash, bool), Script>,
    hits: u64,
    misses: u64,
}

impl CachingTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits
    }

    pub fn cache_misses(&self) -> u64 {
        self.misses
    }
}

impl SourceTransformer for CachingTransformer {
    fn transform(
        &mut self,
        filename: &str,
        source: &str,
        _config: &RuntimeConfig,
        instrument: Option<&dyn Instrumenter>,
    ) -> Script {
        let digest = ContentHash::compute(source.as_bytes());
        let instrumented = instrument.is_some();
        let key = (filename.to_string(), digest, instrumented);

        if let Some(script) = self.cache.get(&key) {
            self.hits += 1;
            return script.clone();
        }

        self.misses += 1;
        let transformed = match instrument {
            Some(instrumenter) => instrumenter.annotate(source, filename),
            None => source.to_string(),
        };
        let script = Script {
            filename: filename.to_string(),
            source: transformed,
            digest,
            instrumented,
        };
        self.cache.insert(key, script.clone());
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_statement_kind() {
        let source = r#"
# a comment
export n = 1
export s = "text"
export flag = true
export none = null
export missing = undefined
export k = fn 7
export plain = fn
export b = require "./b"
export seen = require "./a" . a
global marker = fn
import "./side"
mock "./m"
unmock "./m"
"#;
        let program = parse_module_source(source).unwrap();
        assert_eq!(program.ops.len(), 13);
        assert!(program.coverage.is_none());
        assert_eq!(
            program.ops[0].kind,
            ModuleOpKind::Export {
                name: "n".to_string(),
                expr: Expr::Literal(Value::Int(1)),
            }
        );
        assert_eq!(
            program.ops[8].kind,
            ModuleOpKind::Export {
                name: "seen".to_string(),
                expr: Expr::Require {
                    specifier: "./a".to_string(),
                    member: Some("a".to_string()),
                },
            }
        );
        assert_eq!(
            program.ops[11].kind,
            ModuleOpKind::Mock {
                specifier: "./m".to_string()
            }
        );
    }

    #[test]
    fn coverage_directive_sets_the_annotation() {
        let source = "@coverage __coverage__ /t/a.js\nexport n = 1\n";
        let program = parse_module_source(source).unwrap();
        let coverage = program.coverage.unwrap();
        assert_eq!(coverage.store_key, "__coverage__");
        assert_eq!(coverage.filename, "/t/a.js");
        assert_eq!(program.ops[0].line, 2);
    }

    #[test]
    fn malformed_statements_report_their_line() {
        let err = parse_module_source("export n = 1\nexplode now\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.to_string().contains("unrecognised statement"));

        let err = parse_module_source("export s = \"open\n").unwrap_err();
        assert!(err.message.contains("unterminated"));

        let err = parse_module_source("export 9lives = 1\n").unwrap_err();
        assert!(err.message.contains("invalid identifier"));
    }

    #[test]
    fn transform_memoises_by_content() {
        let config = RuntimeConfig::default();
        let mut transformer = CachingTransformer::new();
        let first = transformer.transform("/t/a.js", "export n = 1", &config, None);
        let second = transformer.transform("/t/a.js", "export n = 1", &config, None);
        assert_eq!(first, second);
        assert_eq!(transformer.cache_hits(), 1);
        assert_eq!(transformer.cache_misses(), 1);

        let changed = transformer.transform("/t/a.js", "export n = 2", &config, None);
        assert_ne!(first.digest, changed.digest);
        assert_eq!(transformer.cache_misses(), 2);
    }

    struct PrefixInstrumenter;

    impl Instrumenter for PrefixInstrumenter {
        fn annotate(&self, source: &str, filename: &str) -> String {
            format!("{COVERAGE_DIRECTIVE} __coverage__ {filename}\n{source}")
        }
    }

    #[test]
    fn instrumented_transforms_are_cached_separately() {
        let config = RuntimeConfig::default();
        let mut transformer = CachingTransformer::new();
        let plain = transformer.transform("/t/a.js", "export n = 1", &config, None);
        let annotated =
            transformer.transform("/t/a.js", "export n = 1", &config, Some(&PrefixInstrumenter));
        assert!(!plain.instrumented);
        assert!(annotated.instrumented);
        assert!(annotated.source.starts_with(COVERAGE_DIRECTIVE));
        assert_eq!(transformer.cache_misses(), 2);
    }
}
