//! End-to-end module loading: caching, cycles, JSON data modules, ghost
//! manual mocks, and the sentinel parent.

use frankenengine_test_runtime::{
    DeterministicFileResolver, Runtime, RuntimeConfig, RuntimeErrorCode, Value,
    SENTINEL_PARENT_FILENAME, SENTINEL_PARENT_ID,
};

fn runtime_without_automock(resolver: DeterministicFileResolver) -> Runtime {
    Runtime::with_resolver(
        RuntimeConfig {
            automock: false,
            ..RuntimeConfig::default()
        },
        resolver,
    )
    .expect("runtime construction")
}

#[test]
fn required_modules_are_cached_and_mutations_stay_visible() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/a.js", "export b = require \"./b\"\n");
    resolver.register_file("/t/b.js", "export n = 1\n");
    let mut runtime = runtime_without_automock(resolver);

    let first = runtime.require("/t/a.js", "./b").unwrap();
    let handle = first.as_object().unwrap();
    assert_eq!(runtime.environment().heap().property(handle, "n"), Value::Int(1));

    // A consumer mutates the exports bag; the cached record exposes the
    // mutation to the next require.
    runtime
        .environment_mut()
        .heap_mut()
        .set_property(handle, "n", Value::Int(2));

    let second = runtime.require("/t/a.js", "./b").unwrap();
    assert_eq!(second, first);
    let handle = second.as_object().unwrap();
    assert_eq!(runtime.environment().heap().property(handle, "n"), Value::Int(2));
}

#[test]
fn registry_reset_breaks_exports_identity() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/b.js", "export n = 1\n");
    let mut runtime = runtime_without_automock(resolver);

    let before = runtime.require("/t/x.js", "./b").unwrap();
    runtime.reset_module_registry().unwrap();
    let after = runtime.require("/t/x.js", "./b").unwrap();
    assert_ne!(before.as_object(), after.as_object());
}

#[test]
fn circular_requires_observe_pre_assignment_exports() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file(
        "/t/a.js",
        "export a = 1\nimport \"./b\"\nexport a = 2\n",
    );
    resolver.register_file("/t/b.js", "export seen = require \"./a\" . a\n");
    let mut runtime = runtime_without_automock(resolver);

    let a_exports = runtime.require_module("/t/a.js", None).unwrap();
    let a_handle = a_exports.as_object().unwrap();
    assert_eq!(runtime.environment().heap().property(a_handle, "a"), Value::Int(2));

    let b_exports = runtime.require("/t/a.js", "./b").unwrap();
    let b_handle = b_exports.as_object().unwrap();
    // B ran mid-way through A's body and captured the pre-assignment value.
    assert_eq!(
        runtime.environment().heap().property(b_handle, "seen"),
        Value::Int(1)
    );
}

#[test]
fn json_modules_parse_through_the_sandbox() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/data.json", r#"{"n": 1, "tags": ["a", "b"]}"#);
    let mut runtime = runtime_without_automock(resolver);

    let exports = runtime.require("/t/x.js", "./data").unwrap();
    let handle = exports.as_object().unwrap();
    assert_eq!(runtime.environment().heap().property(handle, "n"), Value::Int(1));

    let tags = runtime.environment().heap().property(handle, "tags");
    let tags_handle = tags.as_object().unwrap();
    assert_eq!(
        runtime.environment().heap().property(tags_handle, "length"),
        Value::Int(2)
    );

    // Cached like any other module.
    let again = runtime.require("/t/x.js", "./data").unwrap();
    assert_eq!(again, exports);
}

#[test]
fn malformed_json_is_a_syntax_error_naming_the_file() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/repo/broken.json", "{nope");
    let mut runtime = Runtime::with_resolver(
        RuntimeConfig {
            automock: false,
            root_dir: "/repo".to_string(),
            ..RuntimeConfig::default()
        },
        resolver,
    )
    .unwrap();

    let err = runtime.require("/repo/x.js", "./broken").unwrap_err();
    assert_eq!(err.code, RuntimeErrorCode::ModuleSyntax);
    assert!(err.message.contains("broken.json"));
}

#[test]
fn ghost_manual_mocks_load_through_the_real_module_pathway() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/__mocks__/GhostMod.js", "export v = 7\n");
    resolver.register_manual_mock("GhostMod", "/t/__mocks__/GhostMod.js");
    let mut runtime = runtime_without_automock(resolver);

    let exports = runtime.require_module("/t/x.js", Some("GhostMod")).unwrap();
    let handle = exports.as_object().unwrap();
    assert_eq!(runtime.environment().heap().property(handle, "v"), Value::Int(7));
}

#[test]
fn force_real_disables_the_ghost_pathway() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/__mocks__/GhostMod.js", "export v = 7\n");
    resolver.register_manual_mock("GhostMod", "/t/__mocks__/GhostMod.js");
    let mut runtime = runtime_without_automock(resolver);

    runtime.facade_for("/t/x.js").unmock("GhostMod").unwrap();
    let err = runtime
        .require_module("/t/x.js", Some("GhostMod"))
        .unwrap_err();
    assert_eq!(err.code, RuntimeErrorCode::Resolution);
}

#[test]
fn executed_modules_carry_the_sentinel_parent() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/b.js", "export n = 1\n");
    let mut runtime = runtime_without_automock(resolver);

    runtime.require("/t/x.js", "./b").unwrap();
    let record = runtime.module_registry().get("/t/b.js").unwrap();
    assert_eq!(record.parent.filename, SENTINEL_PARENT_FILENAME);
    assert_eq!(record.parent.id, SENTINEL_PARENT_ID);
    assert!(record.require.cache.is_empty());
    assert!(record.require.extensions.is_empty());
    assert!(!record.paths.is_empty());

    // The sentinel's exports bag resists user mutation.
    let sentinel = runtime.sentinel_parent();
    runtime
        .environment_mut()
        .heap_mut()
        .set_property(sentinel.exports, "poke", Value::Int(1));
    assert_eq!(
        runtime
            .environment()
            .heap()
            .property(sentinel.exports, "poke"),
        Value::Undefined
    );
}
