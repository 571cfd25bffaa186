//! Mock delivery end to end: automock synthesis, manual-mock sidecars,
//! virtual mocks, and policy pinning.

use frankenengine_test_runtime::{
    DeterministicFileResolver, MockFactory, MockOptions, Runtime, RuntimeConfig, Value,
};

#[test]
fn automocked_modules_replace_functions_with_recording_noops() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/u.js", "export k = fn 7\nexport n = 3\n");
    let mut runtime = Runtime::with_resolver(RuntimeConfig::default(), resolver).unwrap();

    assert!(runtime.should_mock("/t/x.js", "./u").unwrap());
    let mock = runtime.require("/t/x.js", "./u").unwrap();
    let handle = mock.as_object().unwrap();

    let k = runtime.environment().heap().property(handle, "k");
    assert!(runtime.is_mock_function(&k));
    // The stand-in forgets the real implementation.
    assert_eq!(
        runtime.call_function(k.clone(), vec![Value::Int(5)]).unwrap(),
        Value::Undefined
    );
    let state = runtime
        .environment()
        .heap()
        .mock_state(k.as_object().unwrap())
        .unwrap();
    assert_eq!(state.calls, vec![vec![Value::Int(5)]]);

    // Non-function exports survive structurally.
    assert_eq!(runtime.environment().heap().property(handle, "n"), Value::Int(3));
}

#[test]
fn automock_generation_never_pollutes_the_callers_registries() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/u.js", "export k = fn 7\nimport \"./dep\"\n");
    resolver.register_file("/t/dep.js", "export d = 1\n");
    let mut runtime = Runtime::with_resolver(RuntimeConfig::default(), resolver).unwrap();

    let generated = runtime.generate_mock("/t/x.js", "./u").unwrap();
    assert!(generated.as_object().is_some());

    // Executing the real module (and its dependency) during generation
    // left no trace in the live registries.
    assert!(runtime.module_registry().is_empty());
    assert!(runtime.mock_registry().is_empty());
}

#[test]
fn gen_mock_from_module_is_uncached_automock() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/u.js", "export k = fn 7\n");
    let mut runtime = Runtime::with_resolver(RuntimeConfig::default(), resolver).unwrap();

    let mut facade = runtime.facade_for("/t/x.js");
    let first = facade.gen_mock_from_module("./u").unwrap();
    let second = facade.gen_mock_from_module("./u").unwrap();
    // Fresh value each call, nothing in the mock registry.
    assert_ne!(first.as_object(), second.as_object());
    assert!(facade.runtime().mock_registry().is_empty());

    // The delivered mock (via require) is cached per identifier.
    let delivered = facade.runtime().require("/t/x.js", "./u").unwrap();
    let again = facade.runtime().require("/t/x.js", "./u").unwrap();
    assert_eq!(delivered, again);
}

#[test]
fn manual_mock_sidecars_are_per_directory() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/sub/M.js", "export n = 1\n");
    resolver.register_file("/t/sub/__mocks__/M.js", "export n = 91\n");
    resolver.register_file("/t/other/M.js", "export n = 2\n");
    resolver.register_file("/t/other/__mocks__/M.js", "export n = 92\n");
    let mut runtime = Runtime::with_resolver(
        RuntimeConfig {
            automock: false,
            ..RuntimeConfig::default()
        },
        resolver,
    )
    .unwrap();

    runtime.facade_for("/t/sub/x.js").mock("./M").unwrap();
    runtime.facade_for("/t/other/x.js").mock("./M").unwrap();

    let sub = runtime.require("/t/sub/x.js", "./M").unwrap();
    let handle = sub.as_object().unwrap();
    assert_eq!(runtime.environment().heap().property(handle, "n"), Value::Int(91));

    let other = runtime.require("/t/other/x.js", "./M").unwrap();
    let handle = other.as_object().unwrap();
    assert_eq!(runtime.environment().heap().property(handle, "n"), Value::Int(92));
}

#[test]
fn virtual_mocks_never_touch_the_filesystem() {
    let resolver = DeterministicFileResolver::new();
    let mut runtime = Runtime::with_resolver(RuntimeConfig::default(), resolver).unwrap();

    let ghost = {
        let heap = runtime.environment_mut().heap_mut();
        let handle = heap.alloc_object();
        heap.set_property(handle, "v", Value::Int(42));
        Value::Object(handle)
    };

    runtime
        .facade_for("/t/x.js")
        .mock_with(
            "nope",
            Some(MockFactory::Fixed(ghost.clone())),
            MockOptions { virtual_mock: true },
        )
        .unwrap();

    assert!(runtime.should_mock("/t/x.js", "nope").unwrap());
    let delivered = runtime.require("/t/x.js", "nope").unwrap();
    assert_eq!(delivered, ghost);
    let handle = delivered.as_object().unwrap();
    assert_eq!(runtime.environment().heap().property(handle, "v"), Value::Int(42));
}

#[test]
fn mock_then_unmock_is_real_and_unmock_then_mock_is_mocked() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/m.js", "export n = 1\n");
    let mut runtime = Runtime::with_resolver(RuntimeConfig::default(), resolver).unwrap();

    let mut facade = runtime.facade_for("/t/x.js");
    facade.mock("./m").unwrap().unmock("./m").unwrap();
    assert!(!facade.runtime().should_mock("/t/x.js", "./m").unwrap());

    facade.unmock("./m").unwrap().mock("./m").unwrap();
    assert!(facade.runtime().should_mock("/t/x.js", "./m").unwrap());
}

#[test]
fn module_bodies_can_pin_mocks_for_their_own_requires() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/sub/entry.js", "mock \"./M\"\nexport m = require \"./M\" . n\n");
    resolver.register_file("/t/sub/M.js", "export n = 1\n");
    resolver.register_file("/t/sub/__mocks__/M.js", "export n = 91\n");
    let mut runtime = Runtime::with_resolver(
        RuntimeConfig {
            automock: false,
            ..RuntimeConfig::default()
        },
        resolver,
    )
    .unwrap();

    let exports = runtime.require_module("/t/sub/entry.js", None).unwrap();
    let handle = exports.as_object().unwrap();
    assert_eq!(runtime.environment().heap().property(handle, "m"), Value::Int(91));
}

#[test]
fn unmock_list_patterns_deliver_real_modules_under_automock() {
    let mut resolver = DeterministicFileResolver::new();
    resolver.register_file("/t/vendor/lib.js", "export n = 1\n");
    resolver.register_file("/t/app.js", "export n = 2\n");
    let mut runtime = Runtime::with_resolver(
        RuntimeConfig {
            unmocked_module_path_patterns: vec!["/vendor/".to_string()],
            ..RuntimeConfig::default()
        },
        resolver,
    )
    .unwrap();

    assert!(!runtime.should_mock("/t/x.js", "./vendor/lib").unwrap());
    assert!(runtime.should_mock("/t/x.js", "./app").unwrap());
}
