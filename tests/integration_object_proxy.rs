//! End-to-end proxy behavior against a real spawned twinterpreter.
//!
//! One twin ("pypy", async kernel) is shared by every test in this
//! file; the declarations live in `twinterp::fixtures` and are
//! registered identically here and inside the spawned binary.

use lazy_static::lazy_static;
use std::sync::Arc;
use twinterp::value::{CallArgs, Value};
use twinterp::{fixtures, state, tracker, KernelFlavour, TwinDef, TwinError, TwinHandle, TwinMaster};

const TWIN: &str = "pypy";

lazy_static! {
    static ref MASTER: Arc<TwinMaster> = {
        twinterp::logging::init();
        fixtures::register(TWIN).expect("fixture registration");
        let def = TwinDef::with_executable(env!("CARGO_BIN_EXE_twinterp"), TWIN, KernelFlavour::Async)
            .expect("twin definition");
        let master = TwinMaster::create(def).expect("twin master");
        master.start().expect("twin start");
        master
    };
}

fn counter_class() -> Arc<twinterp::ClassSpec> {
    lazy_static::initialize(&MASTER);
    tracker::lookup_class(fixtures::MODULE, "Counter").unwrap()
}

#[test]
fn foreign_construction_yields_a_proxy() {
    lazy_static::initialize(&MASTER);
    let class = counter_class();
    let handle = class.instantiate(&CallArgs::none()).unwrap();
    assert!(handle.is_proxy());
    assert_eq!(handle.twin_id(), TWIN);
    // Proxy and real share one descriptor; metadata is identical.
    assert_eq!(handle.class().name, "Counter");
    assert_eq!(handle.class().doc.as_deref(), Some("counter with post-increment"));
}

#[test]
fn counter_increments_in_owning_twin() {
    lazy_static::initialize(&MASTER);
    let class = counter_class();
    let counter = class.instantiate(&CallArgs::none()).unwrap();
    for expected in 0..5 {
        let result = counter.call("inc", &CallArgs::none()).unwrap();
        assert_eq!(result, Value::Int(expected));
    }
    // Side effects are visible through subsequent attribute reads.
    assert_eq!(counter.get("v").unwrap(), Value::Int(5));
}

#[test]
fn functions_execute_remotely_only() {
    lazy_static::initialize(&MASTER);
    let add = tracker::lookup_function(fixtures::MODULE, "add").unwrap();
    let result = add
        .invoke(&CallArgs::positional(vec![Value::Int(2), Value::Int(3)]))
        .unwrap();
    assert_eq!(result, Value::Int(5));

    let executing_twin = tracker::lookup_function(fixtures::MODULE, "executing_twin").unwrap();
    let twin = executing_twin.invoke(&CallArgs::none()).unwrap();
    assert_eq!(twin, Value::Str(TWIN.into()));
    assert_ne!(twin, Value::Str(state::twin_id().into()));
}

#[test]
fn attribute_round_trip_survives_the_codec() {
    lazy_static::initialize(&MASTER);
    let board = tracker::lookup_class(fixtures::MODULE, "Blackboard")
        .unwrap()
        .instantiate(&CallArgs::none())
        .unwrap();

    let mut map = std::collections::BTreeMap::new();
    map.insert("nested".to_string(), Value::List(vec![Value::Int(1), Value::Bool(false)]));
    let samples = [
        ("num", Value::Int(-17)),
        ("text", Value::Str("twin".into())),
        ("blob", Value::Bytes(vec![0, 255, 3])),
        ("pi", Value::Float(3.25)),
        ("tree", Value::Map(map)),
    ];
    for (key, value) in samples {
        board.set(key, value.clone()).unwrap();
        assert_eq!(board.get(key).unwrap(), value);
    }

    board.del("num").unwrap();
    match board.get("num") {
        Err(TwinError::Remote(err)) => assert_eq!(err.exc_type, "AttributeError"),
        other => panic!("expected remote attribute error, got {other:?}"),
    }
}

#[test]
fn static_class_state_is_shared_across_twins() {
    lazy_static::initialize(&MASTER);
    let class = counter_class();
    let tally = class.get_class_attribute("tally").unwrap().as_int().unwrap();
    class
        .set_class_attribute("tally", Value::Int(tally + 10))
        .unwrap();
    assert_eq!(
        class.get_class_attribute("tally").unwrap(),
        Value::Int(tally + 10)
    );
}

#[test]
fn class_methods_dispatch_to_the_owning_twin() {
    lazy_static::initialize(&MASTER);
    let class = counter_class();
    assert_eq!(
        class
            .call_class_method("describe", &CallArgs::none())
            .unwrap(),
        Value::Str(format!("fixtures::Counter @ {TWIN}"))
    );
}

#[test]
fn local_methods_run_in_the_calling_process() {
    lazy_static::initialize(&MASTER);
    let scoped = tracker::lookup_class(fixtures::MODULE, "Scoped")
        .unwrap()
        .instantiate(&CallArgs::none())
        .unwrap();
    assert!(scoped.is_proxy());
    // Local-marked method answers with this process.
    assert_eq!(
        scoped.call("here", &CallArgs::none()).unwrap(),
        Value::Str(state::twin_id().into())
    );
    // Regular method answers with the owning twin.
    assert_eq!(
        scoped.call("there", &CallArgs::none()).unwrap(),
        Value::Str(TWIN.into())
    );
}

#[test]
fn payload_exceptions_reraise_with_type_and_message() {
    lazy_static::initialize(&MASTER);
    let boom = tracker::lookup_function(fixtures::MODULE, "boom").unwrap();
    match boom.invoke(&CallArgs::none()) {
        Err(TwinError::Remote(err)) => {
            assert_eq!(err.exc_type, "ValueError");
            assert_eq!(err.message, "boom");
        }
        other => panic!("expected remote ValueError, got {other:?}"),
    }
}

#[test]
fn rehydration_returns_the_same_physical_proxy() {
    lazy_static::initialize(&MASTER);
    let pod = tracker::lookup_class(fixtures::MODULE, "Pod")
        .unwrap()
        .instantiate(&CallArgs::positional(vec![Value::Int(7)]))
        .unwrap();
    let echo = tracker::lookup_function(fixtures::MODULE, "echo").unwrap();

    let returned = echo
        .invoke(&CallArgs::positional(vec![Value::Object(pod.clone())]))
        .unwrap();
    let returned = match returned {
        Value::Object(handle) => handle,
        other => panic!("expected an object back, got {other:?}"),
    };
    match (&pod, &returned) {
        (TwinHandle::Proxy(original), TwinHandle::Proxy(rehydrated)) => {
            assert!(Arc::ptr_eq(original, rehydrated));
        }
        other => panic!("expected two proxies, got {other:?}"),
    }
    assert_eq!(returned.get("x").unwrap(), Value::Int(7));
}

#[test]
fn unknown_methods_surface_as_attribute_errors() {
    lazy_static::initialize(&MASTER);
    let counter = counter_class().instantiate(&CallArgs::none()).unwrap();
    match counter.call("frobnicate", &CallArgs::none()) {
        Err(TwinError::Remote(err)) => assert_eq!(err.exc_type, "AttributeError"),
        other => panic!("expected attribute error, got {other:?}"),
    }
}
