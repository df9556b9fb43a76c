//! Cross-process recursion with the pooled kernel flavour: the bounded
//! worker pool must keep absorbing re-entrant requests while earlier
//! workers are blocked on the rally.

use lazy_static::lazy_static;
use std::sync::Arc;
use twinterp::value::{CallArgs, Value};
use twinterp::{fixtures, tracker, KernelFlavour, TwinDef, TwinHandle, TwinMaster};

const TWIN: &str = "pypy-pool";

lazy_static! {
    static ref MASTER: Arc<TwinMaster> = {
        twinterp::logging::init();
        fixtures::register(TWIN).expect("fixture registration");
        let def = TwinDef::with_executable(env!("CARGO_BIN_EXE_twinterp"), TWIN, KernelFlavour::Multi)
            .expect("twin definition");
        let master = TwinMaster::create(def).expect("twin master");
        master.start().expect("twin start");
        master
    };
}

#[test]
fn pooled_kernels_sustain_deep_rallies() {
    lazy_static::initialize(&MASTER);
    let near = tracker::lookup_class(fixtures::MODULE, "BouncerA")
        .unwrap()
        .instantiate(&CallArgs::positional(vec![Value::Str("A".into())]))
        .unwrap();
    let far = tracker::lookup_class(fixtures::MODULE, "BouncerB")
        .unwrap()
        .instantiate(&CallArgs::positional(vec![Value::Str("B".into())]))
        .unwrap();

    let rally = |bounces: i64| -> Value {
        far.call(
            "play",
            &CallArgs::positional(vec![Value::Object(near.clone()), Value::Int(bounces)]),
        )
        .unwrap()
    };

    assert_eq!(rally(0), Value::Str("B".into()));
    assert_eq!(rally(21), Value::Str("A".into()));
    assert_eq!(rally(24), Value::Str("B".into()));
}

#[test]
fn pooled_kernels_serve_plain_calls() {
    lazy_static::initialize(&MASTER);
    let add = tracker::lookup_function(fixtures::MODULE, "add").unwrap();
    for i in 0..8 {
        let result = add
            .invoke(&CallArgs::positional(vec![Value::Int(i), Value::Int(i)]))
            .unwrap();
        assert_eq!(result, Value::Int(2 * i));
    }
}
