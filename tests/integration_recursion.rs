//! Cross-process recursion with the async kernel: a rally between a
//! master-owned player and a twin-owned player, re-entering both
//! processes on every bounce.

use lazy_static::lazy_static;
use std::sync::Arc;
use twinterp::value::{CallArgs, Value};
use twinterp::{fixtures, tracker, KernelFlavour, TwinDef, TwinHandle, TwinMaster};

const TWIN: &str = "pypy-rec";

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

fn players() -> (TwinHandle, TwinHandle) {
    lazy_static::initialize(&MASTER);
    let near = tracker::lookup_class(fixtures::MODULE, "BouncerA")
        .unwrap()
        .instantiate(&CallArgs::positional(vec![Value::Str("A".into())]))
        .unwrap();
    let far = tracker::lookup_class(fixtures::MODULE, "BouncerB")
        .unwrap()
        .instantiate(&CallArgs::positional(vec![Value::Str("B".into())]))
        .unwrap();
    assert!(!near.is_proxy());
    assert!(far.is_proxy());
    (near, far)
}

fn play(server: &TwinHandle, opponent: &TwinHandle, bounces: i64) -> Value {
    server
        .call(
            "play",
            &CallArgs::positional(vec![Value::Object(opponent.clone()), Value::Int(bounces)]),
        )
        .unwrap()
}

#[test]
fn no_bounce_stays_with_the_server() {
    let (near, far) = players();
    assert_eq!(play(&far, &near, 0), Value::Str("B".into()));
    assert_eq!(play(&near, &far, 0), Value::Str("A".into()));
}

#[test]
fn single_bounce_crosses_once() {
    let (near, far) = players();
    assert_eq!(play(&far, &near, 1), Value::Str("A".into()));
    assert_eq!(play(&near, &far, 1), Value::Str("B".into()));
}

#[test]
fn three_bounces_invert_parity() {
    let (near, far) = players();
    assert_eq!(play(&far, &near, 3), Value::Str("A".into()));
}

#[test]
fn deep_rallies_terminate() {
    let (near, far) = players();
    // Parity decides who holds the ball last; depth comfortably past
    // twenty re-entries per process.
    for bounces in (0..=24).step_by(4) {
        assert_eq!(play(&far, &near, bounces), Value::Str("B".into()));
    }
    for bounces in (1..=25).step_by(4) {
        assert_eq!(play(&far, &near, bounces), Value::Str("A".into()));
    }
}
