//! The single-threaded kernel flavour: strictly paired send/receive,
//! one request at a time. No cross-process recursion, but the full
//! directive vocabulary must work.

use lazy_static::lazy_static;
use std::sync::Arc;
use twinterp::value::{CallArgs, Value};
use twinterp::{fixtures, tracker, KernelFlavour, TwinDef, TwinMaster};

const TWIN: &str = "pypy-single";

lazy_static! {
    static ref MASTER: Arc<TwinMaster> = {
        twinterp::logging::init();
        fixtures::register(TWIN).expect("fixture registration");
        let def = TwinDef::with_executable(env!("CARGO_BIN_EXE_twinterp"), TWIN, KernelFlavour::Single)
            .expect("twin definition");
        let master = TwinMaster::create(def).expect("twin master");
        master.start().expect("twin start");
        master
    };
}

#[test]
fn full_directive_vocabulary_over_a_single_kernel() {
    lazy_static::initialize(&MASTER);

    // call_func
    let add = tracker::lookup_function(fixtures::MODULE, "add").unwrap();
    assert_eq!(
        add.invoke(&CallArgs::positional(vec![Value::Int(4), Value::Int(4)]))
            .unwrap(),
        Value::Int(8)
    );

    // instantiate + call_method + get/set/del attribute
    let board = tracker::lookup_class(fixtures::MODULE, "Blackboard")
        .unwrap()
        .instantiate(&CallArgs::none())
        .unwrap();
    board.set("slot", Value::Str("filled".into())).unwrap();
    assert_eq!(board.get("slot").unwrap(), Value::Str("filled".into()));
    assert_eq!(board.call("len", &CallArgs::none()).unwrap(), Value::Int(1));
    board.del("slot").unwrap();
    assert_eq!(board.call("len", &CallArgs::none()).unwrap(), Value::Int(0));
}

#[test]
fn sequential_requests_from_many_threads() {
    lazy_static::initialize(&MASTER);
    let add = tracker::lookup_function(fixtures::MODULE, "add").unwrap();
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let add = add.clone();
            std::thread::spawn(move || {
                add.invoke(&CallArgs::positional(vec![Value::Int(i), Value::Int(1)]))
                    .unwrap()
            })
        })
        .collect();
    for (i, worker) in workers.into_iter().enumerate() {
        assert_eq!(worker.join().unwrap(), Value::Int(i as i64 + 1));
    }
}
