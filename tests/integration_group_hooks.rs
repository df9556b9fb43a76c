//! Group initializers run inside a twin before its kernels start;
//! finalizers run through the freshly booted kernel right after. Both
//! are observable through the counter tally that lives in the twin.

use twinterp::value::{CallArgs, Value};
use twinterp::{fixtures, group_state, tracker, KernelFlavour, TwinDef, TwinMaster};

const TWIN: &str = "pypy-hooks";

#[test]
fn initializers_and_finalizers_run_around_kernel_boot() {
    twinterp::logging::init();
    fixtures::register(TWIN).expect("fixture registration");

    let prime = tracker::lookup_function(fixtures::MODULE, "prime_tally").unwrap();
    let bump = tracker::lookup_function(fixtures::MODULE, "bump_tally").unwrap();
    group_state::add_initializer(&prime, false).unwrap();
    group_state::add_finalizer(&bump, false).unwrap();

    let def = TwinDef::with_executable(env!("CARGO_BIN_EXE_twinterp"), TWIN, KernelFlavour::Async)
        .expect("twin definition");
    let master = TwinMaster::create(def).expect("twin master");
    master.start().expect("twin start");

    // The initializer reset the tally to 42 before the kernels came up;
    // the finalizer bumped it through the kernel right after.
    let counter = tracker::lookup_class(fixtures::MODULE, "Counter").unwrap();
    assert_eq!(
        counter.get_class_attribute("tally").unwrap(),
        Value::Int(43)
    );

    // The twin still serves ordinary traffic afterwards.
    let add = tracker::lookup_function(fixtures::MODULE, "add").unwrap();
    assert_eq!(
        add.invoke(&CallArgs::positional(vec![Value::Int(20), Value::Int(23)]))
            .unwrap(),
        Value::Int(43)
    );

    master.destroy().expect("destroy");
}
