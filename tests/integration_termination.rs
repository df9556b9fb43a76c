//! Destroying the master while requests are in flight must release
//! every blocked caller with the terminated-channel error in bounded
//! time; there is no other cancellation mechanism.

use std::time::{Duration, Instant};
use twinterp::value::{CallArgs, Value};
use twinterp::{fixtures, tracker, KernelFlavour, TwinDef, TwinError, TwinMaster};

const TWIN: &str = "pypy-term";

#[test]
fn destroy_releases_blocked_callers() {
    twinterp::logging::init();
    fixtures::register(TWIN).expect("fixture registration");
    let def = TwinDef::with_executable(env!("CARGO_BIN_EXE_twinterp"), TWIN, KernelFlavour::Async)
        .expect("twin definition");
    let master = TwinMaster::create(def).expect("twin master");
    master.start().expect("twin start");

    let sleep_ms = tracker::lookup_function(fixtures::MODULE, "sleep_ms").unwrap();
    // Prove the twin serves before pulling the rug.
    assert_eq!(
        sleep_ms
            .invoke(&CallArgs::positional(vec![Value::Int(1)]))
            .unwrap(),
        Value::Null
    );

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let sleep_ms = sleep_ms.clone();
            std::thread::spawn(move || {
                sleep_ms.invoke(&CallArgs::positional(vec![Value::Int(30_000)]))
            })
        })
        .collect();
    // Let every worker get its request onto the wire.
    std::thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    master.destroy().expect("destroy");

    for worker in workers {
        match worker.join().unwrap() {
            Err(TwinError::TwinTerminated { twin_id }) => assert_eq!(twin_id, TWIN),
            Err(TwinError::ChannelTerminated) => {}
            other => panic!("expected terminated-channel failure, got {other:?}"),
        }
    }
    // Bounded: callers must not wait out their 30 s payloads.
    assert!(started.elapsed() < Duration::from_secs(10));

    // The dispatcher is gone; new requests refuse immediately.
    match sleep_ms.invoke(&CallArgs::positional(vec![Value::Int(1)])) {
        Err(TwinError::TwinUnavailable { .. }) | Err(TwinError::TwinTerminated { .. }) => {}
        other => panic!("expected unavailable twin, got {other:?}"),
    }
}
