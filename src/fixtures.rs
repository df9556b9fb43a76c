//! # Sample Twin Declarations
//!
//! A small set of twin classes and functions exercising every directive:
//! counters, attribute boards, ping-pong bouncers, and scope reporters.
//! The bootstrap binary registers them so a spawned `twinterp` twin can
//! serve them, and the integration tests register the same declarations
//! on the master side. Registration is shared code in the cpy2py sense:
//! it must run identically in every process of the group.

use crate::error::{RemoteError, Result, TwinError};
use crate::proxy::class::ClassBuilder;
use crate::proxy::func::FunctionBuilder;
use crate::proxy::handle::TwinHandle;
use crate::proxy::object::TwinObject;
use crate::state;
use crate::value::{CallArgs, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Module name the fixtures are registered under.
pub const MODULE: &str = "fixtures";

/// Live `Pod` instances in this process; lets tests observe that
/// releasing the last remote reference makes the instance collectable.
static LIVE_PODS: AtomicI64 = AtomicI64::new(0);

/// Counter with a post-increment method.
struct Counter {
    v: Mutex<i64>,
}

impl TwinObject for Counter {
    fn call(
        &self,
        _this: &TwinHandle,
        method: &str,
        _args: &CallArgs,
    ) -> std::result::Result<Value, RemoteError> {
        match method {
            "inc" => {
                let mut v = self.v.lock();
                let previous = *v;
                *v += 1;
                Ok(Value::Int(previous))
            }
            other => Err(RemoteError::no_method("Counter", other)),
        }
    }

    fn get_attribute(&self, name: &str) -> std::result::Result<Value, RemoteError> {
        match name {
            "v" => Ok(Value::Int(*self.v.lock())),
            other => Err(RemoteError::attribute("Counter", other)),
        }
    }

    fn set_attribute(&self, name: &str, value: Value) -> std::result::Result<(), RemoteError> {
        match name {
            "v" => {
                *self.v.lock() = value.as_int()?;
                Ok(())
            }
            other => Err(RemoteError::attribute("Counter", other)),
        }
    }
}

/// Single-slot container whose drop is observable through `live_pods`.
struct Pod {
    x: Mutex<Value>,
}

impl Pod {
    fn new(x: Value) -> Self {
        LIVE_PODS.fetch_add(1, Ordering::SeqCst);
        Self { x: Mutex::new(x) }
    }
}

impl Drop for Pod {
    fn drop(&mut self) {
        LIVE_PODS.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TwinObject for Pod {
    fn call(
        &self,
        _this: &TwinHandle,
        method: &str,
        _args: &CallArgs,
    ) -> std::result::Result<Value, RemoteError> {
        Err(RemoteError::no_method("Pod", method))
    }

    fn get_attribute(&self, name: &str) -> std::result::Result<Value, RemoteError> {
        match name {
            "x" => Ok(self.x.lock().clone()),
            other => Err(RemoteError::attribute("Pod", other)),
        }
    }

    fn set_attribute(&self, name: &str, value: Value) -> std::result::Result<(), RemoteError> {
        match name {
            "x" => {
                *self.x.lock() = value;
                Ok(())
            }
            other => Err(RemoteError::attribute("Pod", other)),
        }
    }
}

/// Free-form attribute store; the only fixture supporting deletion.
#[derive(Default)]
pub struct Blackboard {
    slots: Mutex<HashMap<String, Value>>,
}

impl TwinObject for Blackboard {
    fn call(
        &self,
        _this: &TwinHandle,
        method: &str,
        _args: &CallArgs,
    ) -> std::result::Result<Value, RemoteError> {
        match method {
            "len" => Ok(Value::Int(self.slots.lock().len() as i64)),
            other => Err(RemoteError::no_method("Blackboard", other)),
        }
    }

    fn get_attribute(&self, name: &str) -> std::result::Result<Value, RemoteError> {
        self.slots
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteError::attribute("Blackboard", name))
    }

    fn set_attribute(&self, name: &str, value: Value) -> std::result::Result<(), RemoteError> {
        self.slots.lock().insert(name.to_string(), value);
        Ok(())
    }

    fn del_attribute(&self, name: &str) -> std::result::Result<(), RemoteError> {
        match self.slots.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(RemoteError::attribute("Blackboard", name)),
        }
    }
}

/// Ping-pong player: `play(opponent, n)` hands the ball back `n` times
/// and reports the name of the player holding it last.
struct Bouncer {
    name: String,
}

impl TwinObject for Bouncer {
    fn call(
        &self,
        this: &TwinHandle,
        method: &str,
        args: &CallArgs,
    ) -> std::result::Result<Value, RemoteError> {
        match method {
            "name" => Ok(Value::Str(self.name.clone())),
            "play" => {
                let opponent = args.arg(0, "play")?.as_object()?;
                let n = args.arg_or_kwarg(1, "n", "play")?.as_int()?;
                if n <= 0 {
                    return Ok(Value::Str(self.name.clone()));
                }
                opponent
                    .call(
                        "play",
                        &CallArgs::positional(vec![
                            Value::Object(this.clone()),
                            Value::Int(n - 1),
                        ]),
                    )
                    .map_err(flatten_twin_error)
            }
            other => Err(RemoteError::no_method("Bouncer", other)),
        }
    }

    fn get_attribute(&self, name: &str) -> std::result::Result<Value, RemoteError> {
        match name {
            "name" => Ok(Value::Str(self.name.clone())),
            other => Err(RemoteError::attribute("Bouncer", other)),
        }
    }

    fn set_attribute(&self, name: &str, _value: Value) -> std::result::Result<(), RemoteError> {
        Err(RemoteError::attribute("Bouncer", name))
    }
}

/// Reports which twinterpreter actually executes its methods. `here` is
/// marked local and answers with the caller's process; `there` dispatches
/// and answers with the owner's.
struct Scoped;

impl TwinObject for Scoped {
    fn call(
        &self,
        _this: &TwinHandle,
        method: &str,
        _args: &CallArgs,
    ) -> std::result::Result<Value, RemoteError> {
        match method {
            "there" => Ok(Value::Str(state::twin_id().to_string())),
            other => Err(RemoteError::no_method("Scoped", other)),
        }
    }

    fn get_attribute(&self, name: &str) -> std::result::Result<Value, RemoteError> {
        Err(RemoteError::attribute("Scoped", name))
    }

    fn set_attribute(&self, name: &str, _value: Value) -> std::result::Result<(), RemoteError> {
        Err(RemoteError::attribute("Scoped", name))
    }
}

fn flatten_twin_error(err: TwinError) -> RemoteError {
    match err {
        TwinError::Remote(remote) => remote,
        other => RemoteError::new("KernelError", other.to_string()),
    }
}

/// Register all fixtures. `remote` names the twinterpreter owning the
/// remote-side declarations; the master-owned ones resolve to the group
/// master. Idempotent, and shared by every process of the group.
pub fn register(remote: &str) -> Result<()> {
    ClassBuilder::new(MODULE, "Counter")
        .owner(remote)
        .doc("counter with post-increment")
        .constructor(|args| {
            let start = match args.args.first() {
                Some(v) => v.as_int()?,
                None => 0,
            };
            Ok(Box::new(Counter {
                v: Mutex::new(start),
            }) as Box<dyn TwinObject>)
        })
        .static_attr("tally", Value::Int(0))
        .class_method("describe", |cls, _args| {
            Ok(Value::Str(format!("{}::{} @ {}", cls.module, cls.name, state::twin_id())))
        })
        .register()?;

    ClassBuilder::new(MODULE, "Pod")
        .owner(remote)
        .doc("single-slot container")
        .constructor(|args| {
            let x = args.args.first().cloned().unwrap_or(Value::Null);
            Ok(Box::new(Pod::new(x)) as Box<dyn TwinObject>)
        })
        .register()?;

    ClassBuilder::new(MODULE, "Blackboard")
        .owner(remote)
        .doc("free-form attribute store")
        .constructor(|_args| Ok(Box::new(Blackboard::default()) as Box<dyn TwinObject>))
        .register()?;

    // Two bouncer declarations so each side of a rally owns one player.
    ClassBuilder::new(MODULE, "BouncerA")
        .owner(state::master_id())
        .constructor(|args| {
            let name = args.arg(0, "BouncerA")?.as_str()?.to_string();
            Ok(Box::new(Bouncer { name }) as Box<dyn TwinObject>)
        })
        .register()?;
    ClassBuilder::new(MODULE, "BouncerB")
        .owner(remote)
        .constructor(|args| {
            let name = args.arg(0, "BouncerB")?.as_str()?.to_string();
            Ok(Box::new(Bouncer { name }) as Box<dyn TwinObject>)
        })
        .register()?;

    ClassBuilder::new(MODULE, "Scoped")
        .owner(remote)
        .doc("reports the executing twinterpreter")
        .constructor(|_args| Ok(Box::new(Scoped) as Box<dyn TwinObject>))
        .local_method("here", |_this, _args| {
            Ok(Value::Str(state::twin_id().to_string()))
        })
        .register()?;

    FunctionBuilder::new(MODULE, "add")
        .owner(remote)
        .doc("sum of two integers")
        .register(|args| {
            let a = args.arg(0, "add")?.as_int()?;
            let b = args.arg(1, "add")?.as_int()?;
            Ok(Value::Int(a + b))
        })?;

    FunctionBuilder::new(MODULE, "echo")
        .owner(remote)
        .register(|args| Ok(args.args.first().cloned().unwrap_or(Value::Null)))?;

    FunctionBuilder::new(MODULE, "boom")
        .owner(remote)
        .register(|_args| {
            Err(RemoteError::new("ValueError", "boom"))
        })?;

    FunctionBuilder::new(MODULE, "sleep_ms")
        .owner(remote)
        .register(|args| {
            let ms = args.arg(0, "sleep_ms")?.as_int()?;
            std::thread::sleep(std::time::Duration::from_millis(ms.max(0) as u64));
            Ok(Value::Null)
        })?;

    FunctionBuilder::new(MODULE, "live_pods")
        .owner(remote)
        .register(|_args| Ok(Value::Int(LIVE_PODS.load(Ordering::SeqCst))))?;

    FunctionBuilder::new(MODULE, "executing_twin")
        .owner(remote)
        .register(|_args| Ok(Value::Str(state::twin_id().to_string())))?;

    // Group-hook fixtures: mutate the Counter tally where it lives.
    FunctionBuilder::new(MODULE, "prime_tally")
        .owner(remote)
        .doc("initializer fixture: reset the counter tally to 42")
        .register(|_args| {
            let class = crate::tracker::lookup_class(MODULE, "Counter")
                .ok_or_else(|| RemoteError::lookup("Counter is not registered"))?;
            class
                .set_class_attribute("tally", Value::Int(42))
                .map_err(flatten_twin_error)?;
            Ok(Value::Null)
        })?;

    FunctionBuilder::new(MODULE, "bump_tally")
        .owner(remote)
        .doc("finalizer fixture: increment the counter tally")
        .register(|_args| {
            let class = crate::tracker::lookup_class(MODULE, "Counter")
                .ok_or_else(|| RemoteError::lookup("Counter is not registered"))?;
            let tally = class
                .get_class_attribute("tally")
                .map_err(flatten_twin_error)?
                .as_int()?;
            class
                .set_class_attribute("tally", Value::Int(tally + 1))
                .map_err(flatten_twin_error)?;
            Ok(Value::Null)
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker;

    #[test]
    fn registration_is_idempotent() {
        register("fixture-twin").unwrap();
        register("fixture-twin").unwrap();
        assert!(tracker::lookup_class(MODULE, "Counter").is_some());
        assert!(tracker::lookup_function(MODULE, "add").is_some());
    }

    #[test]
    fn counter_counts_like_a_post_increment() {
        let counter = Counter { v: Mutex::new(0) };
        let class = {
            register("fixture-twin").unwrap();
            tracker::lookup_class(MODULE, "Counter").unwrap()
        };
        // Direct object behavior, independent of any kernel.
        let cell = crate::proxy::object::InstanceCell::new(class, Box::new(counter));
        let this = TwinHandle::Real(cell);
        for expected in 0..5 {
            assert_eq!(
                this.call("inc", &CallArgs::none()).unwrap(),
                Value::Int(expected)
            );
        }
        assert_eq!(this.get("v").unwrap(), Value::Int(5));
    }

    #[test]
    fn pods_report_their_liveness() {
        let before = LIVE_PODS.load(Ordering::SeqCst);
        let pod = Pod::new(Value::Int(7));
        assert_eq!(LIVE_PODS.load(Ordering::SeqCst), before + 1);
        drop(pod);
        assert_eq!(LIVE_PODS.load(Ordering::SeqCst), before);
    }

    #[test]
    fn blackboard_supports_deletion() {
        let board = Blackboard::default();
        board.set_attribute("k", Value::Int(1)).unwrap();
        assert_eq!(board.get_attribute("k").unwrap(), Value::Int(1));
        board.del_attribute("k").unwrap();
        assert!(board.get_attribute("k").is_err());
        assert!(board.del_attribute("k").is_err());
    }
}
