//! # Group State
//!
//! Group-scoped lists of *initializers* (run in each twin before its
//! kernels start) and *finalizers* (run by the master right after a twin
//! boots). The authoritative lists live in the master process; a
//! registration made from any other twin is forwarded to the master
//! through the kernel, and optionally pushed into already-running peers.
//!
//! Initializers and finalizers are registered twin functions addressed
//! by `(module, name)`; the bootstrap command line carries those names
//! into fresh twins where they are resolved against the local function
//! registry.

use crate::error::{RemoteError, Result, TwinError};
use crate::proxy::func::{FunctionBuilder, FunctionSpec};
use crate::state;
use crate::tracker;
use crate::value::{CallArgs, Value};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Internal module namespace of the forwarding control functions.
const GROUP_MODULE: &str = "twinterp.group";

#[derive(Default)]
struct GroupState {
    initializers: Vec<Arc<FunctionSpec>>,
    finalizers: Vec<Arc<FunctionSpec>>,
}

lazy_static! {
    static ref GROUP_STATE: Mutex<GroupState> = Mutex::new(GroupState::default());
}

#[derive(Clone, Copy, PartialEq)]
enum Hook {
    Initializer,
    Finalizer,
}

/// Register a function to run in every future twin before its kernels
/// start. With `init_existing`, the function is also executed once in
/// each twin that is already running.
pub fn add_initializer(func: &Arc<FunctionSpec>, init_existing: bool) -> Result<()> {
    add_hook(func, Hook::Initializer, init_existing)
}

/// Register a function to run in the master after each twin boots.
/// With `init_existing`, it is also executed once in each twin that is
/// already running.
pub fn add_finalizer(func: &Arc<FunctionSpec>, init_existing: bool) -> Result<()> {
    add_hook(func, Hook::Finalizer, init_existing)
}

fn add_hook(func: &Arc<FunctionSpec>, hook: Hook, init_existing: bool) -> Result<()> {
    if state::is_master() {
        return add_local(func, hook, init_existing, state::twin_id());
    }
    // Forward the registration to the master's authoritative lists.
    let control = tracker::lookup_function(
        GROUP_MODULE,
        match hook {
            Hook::Initializer => "add_initializer",
            Hook::Finalizer => "add_finalizer",
        },
    )
    .ok_or_else(|| TwinError::Process("group control functions not registered".into()))?;
    let dispatcher = state::get_kernel(state::master_id())?;
    dispatcher
        .dispatch_call(
            &control,
            &CallArgs::positional(vec![
                Value::Str(func.module.clone()),
                Value::Str(func.name.clone()),
                Value::Bool(init_existing),
                Value::Str(state::twin_id().to_string()),
            ]),
        )
        .map(|_| ())
}

fn add_local(
    func: &Arc<FunctionSpec>,
    hook: Hook,
    init_existing: bool,
    parent_twin_id: &str,
) -> Result<()> {
    {
        let mut group = GROUP_STATE.lock();
        match hook {
            Hook::Initializer => group.initializers.push(func.clone()),
            Hook::Finalizer => group.finalizers.push(func.clone()),
        }
    }
    if init_existing {
        // The registering twin runs its own hooks explicitly; push the
        // function into every other live peer.
        for twin_id in state::peered_twins() {
            if twin_id == parent_twin_id {
                continue;
            }
            let dispatcher = match state::get_kernel(&twin_id) {
                Ok(dispatcher) => dispatcher,
                Err(_) => continue,
            };
            if let Err(err) = dispatcher.dispatch_call(func, &CallArgs::none()) {
                warn!(twin = %twin_id, hook = %func.name, "running hook in live twin failed: {err}");
            }
        }
    }
    Ok(())
}

/// `(module, name)` pairs of all registered initializers, in order; the
/// master embeds these in the bootstrap command line.
pub fn initializer_refs() -> Vec<(String, String)> {
    GROUP_STATE
        .lock()
        .initializers
        .iter()
        .map(|f| (f.module.clone(), f.name.clone()))
        .collect()
}

/// Run all finalizers in a freshly booted twinterpreter. Called by the
/// master as part of twin startup; not intended for manual use.
pub fn run_finalizers(twin_id: &str) -> Result<()> {
    let finalizers: Vec<_> = GROUP_STATE.lock().finalizers.clone();
    if finalizers.is_empty() {
        return Ok(());
    }
    let dispatcher = state::get_kernel(twin_id)?;
    for finalizer in finalizers {
        debug!(twin = %twin_id, finalizer = %finalizer.name, "running finalizer");
        dispatcher.dispatch_call(&finalizer, &CallArgs::none())?;
    }
    Ok(())
}

/// Register the control functions that let non-master twins forward
/// hook registrations. Runs in every process of the group; idempotent.
pub fn register_builtins() -> Result<()> {
    for (name, hook) in [
        ("add_initializer", Hook::Initializer),
        ("add_finalizer", Hook::Finalizer),
    ] {
        FunctionBuilder::new(GROUP_MODULE, name)
            .owner(state::master_id())
            .doc("forwarded group-hook registration")
            .register(move |args| {
                let module = args.arg(0, name)?.as_str()?.to_string();
                let func_name = args.arg(1, name)?.as_str()?.to_string();
                let init_existing = args.arg(2, name)?.as_bool()?;
                let parent = args.arg(3, name)?.as_str()?.to_string();
                let func = tracker::lookup_function(&module, &func_name).ok_or_else(|| {
                    RemoteError::lookup(format!("function {module}::{func_name} is not registered"))
                })?;
                add_local(&func, hook, init_existing, &parent)
                    .map_err(|err| RemoteError::new("KernelError", err.to_string()))?;
                Ok(Value::Null)
            })?;
    }
    Ok(())
}
