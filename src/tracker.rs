//! # Instance, Class, and Function Registries
//!
//! Three process-local registries back the identity machinery:
//!
//! - **Active instances**: a weak map `(twin_id, instance_id) → object`
//!   holding every twin-aware real instance and proxy currently alive in
//!   this process. The codec consults it to rehydrate incoming references
//!   to the already-known live object, which is what guarantees at most
//!   one live proxy per remote instance per process.
//! - **Classes**: `(module, class_name) → ClassSpec`, used to materialize
//!   proxies for references whose instance is not yet known here.
//! - **Functions**: `(module, name) → FunctionSpec`, resolving function
//!   references for cross-process calls.
//!
//! The instance map stores weak handles only; it is never a reason an
//! object stays alive. Dead entries are dropped lazily on lookup and
//! swept when the map grows past a watermark.

use crate::error::{Result, TwinError};
use crate::proxy::class::ClassSpec;
use crate::proxy::func::FunctionSpec;
use crate::proxy::handle::{ProxyShell, TwinHandle};
use crate::proxy::object::InstanceCell;
use crate::state::TwinId;
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Opaque identifier of one real object within its owning process.
pub type InstanceId = String;

/// Weak entry in the active-instance registry.
enum LiveHandle {
    Real(Weak<InstanceCell>),
    Proxy(Weak<ProxyShell>),
}

impl LiveHandle {
    fn upgrade(&self) -> Option<TwinHandle> {
        match self {
            LiveHandle::Real(weak) => weak.upgrade().map(TwinHandle::Real),
            LiveHandle::Proxy(weak) => weak.upgrade().map(TwinHandle::Proxy),
        }
    }

    fn is_dead(&self) -> bool {
        match self {
            LiveHandle::Real(weak) => weak.strong_count() == 0,
            LiveHandle::Proxy(weak) => weak.strong_count() == 0,
        }
    }
}

const SWEEP_WATERMARK: usize = 512;

lazy_static! {
    static ref ACTIVE_INSTANCES: Mutex<HashMap<(TwinId, InstanceId), LiveHandle>> =
        Mutex::new(HashMap::new());
    static ref CLASS_REGISTRY: RwLock<HashMap<(String, String), Arc<ClassSpec>>> =
        RwLock::new(HashMap::new());
    static ref FUNCTION_REGISTRY: RwLock<HashMap<(String, String), Arc<FunctionSpec>>> =
        RwLock::new(HashMap::new());
}

fn sweep_if_crowded(map: &mut HashMap<(TwinId, InstanceId), LiveHandle>) {
    if map.len() > SWEEP_WATERMARK {
        map.retain(|_, handle| !handle.is_dead());
    }
}

/// Record a real instance living in this process.
pub fn register_real(cell: &Arc<InstanceCell>) {
    let mut map = ACTIVE_INSTANCES.lock();
    sweep_if_crowded(&mut map);
    map.insert(
        (cell.twin_id().to_string(), cell.instance_id.clone()),
        LiveHandle::Real(Arc::downgrade(cell)),
    );
    trace!(instance = %cell.instance_id, "registered real instance");
}

/// Look up a live instance or proxy by wire identity. Dead entries are
/// removed on the way.
pub fn lookup_instance(twin_id: &str, instance_id: &str) -> Option<TwinHandle> {
    let mut map = ACTIVE_INSTANCES.lock();
    let key = (twin_id.to_string(), instance_id.to_string());
    match map.get(&key) {
        Some(handle) => match handle.upgrade() {
            Some(live) => Some(live),
            None => {
                map.remove(&key);
                None
            }
        },
        None => None,
    }
}

/// Fetch the live proxy for `(twin_id, instance_id)` or register the one
/// produced by `make`. Returns the handle and whether it was created by
/// this call; the caller owes the owning twin a reference increment
/// exactly when it was.
pub fn proxy_or_register(
    twin_id: &str,
    instance_id: &str,
    make: impl FnOnce() -> Arc<ProxyShell>,
) -> (TwinHandle, bool) {
    let mut map = ACTIVE_INSTANCES.lock();
    let key = (twin_id.to_string(), instance_id.to_string());
    if let Some(live) = map.get(&key).and_then(LiveHandle::upgrade) {
        return (live, false);
    }
    sweep_if_crowded(&mut map);
    let shell = make();
    map.insert(key, LiveHandle::Proxy(Arc::downgrade(&shell)));
    (TwinHandle::Proxy(shell), true)
}

/// Forget a registry entry; used when a freshly created proxy could not
/// complete its reference increment.
pub fn forget_instance(twin_id: &str, instance_id: &str) {
    ACTIVE_INSTANCES
        .lock()
        .remove(&(twin_id.to_string(), instance_id.to_string()));
}

/// Number of live tracked instances; diagnostic only.
pub fn live_instances() -> usize {
    ACTIVE_INSTANCES
        .lock()
        .values()
        .filter(|h| !h.is_dead())
        .count()
}

/// Register a twin-aware class under `(module, class_name)`.
///
/// Re-registering the same declaration is a no-op so shared registration
/// code may run in every process of the group; conflicting declarations
/// are an error.
pub fn register_class(spec: Arc<ClassSpec>) -> Result<Arc<ClassSpec>> {
    let key = (spec.module.clone(), spec.name.clone());
    let mut registry = CLASS_REGISTRY.write();
    if let Some(existing) = registry.get(&key) {
        if existing.twin_id == spec.twin_id {
            return Ok(existing.clone());
        }
        return Err(TwinError::Process(format!(
            "class {}::{} already registered for twin '{}'",
            spec.module, spec.name, existing.twin_id
        )));
    }
    registry.insert(key, spec.clone());
    trace!(module = %spec.module, class = %spec.name, owner = %spec.twin_id, "registered class");
    Ok(spec)
}

/// Resolve a registered class.
pub fn lookup_class(module: &str, name: &str) -> Option<Arc<ClassSpec>> {
    CLASS_REGISTRY
        .read()
        .get(&(module.to_string(), name.to_string()))
        .cloned()
}

/// Register a twin-aware function under `(module, name)`.
pub fn register_function(spec: Arc<FunctionSpec>) -> Result<Arc<FunctionSpec>> {
    let key = (spec.module.clone(), spec.name.clone());
    let mut registry = FUNCTION_REGISTRY.write();
    if let Some(existing) = registry.get(&key) {
        if existing.twin_id == spec.twin_id {
            return Ok(existing.clone());
        }
        return Err(TwinError::Process(format!(
            "function {}::{} already registered for twin '{}'",
            spec.module, spec.name, existing.twin_id
        )));
    }
    registry.insert(key, spec.clone());
    trace!(module = %spec.module, function = %spec.name, owner = %spec.twin_id, "registered function");
    Ok(spec)
}

/// Resolve a registered function.
pub fn lookup_function(module: &str, name: &str) -> Option<Arc<FunctionSpec>> {
    FUNCTION_REGISTRY
        .read()
        .get(&(module.to_string(), name.to_string()))
        .cloned()
}
