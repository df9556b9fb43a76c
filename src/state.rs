//! # Twinterpreter State
//!
//! Process-wide identity and kernel tables. Every process in a group
//! knows its own `TWIN_ID` and the group's `MASTER_ID`; the master always
//! has `TWIN_ID == MASTER_ID`. Slaved twinterpreters receive both through
//! environment variables set by the master before exec:
//!
//! - `__TWIN_ID__`: identifier of this interpreter process.
//! - `__MASTER_ID__`: identifier of the group master.
//!
//! When unset (the master itself), the twin id defaults to the basename
//! of the current executable and the master id to the twin id.

use crate::error::{Result, TwinError};
use crate::kernel::dispatcher::RequestDispatcher;
use crate::kernel::server::ServerHandle;
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Opaque identifier of one process within a twinterpreter group.
pub type TwinId = String;

pub const TWIN_ID_ENV: &str = "__TWIN_ID__";
pub const MASTER_ID_ENV: &str = "__MASTER_ID__";

fn executable_basename() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "twinterp".to_string())
}

lazy_static! {
    /// Identity of this interpreter process. Consumed from the
    /// environment so child processes of user code do not inherit it.
    pub static ref TWIN_ID: TwinId = match std::env::var(TWIN_ID_ENV) {
        Ok(id) => {
            std::env::remove_var(TWIN_ID_ENV);
            id
        }
        Err(_) => executable_basename(),
    };

    /// Identity of the group master.
    pub static ref MASTER_ID: TwinId = match std::env::var(MASTER_ID_ENV) {
        Ok(id) => {
            std::env::remove_var(MASTER_ID_ENV);
            id
        }
        Err(_) => TWIN_ID.clone(),
    };

    /// Dispatch interface to each peered kernel, keyed by peer twin id.
    static ref KERNEL_INTERFACE: RwLock<HashMap<TwinId, Arc<RequestDispatcher>>> =
        RwLock::new(HashMap::new());

    /// Control handles of kernel servers running in this process.
    static ref KERNEL_SERVERS: Mutex<HashMap<TwinId, ServerHandle>> =
        Mutex::new(HashMap::new());

    /// Shared runtime carrying kernel i/o tasks for the whole process.
    static ref KERNEL_RUNTIME: Runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("twinterp-kernel")
        .enable_all()
        .build()
        .expect("kernel runtime must start");
}

/// This process's twin id.
pub fn twin_id() -> &'static str {
    &TWIN_ID
}

/// The group master's twin id.
pub fn master_id() -> &'static str {
    &MASTER_ID
}

/// Check whether this process is running a specific twinterpreter.
pub fn is_twinterpreter(id: &str) -> bool {
    twin_id() == id
}

/// Check whether this process is the group master.
pub fn is_master() -> bool {
    twin_id() == master_id()
}

/// Runtime hosting kernel reader/writer/server tasks.
pub fn runtime() -> &'static Runtime {
    &KERNEL_RUNTIME
}

/// Get this process's dispatcher to a specific kernel.
///
/// Fails with [`TwinError::TwinUnavailable`] when no active kernel
/// matches `id`. Requesting a kernel to the own interpreter is a caller
/// bug surfaced the same way.
pub fn get_kernel(id: &str) -> Result<Arc<RequestDispatcher>> {
    if is_twinterpreter(id) {
        return Err(TwinError::TwinUnavailable {
            twin_id: id.to_string(),
        });
    }
    KERNEL_INTERFACE
        .read()
        .get(id)
        .cloned()
        .ok_or_else(|| TwinError::TwinUnavailable {
            twin_id: id.to_string(),
        })
}

/// All currently peered twin ids.
pub fn peered_twins() -> Vec<TwinId> {
    KERNEL_INTERFACE.read().keys().cloned().collect()
}

/// Register the dispatcher for a freshly booted kernel client.
pub fn register_kernel(peer_id: &str, dispatcher: Arc<RequestDispatcher>) {
    KERNEL_INTERFACE
        .write()
        .insert(peer_id.to_string(), dispatcher);
}

/// Drop the dispatcher for a stopped kernel client.
pub fn deregister_kernel(peer_id: &str) {
    KERNEL_INTERFACE.write().remove(peer_id);
}

/// Register a running kernel server. Each peer id may have at most one
/// server per process.
pub fn register_server(peer_id: &str, handle: ServerHandle) -> Result<()> {
    let mut servers = KERNEL_SERVERS.lock();
    if servers.contains_key(peer_id) {
        return Err(TwinError::Process(format!(
            "kernel server for peer '{peer_id}' already running"
        )));
    }
    servers.insert(peer_id.to_string(), handle);
    Ok(())
}

/// Deregister a kernel server on shutdown.
pub fn deregister_server(peer_id: &str) {
    KERNEL_SERVERS.lock().remove(peer_id);
}

/// Control handle of the server peered with `peer_id`, if running.
pub fn server_handle(peer_id: &str) -> Option<ServerHandle> {
    KERNEL_SERVERS.lock().get(peer_id).cloned()
}
