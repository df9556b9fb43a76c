//! # Twin Master
//!
//! Spawns, configures, and supervises one twinterpreter subprocess. A
//! [`TwinMaster`] glues together the twin process handle, one kernel
//! client, one kernel server running on the shared kernel runtime, and
//! the channel pair joining them. It is a per-twin-id singleton: creating
//! the "same" master twice yields the original.
//!
//! Startup handshake: the master binds both channels, spawns the twin
//! with base64-encoded connectors on its command line, then opens its
//! client channel followed by its server channel. The twin constructs
//! its kernel server first and its client second, the reverse order, so
//! the two processes rendezvous without deadlock.

use crate::bootstrap;
use crate::codec::{Codec, CODEC_PROTOCOL};
use crate::error::{Result, TwinError};
use crate::group_state;
use crate::ipyc::{Ipyc, UnixSocketIpyc};
use crate::kernel::client::KernelClient;
use crate::kernel::dispatcher::RequestDispatcher;
use crate::kernel::server::{KernelServer, ServerHandle};
use crate::kernel::KernelFlavour;
use crate::proxy::func::FunctionSpec;
use crate::state::{self, TwinId};
use crate::value::{CallArgs, Value};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long `destroy` waits for a twin to exit cleanly before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Definition of a twinterpreter: which executable to run, under which
/// identity, and with which kernel flavour. Resolves the codec protocol
/// by probing the executable.
#[derive(Clone, Debug, PartialEq)]
pub struct TwinDef {
    pub executable: PathBuf,
    pub twin_id: TwinId,
    pub flavour: KernelFlavour,
    pub codec_protocol: u8,
}

impl TwinDef {
    /// Twin running this very executable; no probe needed.
    pub fn new(twin_id: impl Into<String>, flavour: KernelFlavour) -> Result<Self> {
        let executable = std::env::current_exe()
            .map_err(|e| TwinError::Process(format!("resolve current executable: {e}")))?;
        Ok(Self {
            executable,
            twin_id: twin_id.into(),
            flavour,
            codec_protocol: CODEC_PROTOCOL,
        })
    }

    /// Twin running a foreign executable; negotiates the codec protocol
    /// as the minimum supported by both processes. A bare name is looked
    /// up in `PATH`.
    pub fn with_executable(
        executable: impl Into<PathBuf>,
        twin_id: impl Into<String>,
        flavour: KernelFlavour,
    ) -> Result<Self> {
        let executable = resolve_executable(executable.into())?;
        let codec_protocol = probe_codec_protocol(&executable)?.min(CODEC_PROTOCOL);
        Ok(Self {
            executable,
            twin_id: twin_id.into(),
            flavour,
            codec_protocol,
        })
    }
}

/// Resolve an executable the way a shell would: paths with a directory
/// component are taken as-is, bare names are searched in `PATH`.
fn resolve_executable(executable: PathBuf) -> Result<PathBuf> {
    if executable.components().count() > 1 || executable.is_file() {
        return Ok(executable);
    }
    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(&executable);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(TwinError::Process(format!(
        "executable '{}' not found in PATH",
        executable.display()
    )))
}

/// Ask an executable which codec protocol it speaks.
fn probe_codec_protocol(executable: &PathBuf) -> Result<u8> {
    let output = Command::new(executable)
        .arg("--codec-probe")
        .output()
        .map_err(|e| TwinError::Process(format!("probe {}: {e}", executable.display())))?;
    if !output.status.success() {
        return Err(TwinError::Process(format!(
            "probe {} exited with {}",
            executable.display(),
            output.status
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    text.trim()
        .parse::<u8>()
        .map_err(|_| TwinError::Process(format!("probe returned {:?}", text.trim())))
}

#[derive(Default)]
struct MasterInner {
    process: Option<Child>,
    dispatcher: Option<Arc<RequestDispatcher>>,
    server: Option<ServerHandle>,
}

/// Manager for one twinterpreter subprocess.
pub struct TwinMaster {
    def: TwinDef,
    inner: Mutex<MasterInner>,
}

lazy_static! {
    static ref MASTER_STORE: Mutex<HashMap<TwinId, Arc<TwinMaster>>> = Mutex::new(HashMap::new());
}

impl TwinMaster {
    /// Create or fetch the master for a twin id. Recreating with a
    /// conflicting definition is an error.
    pub fn create(def: TwinDef) -> Result<Arc<Self>> {
        let mut store = MASTER_STORE.lock();
        if let Some(existing) = store.get(&def.twin_id) {
            if existing.def != def {
                return Err(TwinError::Process(format!(
                    "twinterpreter '{}' already defined with different settings",
                    def.twin_id
                )));
            }
            return Ok(existing.clone());
        }
        let master = Arc::new(Self {
            def: def.clone(),
            inner: Mutex::new(MasterInner::default()),
        });
        store.insert(def.twin_id, master.clone());
        Ok(master)
    }

    pub fn twin_id(&self) -> &str {
        &self.def.twin_id
    }

    /// Whether the twin subprocess is currently alive.
    pub fn is_alive(&self) -> bool {
        let mut inner = self.inner.lock();
        Self::process_alive(&mut inner)
    }

    fn process_alive(inner: &mut MasterInner) -> bool {
        match inner.process.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    debug!(status = %status, "twin process already exited");
                    inner.process = None;
                    false
                }
                Err(err) => {
                    warn!("twin liveness check failed: {err}");
                    false
                }
            },
            None => false,
        }
    }

    /// Start the twinterpreter if it is not alive.
    pub fn start(&self) -> Result<()> {
        if MASTER_STORE.lock().get(&self.def.twin_id).map(Arc::as_ptr) != Some(self as *const _) {
            return Err(TwinError::Process(format!(
                "attempt to start twinterpreter '{}' after destroying it",
                self.def.twin_id
            )));
        }
        {
            let mut inner = self.inner.lock();
            if Self::process_alive(&mut inner) {
                warn!(twin = %self.def.twin_id, "reusing running twinterpreter");
                return Ok(());
            }

            info!(twin = %self.def.twin_id, flavour = %self.def.flavour, "starting twinterpreter");
            group_state::register_builtins()?;
            let codec = Codec::new(self.def.codec_protocol)?;

            // Bind both channels before the twin exists so its connectors
            // can go onto the command line.
            let client_ipyc = Box::new(UnixSocketIpyc::bind()?);
            let server_ipyc = Box::new(UnixSocketIpyc::bind()?);

            let child = self.spawn_twin(&client_ipyc, &server_ipyc)?;
            inner.process = Some(child);

            // Open the client end first; the twin builds its server
            // first, in reverse order to us.
            let client_channel = state::runtime().block_on(client_ipyc.open())?;
            let client = KernelClient::start(
                &self.def.twin_id,
                client_channel,
                self.def.flavour,
                codec,
            );
            inner.dispatcher = Some(RequestDispatcher::install(client, codec));

            let server_channel = state::runtime().block_on(server_ipyc.open())?;
            let (server, server_handle) = KernelServer::new(
                &self.def.twin_id,
                server_channel,
                self.def.flavour,
                codec,
            );
            state::runtime().spawn(server.run());
            inner.server = Some(server_handle);
        }

        // Finalize the fresh twin; runs caller-registered finalizers
        // through the just-booted kernel.
        group_state::run_finalizers(&self.def.twin_id)?;
        info!(twin = %self.def.twin_id, "twinterpreter initialized");
        Ok(())
    }

    /// Assemble the twin's bootstrap command line and spawn it.
    fn spawn_twin(
        &self,
        client_ipyc: &UnixSocketIpyc,
        server_ipyc: &UnixSocketIpyc,
    ) -> Result<Child> {
        let cwd = std::env::current_dir()
            .map_err(|e| TwinError::Process(format!("resolve working directory: {e}")))?;
        let mut cmd = Command::new(&self.def.executable);
        cmd.arg("--peer-id")
            .arg(state::twin_id())
            .arg("--twin-id")
            .arg(&self.def.twin_id)
            .arg("--master-id")
            .arg(state::master_id())
            // The twin's server reads from our client channel and vice
            // versa; the connectors cross over here.
            .arg("--server-ipyc")
            .arg(bootstrap::dump_connector(&client_ipyc.connector())?)
            .arg("--client-ipyc")
            .arg(bootstrap::dump_connector(&server_ipyc.connector())?)
            .arg("--ipyc-pkl-protocol")
            .arg(self.def.codec_protocol.to_string())
            .arg("--kernel")
            .arg(bootstrap::dump_kernel(self.def.flavour)?)
            .arg("--cwd")
            .arg(cwd);
        let initializers = group_state::initializer_refs();
        if !initializers.is_empty() {
            cmd.arg("--initializer");
            for initializer in &initializers {
                cmd.arg(bootstrap::dump_initializer(initializer)?);
            }
        }
        cmd.env(state::TWIN_ID_ENV, &self.def.twin_id)
            .env(state::MASTER_ID_ENV, state::master_id());

        let child = cmd
            .spawn()
            .map_err(|e| TwinError::Process(format!("spawn {}: {e}", self.def.executable.display())))?;
        debug!(twin = %self.def.twin_id, pid = child.id(), "spawned twin process");
        Ok(child)
    }

    /// Invoke a twin-owned callable in the twinterpreter.
    pub fn execute(&self, func: &Arc<FunctionSpec>, args: &CallArgs) -> Result<Value> {
        let dispatcher = self
            .inner
            .lock()
            .dispatcher
            .clone()
            .ok_or_else(|| TwinError::TwinUnavailable {
                twin_id: self.def.twin_id.clone(),
            })?;
        dispatcher.dispatch_call(func, args)
    }

    /// Terminate the twinterpreter, leaving the master reusable.
    pub fn stop(&self) -> Result<()> {
        self.cleanup();
        Ok(())
    }

    /// Stop the twinterpreter and retire this master.
    pub fn destroy(&self) -> Result<()> {
        self.cleanup();
        MASTER_STORE.lock().remove(&self.def.twin_id);
        info!(twin = %self.def.twin_id, "destroyed twinterpreter");
        Ok(())
    }

    /// Close all connections: client first, then the process, and the
    /// server last in case twin shutdown still needs it.
    fn cleanup(&self) {
        let (dispatcher, server, process) = {
            let mut inner = self.inner.lock();
            (
                inner.dispatcher.take(),
                inner.server.take(),
                inner.process.take(),
            )
        };

        if let Some(dispatcher) = dispatcher {
            if let Err(err) = dispatcher.shutdown_peer() {
                warn!(twin = %self.def.twin_id, "shutdown event not delivered: {err}");
            }
            dispatcher.stop();
            debug!(twin = %self.def.twin_id, "cleaned up twin client");
        }

        if let Some(mut child) = process {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(twin = %self.def.twin_id, status = %status, "twin process exited");
                        break;
                    }
                    Ok(None) if Instant::now() >= deadline => {
                        warn!(twin = %self.def.twin_id, "twin did not exit in time, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                    Err(err) => {
                        warn!(twin = %self.def.twin_id, "waiting for twin failed: {err}");
                        break;
                    }
                }
            }
        }

        if let Some(server) = server {
            server.stop();
            debug!(twin = %self.def.twin_id, "cleaned up twin server");
        }
    }
}

impl Drop for TwinMaster {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_is_a_singleton_per_twin_id() {
        let def = TwinDef::new("singleton-twin", KernelFlavour::Async).unwrap();
        let first = TwinMaster::create(def.clone()).unwrap();
        let second = TwinMaster::create(def).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn conflicting_definitions_are_rejected() {
        let def = TwinDef::new("conflicted-twin", KernelFlavour::Async).unwrap();
        TwinMaster::create(def).unwrap();
        let other = TwinDef::new("conflicted-twin", KernelFlavour::Multi).unwrap();
        assert!(TwinMaster::create(other).is_err());
    }

    #[test]
    fn bare_names_resolve_through_path() {
        // `sh` exists on any platform these kernels run on.
        let resolved = resolve_executable(PathBuf::from("sh")).unwrap();
        assert!(resolved.is_file());
        assert!(resolved.components().count() > 1);
    }

    #[test]
    fn explicit_paths_pass_through_unresolved() {
        let explicit = PathBuf::from("/no/such/dir/twin");
        assert_eq!(resolve_executable(explicit.clone()).unwrap(), explicit);
    }

    #[test]
    fn execute_without_start_reports_unavailable() {
        let def = TwinDef::new("idle-twin", KernelFlavour::Single).unwrap();
        let master = TwinMaster::create(def).unwrap();
        let func = crate::proxy::func::FunctionBuilder::new("master_tests", "noop")
            .owner("idle-twin")
            .register(|_args| Ok(Value::Null))
            .unwrap();
        assert!(matches!(
            master.execute(&func, &CallArgs::none()),
            Err(TwinError::TwinUnavailable { .. })
        ));
    }
}
