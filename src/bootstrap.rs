//! # Twin Bootstrap
//!
//! Deploys a kernel to make this process a twinterpreter. The master
//! invokes the twin executable with the flags below; [`twin_main`]
//! consumes them, constructs kernel server then client (the reverse of
//! the master's order, avoiding rendezvous deadlocks), serves until
//! shutdown, and reports the server's exit code.
//!
//! Connectors, the kernel flavour pair, and initializer references cross
//! the command line base64-encoded over their bincode form.

use crate::codec::Codec;
use crate::error::{Result, TwinError};
use crate::group_state;
use crate::ipyc::Connector;
use crate::kernel::client::KernelClient;
use crate::kernel::dispatcher::RequestDispatcher;
use crate::kernel::server::KernelServer;
use crate::kernel::KernelFlavour;
use crate::state;
use crate::tracker;
use crate::value::CallArgs;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Command line of a twinterpreter subprocess.
#[derive(Parser, Debug, Clone)]
#[command(name = "twinterp", about = "Twinterpreter kernel bootstrap")]
pub struct TwinArgs {
    /// Unique identifier of the process that spawned us.
    #[arg(long)]
    pub peer_id: String,

    /// Unique identifier of this twinterpreter.
    #[arg(long)]
    pub twin_id: String,

    /// Unique identifier of the master twinterpreter.
    #[arg(long)]
    pub master_id: String,

    /// Base64-encoded connector for the server-side channel.
    #[arg(long)]
    pub server_ipyc: String,

    /// Base64-encoded connector for the client-side channel.
    #[arg(long)]
    pub client_ipyc: String,

    /// Negotiated codec protocol for both channels.
    #[arg(long, default_value_t = crate::codec::CODEC_PROTOCOL)]
    pub ipyc_pkl_protocol: u8,

    /// Base64-encoded kernel client and server flavour pair.
    #[arg(long)]
    pub kernel: Option<String>,

    /// Base64-encoded initializer function references.
    #[arg(long, num_args = 0..)]
    pub initializer: Vec<String>,

    /// Working directory to adopt before the kernels boot.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Base64-encoded main-module bootstrap; accepted for command-line
    /// compatibility and ignored by this runtime.
    #[arg(long)]
    pub main_def: Option<String>,
}

fn dump_any<T: Serialize>(value: &T) -> Result<String> {
    let bytes =
        bincode::serialize(value).map_err(|e| TwinError::Codec(format!("encode bootstrap argument: {e}")))?;
    Ok(BASE64.encode(bytes))
}

fn load_any<T: DeserializeOwned>(encoded: &str) -> Result<T> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| TwinError::Codec(format!("decode bootstrap argument: {e}")))?;
    bincode::deserialize(&bytes)
        .map_err(|e| TwinError::Codec(format!("decode bootstrap argument: {e}")))
}

/// Dump a channel connector for the twin command line.
pub fn dump_connector(connector: &Connector) -> Result<String> {
    dump_any(connector)
}

/// Reconstruct a channel connector from the command line.
pub fn load_connector(encoded: &str) -> Result<Connector> {
    load_any(encoded)
}

/// Dump the kernel flavour as the (client, server) pair it stands for.
pub fn dump_kernel(flavour: KernelFlavour) -> Result<String> {
    dump_any(&(flavour.as_str().to_string(), flavour.as_str().to_string()))
}

/// Load the kernel flavour pair; both halves must agree.
pub fn load_kernel(encoded: Option<&str>) -> Result<KernelFlavour> {
    let Some(encoded) = encoded else {
        return Ok(KernelFlavour::Single);
    };
    let (client, server): (String, String) = load_any(encoded)?;
    if client != server {
        return Err(TwinError::Process(format!(
            "mismatched kernel pair: client '{client}', server '{server}'"
        )));
    }
    server.parse()
}

/// Dump one initializer reference.
pub fn dump_initializer(reference: &(String, String)) -> Result<String> {
    dump_any(reference)
}

/// Load and immediately run one initializer.
fn run_initializer(encoded: &str) -> Result<()> {
    let (module, name): (String, String) = load_any(encoded)?;
    let func = tracker::lookup_function(&module, &name).ok_or_else(|| {
        TwinError::Process(format!("initializer {module}::{name} is not registered"))
    })?;
    debug!(initializer = %name, "running initializer");
    func.call_body(&CallArgs::none())
        .map_err(|err| TwinError::Process(format!("initializer {module}::{name} failed: {err}")))?;
    Ok(())
}

/// Boot the kernels of a twinterpreter and serve until shutdown.
/// Returns the exit code the process should terminate with.
pub fn twin_main(args: TwinArgs) -> Result<i32> {
    if state::twin_id() != args.twin_id {
        return Err(TwinError::Process(format!(
            "twin id mismatch: environment says '{}', command line says '{}'",
            state::twin_id(),
            args.twin_id
        )));
    }
    if state::master_id() != args.master_id {
        return Err(TwinError::Process(format!(
            "master id mismatch: environment says '{}', command line says '{}'",
            state::master_id(),
            args.master_id
        )));
    }

    // Set up the surrounding environment before any kernel resource.
    if let Some(cwd) = &args.cwd {
        std::env::set_current_dir(cwd)
            .map_err(|e| TwinError::Process(format!("chdir {}: {e}", cwd.display())))?;
    }
    if args.main_def.is_some() {
        debug!("ignoring --main-def: main re-bootstrap is not part of this runtime");
    }
    group_state::register_builtins()?;
    for initializer in &args.initializer {
        run_initializer(initializer)?;
    }

    let flavour = load_kernel(args.kernel.as_deref())?;
    let codec = Codec::new(args.ipyc_pkl_protocol)?;
    info!(
        twin = %state::twin_id(),
        peer = %args.peer_id,
        flavour = %flavour,
        "bootstrapping twinterpreter kernel"
    );

    // Start in the opposite order to the master to avoid deadlocks.
    let server_connector = load_connector(&args.server_ipyc)?;
    let server_channel = state::runtime().block_on(server_connector.connect())?;
    let (server, _server_handle) =
        KernelServer::new(&args.peer_id, server_channel, flavour, codec);

    let client_connector = load_connector(&args.client_ipyc)?;
    let client_channel = state::runtime().block_on(client_connector.connect())?;
    let client = KernelClient::start(&args.peer_id, client_channel, flavour, codec);
    let dispatcher = RequestDispatcher::install(client, codec);

    let exit_code = state::runtime().block_on(server.run());

    // The master may already be gone; local teardown is all that is left.
    dispatcher.stop();
    if exit_code != 0 {
        warn!(twin = %state::twin_id(), exit_code, "twinterpreter exiting abnormally");
    } else {
        info!(twin = %state::twin_id(), "twinterpreter exiting");
    }
    Ok(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_survives_the_command_line() {
        let connector = Connector::UnixSocket {
            path: PathBuf::from("/tmp/twinterp-boot.sock"),
        };
        let encoded = dump_connector(&connector).unwrap();
        assert!(!encoded.contains(' '));
        assert_eq!(load_connector(&encoded).unwrap(), connector);
    }

    #[test]
    fn kernel_pair_round_trip() {
        for flavour in [KernelFlavour::Single, KernelFlavour::Async, KernelFlavour::Multi] {
            let encoded = dump_kernel(flavour).unwrap();
            assert_eq!(load_kernel(Some(&encoded)).unwrap(), flavour);
        }
        assert_eq!(load_kernel(None).unwrap(), KernelFlavour::Single);
    }

    #[test]
    fn mismatched_kernel_pair_is_rejected() {
        let encoded = dump_any(&("single".to_string(), "multi".to_string())).unwrap();
        assert!(load_kernel(Some(&encoded)).is_err());
    }

    #[test]
    fn twin_args_parse_the_master_invocation() {
        let args = TwinArgs::parse_from([
            "twinterp",
            "--peer-id",
            "master",
            "--twin-id",
            "pypy",
            "--master-id",
            "master",
            "--server-ipyc",
            "AAAA",
            "--client-ipyc",
            "BBBB",
            "--ipyc-pkl-protocol",
            "1",
            "--cwd",
            "/tmp",
        ]);
        assert_eq!(args.twin_id, "pypy");
        assert_eq!(args.peer_id, "master");
        assert_eq!(args.ipyc_pkl_protocol, 1);
        assert!(args.kernel.is_none());
        assert!(args.initializer.is_empty());
    }
}
