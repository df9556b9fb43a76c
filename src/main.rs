//! # Twinterpreter Bootstrap Binary
//!
//! Entry point of a spawned twinterpreter process. The master invokes
//! this executable with channel connectors and bootstrap parameters on
//! the command line (see [`twinterp::bootstrap::TwinArgs`]); the process
//! registers the shared twin declarations, boots its kernel pair, and
//! serves until shutdown, exiting with the kernel server's exit code.
//!
//! A second mode, `--codec-probe`, prints the highest codec protocol
//! this build supports and exits; masters run it against a twin
//! executable to negotiate the wire protocol before spawning.

use anyhow::Result;
use clap::Parser;
use twinterp::bootstrap::{twin_main, TwinArgs};
use twinterp::codec::CODEC_PROTOCOL;

fn main() -> Result<()> {
    // The probe must answer on a bare stdout, before anything else.
    if std::env::args().any(|arg| arg == "--codec-probe") {
        println!("{CODEC_PROTOCOL}");
        return Ok(());
    }

    twinterp::logging::init();
    let args = TwinArgs::parse();

    // The same declarations the master registers on its side; a twin
    // can only serve what is registered locally.
    twinterp::fixtures::register(twinterp::state::twin_id())?;

    let exit_code = twin_main(args)?;
    std::process::exit(exit_code);
}
