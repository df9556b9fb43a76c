//! # Kernel
//!
//! Any connection between two twinterpreters is handled by a kernel
//! pair: a client and a server residing in the two processes, joined by
//! one duplex channel each. The client frames and sends directives and
//! correlates replies to blocked callers; the server reads directives,
//! hands them to the request handler, and writes replies back.
//!
//! Kernels assume they have been set up properly; use
//! [`crate::master::TwinMaster`] to start kernel pairs.

use crate::error::TwinError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod client;
pub mod dispatcher;
pub mod handler;
pub mod server;

pub use client::KernelClient;
pub use dispatcher::RequestDispatcher;
pub use handler::RequestHandler;
pub use server::{KernelServer, ServerHandle};

/// Dispatch strategy of a kernel pair.
///
/// - `Single`: requests are served inline, one at a time; cross-process
///   recursion is impossible.
/// - `Async`: one worker per request; a blocked worker does not prevent
///   new requests from being served, so call chains may bounce between
///   twinterpreters.
/// - `Multi`: a bounded worker pool fed from a FIFO queue, with idle
///   workers reaped after a randomized timeout. Same recursion support
///   as `Async` with thread recycling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelFlavour {
    Single,
    Async,
    Multi,
}

impl KernelFlavour {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelFlavour::Single => "single",
            KernelFlavour::Async => "async",
            KernelFlavour::Multi => "multi",
        }
    }
}

impl fmt::Display for KernelFlavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelFlavour {
    type Err = TwinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(KernelFlavour::Single),
            "async" => Ok(KernelFlavour::Async),
            "multi" => Ok(KernelFlavour::Multi),
            other => Err(TwinError::Process(format!("unknown kernel flavour '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flavour_names_round_trip() {
        for flavour in [KernelFlavour::Single, KernelFlavour::Async, KernelFlavour::Multi] {
            assert_eq!(flavour.as_str().parse::<KernelFlavour>().unwrap(), flavour);
        }
        assert!("turbo".parse::<KernelFlavour>().is_err());
    }
}
