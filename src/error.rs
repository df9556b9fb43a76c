//! # Error Taxonomy
//!
//! Errors fall into two families with very different propagation rules:
//!
//! - **Payload errors** ([`RemoteError`]): raised by the *target* of a
//!   directive (a twin method, constructor, or attribute access). These are
//!   serialized, shipped back across the channel, and re-raised at the
//!   calling side with their type name and message intact. They never stop
//!   a kernel.
//! - **Runtime errors** ([`TwinError`]): raised by the framework itself.
//!   Channel terminations fail all outstanding requests and refuse new
//!   ones; protocol violations are fatal to the affected server.
//!
//! A third, internal signal ([`StopTwinterpreter`]) is not an error in the
//! usual sense: it carries the exit code a kernel server should terminate
//! with, either because a termination event arrived from the peer or
//! because a payload raised a cooperative interrupt.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, TwinError>;

/// An exception raised by user code in the owning twinterpreter.
///
/// Crosses the channel as part of an exception reply and is re-raised at
/// the client with the same type name and message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteError {
    /// Type name of the original error, e.g. `AttributeError`.
    pub exc_type: String,
    /// Human-readable message of the original error.
    pub message: String,
}

impl RemoteError {
    pub fn new(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exc_type: exc_type.into(),
            message: message.into(),
        }
    }

    /// Attribute lookup/assignment failure on a twin object.
    pub fn attribute(class_name: &str, attribute: &str) -> Self {
        Self::new(
            "AttributeError",
            format!("'{class_name}' object has no attribute '{attribute}'"),
        )
    }

    /// Method lookup failure on a twin object or class.
    pub fn no_method(class_name: &str, method: &str) -> Self {
        Self::new(
            "AttributeError",
            format!("'{class_name}' object has no method '{method}'"),
        )
    }

    /// Argument count/shape mismatch for a call.
    pub fn bad_arguments(target: &str, detail: impl fmt::Display) -> Self {
        Self::new("TypeError", format!("{target}: {detail}"))
    }

    /// A subject reference did not resolve to a resident instance.
    pub fn lookup(detail: impl fmt::Display) -> Self {
        Self::new("LookupError", detail.to_string())
    }

    /// Cooperative interrupt; servers escalate this to a shutdown.
    pub fn interrupt(message: impl Into<String>) -> Self {
        Self::new("Interrupt", message)
    }

    /// Whether this payload error requests a kernel shutdown.
    pub fn is_interrupt(&self) -> bool {
        self.exc_type == "Interrupt"
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exc_type, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Errors produced by the twinterpreter runtime.
#[derive(Debug, Error)]
pub enum TwinError {
    /// The peer end closed or framing hit EOF. Outstanding requests fail
    /// with this error and new requests refuse immediately.
    #[error("interpreter channel terminated")]
    ChannelTerminated,

    /// No kernel is registered for the requested twinterpreter.
    #[error("twinterpreter '{twin_id}' not available")]
    TwinUnavailable { twin_id: String },

    /// The requested twinterpreter was available once but has gone away.
    #[error("twinterpreter '{twin_id}' already terminated")]
    TwinTerminated { twin_id: String },

    /// Malformed directive, unknown code, or a reply that matches no
    /// in-flight request. Fatal to the server that observes it.
    #[error("kernel protocol violation: {0}")]
    Protocol(String),

    /// Wire encoding or decoding failed.
    #[error("codec failure: {0}")]
    Codec(String),

    /// A payload exception from the peer, re-raised locally.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Twin process management failure (spawn, probe, wait).
    #[error("twin process failure: {0}")]
    Process(String),
}

impl TwinError {
    /// Collapse channel-level failures into the per-twin terminated error
    /// reported to callers of the request dispatcher.
    pub fn terminated_for(self, twin_id: &str) -> TwinError {
        match self {
            TwinError::ChannelTerminated => TwinError::TwinTerminated {
                twin_id: twin_id.to_string(),
            },
            other => other,
        }
    }
}

/// Signal carried out of a kernel server's serve loop: terminate with the
/// given exit code. Raised when a termination event is consumed or when a
/// payload raises a cooperative interrupt.
#[derive(Debug, Clone)]
pub struct StopTwinterpreter {
    pub message: String,
    pub exit_code: i32,
}

impl StopTwinterpreter {
    pub fn new(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }
}

impl fmt::Display for StopTwinterpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "twinterpreter shutdown: {} ({})", self.message, self.exit_code)
    }
}
