//! # Request/Reply Protocol
//!
//! The kernel protocol is a fixed directive vocabulary carried in framed,
//! bincode-encoded messages. Each kernel pair uses two duplex channels;
//! on a given channel one side only ever writes requests and events while
//! the other only ever writes replies.
//!
//! ## Message Flow
//!
//! ```text
//! Client                                   Server
//!   |  ---- Request { id, directive } --->  |  hand to request handler
//!   |  <--- Reply { id, reply } ----------  |
//!   |                                       |
//!   |  ---- Event(Termination) ---------->  |  raise StopTwinterpreter
//!   |  (no reply is ever sent for events)   |
//! ```
//!
//! Directive and reply codes are stable for a running process and mirror
//! the classic twinterpreter numbering; they appear in logs and protocol
//! error messages, not on the wire (bincode discriminates by variant).

use crate::error::RemoteError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Correlates a reply to its in-flight request. Unique per client among
/// outstanding requests; allocated from a per-client counter.
pub type RequestId = u64;

// Directive codes.
pub const CODE_CALL_FUNC: u8 = 11;
pub const CODE_CALL_METHOD: u8 = 12;
pub const CODE_GET_ATTRIBUTE: u8 = 21;
pub const CODE_SET_ATTRIBUTE: u8 = 22;
pub const CODE_DEL_ATTRIBUTE: u8 = 23;
pub const CODE_INSTANTIATE: u8 = 31;
pub const CODE_REF_INCR: u8 = 32;
pub const CODE_REF_DECR: u8 = 33;
// Reply codes.
pub const CODE_SUCCESS: u8 = 101;
pub const CODE_EXCEPTION: u8 = 102;

/// Inert wire form of a value. Live handles never cross the channel;
/// the codec substitutes them with reference strings on the way out and
/// resolves those back to live handles on the way in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    /// Cross-process object reference:
    /// `instance_id \t twin_id \t module \t class_name`.
    Ref(String),
    /// Twin class reference as `(module, class_name)`.
    Class(String, String),
    /// Twin function reference as `(module, name)`.
    Func(String, String),
}

/// Wire form of [`crate::value::CallArgs`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WireArgs {
    pub args: Vec<WireValue>,
    pub kwargs: BTreeMap<String, WireValue>,
}

/// A typed request from client to server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Directive {
    CallFunc {
        func: WireValue,
        args: WireArgs,
    },
    CallMethod {
        subject: WireValue,
        name: String,
        args: WireArgs,
    },
    GetAttribute {
        subject: WireValue,
        name: String,
    },
    SetAttribute {
        subject: WireValue,
        name: String,
        value: WireValue,
    },
    DelAttribute {
        subject: WireValue,
        name: String,
    },
    Instantiate {
        class: WireValue,
        args: WireArgs,
    },
    RefIncr {
        subject: WireValue,
    },
    RefDecr {
        subject: WireValue,
    },
}

impl Directive {
    /// Stable numeric code of this directive.
    pub fn code(&self) -> u8 {
        match self {
            Directive::CallFunc { .. } => CODE_CALL_FUNC,
            Directive::CallMethod { .. } => CODE_CALL_METHOD,
            Directive::GetAttribute { .. } => CODE_GET_ATTRIBUTE,
            Directive::SetAttribute { .. } => CODE_SET_ATTRIBUTE,
            Directive::DelAttribute { .. } => CODE_DEL_ATTRIBUTE,
            Directive::Instantiate { .. } => CODE_INSTANTIATE,
            Directive::RefIncr { .. } => CODE_REF_INCR,
            Directive::RefDecr { .. } => CODE_REF_DECR,
        }
    }

    /// Symbolic name used in kernel logs.
    pub fn symbol(&self) -> &'static str {
        match self {
            Directive::CallFunc { .. } => "CALL_FUNC",
            Directive::CallMethod { .. } => "CALL_METHOD",
            Directive::GetAttribute { .. } => "GET_ATTRIBUTE",
            Directive::SetAttribute { .. } => "SET_ATTRIBUTE",
            Directive::DelAttribute { .. } => "DEL_ATTRIBUTE",
            Directive::Instantiate { .. } => "INSTANTIATE",
            Directive::RefIncr { .. } => "REF_INCR",
            Directive::RefDecr { .. } => "REF_DECR",
        }
    }
}

/// Response discriminator: the directive's return value or the payload
/// exception it raised.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    Success(WireValue),
    Exception(RemoteError),
}

impl Reply {
    pub fn code(&self) -> u8 {
        match self {
            Reply::Success(_) => CODE_SUCCESS,
            Reply::Exception(_) => CODE_EXCEPTION,
        }
    }
}

/// Asynchronous control event telling the receiving server to stop.
/// Delivered without a request id; no reply is awaited.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminationEvent {
    pub message: String,
    pub exit_code: i32,
}

impl TerminationEvent {
    pub fn new(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }
}

/// One framed message. Requests and events flow client-to-server;
/// replies flow server-to-client. Receiving the wrong kind for a
/// direction is a protocol violation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    Request { id: RequestId, directive: Directive },
    Event(TerminationEvent),
    Reply { id: RequestId, reply: Reply },
}
