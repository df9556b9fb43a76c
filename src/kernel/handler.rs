//! # Request Handler
//!
//! Applies directives to local objects and owns the per-peer keep-alive
//! table: the sole strong root for instances whose only remaining users
//! live across the channel. `instantiate` records the new instance with
//! count 1, `ref_incr` increments (creating the entry at 1 if absent),
//! and `ref_decr` decrements, releasing the local strong reference when
//! the count reaches zero.
//!
//! Payload failures are caught, wrapped as exception replies, and sent
//! back through the server; a cooperative interrupt from the payload is
//! escalated to a shutdown of this kernel. Framework-internal failures
//! terminate the server.

use crate::codec::Codec;
use crate::error::{RemoteError, StopTwinterpreter, TwinError};
use crate::kernel::server::ReplySender;
use crate::proxy::handle::TwinHandle;
use crate::proxy::object::InstanceCell;
use crate::protocol::{Directive, Reply, RequestId, WireArgs, WireValue};
use crate::state::TwinId;
use crate::tracker::InstanceId;
use crate::value::{CallArgs, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

struct KeepAlive {
    cell: Arc<InstanceCell>,
    count: i64,
}

/// Handler for one peer's requests.
pub struct RequestHandler {
    pub peer_id: TwinId,
    codec: Codec,
    /// instance id => pinned instance and its remote reference count.
    keepalive: Mutex<HashMap<InstanceId, KeepAlive>>,
}

/// Outcome classification inside the handler: payload errors travel back
/// as exception replies, internal errors stop the server.
enum ApplyError {
    Payload(RemoteError),
    Internal(TwinError),
}

impl From<TwinError> for ApplyError {
    fn from(err: TwinError) -> Self {
        match err {
            TwinError::Remote(payload) => ApplyError::Payload(payload),
            TwinError::Protocol(detail) => ApplyError::Internal(TwinError::Protocol(detail)),
            // Anything else (terminated peers during rehydration, codec
            // limits) is reported to the caller, not fatal here.
            other => ApplyError::Payload(RemoteError::new("KernelError", other.to_string())),
        }
    }
}

impl RequestHandler {
    pub fn new(peer_id: &str, codec: Codec) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            codec,
            keepalive: Mutex::new(HashMap::new()),
        }
    }

    /// Serve one request end-to-end: apply the directive and write the
    /// reply. Returns the shutdown signal when the kernel must stop.
    pub fn serve_request(
        &self,
        request_id: RequestId,
        directive: Directive,
        replies: &ReplySender,
    ) -> Result<(), StopTwinterpreter> {
        debug!(peer = %self.peer_id, directive = directive.symbol(), request_id, "serving");
        let reply = match self.apply(directive) {
            Ok(value) => match self.codec.lower(&value) {
                Ok(body) => Reply::Success(body),
                Err(err) => Reply::Exception(RemoteError::new("CodecError", err.to_string())),
            },
            Err(ApplyError::Payload(err)) => {
                error!(peer = %self.peer_id, request_id, "payload exception: {err}");
                let interrupt = err.is_interrupt();
                let reply = Reply::Exception(err.clone());
                replies
                    .send(request_id, reply)
                    .map_err(|_| StopTwinterpreter::new("reply channel closed", 1))?;
                if interrupt {
                    return Err(StopTwinterpreter::new(err.exc_type, 1));
                }
                return Ok(());
            }
            Err(ApplyError::Internal(err)) => {
                error!(peer = %self.peer_id, request_id, "kernel internal exception: {err}");
                // Best effort: tell the caller before this kernel dies.
                let _ = replies.send(
                    request_id,
                    Reply::Exception(RemoteError::new("KernelError", err.to_string())),
                );
                return Err(StopTwinterpreter::new(err.to_string(), 2));
            }
        };
        replies
            .send(request_id, reply)
            .map_err(|_| StopTwinterpreter::new("reply channel closed", 1))
    }

    /// Apply a directive to local objects and produce its return value.
    fn apply(&self, directive: Directive) -> Result<Value, ApplyError> {
        match directive {
            Directive::CallFunc { func, args } => {
                let func = self.raise(func)?;
                let args = self.raise_args(args)?;
                match func {
                    Value::Function(spec) => spec.call_body(&args).map_err(ApplyError::Payload),
                    other => Err(ApplyError::Payload(RemoteError::bad_arguments(
                        "call_func",
                        format!("{} is not callable", other.type_name()),
                    ))),
                }
            }
            Directive::CallMethod {
                subject,
                name,
                args,
            } => {
                let subject = self.raise(subject)?;
                let args = self.raise_args(args)?;
                match subject {
                    Value::Object(handle) => self.expect_resident(&handle).and_then(|_| {
                        handle
                            .call(&name, &args)
                            .map_err(|err| ApplyError::from(err))
                    }),
                    Value::Class(spec) => spec
                        .call_class_method(&name, &args)
                        .map_err(ApplyError::from),
                    other => Err(ApplyError::Payload(RemoteError::bad_arguments(
                        "call_method",
                        format!("{} has no methods", other.type_name()),
                    ))),
                }
            }
            Directive::GetAttribute { subject, name } => match self.raise(subject)? {
                Value::Object(handle) => self
                    .expect_resident(&handle)
                    .and_then(|_| handle.get(&name).map_err(ApplyError::from)),
                Value::Class(spec) => spec.get_class_attribute(&name).map_err(ApplyError::from),
                other => Err(ApplyError::Payload(RemoteError::bad_arguments(
                    "get_attribute",
                    format!("{} has no attributes", other.type_name()),
                ))),
            },
            Directive::SetAttribute {
                subject,
                name,
                value,
            } => {
                let value = self.raise(value)?;
                match self.raise(subject)? {
                    Value::Object(handle) => self.expect_resident(&handle).and_then(|_| {
                        handle
                            .set(&name, value)
                            .map(|_| Value::Null)
                            .map_err(ApplyError::from)
                    }),
                    Value::Class(spec) => spec
                        .set_class_attribute(&name, value)
                        .map(|_| Value::Null)
                        .map_err(ApplyError::from),
                    other => Err(ApplyError::Payload(RemoteError::bad_arguments(
                        "set_attribute",
                        format!("{} has no attributes", other.type_name()),
                    ))),
                }
            }
            Directive::DelAttribute { subject, name } => match self.raise(subject)? {
                Value::Object(handle) => self.expect_resident(&handle).and_then(|_| {
                    handle
                        .del(&name)
                        .map(|_| Value::Null)
                        .map_err(ApplyError::from)
                }),
                Value::Class(spec) => spec
                    .del_class_attribute(&name)
                    .map(|_| Value::Null)
                    .map_err(ApplyError::from),
                other => Err(ApplyError::Payload(RemoteError::bad_arguments(
                    "del_attribute",
                    format!("{} has no attributes", other.type_name()),
                ))),
            },
            Directive::Instantiate { class, args } => {
                let class = self.raise(class)?;
                let args = self.raise_args(args)?;
                let spec = match class {
                    Value::Class(spec) => spec,
                    other => {
                        return Err(ApplyError::Payload(RemoteError::bad_arguments(
                            "instantiate",
                            format!("{} is not a class", other.type_name()),
                        )))
                    }
                };
                let cell = spec.construct_local(&args).map_err(ApplyError::Payload)?;
                let instance_id = cell.instance_id.clone();
                self.keepalive
                    .lock()
                    .insert(instance_id.clone(), KeepAlive { cell, count: 1 });
                Ok(Value::Str(instance_id))
            }
            Directive::RefIncr { subject } => {
                let cell = self.resident_subject(subject)?;
                let mut keepalive = self.keepalive.lock();
                let entry = keepalive
                    .entry(cell.instance_id.clone())
                    .or_insert(KeepAlive { cell, count: 0 });
                entry.count += 1;
                Ok(Value::Int(entry.count))
            }
            Directive::RefDecr { subject } => {
                let cell = self.resident_subject(subject)?;
                let mut keepalive = self.keepalive.lock();
                let entry = match keepalive.get_mut(&cell.instance_id) {
                    Some(entry) => entry,
                    None => {
                        return Err(ApplyError::Payload(RemoteError::lookup(format!(
                            "instance {} is not pinned for peer '{}'",
                            cell.instance_id, self.peer_id
                        ))))
                    }
                };
                entry.count -= 1;
                let count = entry.count;
                if count <= 0 {
                    keepalive.remove(&cell.instance_id);
                }
                Ok(Value::Int(count))
            }
        }
    }

    /// Raise a subject reference and insist it resolves to a real
    /// instance resident in this process.
    fn resident_subject(&self, subject: WireValue) -> Result<Arc<InstanceCell>, ApplyError> {
        match self.raise(subject)? {
            Value::Object(TwinHandle::Real(cell)) => Ok(cell),
            Value::Object(TwinHandle::Proxy(shell)) => {
                Err(ApplyError::Payload(RemoteError::lookup(format!(
                    "instance {} resides in twin '{}', not here",
                    shell.instance_id, shell.twin_id
                ))))
            }
            other => Err(ApplyError::Payload(RemoteError::bad_arguments(
                "subject",
                format!("expected twin instance, got {}", other.type_name()),
            ))),
        }
    }

    /// Guard method/attribute subjects: a subject that rehydrated into a
    /// proxy would bounce the directive straight back over the channel.
    fn expect_resident(&self, handle: &TwinHandle) -> Result<(), ApplyError> {
        if handle.is_proxy() {
            return Err(ApplyError::Payload(RemoteError::lookup(format!(
                "instance {} resides in twin '{}', not here",
                handle.instance_id(),
                handle.twin_id()
            ))));
        }
        Ok(())
    }

    fn raise(&self, value: WireValue) -> Result<Value, ApplyError> {
        self.codec.raise(value).map_err(ApplyError::from)
    }

    fn raise_args(&self, args: WireArgs) -> Result<CallArgs, ApplyError> {
        self.codec.raise_args(args).map_err(ApplyError::from)
    }

    /// Current keep-alive count for an instance; zero when not pinned.
    pub fn keepalive_count(&self, instance_id: &str) -> i64 {
        self.keepalive
            .lock()
            .get(instance_id)
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    /// Number of instances pinned for this peer.
    pub fn pinned_instances(&self) -> usize {
        self.keepalive.lock().len()
    }
}
