//! # Request Dispatcher
//!
//! The dispatcher is the only part of a kernel that non-kernel code
//! interacts with. It encapsulates encoding, sending, receiving, and
//! decoding of requests and translates the reply discriminator: success
//! becomes the returned value, exception re-raises the payload error in
//! the caller's context.
//!
//! Instances are created automatically when a kernel boots; use
//! [`crate::state::get_kernel`] to obtain the active dispatcher for a
//! peer.

use crate::codec::{self, Codec};
use crate::error::{Result, TwinError};
use crate::kernel::client::KernelClient;
use crate::proxy::class::ClassSpec;
use crate::proxy::func::FunctionSpec;
use crate::proxy::handle::TwinHandle;
use crate::protocol::{Directive, Reply, TerminationEvent};
use crate::state::{self, TwinId};
use crate::tracker::InstanceId;
use crate::value::{CallArgs, Value};
use std::sync::Arc;
use tracing::debug;

/// High-level request interface to one peered twinterpreter.
pub struct RequestDispatcher {
    pub peer_id: TwinId,
    client: Arc<KernelClient>,
    codec: Codec,
}

impl RequestDispatcher {
    /// Wrap a booted client and register the dispatcher as this
    /// process's interface to the peer.
    pub fn install(client: Arc<KernelClient>, codec: Codec) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            peer_id: client.peer_id.clone(),
            client,
            codec,
        });
        state::register_kernel(&dispatcher.peer_id, dispatcher.clone());
        dispatcher
    }

    /// Forward a directive and return the raised success value.
    fn run(&self, directive: Directive) -> Result<Value> {
        debug!(peer = %self.peer_id, directive = directive.symbol(), "dispatching");
        let reply = self
            .client
            .run_request(directive)
            .map_err(|err| err.terminated_for(&self.peer_id))?;
        match reply {
            Reply::Success(body) => self.codec.raise(body),
            Reply::Exception(err) => Err(TwinError::Remote(err)),
        }
    }

    /// Execute a function call in the peer and return the result.
    pub fn dispatch_call(&self, func: &Arc<FunctionSpec>, args: &CallArgs) -> Result<Value> {
        self.run(Directive::CallFunc {
            func: self.codec.lower(&Value::Function(func.clone()))?,
            args: self.codec.lower_args(args)?,
        })
    }

    /// Execute a method call on an instance or class subject.
    pub fn dispatch_method_call(
        &self,
        subject: &Value,
        name: &str,
        args: &CallArgs,
    ) -> Result<Value> {
        self.run(Directive::CallMethod {
            subject: self.codec.lower(subject)?,
            name: name.to_string(),
            args: self.codec.lower_args(args)?,
        })
    }

    /// Get an attribute of an instance or class.
    pub fn get_attribute(&self, subject: &Value, name: &str) -> Result<Value> {
        self.run(Directive::GetAttribute {
            subject: self.codec.lower(subject)?,
            name: name.to_string(),
        })
    }

    /// Set an attribute of an instance or class.
    pub fn set_attribute(&self, subject: &Value, name: &str, value: Value) -> Result<()> {
        self.run(Directive::SetAttribute {
            subject: self.codec.lower(subject)?,
            name: name.to_string(),
            value: self.codec.lower(&value)?,
        })
        .map(|_| ())
    }

    /// Delete an attribute of an instance or class.
    pub fn del_attribute(&self, subject: &Value, name: &str) -> Result<()> {
        self.run(Directive::DelAttribute {
            subject: self.codec.lower(subject)?,
            name: name.to_string(),
        })
        .map(|_| ())
    }

    /// Instantiate a class in the owning twin; the new instance starts
    /// with one keep-alive reference for the caller's proxy. Returns the
    /// instance id.
    pub fn instantiate_class(&self, class: &Arc<ClassSpec>, args: &CallArgs) -> Result<InstanceId> {
        let result = self.run(Directive::Instantiate {
            class: self.codec.lower(&Value::Class(class.clone()))?,
            args: self.codec.lower_args(args)?,
        })?;
        match result {
            Value::Str(instance_id) => Ok(instance_id),
            other => Err(TwinError::Protocol(format!(
                "instantiate returned {} instead of an instance id",
                other.type_name()
            ))),
        }
    }

    /// Increment the peer's reference count for an instance.
    pub fn increment_instance_ref(&self, instance: &TwinHandle) -> Result<i64> {
        self.run(Directive::RefIncr {
            subject: self.codec.lower(&Value::Object(instance.clone()))?,
        })?
        .as_int()
        .map_err(TwinError::Remote)
    }

    /// Decrement the peer's reference count for an instance.
    pub fn decrement_instance_ref(&self, instance: &TwinHandle) -> Result<i64> {
        self.run(Directive::RefDecr {
            subject: self.codec.lower(&Value::Object(instance.clone()))?,
        })?
        .as_int()
        .map_err(TwinError::Remote)
    }

    /// Decrement by raw wire identity; the proxy drop path uses this
    /// because the shell being dropped can no longer produce a handle.
    pub fn decrement_ref_by_parts(
        &self,
        instance_id: &str,
        twin_id: &str,
        module: &str,
        class_name: &str,
    ) -> Result<i64> {
        let reference = codec::make_reference(instance_id, twin_id, module, class_name)?;
        self.run(Directive::RefDecr {
            subject: crate::protocol::WireValue::Ref(reference),
        })?
        .as_int()
        .map_err(TwinError::Remote)
    }

    /// Tell the peer's server to shut down. Delivered as an event; a
    /// peer that is already gone counts as success.
    pub fn shutdown_peer(&self) -> Result<()> {
        match self
            .client
            .run_event(TerminationEvent::new("shutdown", 0))
        {
            Ok(()) => Ok(()),
            Err(TwinError::ChannelTerminated) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Tear down the local client side.
    pub fn stop(&self) {
        self.client.shutdown();
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<RequestDispatcher to {}>", self.peer_id)
    }
}
