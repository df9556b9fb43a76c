//! The uniform stand-in for twin objects. A [`TwinHandle`] is what user
//! code and directive payloads hold; whether operations run locally or
//! cross the channel depends on which role is behind it.

use crate::error::{Result, TwinError};
use crate::proxy::class::ClassSpec;
use crate::proxy::object::InstanceCell;
use crate::state::{self, TwinId};
use crate::tracker::InstanceId;
use crate::value::{CallArgs, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Local stand-in for an instance that lives in another twinterpreter.
///
/// Records the association only; creating a shell never reconstructs the
/// remote object. Dropping the shell releases the remote reference.
pub struct ProxyShell {
    pub class: Arc<ClassSpec>,
    pub twin_id: TwinId,
    pub instance_id: InstanceId,
}

impl ProxyShell {
    pub(crate) fn new(class: Arc<ClassSpec>, twin_id: &str, instance_id: &str) -> Self {
        Self {
            class,
            twin_id: twin_id.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl Drop for ProxyShell {
    fn drop(&mut self) {
        // Late teardown must not raise: if the owning twin is already
        // gone, the decrement is silently discarded.
        let dispatcher = match state::get_kernel(&self.twin_id) {
            Ok(dispatcher) => dispatcher,
            Err(_) => return,
        };
        if let Err(err) = dispatcher.decrement_ref_by_parts(
            &self.instance_id,
            &self.twin_id,
            &self.class.module,
            &self.class.name,
        ) {
            debug!(
                twin = %self.twin_id,
                instance = %self.instance_id,
                "dropped proxy decrement: {err}"
            );
        }
    }
}

impl fmt::Debug for ProxyShell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}::{} proxy of {}@{}>",
            self.class.module, self.class.name, self.instance_id, self.twin_id
        )
    }
}

/// A twin object as seen by user code: either the real instance (in the
/// owning twinterpreter) or a proxy (anywhere else). Clones are cheap and
/// share the underlying instance or shell.
#[derive(Clone)]
pub enum TwinHandle {
    Real(Arc<InstanceCell>),
    Proxy(Arc<ProxyShell>),
}

impl TwinHandle {
    pub fn class(&self) -> &Arc<ClassSpec> {
        match self {
            TwinHandle::Real(cell) => &cell.class,
            TwinHandle::Proxy(shell) => &shell.class,
        }
    }

    /// Owning twinterpreter of the underlying real instance.
    pub fn twin_id(&self) -> &str {
        match self {
            TwinHandle::Real(cell) => cell.twin_id(),
            TwinHandle::Proxy(shell) => &shell.twin_id,
        }
    }

    pub fn instance_id(&self) -> &str {
        match self {
            TwinHandle::Real(cell) => &cell.instance_id,
            TwinHandle::Proxy(shell) => &shell.instance_id,
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, TwinHandle::Proxy(_))
    }

    /// Wire identity `(instance_id, twin_id, module, class_name)`.
    pub fn reference(&self) -> (&str, &str, &str, &str) {
        (
            self.instance_id(),
            self.twin_id(),
            &self.class().module,
            &self.class().name,
        )
    }

    /// Invoke a method by name.
    ///
    /// Local-marked methods always run in the calling process with this
    /// handle as their self value; everything else runs where the real
    /// instance lives.
    pub fn call(&self, method: &str, args: &CallArgs) -> Result<Value> {
        if let Some(local) = self.class().local_method(method) {
            return local(self, args).map_err(TwinError::Remote);
        }
        match self {
            TwinHandle::Real(cell) => cell
                .object
                .call(self, method, args)
                .map_err(TwinError::Remote),
            TwinHandle::Proxy(shell) => {
                let dispatcher = state::get_kernel(&shell.twin_id)?;
                dispatcher.dispatch_method_call(&Value::Object(self.clone()), method, args)
            }
        }
    }

    /// Read an attribute by name.
    pub fn get(&self, name: &str) -> Result<Value> {
        match self {
            TwinHandle::Real(cell) => cell.object.get_attribute(name).map_err(TwinError::Remote),
            TwinHandle::Proxy(shell) => {
                let dispatcher = state::get_kernel(&shell.twin_id)?;
                dispatcher.get_attribute(&Value::Object(self.clone()), name)
            }
        }
    }

    /// Write an attribute by name.
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        match self {
            TwinHandle::Real(cell) => cell
                .object
                .set_attribute(name, value)
                .map_err(TwinError::Remote),
            TwinHandle::Proxy(shell) => {
                let dispatcher = state::get_kernel(&shell.twin_id)?;
                dispatcher.set_attribute(&Value::Object(self.clone()), name, value)
            }
        }
    }

    /// Delete an attribute by name.
    pub fn del(&self, name: &str) -> Result<()> {
        match self {
            TwinHandle::Real(cell) => cell.object.del_attribute(name).map_err(TwinError::Remote),
            TwinHandle::Proxy(shell) => {
                let dispatcher = state::get_kernel(&shell.twin_id)?;
                dispatcher.del_attribute(&Value::Object(self.clone()), name)
            }
        }
    }
}

impl fmt::Debug for TwinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TwinHandle::Real(cell) => cell.fmt(f),
            TwinHandle::Proxy(shell) => shell.fmt(f),
        }
    }
}
