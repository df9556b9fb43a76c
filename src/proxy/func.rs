//! Twin-aware functions: plain callables owned by one twinterpreter.
//! Invoking one anywhere else dispatches a `call_func` directive to the
//! owner; the caller's process never executes the body.

use crate::error::{RemoteError, Result, TwinError};
use crate::state::{self, TwinId};
use crate::tracker;
use crate::value::{CallArgs, Value};
use std::fmt;
use std::sync::Arc;

type FunctionBody =
    Box<dyn Fn(&CallArgs) -> std::result::Result<Value, RemoteError> + Send + Sync>;

/// Descriptor of a twin-aware function, registered under `(module, name)`.
pub struct FunctionSpec {
    pub module: String,
    pub name: String,
    /// Twinterpreter in which the body executes.
    pub twin_id: TwinId,
    pub doc: Option<String>,
    body: FunctionBody,
}

impl FunctionSpec {
    pub fn is_owner(&self) -> bool {
        state::is_twinterpreter(&self.twin_id)
    }

    /// Invoke the function: locally in the owning twin, via the kernel
    /// anywhere else.
    pub fn invoke(self: &Arc<Self>, args: &CallArgs) -> Result<Value> {
        if self.is_owner() {
            return (self.body)(args).map_err(TwinError::Remote);
        }
        let dispatcher = state::get_kernel(&self.twin_id)?;
        dispatcher.dispatch_call(self, args)
    }

    /// Run the body unconditionally; the request handler uses this when
    /// serving a `call_func` directive in the owning twin.
    pub(crate) fn call_body(&self, args: &CallArgs) -> std::result::Result<Value, RemoteError> {
        (self.body)(args)
    }
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}::{} @ {}>", self.module, self.name, self.twin_id)
    }
}

/// Builder for twin-aware function declarations. The owner defaults to
/// the group master, like classes.
pub struct FunctionBuilder {
    module: String,
    name: String,
    twin_id: Option<TwinId>,
    doc: Option<String>,
}

impl FunctionBuilder {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            twin_id: None,
            doc: None,
        }
    }

    /// Twinterpreter in which the body executes.
    pub fn owner(mut self, twin_id: impl Into<String>) -> Self {
        self.twin_id = Some(twin_id.into());
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn register<F>(self, body: F) -> Result<Arc<FunctionSpec>>
    where
        F: Fn(&CallArgs) -> std::result::Result<Value, RemoteError> + Send + Sync + 'static,
    {
        if self.module.contains('\t') || self.name.contains('\t') {
            return Err(TwinError::Codec(format!(
                "function path {}::{} must not contain tabs",
                self.module, self.name
            )));
        }
        let spec = Arc::new(FunctionSpec {
            module: self.module,
            name: self.name,
            twin_id: self
                .twin_id
                .unwrap_or_else(|| state::master_id().to_string()),
            doc: self.doc,
            body: Box::new(body),
        });
        tracker::register_function(spec)
    }
}
