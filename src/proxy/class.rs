//! Twin-aware class descriptors.
//!
//! One [`ClassSpec`] per declaration plays the role both sibling classes
//! play in a dynamic runtime: in the owning twinterpreter it constructs
//! real instances through the registered constructor; in every other
//! process construction allocates a proxy shell and issues an
//! `instantiate` directive instead, and class-level attribute and method
//! access routes through the kernel so static class state stays
//! consistent across twins.

use crate::error::{RemoteError, Result, TwinError};
use crate::proxy::handle::{ProxyShell, TwinHandle};
use crate::proxy::object::{InstanceCell, TwinObject};
use crate::state::{self, TwinId};
use crate::tracker;
use crate::value::{CallArgs, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds a real instance from construction arguments. Runs only in the
/// owning twinterpreter.
pub type Constructor =
    Box<dyn Fn(&CallArgs) -> std::result::Result<Box<dyn TwinObject>, RemoteError> + Send + Sync>;

/// A method bound to the class rather than an instance.
pub type ClassMethod = Box<
    dyn Fn(&Arc<ClassSpec>, &CallArgs) -> std::result::Result<Value, RemoteError> + Send + Sync,
>;

/// A method that opts out of cross-process dispatch: it runs in the
/// calling process with the (possibly proxy) handle as its self value.
pub type LocalMethod =
    Box<dyn Fn(&TwinHandle, &CallArgs) -> std::result::Result<Value, RemoteError> + Send + Sync>;

/// Descriptor of a twin-aware class, registered under `(module, name)`.
pub struct ClassSpec {
    pub module: String,
    pub name: String,
    /// Twinterpreter owning all real instances of this class.
    pub twin_id: TwinId,
    pub doc: Option<String>,
    ctor: Constructor,
    class_methods: HashMap<String, ClassMethod>,
    local_methods: HashMap<String, LocalMethod>,
    /// Class-level attribute store; authoritative in the owning twin.
    statics: Mutex<HashMap<String, Value>>,
}

impl ClassSpec {
    /// Whether this process is the owning twinterpreter.
    pub fn is_owner(&self) -> bool {
        state::is_twinterpreter(&self.twin_id)
    }

    /// Construct an instance of this class.
    ///
    /// In the owning twin this runs the registered constructor and yields
    /// the real instance. Anywhere else it allocates a proxy shell and
    /// issues `instantiate` to the owner; the returned proxy is
    /// pre-counted by the owner's keep-alive table.
    pub fn instantiate(self: &Arc<Self>, args: &CallArgs) -> Result<TwinHandle> {
        if self.is_owner() {
            let cell = self.construct_local(args).map_err(TwinError::Remote)?;
            return Ok(TwinHandle::Real(cell));
        }
        let dispatcher = state::get_kernel(&self.twin_id)?;
        let instance_id = dispatcher.instantiate_class(self, args)?;
        debug!(
            class = %self.name,
            twin = %self.twin_id,
            instance = %instance_id,
            "instantiated remote instance"
        );
        let (handle, _created) = tracker::proxy_or_register(&self.twin_id, &instance_id, || {
            Arc::new(ProxyShell::new(self.clone(), &self.twin_id, &instance_id))
        });
        Ok(handle)
    }

    /// Run the constructor and register the real instance locally.
    pub(crate) fn construct_local(
        self: &Arc<Self>,
        args: &CallArgs,
    ) -> std::result::Result<Arc<InstanceCell>, RemoteError> {
        if !self.is_owner() {
            return Err(RemoteError::new(
                "TypeError",
                format!(
                    "class {}::{} is owned by twin '{}', not '{}'",
                    self.module,
                    self.name,
                    self.twin_id,
                    state::twin_id()
                ),
            ));
        }
        let object = (self.ctor)(args)?;
        let cell = InstanceCell::new(self.clone(), object);
        tracker::register_real(&cell);
        Ok(cell)
    }

    /// Materialize the proxy for a known remote instance.
    ///
    /// Used by the codec when rehydrating a reference that is not yet
    /// live here. Never reconstructs the remote object; a newly created
    /// proxy increments the remote reference count before it is handed
    /// out.
    pub(crate) fn proxy_from_parts(
        self: &Arc<Self>,
        twin_id: &str,
        instance_id: &str,
    ) -> Result<TwinHandle> {
        let (handle, created) = tracker::proxy_or_register(twin_id, instance_id, || {
            Arc::new(ProxyShell::new(self.clone(), twin_id, instance_id))
        });
        if created {
            let dispatcher = state::get_kernel(twin_id)?;
            if let Err(err) = dispatcher.increment_instance_ref(&handle) {
                tracker::forget_instance(twin_id, instance_id);
                return Err(err);
            }
        }
        Ok(handle)
    }

    pub(crate) fn local_method(&self, name: &str) -> Option<&LocalMethod> {
        self.local_methods.get(name)
    }

    /// Invoke a class-level method.
    pub fn call_class_method(self: &Arc<Self>, name: &str, args: &CallArgs) -> Result<Value> {
        if self.is_owner() {
            let method = self
                .class_methods
                .get(name)
                .ok_or_else(|| TwinError::Remote(RemoteError::no_method(&self.name, name)))?;
            return method(self, args).map_err(TwinError::Remote);
        }
        let dispatcher = state::get_kernel(&self.twin_id)?;
        dispatcher.dispatch_method_call(&Value::Class(self.clone()), name, args)
    }

    /// Read a class-level attribute.
    pub fn get_class_attribute(self: &Arc<Self>, name: &str) -> Result<Value> {
        if self.is_owner() {
            return self
                .statics
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| TwinError::Remote(RemoteError::attribute(&self.name, name)));
        }
        let dispatcher = state::get_kernel(&self.twin_id)?;
        dispatcher.get_attribute(&Value::Class(self.clone()), name)
    }

    /// Write a class-level attribute.
    pub fn set_class_attribute(self: &Arc<Self>, name: &str, value: Value) -> Result<()> {
        if self.is_owner() {
            self.statics.lock().insert(name.to_string(), value);
            return Ok(());
        }
        let dispatcher = state::get_kernel(&self.twin_id)?;
        dispatcher.set_attribute(&Value::Class(self.clone()), name, value)
    }

    /// Delete a class-level attribute.
    pub fn del_class_attribute(self: &Arc<Self>, name: &str) -> Result<()> {
        if self.is_owner() {
            return match self.statics.lock().remove(name) {
                Some(_) => Ok(()),
                None => Err(TwinError::Remote(RemoteError::attribute(&self.name, name))),
            };
        }
        let dispatcher = state::get_kernel(&self.twin_id)?;
        dispatcher.del_attribute(&Value::Class(self.clone()), name)
    }
}

impl fmt::Debug for ClassSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassSpec")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("twin_id", &self.twin_id)
            .finish()
    }
}

/// Fluent builder for twin-aware class declarations.
///
/// The owner defaults to the group master when neither the declaration
/// nor any shared registration code names one.
pub struct ClassBuilder {
    module: String,
    name: String,
    twin_id: Option<TwinId>,
    doc: Option<String>,
    ctor: Option<Constructor>,
    class_methods: HashMap<String, ClassMethod>,
    local_methods: HashMap<String, LocalMethod>,
    statics: HashMap<String, Value>,
}

impl ClassBuilder {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            twin_id: None,
            doc: None,
            ctor: None,
            class_methods: HashMap::new(),
            local_methods: HashMap::new(),
            statics: HashMap::new(),
        }
    }

    /// Twinterpreter that owns real instances of this class.
    pub fn owner(mut self, twin_id: impl Into<String>) -> Self {
        self.twin_id = Some(twin_id.into());
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn constructor<F>(mut self, ctor: F) -> Self
    where
        F: Fn(&CallArgs) -> std::result::Result<Box<dyn TwinObject>, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        self.ctor = Some(Box::new(ctor));
        self
    }

    pub fn class_method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&Arc<ClassSpec>, &CallArgs) -> std::result::Result<Value, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        self.class_methods.insert(name.into(), Box::new(method));
        self
    }

    /// Mark a method as local: it runs in the caller's process with the
    /// proxy as its self value.
    pub fn local_method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&TwinHandle, &CallArgs) -> std::result::Result<Value, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        self.local_methods.insert(name.into(), Box::new(method));
        self
    }

    /// Declare a class-level attribute with its initial value.
    pub fn static_attr(mut self, name: impl Into<String>, value: Value) -> Self {
        self.statics.insert(name.into(), value);
        self
    }

    /// Register the class; the same declaration may be registered from
    /// shared code in every process of the group.
    pub fn register(self) -> Result<Arc<ClassSpec>> {
        let module = self.module;
        let name = self.name;
        if module.contains('\t') || name.contains('\t') {
            return Err(TwinError::Codec(format!(
                "class path {module}::{name} must not contain tabs"
            )));
        }
        let ctor = self.ctor.unwrap_or_else(|| {
            let class_name = name.clone();
            Box::new(move |_args: &CallArgs| {
                Err(RemoteError::new(
                    "TypeError",
                    format!("class '{class_name}' has no constructor"),
                ))
            })
        });
        let spec = Arc::new(ClassSpec {
            module,
            name,
            twin_id: self
                .twin_id
                .unwrap_or_else(|| state::master_id().to_string()),
            doc: self.doc,
            ctor,
            class_methods: self.class_methods,
            local_methods: self.local_methods,
            statics: Mutex::new(self.statics),
        });
        tracker::register_class(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use parking_lot::Mutex as PlMutex;

    struct Tally {
        n: PlMutex<i64>,
    }

    impl TwinObject for Tally {
        fn call(
            &self,
            _this: &TwinHandle,
            method: &str,
            args: &CallArgs,
        ) -> std::result::Result<Value, RemoteError> {
            match method {
                "bump" => {
                    let by = args.arg_or_kwarg(0, "by", "bump")?.as_int()?;
                    let mut n = self.n.lock();
                    *n += by;
                    Ok(Value::Int(*n))
                }
                other => Err(RemoteError::no_method("Tally", other)),
            }
        }

        fn get_attribute(&self, name: &str) -> std::result::Result<Value, RemoteError> {
            match name {
                "n" => Ok(Value::Int(*self.n.lock())),
                other => Err(RemoteError::attribute("Tally", other)),
            }
        }

        fn set_attribute(&self, name: &str, value: Value) -> std::result::Result<(), RemoteError> {
            match name {
                "n" => {
                    *self.n.lock() = value.as_int()?;
                    Ok(())
                }
                other => Err(RemoteError::attribute("Tally", other)),
            }
        }
    }

    fn tally_class() -> Arc<ClassSpec> {
        // Owned by this process so construction stays local under test.
        ClassBuilder::new("class_tests", "Tally")
            .owner(state::twin_id())
            .doc("running total")
            .constructor(|args| {
                let start = match args.args.first() {
                    Some(v) => v.as_int()?,
                    None => 0,
                };
                Ok(Box::new(Tally {
                    n: PlMutex::new(start),
                }))
            })
            .class_method("describe", |cls, _args| {
                Ok(Value::Str(format!("{}::{}", cls.module, cls.name)))
            })
            .static_attr("flavor", Value::Str("plain".into()))
            .register()
            .unwrap()
    }

    #[test]
    fn owner_constructs_real_instances() {
        let class = tally_class();
        let handle = class
            .instantiate(&CallArgs::positional(vec![Value::Int(5)]))
            .unwrap();
        assert!(!handle.is_proxy());
        assert_eq!(handle.get("n").unwrap(), Value::Int(5));
        assert_eq!(
            handle
                .call("bump", &CallArgs::positional(vec![Value::Int(3)]))
                .unwrap(),
            Value::Int(8)
        );
        assert_eq!(handle.get("n").unwrap(), Value::Int(8));
    }

    #[test]
    fn class_methods_and_statics_resolve_locally_for_owner() {
        let class = tally_class();
        assert_eq!(
            class.call_class_method("describe", &CallArgs::none()).unwrap(),
            Value::Str("class_tests::Tally".into())
        );
        assert_eq!(
            class.get_class_attribute("flavor").unwrap(),
            Value::Str("plain".into())
        );
        class
            .set_class_attribute("flavor", Value::Str("salted".into()))
            .unwrap();
        assert_eq!(
            class.get_class_attribute("flavor").unwrap(),
            Value::Str("salted".into())
        );
        class.del_class_attribute("flavor").unwrap();
        assert!(class.get_class_attribute("flavor").is_err());
    }

    #[test]
    fn sibling_metadata_is_shared() {
        let class = tally_class();
        // Real and proxy roles observe the same descriptor.
        assert_eq!(class.doc.as_deref(), Some("running total"));
        assert_eq!(class.twin_id, state::twin_id());
    }

    #[test]
    fn tabs_in_class_path_are_rejected() {
        let result = ClassBuilder::new("bad\tmodule", "X").register();
        assert!(result.is_err());
    }
}
