//! Real-instance side of the object model: the capability trait twin
//! objects implement, and the cell that binds an implementation to its
//! wire identity.

use crate::error::RemoteError;
use crate::proxy::class::ClassSpec;
use crate::proxy::handle::TwinHandle;
use crate::tracker::InstanceId;
use crate::value::{CallArgs, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Capability set of a twin-aware object: invoke a method by name and
/// read, write, or delete an attribute by name.
///
/// Methods take `&self`; implementations own their interior mutability
/// and must keep internal locks scoped to actual state access, never
/// held across a nested kernel dispatch. That discipline is what allows
/// call chains to bounce between twinterpreters and re-enter the same
/// object.
///
/// `this` is the handle under which the object is being addressed; it is
/// what a method passes along when it hands *itself* to another twin.
pub trait TwinObject: Send + Sync {
    fn call(&self, this: &TwinHandle, method: &str, args: &CallArgs)
        -> Result<Value, RemoteError>;

    fn get_attribute(&self, name: &str) -> Result<Value, RemoteError>;

    fn set_attribute(&self, name: &str, value: Value) -> Result<(), RemoteError>;

    /// Most objects have a fixed attribute set; deletion is opt-in.
    fn del_attribute(&self, name: &str) -> Result<(), RemoteError> {
        Err(RemoteError::new(
            "AttributeError",
            format!("attribute '{name}' cannot be deleted"),
        ))
    }
}

/// A real instance: the behavior implementation plus its process-unique
/// identity and class descriptor. Lives in the owning twinterpreter only.
pub struct InstanceCell {
    pub instance_id: InstanceId,
    pub class: Arc<ClassSpec>,
    pub object: Box<dyn TwinObject>,
}

impl InstanceCell {
    pub fn new(class: Arc<ClassSpec>, object: Box<dyn TwinObject>) -> Arc<Self> {
        let instance_id = new_instance_id(object.as_ref() as *const dyn TwinObject as *const () as usize);
        Arc::new(Self {
            instance_id,
            class,
            object,
        })
    }

    /// Owning twin of this instance; real instances only exist there.
    pub fn twin_id(&self) -> &str {
        &self.class.twin_id
    }
}

impl fmt::Debug for InstanceCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}::{} instance {}>",
            self.class.module, self.class.name, self.instance_id
        )
    }
}

/// Create an instance identifier from the object address and the current
/// time, unique for the object's lifetime and across reuse of its
/// allocation within this process.
fn new_instance_id(addr: usize) -> InstanceId {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{addr:X}-{nanos:X}")
}
