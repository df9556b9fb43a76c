//! # Dynamic Value Model
//!
//! Twinterpreters exchange loosely typed values: scalars, collections, and
//! live handles to twin objects, classes, and functions. [`Value`] is the
//! in-process representation; the codec lowers it to an inert wire form
//! (substituting handles with cross-process references) before anything
//! touches a channel.
//!
//! Handles inside a [`Value`] are cheap reference-counted clones. Dropping
//! the last clone of a proxy handle releases the remote reference.

use crate::error::RemoteError;
use crate::proxy::class::ClassSpec;
use crate::proxy::func::FunctionSpec;
use crate::proxy::handle::TwinHandle;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value passing between twinterpreters or stored on a twin object.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Live twin object: either a local real instance or a proxy.
    Object(TwinHandle),
    /// A registered twin-aware class.
    Class(Arc<ClassSpec>),
    /// A registered twin-aware function.
    Function(Arc<FunctionSpec>),
}

impl Value {
    /// Short tag for diagnostics and type errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Class(_) => "class",
            Value::Function(_) => "function",
        }
    }

    pub fn as_int(&self) -> Result<i64, RemoteError> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(RemoteError::bad_arguments(
                "int",
                format!("expected int, got {}", other.type_name()),
            )),
        }
    }

    pub fn as_str(&self) -> Result<&str, RemoteError> {
        match self {
            Value::Str(v) => Ok(v),
            other => Err(RemoteError::bad_arguments(
                "str",
                format!("expected str, got {}", other.type_name()),
            )),
        }
    }

    pub fn as_bool(&self) -> Result<bool, RemoteError> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(RemoteError::bad_arguments(
                "bool",
                format!("expected bool, got {}", other.type_name()),
            )),
        }
    }

    pub fn as_object(&self) -> Result<&TwinHandle, RemoteError> {
        match self {
            Value::Object(h) => Ok(h),
            other => Err(RemoteError::bad_arguments(
                "object",
                format!("expected twin object, got {}", other.type_name()),
            )),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Str(v) => write!(f, "Str({v:?})"),
            Value::Bytes(v) => write!(f, "Bytes(len={})", v.len()),
            Value::List(v) => f.debug_tuple("List").field(v).finish(),
            Value::Map(v) => f.debug_tuple("Map").field(v).finish(),
            Value::Object(h) => write!(f, "Object({h:?})"),
            Value::Class(c) => write!(f, "Class({}::{})", c.module, c.name),
            Value::Function(c) => write!(f, "Function({}::{})", c.module, c.name),
        }
    }
}

/// Structural equality; handles compare by wire identity, classes and
/// functions by their registry key.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => {
                a.twin_id() == b.twin_id() && a.instance_id() == b.instance_id()
            }
            (Value::Class(a), Value::Class(b)) => a.module == b.module && a.name == b.name,
            (Value::Function(a), Value::Function(b)) => a.module == b.module && a.name == b.name,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<TwinHandle> for Value {
    fn from(v: TwinHandle) -> Self {
        Value::Object(v)
    }
}

/// Positional and keyword arguments for calls, construction, and
/// function dispatch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    /// No arguments at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Positional arguments only.
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    /// Fetch a required positional argument.
    pub fn arg(&self, index: usize, target: &str) -> Result<&Value, RemoteError> {
        self.args.get(index).ok_or_else(|| {
            RemoteError::bad_arguments(
                target,
                format!("missing positional argument {index} (got {})", self.args.len()),
            )
        })
    }

    /// Fetch positional argument `index`, falling back to keyword `name`.
    pub fn arg_or_kwarg(&self, index: usize, name: &str, target: &str) -> Result<&Value, RemoteError> {
        if let Some(v) = self.args.get(index) {
            return Ok(v);
        }
        self.kwargs.get(name).ok_or_else(|| {
            RemoteError::bad_arguments(target, format!("missing argument '{name}'"))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_conversions() {
        assert_eq!(Value::from(3), Value::Int(3));
        assert_eq!(Value::from("hi"), Value::Str("hi".into()));
        assert_eq!(Value::from(true), Value::Bool(true));
        assert!(Value::Null.is_null());
    }

    #[test]
    fn extraction_reports_actual_type() {
        let err = Value::Str("x".into()).as_int().unwrap_err();
        assert_eq!(err.exc_type, "TypeError");
        assert!(err.message.contains("str"));
    }

    #[test]
    fn arg_or_kwarg_prefers_positional() {
        let args = CallArgs::positional(vec![Value::Int(1)]).with_kwarg("n", Value::Int(2));
        assert_eq!(args.arg_or_kwarg(0, "n", "play").unwrap(), &Value::Int(1));
        assert_eq!(args.arg_or_kwarg(1, "n", "play").unwrap(), &Value::Int(2));
        assert!(args.arg_or_kwarg(1, "missing", "play").is_err());
    }
}
