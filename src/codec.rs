//! # Identity-Preserving Wire Codec
//!
//! Values are lowered to an inert wire form before framing and raised
//! back on receipt. The interesting part is identity persistence: a live
//! twin object never crosses the channel. Lowering substitutes it with
//! the compact cross-process reference string
//!
//! ```text
//! instance_id \t twin_id \t module_name \t class_name
//! ```
//!
//! and raising resolves that reference against the active-instance
//! registry. A hit returns the live local instance or proxy (the same
//! physical object every time); a miss materializes a fresh proxy from
//! the registered class, incrementing the owner's reference count.
//! Classes and functions cross as registry keys rather than references.
//!
//! Frames themselves are bincode-encoded. A single integer codec
//! protocol is negotiated at startup as the minimum supported by both
//! interpreter processes; the master probes the twin executable before
//! spawning it.

use crate::error::{RemoteError, Result, TwinError};
use crate::protocol::{Frame, WireArgs, WireValue};
use crate::state;
use crate::tracker;
use crate::value::{CallArgs, Value};
use std::collections::BTreeMap;

/// Highest codec protocol this build understands.
pub const CODEC_PROTOCOL: u8 = 1;

/// Wire codec bound to a negotiated protocol number. One instance per
/// channel direction; both kernel sides of a pair carry their own.
#[derive(Clone, Copy, Debug)]
pub struct Codec {
    protocol: u8,
}

impl Codec {
    /// Create a codec for a negotiated protocol.
    pub fn new(protocol: u8) -> Result<Self> {
        if protocol == 0 || protocol > CODEC_PROTOCOL {
            return Err(TwinError::Codec(format!(
                "unsupported codec protocol {protocol} (this build supports 1..={CODEC_PROTOCOL})"
            )));
        }
        Ok(Self { protocol })
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Serialize one frame for the channel.
    pub fn dump_frame(&self, frame: &Frame) -> Result<Vec<u8>> {
        bincode::serialize(frame).map_err(|e| TwinError::Codec(format!("encode frame: {e}")))
    }

    /// Deserialize one frame from the channel. Failure here is an
    /// internal protocol error, fatal to the receiving kernel.
    pub fn load_frame(&self, bytes: &[u8]) -> Result<Frame> {
        bincode::deserialize(bytes).map_err(|e| TwinError::Protocol(format!("decode frame: {e}")))
    }

    /// Lower a value into its wire form, substituting live handles with
    /// cross-process references.
    pub fn lower(&self, value: &Value) -> Result<WireValue> {
        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Bool(v) => WireValue::Bool(*v),
            Value::Int(v) => WireValue::Int(*v),
            Value::Float(v) => WireValue::Float(*v),
            Value::Str(v) => WireValue::Str(v.clone()),
            Value::Bytes(v) => WireValue::Bytes(v.clone()),
            Value::List(items) => WireValue::List(
                items
                    .iter()
                    .map(|item| self.lower(item))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Map(map) => {
                let mut lowered = BTreeMap::new();
                for (key, item) in map {
                    lowered.insert(key.clone(), self.lower(item)?);
                }
                WireValue::Map(lowered)
            }
            Value::Object(handle) => {
                let (instance_id, twin_id, module, class_name) = handle.reference();
                WireValue::Ref(make_reference(instance_id, twin_id, module, class_name)?)
            }
            Value::Class(spec) => WireValue::Class(spec.module.clone(), spec.name.clone()),
            Value::Function(spec) => WireValue::Func(spec.module.clone(), spec.name.clone()),
        })
    }

    /// Raise a wire value back into a live value, rehydrating references.
    ///
    /// Reference resolution failures surface as payload-level lookup
    /// errors; a reference to an instance of this very process that is no
    /// longer tracked means the object has been collected.
    pub fn raise(&self, value: WireValue) -> Result<Value> {
        Ok(match value {
            WireValue::Null => Value::Null,
            WireValue::Bool(v) => Value::Bool(v),
            WireValue::Int(v) => Value::Int(v),
            WireValue::Float(v) => Value::Float(v),
            WireValue::Str(v) => Value::Str(v),
            WireValue::Bytes(v) => Value::Bytes(v),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| self.raise(item))
                    .collect::<Result<Vec<_>>>()?,
            ),
            WireValue::Map(map) => {
                let mut raised = BTreeMap::new();
                for (key, item) in map {
                    raised.insert(key, self.raise(item)?);
                }
                Value::Map(raised)
            }
            WireValue::Ref(reference) => Value::Object(self.resolve_reference(&reference)?),
            WireValue::Class(module, name) => {
                let spec = tracker::lookup_class(&module, &name).ok_or_else(|| {
                    TwinError::Remote(RemoteError::lookup(format!(
                        "class {module}::{name} is not registered in twin '{}'",
                        state::twin_id()
                    )))
                })?;
                Value::Class(spec)
            }
            WireValue::Func(module, name) => {
                let spec = tracker::lookup_function(&module, &name).ok_or_else(|| {
                    TwinError::Remote(RemoteError::lookup(format!(
                        "function {module}::{name} is not registered in twin '{}'",
                        state::twin_id()
                    )))
                })?;
                Value::Function(spec)
            }
        })
    }

    fn resolve_reference(&self, reference: &str) -> Result<crate::proxy::handle::TwinHandle> {
        let (instance_id, twin_id, module, class_name) = parse_reference(reference)?;
        if let Some(handle) = tracker::lookup_instance(twin_id, instance_id) {
            return Ok(handle);
        }
        if state::is_twinterpreter(twin_id) {
            // The real object lived here but is gone: nothing to proxy.
            return Err(TwinError::Remote(RemoteError::lookup(format!(
                "instance {instance_id} of {module}::{class_name} no longer resides in twin '{twin_id}'"
            ))));
        }
        let spec = tracker::lookup_class(module, class_name).ok_or_else(|| {
            TwinError::Remote(RemoteError::lookup(format!(
                "class {module}::{class_name} is not registered in twin '{}'",
                state::twin_id()
            )))
        })?;
        spec.proxy_from_parts(twin_id, instance_id)
    }

    /// Lower a call-argument bundle.
    pub fn lower_args(&self, args: &CallArgs) -> Result<WireArgs> {
        let mut kwargs = BTreeMap::new();
        for (key, value) in &args.kwargs {
            kwargs.insert(key.clone(), self.lower(value)?);
        }
        Ok(WireArgs {
            args: args
                .args
                .iter()
                .map(|v| self.lower(v))
                .collect::<Result<Vec<_>>>()?,
            kwargs,
        })
    }

    /// Raise a call-argument bundle.
    pub fn raise_args(&self, args: WireArgs) -> Result<CallArgs> {
        let mut kwargs = BTreeMap::new();
        for (key, value) in args.kwargs {
            kwargs.insert(key, self.raise(value)?);
        }
        Ok(CallArgs {
            args: args
                .args
                .into_iter()
                .map(|v| self.raise(v))
                .collect::<Result<Vec<_>>>()?,
            kwargs,
        })
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            protocol: CODEC_PROTOCOL,
        }
    }
}

/// Build the tab-separated reference string. Tabs are forbidden in every
/// constituent field.
pub fn make_reference(
    instance_id: &str,
    twin_id: &str,
    module: &str,
    class_name: &str,
) -> Result<String> {
    for field in [instance_id, twin_id, module, class_name] {
        if field.contains('\t') {
            return Err(TwinError::Codec(format!(
                "reference field {field:?} contains a tab"
            )));
        }
    }
    Ok(format!("{instance_id}\t{twin_id}\t{module}\t{class_name}"))
}

/// Split a reference string into `(instance_id, twin_id, module, class)`.
pub fn parse_reference(reference: &str) -> Result<(&str, &str, &str, &str)> {
    let mut parts = reference.split('\t');
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(instance_id), Some(twin_id), Some(module), Some(class_name), None) => {
            Ok((instance_id, twin_id, module, class_name))
        }
        _ => Err(TwinError::Protocol(format!(
            "malformed object reference {reference:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::class::ClassBuilder;
    use crate::proxy::handle::TwinHandle;
    use crate::value::CallArgs;

    #[test]
    fn reference_string_round_trip() {
        let reference = make_reference("1A2B-FF", "pypy", "demo", "Counter").unwrap();
        assert_eq!(reference, "1A2B-FF\tpypy\tdemo\tCounter");
        let (instance_id, twin_id, module, class_name) = parse_reference(&reference).unwrap();
        assert_eq!(instance_id, "1A2B-FF");
        assert_eq!(twin_id, "pypy");
        assert_eq!(module, "demo");
        assert_eq!(class_name, "Counter");
    }

    #[test]
    fn tabs_in_reference_fields_are_rejected() {
        assert!(make_reference("a\tb", "t", "m", "C").is_err());
        assert!(parse_reference("only\tthree\tfields").is_err());
        assert!(parse_reference("one\ttoo\tmany\tfields\there").is_err());
    }

    #[test]
    fn unsupported_protocol_is_rejected() {
        assert!(Codec::new(0).is_err());
        assert!(Codec::new(CODEC_PROTOCOL + 1).is_err());
        assert_eq!(Codec::new(1).unwrap().protocol(), 1);
    }

    #[test]
    fn scalars_round_trip() {
        let codec = Codec::default();
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-40),
            Value::Float(2.5),
            Value::Str("twin".into()),
            Value::Bytes(vec![0, 1, 2]),
            Value::List(vec![Value::Int(1), Value::Str("x".into())]),
        ] {
            let wire = codec.lower(&value).unwrap();
            assert_eq!(codec.raise(wire).unwrap(), value);
        }
    }

    #[test]
    fn local_real_instances_rehydrate_to_themselves() {
        let class = ClassBuilder::new("codec_tests", "Held")
            .owner(crate::state::twin_id())
            .constructor(|_args| {
                Ok(Box::new(crate::fixtures::Blackboard::default())
                    as Box<dyn crate::proxy::object::TwinObject>)
            })
            .register()
            .unwrap();
        let handle = class.instantiate(&CallArgs::none()).unwrap();

        let codec = Codec::default();
        let wire = codec.lower(&Value::Object(handle.clone())).unwrap();
        let raised = codec.raise(wire).unwrap();
        match raised {
            Value::Object(TwinHandle::Real(cell)) => {
                assert_eq!(cell.instance_id, handle.instance_id())
            }
            other => panic!("expected the live real instance, got {other:?}"),
        }
    }

    #[test]
    fn collected_local_instances_raise_lookup_errors() {
        let class = ClassBuilder::new("codec_tests", "Gone")
            .owner(crate::state::twin_id())
            .constructor(|_args| {
                Ok(Box::new(crate::fixtures::Blackboard::default())
                    as Box<dyn crate::proxy::object::TwinObject>)
            })
            .register()
            .unwrap();
        let handle = class.instantiate(&CallArgs::none()).unwrap();
        let codec = Codec::default();
        let wire = codec.lower(&Value::Object(handle.clone())).unwrap();
        drop(handle);

        match codec.raise(wire) {
            Err(TwinError::Remote(err)) => assert_eq!(err.exc_type, "LookupError"),
            other => panic!("expected lookup error, got {other:?}"),
        }
    }

    #[test]
    fn classes_and_functions_cross_as_registry_keys() {
        let class = ClassBuilder::new("codec_tests", "Keyed")
            .owner("faraway")
            .register()
            .unwrap();
        let codec = Codec::default();
        let wire = codec.lower(&Value::Class(class.clone())).unwrap();
        assert_eq!(wire, WireValue::Class("codec_tests".into(), "Keyed".into()));
        match codec.raise(wire).unwrap() {
            Value::Class(spec) => assert_eq!(spec.twin_id, "faraway"),
            other => panic!("expected class, got {other:?}"),
        }
    }
}
