//! Metaobjects: reflective descriptions of an object's methods, signals,
//! and properties.
//!
//! Uids for all three kinds are drawn from one shared counter starting at
//! [`MetaObject::USER_ACTION_START`]; the range below it is reserved for
//! built-in actions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::{DecodeError, Type, Value};

/// A callable method descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaMethod {
    pub uid: u32,
    pub name: String,
    pub return_signature: Type,
    /// Always a tuple.
    pub parameters_signature: Type,
    pub description: String,
}

impl MetaMethod {
    /// Name qualified with the parameter signature, e.g. `echo::(s)`.
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.name, self.parameters_signature)
    }
}

/// A signal descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaSignal {
    pub uid: u32,
    pub name: String,
    /// Always a tuple of the emitted argument types.
    pub signature: Type,
}

/// A property descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaProperty {
    pub uid: u32,
    pub name: String,
    pub signature: Type,
}

/// The method/signal/property tables of one object, shared-immutable once
/// published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaObject {
    methods: BTreeMap<u32, MetaMethod>,
    signals: BTreeMap<u32, MetaSignal>,
    properties: BTreeMap<u32, MetaProperty>,
    description: String,
    method_full_names: HashMap<String, u32>,
    method_names: HashMap<String, Vec<u32>>,
    signal_names: HashMap<String, u32>,
    property_names: HashMap<String, u32>,
}

impl MetaObject {
    /// First uid available to user-defined actions; everything below is a
    /// built-in.
    pub const USER_ACTION_START: u32 = 100;

    /// Wire shape: three uid-keyed descriptor maps plus a description.
    pub const SIGNATURE: &'static str = "({I(Issss)}{I(Iss)}{I(Iss)}s)";

    pub fn builder() -> MetaObjectBuilder {
        MetaObjectBuilder::new()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn method(&self, uid: u32) -> Option<&MetaMethod> {
        self.methods.get(&uid)
    }

    pub fn signal(&self, uid: u32) -> Option<&MetaSignal> {
        self.signals.get(&uid)
    }

    pub fn property(&self, uid: u32) -> Option<&MetaProperty> {
        self.properties.get(&uid)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MetaMethod> {
        self.methods.values()
    }

    pub fn signals(&self) -> impl Iterator<Item = &MetaSignal> {
        self.signals.values()
    }

    pub fn properties(&self) -> impl Iterator<Item = &MetaProperty> {
        self.properties.values()
    }

    /// Resolve a method by `name::(signature)` or bare name. With a bare
    /// name, overloads are disambiguated against `args`; an unresolvable
    /// ambiguity yields `None`.
    pub fn method_uid(&self, name: &str, args: Option<&[Value]>) -> Option<u32> {
        if name.contains("::") {
            return self.method_full_names.get(name).copied();
        }
        let candidates = self.method_names.get(name)?;
        match candidates.as_slice() {
            [single] => Some(*single),
            many => {
                let args = args?;
                many.iter()
                    .copied()
                    .find(|uid| self.methods[uid].accepts(args))
            }
        }
    }

    pub fn signal_uid(&self, name: &str) -> Option<u32> {
        self.signal_names.get(name).copied()
    }

    pub fn property_uid(&self, name: &str) -> Option<u32> {
        self.property_names.get(name).copied()
    }

    /// Encode into the wire value described by [`Self::SIGNATURE`].
    pub fn to_value(&self) -> Value {
        let methods = self
            .methods
            .values()
            .map(|m| {
                (
                    Value::UInt32(m.uid),
                    Value::Tuple(vec![
                        Value::UInt32(m.uid),
                        Value::String(m.name.clone()),
                        Value::String(m.return_signature.to_string()),
                        Value::String(m.parameters_signature.to_string()),
                        Value::String(m.description.clone()),
                    ]),
                )
            })
            .collect();
        let signals = self
            .signals
            .values()
            .map(|s| {
                (
                    Value::UInt32(s.uid),
                    Value::Tuple(vec![
                        Value::UInt32(s.uid),
                        Value::String(s.name.clone()),
                        Value::String(s.signature.to_string()),
                    ]),
                )
            })
            .collect();
        let properties = self
            .properties
            .values()
            .map(|p| {
                (
                    Value::UInt32(p.uid),
                    Value::Tuple(vec![
                        Value::UInt32(p.uid),
                        Value::String(p.name.clone()),
                        Value::String(p.signature.to_string()),
                    ]),
                )
            })
            .collect();
        Value::Tuple(vec![
            Value::Map(methods),
            Value::Map(signals),
            Value::Map(properties),
            Value::String(self.description.clone()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<MetaObject, DecodeError> {
        let mismatch = || DecodeError::TypeMismatch {
            expected: Self::SIGNATURE.to_owned(),
            found: value.signature().to_string(),
        };
        let fields = value.as_tuple().ok_or_else(mismatch)?;
        let [methods, signals, properties, description] = fields else {
            return Err(mismatch());
        };

        let mut builder = MetaObjectBuilder::new();
        builder = builder.description(description.as_str().ok_or_else(mismatch)?);

        let entries = |v: &Value| -> Result<Vec<Vec<Value>>, DecodeError> {
            match v {
                Value::Map(entries) => entries
                    .iter()
                    .map(|(_, v)| v.as_tuple().map(<[Value]>::to_vec).ok_or_else(mismatch))
                    .collect(),
                _ => Err(mismatch()),
            }
        };

        for m in entries(methods)? {
            let [uid, name, ret, params, desc] = m.as_slice() else {
                return Err(mismatch());
            };
            builder = builder.method_with_uid(
                uid.as_u32().ok_or_else(mismatch)?,
                name.as_str().ok_or_else(mismatch)?,
                &Type::from_str(params.as_str().ok_or_else(mismatch)?)?,
                &Type::from_str(ret.as_str().ok_or_else(mismatch)?)?,
                desc.as_str().ok_or_else(mismatch)?,
            );
        }
        for s in entries(signals)? {
            let [uid, name, sig] = s.as_slice() else {
                return Err(mismatch());
            };
            builder = builder.signal_with_uid(
                uid.as_u32().ok_or_else(mismatch)?,
                name.as_str().ok_or_else(mismatch)?,
                &Type::from_str(sig.as_str().ok_or_else(mismatch)?)?,
            );
        }
        for p in entries(properties)? {
            let [uid, name, sig] = p.as_slice() else {
                return Err(mismatch());
            };
            builder = builder.property_with_uid(
                uid.as_u32().ok_or_else(mismatch)?,
                name.as_str().ok_or_else(mismatch)?,
                &Type::from_str(sig.as_str().ok_or_else(mismatch)?)?,
            );
        }
        Ok(builder.build())
    }
}

impl MetaMethod {
    /// Whether the given argument values are acceptable for this method.
    fn accepts(&self, args: &[Value]) -> bool {
        let Type::Tuple(params) = &self.parameters_signature else {
            return false;
        };
        params.len() == args.len()
            && params.iter().zip(args).all(|(ty, v)| compatible(ty, v))
    }
}

/// Structural compatibility between a declared type and a concrete value.
fn compatible(ty: &Type, value: &Value) -> bool {
    match (ty, value) {
        (Type::Dynamic, _) => true,
        (_, Value::Dynamic(inner)) => compatible(ty, inner),
        (Type::List(elem), Value::List(items)) => items.iter().all(|v| compatible(elem, v)),
        (Type::Map(k, v), Value::Map(entries)) => entries
            .iter()
            .all(|(key, val)| compatible(k, key) && compatible(v, val)),
        (Type::Tuple(tys), Value::Tuple(vals)) => {
            tys.len() == vals.len() && tys.iter().zip(vals).all(|(t, v)| compatible(t, v))
        }
        (Type::Object, Value::Object(_)) => true,
        (ty, value) => *ty == value.signature(),
    }
}

impl fmt::Display for MetaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "metaobject {{")?;
        for m in self.methods.values() {
            writeln!(
                f,
                "  {:>4} {} {} -> {}",
                m.uid, m.name, m.parameters_signature, m.return_signature
            )?;
        }
        for s in self.signals.values() {
            writeln!(f, "  {:>4} signal {} {}", s.uid, s.name, s.signature)?;
        }
        for p in self.properties.values() {
            writeln!(f, "  {:>4} property {} {}", p.uid, p.name, p.signature)?;
        }
        write!(f, "}}")
    }
}

/// Builds a [`MetaObject`], assigning dense uids from a shared counter.
#[derive(Debug)]
pub struct MetaObjectBuilder {
    meta: MetaObject,
    next_uid: u32,
}

impl Default for MetaObjectBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaObjectBuilder {
    pub fn new() -> Self {
        Self {
            meta: MetaObject::default(),
            next_uid: MetaObject::USER_ACTION_START,
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.meta.description = description.to_owned();
        self
    }

    pub fn method(mut self, name: &str, params: &Type, ret: &Type, description: &str) -> Self {
        let uid = self.next_uid;
        self.method_mut(uid, name, params, ret, description);
        self
    }

    pub fn method_with_uid(
        mut self,
        uid: u32,
        name: &str,
        params: &Type,
        ret: &Type,
        description: &str,
    ) -> Self {
        self.method_mut(uid, name, params, ret, description);
        self
    }

    pub fn signal(mut self, name: &str, signature: &Type) -> Self {
        let uid = self.next_uid;
        self.signal_mut(uid, name, signature);
        self
    }

    pub fn signal_with_uid(mut self, uid: u32, name: &str, signature: &Type) -> Self {
        self.signal_mut(uid, name, signature);
        self
    }

    pub fn property(mut self, name: &str, signature: &Type) -> Self {
        let uid = self.next_uid;
        self.property_mut(uid, name, signature);
        self
    }

    pub fn property_with_uid(mut self, uid: u32, name: &str, signature: &Type) -> Self {
        self.property_mut(uid, name, signature);
        self
    }

    /// Uid that the next auto-assigned descriptor will receive.
    pub fn next_uid(&self) -> u32 {
        self.next_uid
    }

    pub fn build(self) -> MetaObject {
        self.meta
    }

    fn bump(&mut self, uid: u32) {
        self.next_uid = self.next_uid.max(uid + 1);
    }

    fn method_mut(&mut self, uid: u32, name: &str, params: &Type, ret: &Type, description: &str) {
        self.bump(uid);
        let method = MetaMethod {
            uid,
            name: name.to_owned(),
            return_signature: ret.clone(),
            parameters_signature: params.clone(),
            description: description.to_owned(),
        };
        self.meta.method_full_names.insert(method.full_name(), uid);
        self.meta
            .method_names
            .entry(method.name.clone())
            .or_default()
            .push(uid);
        self.meta.methods.insert(uid, method);
    }

    fn signal_mut(&mut self, uid: u32, name: &str, signature: &Type) {
        self.bump(uid);
        self.meta.signal_names.insert(name.to_owned(), uid);
        self.meta.signals.insert(
            uid,
            MetaSignal {
                uid,
                name: name.to_owned(),
                signature: signature.clone(),
            },
        );
    }

    fn property_mut(&mut self, uid: u32, name: &str, signature: &Type) {
        self.bump(uid);
        self.meta.property_names.insert(name.to_owned(), uid);
        self.meta.properties.insert(
            uid,
            MetaProperty {
                uid,
                name: name.to_owned(),
                signature: signature.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetaObject {
        MetaObject::builder()
            .description("test object")
            .method(
                "echo",
                &Type::parse("(s)").unwrap(),
                &Type::String,
                "echo a string",
            )
            .method("add", &Type::parse("(ii)").unwrap(), &Type::Int32, "")
            .method("add", &Type::parse("(dd)").unwrap(), &Type::Double, "")
            .signal("tick", &Type::parse("(i)").unwrap())
            .property("volume", &Type::Int32)
            .build()
    }

    #[test]
    fn uids_are_dense_and_shared() {
        let meta = sample();
        let uids: Vec<u32> = meta
            .methods()
            .map(|m| m.uid)
            .chain(meta.signals().map(|s| s.uid))
            .chain(meta.properties().map(|p| p.uid))
            .collect();
        assert_eq!(uids, vec![100, 101, 102, 103, 104]);
    }

    #[test]
    fn resolve_by_full_name_and_bare_name() {
        let meta = sample();
        assert_eq!(meta.method_uid("echo::(s)", None), Some(100));
        assert_eq!(meta.method_uid("echo", None), Some(100));
        assert_eq!(meta.method_uid("missing", None), None);
    }

    #[test]
    fn resolve_overload_by_arguments() {
        let meta = sample();
        assert_eq!(meta.method_uid("add", None), None);
        assert_eq!(
            meta.method_uid("add", Some(&[Value::Int32(1), Value::Int32(2)])),
            Some(101)
        );
        assert_eq!(
            meta.method_uid("add", Some(&[Value::Double(1.0), Value::Double(2.0)])),
            Some(102)
        );
    }

    #[test]
    fn wire_roundtrip() {
        let meta = sample();
        let decoded = MetaObject::from_value(&meta.to_value()).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.method_uid("echo::(s)", None), Some(100));
        assert_eq!(decoded.signal_uid("tick"), Some(103));
        assert_eq!(decoded.property_uid("volume"), Some(104));
    }
}
