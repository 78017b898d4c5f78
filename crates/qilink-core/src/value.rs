//! Dynamic values.

use bytes::Bytes;

use crate::{MetaObject, Type};

/// A reference to an object travelling inside a payload. The receiver
/// materialises a proxy bound to the socket the reference arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectReference {
    pub meta: MetaObject,
    pub service: u32,
    pub object: u32,
}

/// A dynamically typed value, the unit the codec reads and writes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    Int8(i8),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Raw(Bytes),
    List(Vec<Value>),
    /// Insertion-ordered; the codec writes entries in this order.
    Map(Vec<(Value, Value)>),
    Tuple(Vec<Value>),
    Dynamic(Box<Value>),
    Object(ObjectReference),
}

impl Value {
    /// Infer the signature of this value. Empty containers infer dynamic
    /// element types.
    pub fn signature(&self) -> Type {
        match self {
            Value::Void => Type::Void,
            Value::Bool(_) => Type::Bool,
            Value::Int8(_) => Type::Int8,
            Value::Int32(_) => Type::Int32,
            Value::UInt32(_) => Type::UInt32,
            Value::Int64(_) => Type::Int64,
            Value::Float(_) => Type::Float,
            Value::Double(_) => Type::Double,
            Value::String(_) => Type::String,
            Value::Raw(_) => Type::Raw,
            Value::List(elems) => Type::List(Box::new(
                elems.first().map(Value::signature).unwrap_or(Type::Dynamic),
            )),
            Value::Map(entries) => match entries.first() {
                Some((k, v)) => Type::Map(Box::new(k.signature()), Box::new(v.signature())),
                None => Type::Map(Box::new(Type::Dynamic), Box::new(Type::Dynamic)),
            },
            Value::Tuple(elems) => Type::Tuple(elems.iter().map(Value::signature).collect()),
            Value::Dynamic(_) => Type::Dynamic,
            Value::Object(_) => Type::Object,
        }
    }

    /// Unwrap dynamic layers.
    pub fn into_inner(self) -> Value {
        match self {
            Value::Dynamic(inner) => inner.into_inner(),
            other => other,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Dynamic(inner) => inner.as_str(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            Value::Dynamic(inner) => inner.as_u32(),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            Value::Dynamic(inner) => inner.as_i32(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Dynamic(inner) => inner.as_i64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Dynamic(inner) => inner.as_bool(),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(elems) => Some(elems),
            Value::Dynamic(inner) => inner.as_tuple(),
            _ => None,
        }
    }

    pub fn into_tuple(self) -> Option<Vec<Value>> {
        match self {
            Value::Tuple(elems) => Some(elems),
            Value::Dynamic(inner) => inner.into_tuple(),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectReference> {
        match self {
            Value::Object(r) => Some(r),
            Value::Dynamic(inner) => inner.as_object(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Int8(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Raw(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_inference() {
        assert_eq!(Value::from(3i32).signature(), Type::Int32);
        assert_eq!(
            Value::List(vec![Value::from("a"), Value::from("b")]).signature(),
            Type::List(Box::new(Type::String))
        );
        assert_eq!(
            Value::Tuple(vec![Value::from(1u32), Value::from("x")])
                .signature()
                .to_string(),
            "(Is)"
        );
        assert_eq!(
            Value::List(vec![]).signature(),
            Type::List(Box::new(Type::Dynamic))
        );
    }

    #[test]
    fn dynamic_accessors_see_through() {
        let v = Value::Dynamic(Box::new(Value::from("hello")));
        assert_eq!(v.as_str(), Some("hello"));
        assert_eq!(v.signature(), Type::Dynamic);
        assert_eq!(v.into_inner(), Value::from("hello"));
    }
}
