//! Capability maps exchanged on every new socket.

use std::collections::BTreeMap;

use crate::{DecodeError, Value};

pub const META_OBJECT_CACHE: &str = "MetaObjectCache";
pub const MESSAGE_FLAGS: &str = "MessageFlags";
pub const REMOTE_CANCELABLE_CALLS: &str = "RemoteCancelableCalls";

/// A `{sm}` map of advertised features. After the exchange each side keeps
/// the intersection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    entries: BTreeMap<String, Value>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// What this implementation advertises.
    pub fn local() -> Self {
        let mut caps = Self::new();
        caps.set_bool(META_OBJECT_CACHE, false);
        caps.set_bool(MESSAGE_FLAGS, true);
        caps.set_bool(REMOTE_CANCELABLE_CALLS, true);
        caps
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.entries.insert(key.to_owned(), Value::Bool(value));
    }

    pub fn boolean(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Keys present on both sides; boolean features are and-ed, anything
    /// disagreeing otherwise is dropped.
    pub fn intersect(&self, other: &Capabilities) -> Capabilities {
        let mut out = Capabilities::new();
        for (key, value) in &self.entries {
            let Some(theirs) = other.entries.get(key) else {
                continue;
            };
            match (value.as_bool(), theirs.as_bool()) {
                (Some(a), Some(b)) => out.set_bool(key, a && b),
                _ if value == theirs => {
                    out.entries.insert(key.clone(), value.clone());
                }
                _ => {}
            }
        }
        out
    }

    pub fn to_value(&self) -> Value {
        Value::Map(
            self.entries
                .iter()
                .map(|(k, v)| {
                    (
                        Value::String(k.clone()),
                        Value::Dynamic(Box::new(v.clone())),
                    )
                })
                .collect(),
        )
    }

    pub fn from_value(value: &Value) -> Result<Capabilities, DecodeError> {
        let Value::Map(entries) = value else {
            return Err(DecodeError::TypeMismatch {
                expected: "{sm}".to_owned(),
                found: value.signature().to_string(),
            });
        };
        let mut caps = Capabilities::new();
        for (k, v) in entries {
            let key = k.as_str().ok_or_else(|| DecodeError::TypeMismatch {
                expected: "s".to_owned(),
                found: k.signature().to_string(),
            })?;
            caps.entries
                .insert(key.to_owned(), v.clone().into_inner());
        }
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_ands_booleans() {
        let mut a = Capabilities::local();
        a.set_bool("X", true);
        let mut b = Capabilities::local();
        b.set_bool(REMOTE_CANCELABLE_CALLS, false);

        let i = a.intersect(&b);
        assert!(i.boolean(MESSAGE_FLAGS));
        assert!(!i.boolean(REMOTE_CANCELABLE_CALLS));
        // Present only on one side: dropped.
        assert!(!i.boolean("X"));
    }

    #[test]
    fn wire_roundtrip() {
        let caps = Capabilities::local();
        let decoded = Capabilities::from_value(&caps.to_value()).unwrap();
        assert_eq!(decoded, caps);
    }
}
