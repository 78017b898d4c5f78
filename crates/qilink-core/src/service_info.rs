//! Directory entries as they travel on the wire.

use crate::{DecodeError, Type, Value};

/// One directory entry. Wire shape `(I[s][s]s)`: service id, endpoint
/// URLs, identity strings `[machine, process, session]`, name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceInfo {
    pub id: u32,
    pub name: String,
    pub endpoints: Vec<String>,
    pub machine_id: String,
    pub process_id: String,
    pub session_id: String,
}

impl ServiceInfo {
    pub const SIGNATURE: &'static str = "(I[s][s]s)";

    pub fn signature() -> Type {
        Type::parse(Self::SIGNATURE).expect("constant signature")
    }

    pub fn to_value(&self) -> Value {
        Value::Tuple(vec![
            Value::UInt32(self.id),
            Value::List(
                self.endpoints
                    .iter()
                    .map(|e| Value::String(e.clone()))
                    .collect(),
            ),
            Value::List(vec![
                Value::String(self.machine_id.clone()),
                Value::String(self.process_id.clone()),
                Value::String(self.session_id.clone()),
            ]),
            Value::String(self.name.clone()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<ServiceInfo, DecodeError> {
        let mismatch = || DecodeError::TypeMismatch {
            expected: Self::SIGNATURE.to_owned(),
            found: value.signature().to_string(),
        };
        let fields = value.as_tuple().ok_or_else(mismatch)?;
        let [id, endpoints, identity, name] = fields else {
            return Err(mismatch());
        };
        let strings = |v: &Value| -> Result<Vec<String>, DecodeError> {
            match v {
                Value::List(items) => items
                    .iter()
                    .map(|i| i.as_str().map(str::to_owned).ok_or_else(mismatch))
                    .collect(),
                _ => Err(mismatch()),
            }
        };
        let identity = strings(identity)?;
        let mut identity = identity.into_iter();
        Ok(ServiceInfo {
            id: id.as_u32().ok_or_else(mismatch)?,
            name: name.as_str().ok_or_else(mismatch)?.to_owned(),
            endpoints: strings(endpoints)?,
            machine_id: identity.next().unwrap_or_default(),
            process_id: identity.next().unwrap_or_default(),
            session_id: identity.next().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let info = ServiceInfo {
            id: 7,
            name: "echo".to_owned(),
            endpoints: vec!["tcp://127.0.0.1:4242".to_owned()],
            machine_id: "m".to_owned(),
            process_id: "1234".to_owned(),
            session_id: "s-1".to_owned(),
        };
        let value = info.to_value();
        assert_eq!(value.signature().to_string(), ServiceInfo::SIGNATURE);
        assert_eq!(ServiceInfo::from_value(&value).unwrap(), info);
    }
}
