//! Messages: fixed 28-byte header plus a copy-on-write payload.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Encoder, ProtocolError, Value};

/// Header sentinel.
pub const MAGIC: u32 = 0x42ad_de42;

/// Header size on the wire.
pub const HEADER_SIZE: usize = 28;

/// Protocol version written into every header.
pub const VERSION: u16 = 0;

/// Upper bound on a single payload; anything larger is an impossible
/// header and terminates the connection.
pub const MAX_PAYLOAD: u32 = 128 * 1024 * 1024;

/// Well-known service ids.
pub mod service {
    /// The socket-level server object (capability exchange).
    pub const SERVER: u32 = 0;
    /// The service directory.
    pub const DIRECTORY: u32 = 1;
}

/// Well-known object ids.
pub mod object {
    pub const NONE: u32 = 0;
    /// A service's main object.
    pub const MAIN: u32 = 1;
}

/// Built-in action ids, valid on every object. User actions start at 100.
pub mod action {
    pub const REGISTER_EVENT: u32 = 0;
    pub const UNREGISTER_EVENT: u32 = 1;
    pub const METAOBJECT: u32 = 2;
    pub const TERMINATE: u32 = 3;
    pub const PROPERTY: u32 = 5;
    pub const SET_PROPERTY: u32 = 6;
    pub const PROPERTIES: u32 = 7;
    pub const AUTHENTICATE: u32 = 8;
}

/// Directory protocol action ids (service 1, object 1).
pub mod directory_action {
    pub const SERVICE: u32 = 100;
    pub const SERVICES: u32 = 101;
    pub const REGISTER_SERVICE: u32 = 102;
    pub const UNREGISTER_SERVICE: u32 = 103;
    pub const SERVICE_READY: u32 = 104;
    pub const UPDATE_SERVICE_INFO: u32 = 105;
    pub const SERVICE_ADDED: u32 = 106;
    pub const SERVICE_REMOVED: u32 = 107;
}

/// Symbolic name of an action id, if it has one.
pub fn action_name(action: u32, service_id: u32) -> Option<&'static str> {
    match action {
        action::REGISTER_EVENT => return Some("RegisterEvent"),
        action::UNREGISTER_EVENT => return Some("UnregisterEvent"),
        action::METAOBJECT => return Some("MetaObject"),
        action::TERMINATE => return Some("Terminate"),
        action::PROPERTY => return Some("Property"),
        action::SET_PROPERTY => return Some("SetProperty"),
        action::PROPERTIES => return Some("Properties"),
        action::AUTHENTICATE => return Some("Authenticate"),
        _ => {}
    }
    if service_id != service::DIRECTORY {
        return None;
    }
    match action {
        directory_action::SERVICE => Some("Service"),
        directory_action::SERVICES => Some("Services"),
        directory_action::REGISTER_SERVICE => Some("RegisterService"),
        directory_action::UNREGISTER_SERVICE => Some("UnregisterService"),
        directory_action::SERVICE_READY => Some("ServiceReady"),
        directory_action::UPDATE_SERVICE_INFO => Some("UpdateServiceInfo"),
        directory_action::SERVICE_ADDED => Some("ServiceAdded"),
        directory_action::SERVICE_REMOVED => Some("ServiceRemoved"),
        _ => None,
    }
}

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    None = 0,
    Call = 1,
    Reply = 2,
    Error = 3,
    Post = 4,
    Event = 5,
    Cancel = 6,
    Canceled = 7,
}

impl Kind {
    pub fn from_u8(v: u8) -> Option<Kind> {
        Some(match v {
            0 => Kind::None,
            1 => Kind::Call,
            2 => Kind::Reply,
            3 => Kind::Error,
            4 => Kind::Post,
            5 => Kind::Event,
            6 => Kind::Cancel,
            7 => Kind::Canceled,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::None => "None",
            Kind::Call => "Call",
            Kind::Reply => "Reply",
            Kind::Error => "Error",
            Kind::Post => "Post",
            Kind::Event => "Event",
            Kind::Cancel => "Cancel",
            Kind::Canceled => "Canceled",
        }
    }
}

bitflags::bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        /// Payload is a dynamic value rather than the declared signature.
        const DYNAMIC_PAYLOAD = 0x1;
        /// Reply carries a return-type string before the value.
        const RETURN_TYPE = 0x2;
    }
}

/// The address quadruple: correlation id plus target coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageAddress {
    pub id: u32,
    pub service: u32,
    pub object: u32,
    pub action: u32,
}

impl fmt::Display for MessageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}.{}.{}, id:{}}}",
            self.service, self.object, self.action, self.id
        )
    }
}

static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate a fresh process-wide message id. Wraps; in-flight windows are
/// far smaller than the id space.
pub fn next_message_id() -> u32 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// The payload of one message: a sequence of shared-immutable segments.
/// Cloning shares the bytes; mutation always goes through replacement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    segments: Vec<Bytes>,
}

impl Body {
    pub fn from_segments(segments: Vec<Bytes>) -> Self {
        Self { segments }
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Bytes::is_empty)
    }

    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// A contiguous view. Free when the body has at most one segment (the
    /// case for every received message); otherwise the segments are copied
    /// once.
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut buf = BytesMut::with_capacity(self.len());
                for seg in many {
                    buf.put_slice(seg);
                }
                buf.freeze()
            }
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self {
            segments: vec![bytes],
        }
    }
}

/// One wire message. Cheap to clone: the body is shared, the header is
/// plain data, so a clone-then-mutate never aliases an enqueued copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u32,
    pub version: u16,
    pub kind: Kind,
    pub flags: MessageFlags,
    pub service: u32,
    pub object: u32,
    pub action: u32,
    body: Body,
}

impl Message {
    pub fn new(kind: Kind, address: MessageAddress) -> Self {
        Self {
            id: address.id,
            version: VERSION,
            kind,
            flags: MessageFlags::empty(),
            service: address.service,
            object: address.object,
            action: address.action,
            body: Body::default(),
        }
    }

    /// A `Call` with a fresh message id.
    pub fn call(service: u32, object: u32, action: u32) -> Self {
        Self::new(
            Kind::Call,
            MessageAddress {
                id: next_message_id(),
                service,
                object,
                action,
            },
        )
    }

    /// A `Post` with a fresh message id.
    pub fn post(service: u32, object: u32, action: u32) -> Self {
        Self::new(
            Kind::Post,
            MessageAddress {
                id: next_message_id(),
                service,
                object,
                action,
            },
        )
    }

    /// A `Reply` sharing the inbound address.
    pub fn reply_to(call: &Message) -> Self {
        Self::new(Kind::Reply, call.address())
    }

    /// An `Error` message for `address`; the payload is a self-describing
    /// string.
    pub fn error(address: MessageAddress, description: &str) -> Self {
        let mut msg = Self::new(Kind::Error, address);
        let mut enc = Encoder::new();
        enc.write_str("s");
        enc.write_str(description);
        msg.body = enc.finish();
        msg
    }

    /// An `Error` reply; the payload is a self-describing string.
    pub fn error_reply(call: &Message, description: &str) -> Self {
        Self::error(call.address(), description)
    }

    /// A `Canceled` acknowledgement sharing the inbound address.
    pub fn canceled_reply(call: &Message) -> Self {
        Self::new(Kind::Canceled, call.address())
    }

    pub fn address(&self) -> MessageAddress {
        MessageAddress {
            id: self.id,
            service: self.service,
            object: self.object,
            action: self.action,
        }
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Decode the error description out of an `Error` message.
    pub fn error_description(&self) -> String {
        let bytes = self.body.to_bytes();
        let mut dec = crate::Decoder::new(&bytes);
        match dec.read_value(&crate::Type::Dynamic) {
            Ok(Value::Dynamic(inner)) => match *inner {
                Value::String(s) => s,
                other => format!("{other:?}"),
            },
            _ => String::from("malformed error payload"),
        }
    }

    /// Serialize the header. `size` is taken from the body.
    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.body.len() as u32).to_le_bytes());
        buf[12..14].copy_from_slice(&self.version.to_le_bytes());
        buf[14] = self.kind as u8;
        buf[15] = self.flags.bits();
        buf[16..20].copy_from_slice(&self.service.to_le_bytes());
        buf[20..24].copy_from_slice(&self.object.to_le_bytes());
        buf[24..28].copy_from_slice(&self.action.to_le_bytes());
        buf
    }

    /// Parse and validate a header; returns the message (empty body) and
    /// the payload size still to read.
    pub fn parse_header(buf: &[u8; HEADER_SIZE]) -> Result<(Message, u32), ProtocolError> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if size > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD,
            });
        }
        let version = u16::from_le_bytes(buf[12..14].try_into().unwrap());
        let kind = Kind::from_u8(buf[14]).ok_or(ProtocolError::UnknownKind(buf[14]))?;
        if kind == Kind::None {
            return Err(ProtocolError::NoneKind);
        }
        let flags = MessageFlags::from_bits_truncate(buf[15]);
        let service_id = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let object_id = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        if object_id == object::NONE {
            return Err(ProtocolError::NullObject);
        }
        let action_id = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        Ok((
            Message {
                id,
                version,
                kind,
                flags,
                service: service_id,
                object: object_id,
                action: action_id,
                body: Body::default(),
            },
            size,
        ))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message {{ id={} type={} serv=",
            self.id,
            self.kind.name()
        )?;
        if self.service == service::DIRECTORY {
            write!(f, "ServiceDirectory")?;
        } else {
            write!(f, "{}", self.service)?;
        }
        write!(f, " obje=")?;
        if self.object == object::MAIN {
            write!(f, "main")?;
        } else {
            write!(f, "{}", self.object)?;
        }
        write!(f, " acti=")?;
        match action_name(self.action, self.service) {
            Some(name) => write!(f, "{name}")?,
            None => write!(f, "{}", self.action)?,
        }
        write!(f, " size={} }}", self.body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut msg = Message::call(7, 1, 104);
        msg.set_body(Body::from(Bytes::from_static(b"abcd")));
        let header = msg.header_bytes();
        let (parsed, size) = Message::parse_header(&header).unwrap();
        assert_eq!(size, 4);
        assert_eq!(parsed.address(), msg.address());
        assert_eq!(parsed.kind, Kind::Call);
        assert_eq!(parsed.version, VERSION);
    }

    #[test]
    fn message_ids_are_strictly_increasing() {
        let a = Message::call(1, 1, 100);
        let b = Message::call(1, 1, 100);
        assert!(b.id > a.id);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut header = Message::call(1, 1, 100).header_bytes();
        header[0] ^= 0xff;
        assert!(matches!(
            Message::parse_header(&header),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_none_kind_and_null_object() {
        let mut header = Message::call(1, 1, 100).header_bytes();
        header[14] = 0;
        assert!(matches!(
            Message::parse_header(&header),
            Err(ProtocolError::NoneKind)
        ));

        let mut header = Message::call(1, 1, 100).header_bytes();
        header[20..24].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            Message::parse_header(&header),
            Err(ProtocolError::NullObject)
        ));
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut header = Message::call(1, 1, 100).header_bytes();
        header[14] = 42;
        assert!(matches!(
            Message::parse_header(&header),
            Err(ProtocolError::UnknownKind(42))
        ));
    }

    #[test]
    fn error_reply_payload_is_self_describing() {
        let call = Message::call(2, 1, 100);
        let err = Message::error_reply(&call, "boom");
        assert_eq!(err.kind, Kind::Error);
        assert_eq!(err.id, call.id);
        assert_eq!(err.error_description(), "boom");
    }

    #[test]
    fn clone_then_mutate_does_not_alias() {
        let mut a = Message::call(2, 1, 100).with_body(Body::from(Bytes::from_static(b"xy")));
        let b = a.clone();
        a.set_body(Body::from(Bytes::from_static(b"zz")));
        assert_eq!(b.body().to_bytes().as_ref(), b"xy");
    }

    #[test]
    fn symbolic_action_names() {
        assert_eq!(action_name(2, 42), Some("MetaObject"));
        assert_eq!(action_name(104, service::DIRECTORY), Some("ServiceReady"));
        assert_eq!(action_name(104, 42), None);
        let display = format!("{}", Message::call(service::DIRECTORY, 1, 100));
        assert!(display.contains("ServiceDirectory"));
        assert!(display.contains("Service"));
    }
}
