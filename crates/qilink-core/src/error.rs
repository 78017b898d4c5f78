//! Error kinds.

use core::fmt;

/// Header-level violations. A protocol error terminates the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    BadMagic(u32),
    UnknownKind(u8),
    /// `kind` field was `None` on the wire.
    NoneKind,
    /// `object` field was zero.
    NullObject,
    PayloadTooLarge { size: u32, max: u32 },
    /// Peer spoke before completing the capability exchange.
    NotAuthenticated,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic(m) => write!(f, "bad magic 0x{m:08x}"),
            Self::UnknownKind(k) => write!(f, "unknown message kind {k}"),
            Self::NoneKind => write!(f, "message kind is None"),
            Self::NullObject => write!(f, "message object is 0"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "payload {size} bytes exceeds max {max}")
            }
            Self::NotAuthenticated => write!(f, "message before capability exchange"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Signature parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    UnexpectedEnd,
    UnexpectedChar { ch: char, at: usize },
    TrailingChars { at: usize },
    EmptyTuple,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd => write!(f, "signature ended unexpectedly"),
            Self::UnexpectedChar { ch, at } => {
                write!(f, "unexpected character {ch:?} at offset {at}")
            }
            Self::TrailingChars { at } => write!(f, "trailing characters at offset {at}"),
            Self::EmptyTuple => write!(f, "empty tuple signature"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Payload decoding errors. Local, surfaced to the caller; the connection
/// is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof { needed: usize, remaining: usize },
    InvalidUtf8,
    InvalidBool(u8),
    TrailingBytes { count: usize },
    Signature(SignatureError),
    /// A length prefix that cannot fit in the remaining payload.
    BadLength(u32),
    TypeMismatch { expected: String, found: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof { needed, remaining } => {
                write!(f, "unexpected end of payload: need {needed}, have {remaining}")
            }
            Self::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            Self::InvalidBool(b) => write!(f, "invalid bool byte {b}"),
            Self::TrailingBytes { count } => write!(f, "{count} trailing bytes after value"),
            Self::Signature(e) => write!(f, "bad signature: {e}"),
            Self::BadLength(n) => write!(f, "length prefix {n} exceeds payload"),
            Self::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<SignatureError> for DecodeError {
    fn from(e: SignatureError) -> Self {
        Self::Signature(e)
    }
}

/// Payload encoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Value does not match the declared signature.
    SignatureMismatch { expected: String, found: String },
    Signature(SignatureError),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignatureMismatch { expected, found } => {
                write!(f, "value {found} does not match signature {expected}")
            }
            Self::Signature(e) => write!(f, "bad signature: {e}"),
        }
    }
}

impl std::error::Error for EncodeError {}

impl From<SignatureError> for EncodeError {
    fn from(e: SignatureError) -> Self {
        Self::Signature(e)
    }
}

/// Messaging-layer errors.
#[derive(Debug)]
pub enum Error {
    Decode(DecodeError),
    Encode(EncodeError),
    Protocol(ProtocolError),
    /// Transport closed; every pending future on the socket fails with this.
    ConnectionClosed,
    ServiceNotFound(String),
    ServiceUnavailable(String),
    /// Peer replied with an error message.
    Remote(String),
    Timeout,
    Cancelled,
    AlreadyRegistered(String),
    MethodNotFound(String),
    SignalNotFound(String),
    PropertyNotFound(String),
    UnsupportedScheme(String),
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::ServiceNotFound(name) => write!(f, "service not found: {name}"),
            Self::ServiceUnavailable(name) => write!(f, "service unavailable: {name}"),
            Self::Remote(msg) => write!(f, "remote error: {msg}"),
            Self::Timeout => write!(f, "call timed out"),
            Self::Cancelled => write!(f, "call cancelled"),
            Self::AlreadyRegistered(name) => write!(f, "service already registered: {name}"),
            Self::MethodNotFound(name) => write!(f, "method not found: {name}"),
            Self::SignalNotFound(name) => write!(f, "signal not found: {name}"),
            Self::PropertyNotFound(name) => write!(f, "property not found: {name}"),
            Self::UnsupportedScheme(scheme) => write!(f, "unsupported scheme: {scheme}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Protocol(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
