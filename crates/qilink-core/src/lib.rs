//! qilink-core: Wire layer for the qilink object messaging runtime.
//!
//! This crate defines:
//! - The signature grammar and dynamic values ([`Type`], [`Value`])
//! - The binary codec ([`Encoder`], [`Decoder`])
//! - The message format ([`Message`], [`Kind`], [`MessageAddress`])
//! - Metaobject descriptions ([`MetaObject`], [`MetaMethod`])
//! - Framed transports ([`TransportSocket`], [`TransportServer`])
//! - Endpoint URLs ([`Url`]) and capability maps ([`Capabilities`])
//! - Error kinds ([`Error`], [`ProtocolError`], [`DecodeError`])

#![forbid(unsafe_code)]

mod capabilities;
mod codec;
mod error;
mod message;
mod metaobject;
mod server;
mod service_info;
mod signature;
mod socket;
mod url;
mod value;

pub use capabilities::*;
pub use codec::*;
pub use error::*;
pub use message::*;
pub use metaobject::*;
pub use server::*;
pub use service_info::*;
pub use signature::*;
pub use socket::*;
pub use url::*;
pub use value::*;
