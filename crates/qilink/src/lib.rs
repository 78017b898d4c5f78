//! qilink: a distributed object messaging runtime.
//!
//! Processes expose named *services* (methods, signals, properties) to
//! peers over TCP or Unix-domain sockets. A central service directory maps
//! names to endpoints; a [`Session`] hosts local services and materialises
//! [`RemoteObject`] proxies for remote ones.
//!
//! ```ignore
//! let session = Session::new(SessionConfig::from_env());
//! session.connect(&"tcp://127.0.0.1:9559".parse()?).await?;
//!
//! let echo = ObjectBuilder::new()
//!     .method("echo", "(s)", "s", |_ctx, mut args| async move {
//!         Ok(args.remove(0))
//!     })
//!     .build();
//! session.register_service("echo", echo).await?;
//!
//! let proxy = session.service("echo").await?;
//! let reply = proxy.call("echo", vec!["hello".into()]).await?;
//! ```

#![forbid(unsafe_code)]

mod bound;
mod channel;
mod config;
mod object;
mod remote;
mod session;

pub use bound::*;
pub use channel::*;
pub use config::*;
pub use object::*;
pub use remote::*;
pub use session::*;

pub use qilink_core::*;
