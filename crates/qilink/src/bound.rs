//! Server-side adapters: inbound messages become local invocations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;

use qilink_core::{
    action, decode_value_exact, encode_value, encode_value_as, Error, Kind, Message, MetaObject,
    Result, Type, Value,
};

use crate::{CallContext, Channel, DynamicObject};

/// How a bound object runs its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// Same as [`DispatchPolicy::Queued`].
    #[default]
    Auto,
    /// Run on the demux task. Only for handlers that neither block nor
    /// call back over the same socket.
    Direct,
    /// Run on the object's private worker, one call at a time.
    Queued,
}

static NEXT_OBJECT_ID: AtomicU32 = AtomicU32::new(2);

/// Fresh object id for objects hooked onto a host (object id 1 is a
/// service's main object).
pub(crate) fn next_object_id() -> u32 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

struct BoundInner {
    object: Arc<DynamicObject>,
    service: AtomicU32,
    object_id: u32,
    policy: DispatchPolicy,
    queue: OnceLock<mpsc::UnboundedSender<BoxFuture<'static, ()>>>,
}

/// Owns a concrete object on behalf of remote callers: decodes inbound
/// calls, dispatches per policy, replies on the originating channel.
#[derive(Clone)]
pub struct BoundObject {
    inner: Arc<BoundInner>,
}

impl std::fmt::Debug for BoundObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundObject")
            .field("service", &self.service())
            .field("object", &self.inner.object_id)
            .finish_non_exhaustive()
    }
}

impl BoundObject {
    /// Bind a service's main object.
    pub fn new(object: Arc<DynamicObject>, policy: DispatchPolicy) -> BoundObject {
        Self::with_object_id(object, policy, qilink_core::object::MAIN)
    }

    pub(crate) fn with_object_id(
        object: Arc<DynamicObject>,
        policy: DispatchPolicy,
        object_id: u32,
    ) -> BoundObject {
        BoundObject {
            inner: Arc::new(BoundInner {
                object,
                service: AtomicU32::new(0),
                object_id,
                policy,
                queue: OnceLock::new(),
            }),
        }
    }

    pub fn object(&self) -> &Arc<DynamicObject> {
        &self.inner.object
    }

    pub fn object_id(&self) -> u32 {
        self.inner.object_id
    }

    pub fn service(&self) -> u32 {
        self.inner.service.load(Ordering::Relaxed)
    }

    /// Set once the directory has assigned the service id.
    pub fn set_service(&self, service_id: u32) {
        self.inner.service.store(service_id, Ordering::Relaxed);
    }

    /// Handle one inbound `Call` or `Post` addressed to this object.
    pub(crate) async fn dispatch(&self, channel: &Channel, message: Message) {
        if message.action < MetaObject::USER_ACTION_START {
            self.dispatch_builtin(channel, message).await;
        } else {
            self.dispatch_method(channel, message).await;
        }
    }

    async fn dispatch_method(&self, channel: &Channel, message: Message) {
        let wants_reply = message.kind == Kind::Call;
        let meta = self.inner.object.meta();

        let Some(method) = meta.method(message.action) else {
            tracing::debug!(%message, "unknown function");
            if wants_reply {
                let reply =
                    Message::error_reply(&message, &format!("unknown function {}", message.action));
                let _ = channel.send(&reply).await;
            }
            return;
        };

        let body = message.body().to_bytes();
        // The parameter signature is a declared tuple: trailing garbage
        // after it is a decode error, not forward compatibility.
        let args = match decode_value_exact(&body, &method.parameters_signature) {
            Ok(value) => value.into_tuple().unwrap_or_default(),
            Err(e) => {
                tracing::debug!(%message, error = %e, "argument decode failed");
                if wants_reply {
                    let reply = Message::error_reply(
                        &message,
                        &format!("failed to decode arguments for {}: {e}", method.name),
                    );
                    let _ = channel.send(&reply).await;
                }
                return;
            }
        };

        let Some(handler) = self.inner.object.handler(message.action) else {
            if wants_reply {
                let reply = Message::error_reply(
                    &message,
                    &format!("no handler for {}", method.name),
                );
                let _ = channel.send(&reply).await;
            }
            return;
        };

        let ctx = CallContext {
            channel: channel.clone(),
        };
        let return_signature = method.return_signature.clone();
        let reply_channel = channel.clone();
        let call = message.clone();
        let handler_future = handler(ctx, args);

        let job = async move {
            let outcome = match AssertUnwindSafe(handler_future).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(Error::Remote(panic_message(panic))),
            };
            if !wants_reply {
                if let Err(e) = outcome {
                    tracing::debug!(error = %e, "post handler failed");
                }
                return;
            }
            let reply = match outcome
                .and_then(|value| encode_value_as(&value, &return_signature).map_err(Error::from))
            {
                Ok(body) => Message::reply_to(&call).with_body(body),
                Err(e) => Message::error_reply(&call, &e.to_string()),
            };
            let _ = reply_channel.send(&reply).await;
        };

        match self.inner.policy {
            DispatchPolicy::Direct => job.await,
            DispatchPolicy::Auto | DispatchPolicy::Queued => {
                let (abort, registration) = AbortHandle::new_pair();
                if wants_reply {
                    channel.register_cancelable(message.id, abort, message.address());
                }
                let cleanup_channel = channel.clone();
                let call_id = message.id;
                self.enqueue(Box::pin(async move {
                    let _ = Abortable::new(job, registration).await;
                    cleanup_channel.unregister_cancelable(call_id);
                }));
            }
        }
    }

    async fn dispatch_builtin(&self, channel: &Channel, message: Message) {
        let wants_reply = message.kind == Kind::Call;
        let outcome = self.run_builtin(channel, &message);
        if !wants_reply {
            if let Err(e) = outcome {
                tracing::debug!(%message, error = %e, "builtin post failed");
            }
            return;
        }
        let reply = match outcome.and_then(|value| encode_value(&value).map_err(Error::from)) {
            Ok(body) => Message::reply_to(&message).with_body(body),
            Err(e) => Message::error_reply(&message, &e.to_string()),
        };
        let _ = channel.send(&reply).await;
    }

    fn run_builtin(&self, channel: &Channel, message: &Message) -> Result<Value> {
        let object = &self.inner.object;
        let body = message.body().to_bytes();
        match message.action {
            action::METAOBJECT => Ok(object.meta().to_value()),
            action::REGISTER_EVENT => {
                let args = decode_args(&body, "(II)")?;
                let signal = arg_u32(&args, 0)?;
                let callback = arg_u32(&args, 1)?;
                if object.meta().signal(signal).is_none() {
                    return Err(Error::SignalNotFound(signal.to_string()));
                }
                let link = object.hub().connect_remote(
                    signal,
                    channel.clone(),
                    message.service,
                    message.object,
                    callback,
                );
                tracing::debug!(signal, link, peer = channel.peer(), "event registered");
                Ok(Value::Int64(link as i64))
            }
            action::UNREGISTER_EVENT => {
                let args = decode_args(&body, "(Il)")?;
                let signal = arg_u32(&args, 0)?;
                let link = arg_i64(&args, 1)?;
                if !object.hub().disconnect(signal, link as u64) {
                    tracing::debug!(signal, link, "unregister for unknown link");
                }
                Ok(Value::Void)
            }
            action::TERMINATE => {
                tracing::debug!(
                    service = message.service,
                    object = message.object,
                    "terminate: releasing bound object"
                );
                channel.remove_object(message.service, message.object);
                Ok(Value::Void)
            }
            action::PROPERTY => {
                let args = decode_args(&body, "(I)")?;
                let uid = arg_u32(&args, 0)?;
                let value = object
                    .property(uid)
                    .ok_or_else(|| Error::PropertyNotFound(uid.to_string()))?;
                Ok(Value::Dynamic(Box::new(value)))
            }
            action::SET_PROPERTY => {
                let args = decode_args(&body, "(Im)")?;
                let uid = arg_u32(&args, 0)?;
                let value = args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| Error::PropertyNotFound(uid.to_string()))?;
                object.set_property(uid, value.into_inner())?;
                Ok(Value::Void)
            }
            action::PROPERTIES => Ok(Value::Map(
                object
                    .properties_snapshot()
                    .into_iter()
                    .map(|(uid, value)| {
                        (Value::UInt32(uid), Value::Dynamic(Box::new(value)))
                    })
                    .collect(),
            )),
            other => Err(Error::Remote(format!("unknown builtin action {other}"))),
        }
    }

    fn enqueue(&self, job: BoxFuture<'static, ()>) {
        let queue = self.inner.queue.get_or_init(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
            });
            tx
        });
        if queue.send(job).is_err() {
            tracing::warn!("bound object worker is gone; dropping call");
        }
    }
}

fn decode_args(body: &[u8], signature: &str) -> Result<Vec<Value>> {
    let ty = Type::parse(signature).expect("constant signature");
    Ok(decode_value_exact(body, &ty)?.into_tuple().unwrap_or_default())
}

fn arg_u32(args: &[Value], index: usize) -> Result<u32> {
    args.get(index)
        .and_then(Value::as_u32)
        .ok_or_else(|| Error::Decode(qilink_core::DecodeError::TypeMismatch {
            expected: "I".to_owned(),
            found: "missing argument".to_owned(),
        }))
}

fn arg_i64(args: &[Value], index: usize) -> Result<i64> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Decode(qilink_core::DecodeError::TypeMismatch {
            expected: "l".to_owned(),
            found: "missing argument".to_owned(),
        }))
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic in handler: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic in handler: {s}")
    } else {
        "panic in handler".to_owned()
    }
}
