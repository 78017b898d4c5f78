//! Client-side proxies: local invocations become outbound messages.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use qilink_core::{
    action, decode_value, decode_value_exact, encode_value_as, Error, Kind, Message, MetaObject,
    ObjectReference, Result, Type, Value,
};

use crate::{Channel, DispatchPolicy, DynamicObject, PendingCall};

type SignalCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Handle for one registered signal callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSubscription {
    signal: u32,
    id: u64,
}

struct SubscriptionState {
    post_uid: u32,
    remote_link: i64,
    handlers: Arc<Mutex<HashMap<u64, SignalCallback>>>,
    next_id: u64,
}

struct RemoteInner {
    service: u32,
    object: u32,
    meta: Arc<MetaObject>,
    channel: Channel,
    default_timeout: Option<Duration>,
    subscriptions: AsyncMutex<HashMap<u32, SubscriptionState>>,
    /// Received as an argument: post `terminate` to the host on drop.
    ephemeral: bool,
}

/// A proxy for a remote object: calls marshal into messages, replies
/// resolve futures keyed by correlation id.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<RemoteInner>,
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("service", &self.inner.service)
            .field("object", &self.inner.object)
            .finish_non_exhaustive()
    }
}

impl RemoteObject {
    pub(crate) fn new(
        channel: Channel,
        service: u32,
        object: u32,
        meta: Arc<MetaObject>,
        default_timeout: Option<Duration>,
    ) -> RemoteObject {
        RemoteObject {
            inner: Arc::new(RemoteInner {
                service,
                object,
                meta,
                channel,
                default_timeout,
                subscriptions: AsyncMutex::new(HashMap::new()),
                ephemeral: false,
            }),
        }
    }

    /// Materialise the proxy for an object reference that arrived inside
    /// a payload.
    pub(crate) fn from_reference(channel: Channel, reference: &ObjectReference) -> RemoteObject {
        RemoteObject {
            inner: Arc::new(RemoteInner {
                service: reference.service,
                object: reference.object,
                meta: Arc::new(reference.meta.clone()),
                channel,
                default_timeout: None,
                subscriptions: AsyncMutex::new(HashMap::new()),
                ephemeral: true,
            }),
        }
    }

    pub fn service(&self) -> u32 {
        self.inner.service
    }

    pub fn object(&self) -> u32 {
        self.inner.object
    }

    pub fn meta(&self) -> &Arc<MetaObject> {
        &self.inner.meta
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Call a method by `name::(signature)` or bare name and await the
    /// result.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with_timeout(method, args, self.inner.default_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let (message, return_signature) = self.prepare_call(method, args)?;
        let reply = self.inner.channel.call(message, timeout).await?;
        interpret_reply(reply, &return_signature)
    }

    /// Start a call and keep the cancellable future.
    pub async fn start_call(&self, method: &str, args: Vec<Value>) -> Result<Call> {
        let (message, return_signature) = self.prepare_call(method, args)?;
        let pending = self.inner.channel.start_call(message).await?;
        Ok(Call {
            pending,
            return_signature,
        })
    }

    /// One-way invocation: no reply is expected or awaited.
    pub async fn post(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let uid = self
            .inner
            .meta
            .method_uid(method, Some(&args))
            .ok_or_else(|| Error::MethodNotFound(method.to_owned()))?;
        let descriptor = self
            .inner
            .meta
            .method(uid)
            .ok_or_else(|| Error::MethodNotFound(method.to_owned()))?;
        let body = encode_value_as(&Value::Tuple(args), &descriptor.parameters_signature)?;
        let message =
            Message::post(self.inner.service, self.inner.object, uid).with_body(body);
        self.inner.channel.send(&message).await
    }

    /// Subscribe to a signal. The first subscription for a signal
    /// registers a remote event link; later ones share it.
    pub async fn subscribe<F>(&self, signal: &str, callback: F) -> Result<SignalSubscription>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let uid = self
            .inner
            .meta
            .signal_uid(signal)
            .ok_or_else(|| Error::SignalNotFound(signal.to_owned()))?;
        let signature = self
            .inner
            .meta
            .signal(uid)
            .map(|s| s.signature.clone())
            .ok_or_else(|| Error::SignalNotFound(signal.to_owned()))?;

        let mut subscriptions = self.inner.subscriptions.lock().await;
        if !subscriptions.contains_key(&uid) {
            let handlers: Arc<Mutex<HashMap<u64, SignalCallback>>> =
                Arc::new(Mutex::new(HashMap::new()));
            let dispatch_handlers = handlers.clone();
            let post_uid = self.inner.channel.register_post_handler(Arc::new(
                move |message: Message| {
                    let body = message.body().to_bytes();
                    match decode_value_exact(&body, &signature) {
                        Ok(value) => {
                            let args = value.into_tuple().unwrap_or_default();
                            let callbacks: Vec<SignalCallback> =
                                dispatch_handlers.lock().values().cloned().collect();
                            for callback in callbacks {
                                callback(&args);
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "dropping undecodable signal post");
                        }
                    }
                },
            ));

            let link = match self
                .builtin(
                    action::REGISTER_EVENT,
                    Value::Tuple(vec![Value::UInt32(uid), Value::UInt32(post_uid)]),
                    "(II)",
                    &Type::Int64,
                )
                .await
            {
                Ok(value) => value.as_i64().unwrap_or_default(),
                Err(e) => {
                    self.inner.channel.unregister_post_handler(post_uid);
                    return Err(e);
                }
            };
            subscriptions.insert(
                uid,
                SubscriptionState {
                    post_uid,
                    remote_link: link,
                    handlers,
                    next_id: 1,
                },
            );
        }

        let state = subscriptions
            .get_mut(&uid)
            .expect("subscription state just inserted");
        let id = state.next_id;
        state.next_id += 1;
        state.handlers.lock().insert(id, Arc::new(callback));
        Ok(SignalSubscription { signal: uid, id })
    }

    /// Drop one callback; the last one for a signal unregisters the
    /// remote event link.
    pub async fn unsubscribe(&self, subscription: SignalSubscription) -> Result<()> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let Some(state) = subscriptions.get_mut(&subscription.signal) else {
            return Ok(());
        };
        state.handlers.lock().remove(&subscription.id);
        if !state.handlers.lock().is_empty() {
            return Ok(());
        }
        let state = subscriptions
            .remove(&subscription.signal)
            .expect("present above");
        drop(subscriptions);
        self.inner.channel.unregister_post_handler(state.post_uid);
        self.builtin(
            action::UNREGISTER_EVENT,
            Value::Tuple(vec![
                Value::UInt32(subscription.signal),
                Value::Int64(state.remote_link),
            ]),
            "(Il)",
            &Type::Void,
        )
        .await?;
        Ok(())
    }

    /// Fetch a property value.
    pub async fn property(&self, name: &str) -> Result<Value> {
        let uid = self
            .inner
            .meta
            .property_uid(name)
            .ok_or_else(|| Error::PropertyNotFound(name.to_owned()))?;
        let value = self
            .builtin(
                action::PROPERTY,
                Value::Tuple(vec![Value::UInt32(uid)]),
                "(I)",
                &Type::Dynamic,
            )
            .await?;
        Ok(value.into_inner())
    }

    /// Store a property value; the peer emits the change signal after the
    /// store.
    pub async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        let uid = self
            .inner
            .meta
            .property_uid(name)
            .ok_or_else(|| Error::PropertyNotFound(name.to_owned()))?;
        self.builtin(
            action::SET_PROPERTY,
            Value::Tuple(vec![Value::UInt32(uid), Value::Dynamic(Box::new(value))]),
            "(Im)",
            &Type::Void,
        )
        .await?;
        Ok(())
    }

    /// Snapshot of every property, keyed by uid.
    pub async fn properties(&self) -> Result<Vec<(u32, Value)>> {
        let value = self
            .builtin(
                action::PROPERTIES,
                Value::Tuple(vec![]),
                "()",
                &Type::parse("{Im}").expect("constant signature"),
            )
            .await?;
        let Value::Map(entries) = value else {
            return Ok(Vec::new());
        };
        Ok(entries
            .into_iter()
            .filter_map(|(k, v)| Some((k.as_u32()?, v.into_inner())))
            .collect())
    }

    /// Wrap a local object so it can travel as an argument to this
    /// service. The returned value is hosted on this proxy's channel until
    /// the receiver terminates it.
    pub fn bind_object(&self, object: Arc<DynamicObject>) -> Value {
        self.inner.channel.bind_argument_object(
            self.inner.service,
            object,
            DispatchPolicy::Auto,
        )
    }

    fn prepare_call(&self, method: &str, args: Vec<Value>) -> Result<(Message, Type)> {
        let uid = self
            .inner
            .meta
            .method_uid(method, Some(&args))
            .ok_or_else(|| Error::MethodNotFound(method.to_owned()))?;
        let descriptor = self
            .inner
            .meta
            .method(uid)
            .ok_or_else(|| Error::MethodNotFound(method.to_owned()))?;
        let body = encode_value_as(&Value::Tuple(args), &descriptor.parameters_signature)?;
        let message =
            Message::call(self.inner.service, self.inner.object, uid).with_body(body);
        Ok((message, descriptor.return_signature.clone()))
    }

    async fn builtin(
        &self,
        action_id: u32,
        args: Value,
        params: &str,
        return_signature: &Type,
    ) -> Result<Value> {
        let params = Type::parse(params).expect("constant signature");
        let body = encode_value_as(&args, &params)?;
        let message =
            Message::call(self.inner.service, self.inner.object, action_id).with_body(body);
        let reply = self
            .inner
            .channel
            .call(message, self.inner.default_timeout)
            .await?;
        interpret_reply(reply, return_signature)
    }
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        if !self.ephemeral || self.channel.is_closed() {
            return;
        }
        // Last proxy reference gone: release the host-side object.
        let channel = self.channel.clone();
        let terminate = Message::post(self.service, self.object, action::TERMINATE);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = channel.send(&terminate).await;
            });
        }
    }
}

fn interpret_reply(reply: Message, return_signature: &Type) -> Result<Value> {
    match reply.kind {
        Kind::Reply => Ok(decode_value(&reply.body().to_bytes(), return_signature)?),
        Kind::Error => Err(Error::Remote(reply.error_description())),
        Kind::Canceled => Err(Error::Cancelled),
        other => Err(Error::Remote(format!(
            "unexpected reply kind {}",
            other.name()
        ))),
    }
}

/// Fetch the metaobject of `(service, object)` over `channel`.
pub(crate) async fn fetch_metaobject(
    channel: &Channel,
    service: u32,
    object: u32,
    timeout: Option<Duration>,
) -> Result<Arc<MetaObject>> {
    let message = Message::call(service, object, action::METAOBJECT);
    let reply = channel.call(message, timeout).await?;
    if reply.kind != Kind::Reply {
        return Err(Error::Remote(reply.error_description()));
    }
    let ty = Type::parse(MetaObject::SIGNATURE).expect("constant signature");
    let value = decode_value(&reply.body().to_bytes(), &ty)?;
    Ok(Arc::new(MetaObject::from_value(&value)?))
}

/// An in-flight call. Resolves to the decoded result; cancellable.
pub struct Call {
    pending: PendingCall,
    return_signature: Type,
}

impl Call {
    pub fn id(&self) -> u32 {
        self.pending.id()
    }

    /// See [`PendingCall::cancel`].
    pub fn cancel(&self) {
        self.pending.cancel();
    }
}

impl Future for Call {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.pending).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(interpret_reply(reply, &this.return_signature)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}
