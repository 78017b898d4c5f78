//! Channels: one connected socket plus its demux state.
//!
//! Exactly one task per socket calls `recv` — the demux loop spawned when
//! the channel is created. It routes replies to pending waiters by
//! correlation id, dispatches inbound calls to bound objects, and feeds
//! posted signals to registered handlers. Everything else in the crate
//! talks to the socket through a `Channel`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::AbortHandle;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use qilink_core::{
    action, decode_value, decode_value_exact, encode_value, object, service, Capabilities, Error,
    Kind, Message, MessageAddress, Result, TransportSocket, Type, Url, Value,
    REMOTE_CANCELABLE_CALLS,
};

use crate::{BoundObject, DispatchPolicy, DynamicObject};

/// Handshake deadline; a peer that never authenticates should not pin a
/// waiter forever.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Post-handler uids live above every plausible action uid so the two
/// spaces cannot collide on a bidirectional channel.
const POST_UID_BASE: u32 = 0x8000_0000;

pub(crate) type PostHandler = Arc<dyn Fn(Message) + Send + Sync>;

struct CancelEntry {
    abort: AbortHandle,
    address: MessageAddress,
}

struct ChannelInner {
    socket: TransportSocket,
    id: u64,
    server_side: bool,
    authenticated: AtomicBool,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Message>>>>,
    post_handlers: Mutex<HashMap<u32, PostHandler>>,
    objects: Mutex<HashMap<(u32, u32), BoundObject>>,
    cancels: Mutex<HashMap<u32, CancelEntry>>,
    capabilities: Mutex<Capabilities>,
    next_post_uid: AtomicU32,
    closed_tx: watch::Sender<bool>,
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A connected socket with reply correlation, object hosting, and the
/// capability handshake. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.socket.peer())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Connect to `url` and perform the capability exchange.
    pub async fn connect(url: &Url) -> Result<Channel> {
        let socket = TransportSocket::connect(url).await?;
        let channel = Channel::from_socket(socket, false);
        channel.spawn_demux();
        channel.authenticate_client().await?;
        Ok(channel)
    }

    /// Adopt an accepted socket. The first inbound message must be the
    /// peer's `authenticate` call.
    pub fn serve(socket: TransportSocket) -> Channel {
        let channel = Channel::from_socket(socket, true);
        channel.spawn_demux();
        channel
    }

    fn from_socket(socket: TransportSocket, server_side: bool) -> Channel {
        let (closed_tx, _) = watch::channel(false);
        Channel {
            inner: Arc::new(ChannelInner {
                socket,
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                server_side,
                authenticated: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                post_handlers: Mutex::new(HashMap::new()),
                objects: Mutex::new(HashMap::new()),
                cancels: Mutex::new(HashMap::new()),
                capabilities: Mutex::new(Capabilities::new()),
                next_post_uid: AtomicU32::new(POST_UID_BASE),
                closed_tx,
            }),
        }
    }

    /// Stable identity for ownership tracking.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        self.inner.socket.peer()
    }

    /// Capabilities negotiated on this socket.
    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// Resolves once the channel has shut down.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub async fn disconnect(&self) {
        self.inner.socket.disconnect().await;
    }

    /// Send a message as-is. The message must be treated as immutable
    /// afterwards.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.inner.socket.send(message).await
    }

    /// Register a reply waiter, then send. The waiter is in the table
    /// before the message can possibly be answered.
    pub async fn start_call(&self, message: Message) -> Result<PendingCall> {
        let address = message.address();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if let Some(stale) = pending.insert(address.id, tx) {
                // In-flight id collision; the window is far smaller than
                // the id space, so this indicates a counter bug.
                tracing::warn!(id = address.id, "pending waiter displaced");
                let _ = stale.send(Err(Error::ConnectionClosed));
            }
        }
        if let Err(e) = self.send(&message).await {
            self.inner.pending.lock().remove(&address.id);
            return Err(e);
        }
        Ok(PendingCall {
            channel: self.clone(),
            address,
            rx,
            done: false,
        })
    }

    /// One call, one resolution: the reply message, or the error that
    /// settled it first (timeout, cancellation, disconnect).
    pub async fn call(&self, message: Message, timeout: Option<Duration>) -> Result<Message> {
        let mut pending = self.start_call(message).await?;
        match timeout {
            None => (&mut pending).await,
            Some(limit) => match tokio::time::timeout(limit, &mut pending).await {
                Ok(result) => result,
                Err(_) => {
                    pending.abandon();
                    tracing::debug!(id = pending.address.id, "call timed out");
                    Err(Error::Timeout)
                }
            },
        }
    }

    /// Host a bound object: inbound calls addressed to
    /// `(service, object)` on this socket dispatch to it.
    pub fn add_object(&self, service_id: u32, object_id: u32, bound: BoundObject) {
        self.inner
            .objects
            .lock()
            .insert((service_id, object_id), bound);
    }

    pub fn remove_object(&self, service_id: u32, object_id: u32) -> Option<BoundObject> {
        self.inner.objects.lock().remove(&(service_id, object_id))
    }

    /// Number of objects hosted on this socket.
    pub fn object_count(&self) -> usize {
        self.inner.objects.lock().len()
    }

    /// Wrap a local object for travel inside a payload: an ephemeral bound
    /// object is hosted on this socket under a fresh object id and a
    /// reference to it is returned. The receiver releases it with
    /// `terminate`.
    pub fn bind_argument_object(
        &self,
        service_id: u32,
        object: Arc<DynamicObject>,
        policy: DispatchPolicy,
    ) -> Value {
        let object_id = crate::next_object_id();
        let meta = (**object.meta()).clone();
        let bound = BoundObject::with_object_id(object, policy, object_id);
        bound.set_service(service_id);
        self.add_object(service_id, object_id, bound);
        tracing::debug!(service = service_id, object = object_id, "hooked argument object");
        Value::Object(qilink_core::ObjectReference {
            meta,
            service: service_id,
            object: object_id,
        })
    }

    pub(crate) fn register_post_handler(&self, handler: PostHandler) -> u32 {
        let uid = self.inner.next_post_uid.fetch_add(1, Ordering::Relaxed);
        self.inner.post_handlers.lock().insert(uid, handler);
        uid
    }

    pub(crate) fn unregister_post_handler(&self, uid: u32) {
        self.inner.post_handlers.lock().remove(&uid);
    }

    pub(crate) fn register_cancelable(
        &self,
        id: u32,
        abort: AbortHandle,
        address: MessageAddress,
    ) {
        self.inner
            .cancels
            .lock()
            .insert(id, CancelEntry { abort, address });
    }

    pub(crate) fn unregister_cancelable(&self, id: u32) {
        self.inner.cancels.lock().remove(&id);
    }

    fn spawn_demux(&self) {
        let channel = self.clone();
        tokio::spawn(async move {
            loop {
                let message = match channel.inner.socket.recv().await {
                    Ok(message) => message,
                    Err(Error::ConnectionClosed) => break,
                    Err(e) => {
                        tracing::warn!(peer = channel.peer(), error = %e, "demux stopping");
                        break;
                    }
                };
                channel.route(message).await;
            }
            channel.shutdown_tables();
        });
    }

    async fn route(&self, message: Message) {
        match message.kind {
            Kind::Reply | Kind::Error | Kind::Canceled => {
                let waiter = self.inner.pending.lock().remove(&message.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(message));
                    }
                    None => {
                        tracing::debug!(id = message.id, "late reply dropped");
                    }
                }
            }
            Kind::Call => {
                if message.service == service::SERVER && message.action == action::AUTHENTICATE {
                    self.handle_authenticate(message).await;
                    return;
                }
                if self.inner.server_side && !self.inner.authenticated.load(Ordering::Acquire) {
                    tracing::warn!(peer = self.peer(), "message before capability exchange");
                    self.inner.socket.disconnect().await;
                    return;
                }
                self.dispatch_to_object(message).await;
            }
            Kind::Post | Kind::Event => {
                let handler = self.inner.post_handlers.lock().get(&message.action).cloned();
                if let Some(handler) = handler {
                    handler(message);
                } else {
                    self.dispatch_to_object(message).await;
                }
            }
            Kind::Cancel => {
                let entry = self.inner.cancels.lock().remove(&message.id);
                match entry {
                    Some(entry) => {
                        entry.abort.abort();
                        let ack = Message::new(Kind::Canceled, entry.address);
                        let _ = self.send(&ack).await;
                    }
                    None => {
                        tracing::debug!(id = message.id, "cancel for unknown call ignored");
                    }
                }
            }
            Kind::None => unreachable!("rejected by header validation"),
        }
    }

    async fn dispatch_to_object(&self, message: Message) {
        let bound = self
            .inner
            .objects
            .lock()
            .get(&(message.service, message.object))
            .cloned();
        match bound {
            Some(bound) => bound.dispatch(self, message).await,
            None if message.kind == Kind::Call => {
                tracing::debug!(%message, "call for unknown object");
                let reply = Message::error_reply(
                    &message,
                    &format!("unknown object {}.{}", message.service, message.object),
                );
                let _ = self.send(&reply).await;
            }
            None => {
                tracing::trace!(%message, "post for unknown object dropped");
            }
        }
    }

    async fn handle_authenticate(&self, message: Message) {
        let body = message.body().to_bytes();
        let params = Type::parse("({sm})").expect("constant signature");
        // Declared tuple: trailing garbage is a protocol violation.
        let theirs = decode_value_exact(&body, &params)
            .ok()
            .and_then(|v| v.into_tuple())
            .and_then(|mut t| t.pop())
            .and_then(|map| Capabilities::from_value(&map).ok());
        let Some(theirs) = theirs else {
            tracing::warn!(peer = self.peer(), "malformed capability map");
            self.inner.socket.disconnect().await;
            return;
        };
        let negotiated = Capabilities::local().intersect(&theirs);
        let reply_body = match encode_value(&negotiated.to_value()) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode capability reply");
                return;
            }
        };
        *self.inner.capabilities.lock() = negotiated;
        self.inner.authenticated.store(true, Ordering::Release);
        let reply = Message::reply_to(&message).with_body(reply_body);
        let _ = self.send(&reply).await;
    }

    async fn authenticate_client(&self) -> Result<()> {
        let local = Capabilities::local();
        let mut request = Message::call(service::SERVER, object::MAIN, action::AUTHENTICATE);
        request.set_body(encode_value(&Value::Tuple(vec![local.to_value()]))?);
        let reply = self.call(request, Some(HANDSHAKE_TIMEOUT)).await?;
        if reply.kind != Kind::Reply {
            return Err(Error::Remote(reply.error_description()));
        }
        let body = reply.body().to_bytes();
        let map = decode_value(&body, &Type::parse("{sm}").expect("constant signature"))?;
        let negotiated = Capabilities::from_value(&map)?;
        *self.inner.capabilities.lock() = negotiated;
        self.inner.authenticated.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown_tables(&self) {
        let waiters: Vec<_> = {
            let mut pending = self.inner.pending.lock();
            pending.drain().collect()
        };
        for (_, tx) in waiters {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
        self.inner.post_handlers.lock().clear();
        self.inner.objects.lock().clear();
        self.inner.cancels.lock().clear();
        let _ = self.inner.closed_tx.send(true);
    }
}

/// A pending call: resolves with the reply message, fails with the first
/// of {disconnect, timeout, cancellation}. Dropping it abandons the
/// waiter; a reply that arrives later is discarded.
pub struct PendingCall {
    channel: Channel,
    address: MessageAddress,
    rx: oneshot::Receiver<Result<Message>>,
    done: bool,
}

impl PendingCall {
    pub fn id(&self) -> u32 {
        self.address.id
    }

    /// Advisory cancellation: settles the local future with `Cancelled`
    /// immediately and, if the peer advertised it, sends a `Cancel`
    /// carrying the original id.
    pub fn cancel(&self) {
        let Some(tx) = self.channel.inner.pending.lock().remove(&self.address.id) else {
            return;
        };
        let _ = tx.send(Err(Error::Cancelled));
        if self.channel.capabilities().boolean(REMOTE_CANCELABLE_CALLS) {
            let channel = self.channel.clone();
            let cancel = Message::new(Kind::Cancel, self.address);
            tokio::spawn(async move {
                let _ = channel.send(&cancel).await;
            });
        }
    }

    fn abandon(&mut self) {
        self.done = true;
        self.channel.inner.pending.lock().remove(&self.address.id);
    }
}

impl Future for PendingCall {
    type Output = Result<Message>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.done = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.done = true;
                Poll::Ready(Err(Error::ConnectionClosed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.done {
            self.channel.inner.pending.lock().remove(&self.address.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectBuilder;
    use qilink_core::encode_value_as;

    fn echo_channel_pair() -> (Channel, Channel) {
        let (client_sock, server_sock) = TransportSocket::pair();
        let server = Channel::serve(server_sock);
        let object = ObjectBuilder::new()
            .method("echo", "(s)", "s", |_ctx, mut args| async move {
                Ok(args.remove(0))
            })
            .build();
        server.add_object(2, object::MAIN, BoundObject::new(object, DispatchPolicy::Queued));

        let client = Channel::from_socket(client_sock, false);
        client.spawn_demux();
        (client, server)
    }

    #[tokio::test]
    async fn handshake_then_call() {
        let (client, _server) = echo_channel_pair();
        client.authenticate_client().await.unwrap();
        assert!(client.capabilities().boolean(qilink_core::MESSAGE_FLAGS));

        let args = Value::Tuple(vec![Value::from("hi")]);
        let msg = Message::call(2, object::MAIN, 100)
            .with_body(encode_value_as(&args, &Type::parse("(s)").unwrap()).unwrap());
        let reply = client.call(msg, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(reply.kind, Kind::Reply);
        let value = decode_value(&reply.body().to_bytes(), &Type::String).unwrap();
        assert_eq!(value.as_str(), Some("hi"));
    }

    #[tokio::test]
    async fn call_with_bytes_beyond_the_parameter_tuple_is_rejected() {
        use qilink_core::Encoder;

        let (client, _server) = echo_channel_pair();
        client.authenticate_client().await.unwrap();

        // Raw garbage after the declared (s) tuple.
        let mut enc = Encoder::new();
        enc.write_str("hi");
        enc.write_u32(0xdead_beef);
        let msg = Message::call(2, object::MAIN, 100).with_body(enc.finish());
        let reply = client.call(msg, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(reply.kind, Kind::Error);
        assert!(reply.error_description().contains("trailing"));

        // An extra, structurally valid argument is the same violation:
        // the extra element must not be silently dropped.
        let args = Value::Tuple(vec![Value::from("hi"), Value::Int32(42)]);
        let body = encode_value_as(&args, &Type::parse("(si)").unwrap()).unwrap();
        let msg = Message::call(2, object::MAIN, 100).with_body(body);
        let reply = client.call(msg, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(reply.kind, Kind::Error);

        // A well-formed call on the same channel still succeeds.
        let args = Value::Tuple(vec![Value::from("still up")]);
        let body = encode_value_as(&args, &Type::parse("(s)").unwrap()).unwrap();
        let msg = Message::call(2, object::MAIN, 100).with_body(body);
        let reply = client.call(msg, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(reply.kind, Kind::Reply);
    }

    #[tokio::test]
    async fn server_drops_unauthenticated_traffic() {
        let (client_sock, server_sock) = TransportSocket::pair();
        let _server = Channel::serve(server_sock);
        let client = Channel::from_socket(client_sock, false);
        client.spawn_demux();

        // No handshake: the server must sever the connection.
        let msg = Message::call(2, object::MAIN, 100);
        let err = client.call(msg, Some(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed | Error::Timeout));
    }

    #[tokio::test]
    async fn pending_fails_on_disconnect() {
        let (client, server) = echo_channel_pair();
        client.authenticate_client().await.unwrap();

        // A call nothing will answer.
        let msg = Message::call(9, object::MAIN, 100);
        let pending = client.start_call(msg).await.unwrap();
        server.disconnect().await;
        assert!(matches!(pending.await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        let (client, _server) = echo_channel_pair();
        client.authenticate_client().await.unwrap();

        let msg = Message::call(9, object::MAIN, 100);
        let err = client
            .call(msg, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(client.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_settles_immediately() {
        let (client, _server) = echo_channel_pair();
        client.authenticate_client().await.unwrap();

        let msg = Message::call(9, object::MAIN, 100);
        let pending = client.start_call(msg).await.unwrap();
        pending.cancel();
        assert!(matches!(pending.await, Err(Error::Cancelled)));
        assert!(client.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn dropping_pending_call_cleans_table() {
        let (client, _server) = echo_channel_pair();
        client.authenticate_client().await.unwrap();

        let msg = Message::call(9, object::MAIN, 100);
        let pending = client.start_call(msg).await.unwrap();
        drop(pending);
        assert!(client.inner.pending.lock().is_empty());
    }
}
