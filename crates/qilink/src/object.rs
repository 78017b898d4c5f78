//! Concrete callable objects.
//!
//! A [`DynamicObject`] pairs a [`MetaObject`] with handler closures,
//! property cells, and a signal hub. [`ObjectBuilder`] advertises
//! methods, signals, and properties and produces the metaobject as a
//! by-product.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use qilink_core::{
    encode_value_as, Error, MetaObject, MetaObjectBuilder, Message, ObjectReference, Result,
    Type, Value,
};

use crate::{Channel, RemoteObject};

/// Context handed to every method handler.
#[derive(Clone)]
pub struct CallContext {
    /// The channel the call arrived on.
    pub channel: Channel,
}

impl CallContext {
    /// Materialise a proxy for an object reference received as an
    /// argument. The proxy posts `terminate` to the host when dropped.
    pub fn proxy(&self, reference: &ObjectReference) -> RemoteObject {
        RemoteObject::from_reference(self.channel.clone(), reference)
    }
}

pub(crate) type MethodHandler =
    Arc<dyn Fn(CallContext, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct RemoteLink {
    channel: Channel,
    service: u32,
    object: u32,
    callback: u32,
}

/// Fan-out state for one object's signals. Emission is serialized through
/// a single worker task, preserving per-signal order.
pub(crate) struct SignalHub {
    links: Mutex<HashMap<u32, HashMap<u64, RemoteLink>>>,
    next_link: AtomicU64,
    emitter: OnceLock<mpsc::UnboundedSender<Vec<(Channel, Message)>>>,
}

impl SignalHub {
    fn new() -> Arc<SignalHub> {
        Arc::new(SignalHub {
            links: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(1),
            emitter: OnceLock::new(),
        })
    }

    /// Record a remote listener. The link dies with the channel.
    pub(crate) fn connect_remote(
        self: &Arc<Self>,
        signal: u32,
        channel: Channel,
        service: u32,
        object: u32,
        callback: u32,
    ) -> u64 {
        let link_id = self.next_link.fetch_add(1, Ordering::Relaxed);
        self.links.lock().entry(signal).or_default().insert(
            link_id,
            RemoteLink {
                channel: channel.clone(),
                service,
                object,
                callback,
            },
        );

        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            channel.closed().await;
            if let Some(hub) = hub.upgrade() {
                hub.disconnect_channel(channel.id());
            }
        });
        link_id
    }

    pub(crate) fn disconnect(&self, signal: u32, link_id: u64) -> bool {
        let mut links = self.links.lock();
        match links.get_mut(&signal) {
            Some(per_signal) => per_signal.remove(&link_id).is_some(),
            None => false,
        }
    }

    fn disconnect_channel(&self, channel_id: u64) {
        let mut links = self.links.lock();
        for per_signal in links.values_mut() {
            per_signal.retain(|_, link| link.channel.id() != channel_id);
        }
    }

    pub(crate) fn link_count(&self, signal: u32) -> usize {
        self.links
            .lock()
            .get(&signal)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    fn emit(&self, signal: u32, signature: &Type, args: Vec<Value>) -> Result<()> {
        let body = encode_value_as(&Value::Tuple(args), signature)?;
        let sends: Vec<(Channel, Message)> = self
            .links
            .lock()
            .get(&signal)
            .into_iter()
            .flat_map(HashMap::values)
            .map(|link| {
                let message =
                    Message::post(link.service, link.object, link.callback).with_body(body.clone());
                (link.channel.clone(), message)
            })
            .collect();
        if sends.is_empty() {
            return Ok(());
        }

        // One worker per hub: posts for the same publisher leave in
        // emission order.
        let emitter = self.emitter.get_or_init(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<(Channel, Message)>>();
            tokio::spawn(async move {
                while let Some(batch) = rx.recv().await {
                    for (channel, message) in batch {
                        if channel.send(&message).await.is_err() {
                            tracing::trace!("signal post dropped on closed channel");
                        }
                    }
                }
            });
            tx
        });
        let _ = emitter.send(sends);
        Ok(())
    }
}

/// A concrete object: metaobject plus the handlers, signals, and
/// properties backing it.
pub struct DynamicObject {
    meta: Arc<MetaObject>,
    handlers: HashMap<u32, MethodHandler>,
    properties: Mutex<HashMap<u32, Value>>,
    property_signals: HashMap<u32, u32>,
    hub: Arc<SignalHub>,
}

impl std::fmt::Debug for DynamicObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicObject")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl DynamicObject {
    pub fn builder() -> ObjectBuilder {
        ObjectBuilder::new()
    }

    pub fn meta(&self) -> &Arc<MetaObject> {
        &self.meta
    }

    pub(crate) fn handler(&self, uid: u32) -> Option<MethodHandler> {
        self.handlers.get(&uid).cloned()
    }

    pub(crate) fn hub(&self) -> &Arc<SignalHub> {
        &self.hub
    }

    /// Emit a signal to every registered listener.
    pub fn emit(&self, signal: &str, args: Vec<Value>) -> Result<()> {
        let uid = self
            .meta
            .signal_uid(signal)
            .ok_or_else(|| Error::SignalNotFound(signal.to_owned()))?;
        self.emit_uid(uid, args)
    }

    pub fn emit_uid(&self, uid: u32, args: Vec<Value>) -> Result<()> {
        let signature = self
            .meta
            .signal(uid)
            .map(|s| s.signature.clone())
            .ok_or_else(|| Error::SignalNotFound(uid.to_string()))?;
        self.hub.emit(uid, &signature, args)
    }

    pub fn property(&self, uid: u32) -> Option<Value> {
        self.properties.lock().get(&uid).cloned()
    }

    /// Store a property value, then emit its change signal. The store
    /// happens-before the emission.
    pub fn set_property(&self, uid: u32, value: Value) -> Result<()> {
        if self.meta.property(uid).is_none() {
            return Err(Error::PropertyNotFound(uid.to_string()));
        }
        self.properties.lock().insert(uid, value.clone());
        if let Some(signal) = self.property_signals.get(&uid) {
            self.emit_uid(*signal, vec![value])?;
        }
        Ok(())
    }

    pub fn properties_snapshot(&self) -> Vec<(u32, Value)> {
        let mut entries: Vec<(u32, Value)> = self
            .properties
            .lock()
            .iter()
            .map(|(uid, value)| (*uid, value.clone()))
            .collect();
        entries.sort_by_key(|(uid, _)| *uid);
        entries
    }
}

/// Builds a [`DynamicObject`].
///
/// Signatures are given in their compact textual form; an invalid
/// signature is a programming error and panics.
#[derive(Default)]
pub struct ObjectBuilder {
    meta: MetaObjectBuilder,
    handlers: HashMap<u32, MethodHandler>,
    properties: HashMap<u32, Value>,
    property_signals: HashMap<u32, u32>,
}

impl ObjectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn description(mut self, description: &str) -> Self {
        self.meta = std::mem::take(&mut self.meta).description(description);
        self
    }

    /// Advertise a method with an auto-assigned uid.
    pub fn method<F, Fut>(self, name: &str, params: &str, ret: &str, handler: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let uid = self.meta.next_uid();
        self.method_with_uid(uid, name, params, ret, handler)
    }

    /// Advertise a method at a fixed uid (wire-contract objects).
    pub fn method_with_uid<F, Fut>(
        mut self,
        uid: u32,
        name: &str,
        params: &str,
        ret: &str,
        handler: F,
    ) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let params = parse_signature(params);
        let ret = parse_signature(ret);
        assert!(
            matches!(params, Type::Tuple(_)),
            "parameter signature must be a tuple"
        );
        self.meta = std::mem::take(&mut self.meta).method_with_uid(uid, name, &params, &ret, "");
        let boxed: MethodHandler = Arc::new(move |ctx, args| Box::pin(handler(ctx, args)));
        self.handlers.insert(uid, boxed);
        self
    }

    pub fn signal(mut self, name: &str, signature: &str) -> Self {
        let signature = parse_signature(signature);
        assert!(
            matches!(signature, Type::Tuple(_)),
            "signal signature must be a tuple"
        );
        self.meta = std::mem::take(&mut self.meta).signal(name, &signature);
        self
    }

    pub fn signal_with_uid(mut self, uid: u32, name: &str, signature: &str) -> Self {
        let signature = parse_signature(signature);
        self.meta = std::mem::take(&mut self.meta).signal_with_uid(uid, name, &signature);
        self
    }

    /// Advertise a property; a change signal of the same name is
    /// advertised alongside it.
    pub fn property(mut self, name: &str, signature: &str, initial: Value) -> Self {
        let signature = parse_signature(signature);
        let mut meta = std::mem::take(&mut self.meta);
        let property_uid = meta.next_uid();
        meta = meta.property_with_uid(property_uid, name, &signature);
        let signal_uid = meta.next_uid();
        meta = meta.signal_with_uid(
            signal_uid,
            name,
            &Type::Tuple(vec![signature.clone()]),
        );
        self.meta = meta;
        self.properties.insert(property_uid, initial);
        self.property_signals.insert(property_uid, signal_uid);
        self
    }

    pub fn build(self) -> Arc<DynamicObject> {
        Arc::new(DynamicObject {
            meta: Arc::new(self.meta.build()),
            handlers: self.handlers,
            properties: Mutex::new(self.properties),
            property_signals: self.property_signals,
            hub: SignalHub::new(),
        })
    }
}

fn parse_signature(text: &str) -> Type {
    match Type::parse(text) {
        Ok(ty) => ty,
        Err(e) => panic!("invalid signature {text:?}: {e}"),
    }
}
