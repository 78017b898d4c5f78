//! Sessions: the process-local facade over the directory connection,
//! hosted services, and consumed services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use qilink_core::{
    decode_value, decode_value_exact, directory_action, encode_value_as, object, service, Error,
    Kind, Message, MetaObject, Result, ServiceInfo, TransportServer, Type, Url, Value,
};

use crate::{
    fetch_metaobject, BoundObject, Channel, DispatchPolicy, DynamicObject, RemoteObject,
    SessionConfig,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

struct CachedService {
    id: u32,
    meta: Arc<MetaObject>,
    channel: Channel,
}

struct ServerState {
    endpoints: Vec<Url>,
    accept_task: JoinHandle<()>,
}

struct SessionInner {
    config: SessionConfig,
    machine_id: String,
    process_id: String,
    session_id: String,
    directory: Mutex<Option<Channel>>,
    /// Client channels keyed by endpoint URL, shared between services on
    /// the same endpoint.
    channels: Mutex<HashMap<String, Channel>>,
    cache: Mutex<HashMap<String, CachedService>>,
    /// Per-name guards so concurrent lookups coalesce into one directory
    /// RPC.
    lookup_guards: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    local: Mutex<HashMap<u32, (String, BoundObject)>>,
    served: Mutex<Vec<Channel>>,
    server: Mutex<Option<ServerState>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(state) = self.server.get_mut().take() {
            state.accept_task.abort();
        }
    }
}

/// A process-local messaging endpoint.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.inner.session_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Session {
        let session_id = format!(
            "{}-{}",
            std::process::id(),
            NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
        );
        Session {
            inner: Arc::new(SessionInner {
                config,
                machine_id: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()),
                process_id: std::process::id().to_string(),
                session_id,
                directory: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                lookup_guards: Mutex::new(HashMap::new()),
                local: Mutex::new(HashMap::new()),
                served: Mutex::new(Vec::new()),
                server: Mutex::new(None),
            }),
        }
    }

    /// Connect to the configured directory URL.
    pub async fn connect(&self) -> Result<()> {
        let url = self.inner.config.directory_url.clone();
        self.connect_to(&url).await
    }

    /// Connect to a directory and subscribe to its removal notifications
    /// so cached lookups stay truthful.
    pub async fn connect_to(&self, url: &Url) -> Result<()> {
        let channel = Channel::connect(url).await?;

        let weak = Arc::downgrade(&self.inner);
        let removed_signature = Type::parse("(Is)").expect("constant signature");
        let post_uid = channel.register_post_handler(Arc::new(move |message: Message| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let body = message.body().to_bytes();
            let value = match decode_value_exact(&body, &removed_signature) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed serviceRemoved payload");
                    return;
                }
            };
            let args = value.into_tuple().unwrap_or_default();
            if let Some(name) = args.get(1).and_then(Value::as_str) {
                tracing::debug!(name, "service removed; dropping cached lookup");
                inner.cache.lock().remove(name);
            }
        }));

        let subscribe = Message::call(
            service::DIRECTORY,
            object::MAIN,
            qilink_core::action::REGISTER_EVENT,
        )
        .with_body(encode_value_as(
            &Value::Tuple(vec![
                Value::UInt32(directory_action::SERVICE_REMOVED),
                Value::UInt32(post_uid),
            ]),
            &Type::parse("(II)").expect("constant signature"),
        )?);
        let reply = channel.call(subscribe, self.inner.config.call_timeout).await?;
        if reply.kind != Kind::Reply {
            return Err(Error::Remote(reply.error_description()));
        }

        *self.inner.directory.lock() = Some(channel);
        Ok(())
    }

    /// Resolve a service by name and build a proxy for its main object.
    pub async fn service(&self, name: &str) -> Result<RemoteObject> {
        if let Some(proxy) = self.cached_proxy(name) {
            return Ok(proxy);
        }

        // One outstanding directory RPC per name; everyone else waits for
        // the cache to fill.
        let guard = {
            let mut guards = self.inner.lookup_guards.lock();
            guards
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _locked = guard.lock().await;
        if let Some(proxy) = self.cached_proxy(name) {
            return Ok(proxy);
        }

        let info = self.lookup(name).await?;
        if info.endpoints.is_empty() {
            return Err(Error::ServiceNotFound(name.to_owned()));
        }
        let channel = self.channel_to(&info.endpoints, name).await?;
        let meta = fetch_metaobject(
            &channel,
            info.id,
            object::MAIN,
            self.inner.config.call_timeout,
        )
        .await?;

        if self.inner.config.service_cache {
            self.inner.cache.lock().insert(
                name.to_owned(),
                CachedService {
                    id: info.id,
                    meta: meta.clone(),
                    channel: channel.clone(),
                },
            );
            let weak = Arc::downgrade(&self.inner);
            let watched = channel.clone();
            tokio::spawn(async move {
                watched.closed().await;
                if let Some(inner) = weak.upgrade() {
                    let channel_id = watched.id();
                    inner
                        .cache
                        .lock()
                        .retain(|_, entry| entry.channel.id() != channel_id);
                }
            });
        }

        Ok(RemoteObject::new(
            channel,
            info.id,
            object::MAIN,
            meta,
            self.inner.config.call_timeout,
        ))
    }

    /// List every visible service.
    pub async fn services(&self) -> Result<Vec<ServiceInfo>> {
        let list_signature =
            Type::parse("[(I[s][s]s)]").expect("constant signature");
        let value = self
            .directory_call(
                directory_action::SERVICES,
                Value::Tuple(vec![]),
                "()",
                &list_signature,
            )
            .await?;
        let Value::List(items) = value else {
            return Ok(Vec::new());
        };
        items
            .iter()
            .map(|item| ServiceInfo::from_value(item).map_err(Error::from))
            .collect()
    }

    /// Host `object` under `name`: register at the directory, expose it on
    /// this session's endpoints, announce readiness.
    pub async fn register_service(&self, name: &str, object: Arc<DynamicObject>) -> Result<u32> {
        self.register_service_with(name, object, DispatchPolicy::Auto)
            .await
    }

    pub async fn register_service_with(
        &self,
        name: &str,
        object: Arc<DynamicObject>,
        policy: DispatchPolicy,
    ) -> Result<u32> {
        self.ensure_listening().await?;
        let info = ServiceInfo {
            id: 0,
            name: name.to_owned(),
            endpoints: self.endpoints().iter().map(ToString::to_string).collect(),
            machine_id: self.inner.machine_id.clone(),
            process_id: self.inner.process_id.clone(),
            session_id: self.inner.session_id.clone(),
        };
        let id = match self
            .directory_call(
                directory_action::REGISTER_SERVICE,
                Value::Tuple(vec![info.to_value()]),
                "((I[s][s]s))",
                &Type::UInt32,
            )
            .await
        {
            Ok(value) => value
                .as_u32()
                .ok_or_else(|| Error::Remote("malformed service id".to_owned()))?,
            Err(Error::Remote(m)) if m.contains("already registered") => {
                return Err(Error::AlreadyRegistered(name.to_owned()));
            }
            Err(e) => return Err(e),
        };

        let bound = BoundObject::new(object, policy);
        bound.set_service(id);
        self.inner
            .local
            .lock()
            .insert(id, (name.to_owned(), bound.clone()));
        for channel in self.inner.served.lock().iter() {
            channel.add_object(id, object::MAIN, bound.clone());
        }

        self.directory_call(
            directory_action::SERVICE_READY,
            Value::Tuple(vec![Value::UInt32(id)]),
            "(I)",
            &Type::Void,
        )
        .await?;
        tracing::debug!(name, id, "service registered");
        Ok(id)
    }

    /// Withdraw a hosted service.
    pub async fn unregister_service(&self, id: u32) -> Result<()> {
        self.directory_call(
            directory_action::UNREGISTER_SERVICE,
            Value::Tuple(vec![Value::UInt32(id)]),
            "(I)",
            &Type::Void,
        )
        .await?;
        self.inner.local.lock().remove(&id);
        for channel in self.inner.served.lock().iter() {
            channel.remove_object(id, object::MAIN);
        }
        Ok(())
    }

    /// Start accepting peer connections on `url`.
    pub async fn listen(&self, url: &Url) -> Result<()> {
        let mut server = TransportServer::bind(std::slice::from_ref(url)).await?;
        let endpoints = server.endpoints().to_vec();
        let weak = Arc::downgrade(&self.inner);
        let accept_task = tokio::spawn(async move {
            while let Some(socket) = server.accept().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let channel = Channel::serve(socket);
                for (id, (_, bound)) in inner.local.lock().iter() {
                    channel.add_object(*id, object::MAIN, bound.clone());
                }
                inner.served.lock().push(channel.clone());

                let weak_inner = Arc::downgrade(&inner);
                tokio::spawn(async move {
                    let channel_id = channel.id();
                    channel.closed().await;
                    if let Some(inner) = weak_inner.upgrade() {
                        inner.served.lock().retain(|c| c.id() != channel_id);
                    }
                });
            }
        });
        *self.inner.server.lock() = Some(ServerState {
            endpoints,
            accept_task,
        });
        Ok(())
    }

    /// Endpoints this session is listening on.
    pub fn endpoints(&self) -> Vec<Url> {
        self.inner
            .server
            .lock()
            .as_ref()
            .map(|s| s.endpoints.clone())
            .unwrap_or_default()
    }

    /// Tear everything down: directory link, service channels, listeners.
    pub async fn close(&self) {
        let directory = self.inner.directory.lock().take();
        if let Some(directory) = directory {
            directory.disconnect().await;
        }
        let channels: Vec<Channel> = self.inner.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.disconnect().await;
        }
        let served: Vec<Channel> = std::mem::take(&mut *self.inner.served.lock());
        for channel in served {
            channel.disconnect().await;
        }
        if let Some(state) = self.inner.server.lock().take() {
            state.accept_task.abort();
        }
        self.inner.cache.lock().clear();
    }

    fn cached_proxy(&self, name: &str) -> Option<RemoteObject> {
        if !self.inner.config.service_cache {
            return None;
        }
        let cache = self.inner.cache.lock();
        let entry = cache.get(name)?;
        if entry.channel.is_closed() {
            return None;
        }
        Some(RemoteObject::new(
            entry.channel.clone(),
            entry.id,
            object::MAIN,
            entry.meta.clone(),
            self.inner.config.call_timeout,
        ))
    }

    async fn lookup(&self, name: &str) -> Result<ServiceInfo> {
        let value = match self
            .directory_call(
                directory_action::SERVICE,
                Value::Tuple(vec![Value::String(name.to_owned())]),
                "(s)",
                &ServiceInfo::signature(),
            )
            .await
        {
            Ok(value) => value,
            Err(Error::Remote(m)) => {
                tracing::debug!(name, error = %m, "directory lookup failed");
                return Err(Error::ServiceNotFound(name.to_owned()));
            }
            Err(e) => return Err(e),
        };
        Ok(ServiceInfo::from_value(&value)?)
    }

    /// Open (or reuse) a channel to the first reachable endpoint.
    async fn channel_to(&self, endpoints: &[String], name: &str) -> Result<Channel> {
        let mut last_error = None;
        for endpoint in endpoints {
            let Ok(url) = endpoint.parse::<Url>() else {
                tracing::debug!(%endpoint, "skipping unparseable endpoint");
                continue;
            };
            let existing = self.inner.channels.lock().get(endpoint).cloned();
            if let Some(channel) = existing {
                if !channel.is_closed() {
                    return Ok(channel);
                }
            }
            match Channel::connect(&url).await {
                Ok(channel) => {
                    self.inner
                        .channels
                        .lock()
                        .insert(endpoint.clone(), channel.clone());
                    let weak = Arc::downgrade(&self.inner);
                    let key = endpoint.clone();
                    let watched = channel.clone();
                    tokio::spawn(async move {
                        watched.closed().await;
                        if let Some(inner) = weak.upgrade() {
                            inner.channels.lock().remove(&key);
                        }
                    });
                    return Ok(channel);
                }
                Err(e) => {
                    tracing::debug!(endpoint, error = %e, "endpoint unreachable");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Err(Error::ServiceUnavailable(name.to_owned())),
        }
    }

    async fn directory_call(
        &self,
        action_id: u32,
        args: Value,
        params: &str,
        return_signature: &Type,
    ) -> Result<Value> {
        let channel = self
            .inner
            .directory
            .lock()
            .clone()
            .ok_or_else(|| Error::ServiceUnavailable("service directory".to_owned()))?;
        let params = Type::parse(params).expect("constant signature");
        let body = encode_value_as(&args, &params)?;
        let message =
            Message::call(service::DIRECTORY, object::MAIN, action_id).with_body(body);
        let reply = channel.call(message, self.inner.config.call_timeout).await?;
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

    async fn ensure_listening(&self) -> Result<()> {
        if self.inner.server.lock().is_some() {
            return Ok(());
        }
        let url = self.inner.config.listen_url.clone();
        self.listen(&url).await
    }
}
