//! qilink-gateway: forwards client traffic to services without clients
//! ever learning service endpoints.
//!
//! The gateway works below the object layer, on raw sockets. Client
//! messages are rewritten onto per-service upstream sockets with fresh
//! correlation ids; replies are mapped back through the rewrite table.
//! Endpoint lookups are answered with the gateway's own endpoints, and
//! messages for a service whose socket is still opening are staged and
//! drained in arrival order once it connects.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use qilink_core::{
    action, decode_value_exact, directory_action, encode_value, encode_value_as, object,
    service, Body, Capabilities, Error, Kind, Message, MessageAddress, ProtocolError, Result,
    ServiceInfo, TransportServer, TransportSocket, Type, Url, Value,
};

/// First forwarded correlation id.
const FORWARD_ID_BASE: u32 = 500;

/// Who a forwarded message belongs to.
#[derive(Clone)]
enum Origin {
    /// A downstream client call awaiting the reply.
    Client {
        client: u64,
        address: MessageAddress,
        /// C.1: substitute the gateway's endpoints into the reply.
        rewrite_endpoints: bool,
    },
    /// A gateway-internal endpoint lookup for `service_id`.
    Lookup { service_id: u32 },
}

struct ServiceLinkUp {
    service_id: u32,
    socket: TransportSocket,
    /// forwarded id → origin; a bijection over its lifetime.
    rewrites: Mutex<HashMap<u32, Origin>>,
}

#[derive(Clone)]
enum ServiceLink {
    /// Lookup or connect in progress; traffic is staged.
    Opening,
    Up(Arc<ServiceLinkUp>),
}

struct GatewayInner {
    endpoints: Vec<Url>,
    clients: Mutex<HashMap<u64, TransportSocket>>,
    services: Mutex<HashMap<u32, ServiceLink>>,
    pending: Mutex<HashMap<u32, Vec<(Message, u64)>>>,
    /// service id → name, learned from lookups passing through.
    names: Mutex<HashMap<u32, String>>,
    next_forward_id: AtomicU32,
    next_client_id: AtomicU64,
}

/// A running gateway.
pub struct Gateway {
    inner: Arc<GatewayInner>,
    accept_task: JoinHandle<()>,
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Gateway {
    /// Connect upstream to the directory and start accepting clients on
    /// `listen_url`.
    pub async fn listen(directory_url: &Url, listen_url: &Url) -> Result<Gateway> {
        let mut server = TransportServer::bind(std::slice::from_ref(listen_url)).await?;
        let endpoints = server.endpoints().to_vec();

        let inner = Arc::new(GatewayInner {
            endpoints,
            clients: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            next_forward_id: AtomicU32::new(FORWARD_ID_BASE),
            next_client_id: AtomicU64::new(1),
        });

        let directory_socket = TransportSocket::connect(directory_url).await?;
        client_handshake(&directory_socket).await?;
        let directory_link = Arc::new(ServiceLinkUp {
            service_id: service::DIRECTORY,
            socket: directory_socket,
            rewrites: Mutex::new(HashMap::new()),
        });
        inner
            .services
            .lock()
            .insert(service::DIRECTORY, ServiceLink::Up(directory_link.clone()));
        tokio::spawn(service_loop(inner.clone(), directory_link));

        let accept_inner = inner.clone();
        let accept_task = tokio::spawn(async move {
            while let Some(socket) = server.accept().await {
                let client_id = accept_inner.next_client_id.fetch_add(1, Ordering::Relaxed);
                accept_inner.clients.lock().insert(client_id, socket.clone());
                tracing::debug!(client_id, peer = socket.peer(), "gateway client connected");
                tokio::spawn(client_loop(accept_inner.clone(), client_id, socket));
            }
        });

        tracing::debug!(endpoint = %inner.endpoints[0], "gateway up");
        Ok(Gateway { inner, accept_task })
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.inner.endpoints
    }

    pub fn url(&self) -> Url {
        self.inner.endpoints[0].clone()
    }

    /// In-flight rewrite entries across every service socket
    /// (diagnostics; zero at quiescence).
    pub fn outstanding_forwards(&self) -> usize {
        self.inner
            .services
            .lock()
            .values()
            .map(|link| match link {
                ServiceLink::Up(link) => link.rewrites.lock().len(),
                ServiceLink::Opening => 0,
            })
            .sum()
    }

    /// Messages staged for services still opening (diagnostics).
    pub fn staged_messages(&self) -> usize {
        self.inner.pending.lock().values().map(Vec::len).sum()
    }
}

/// Authenticate on an upstream socket before any forwarding.
async fn client_handshake(socket: &TransportSocket) -> Result<()> {
    let mut request = Message::call(service::SERVER, object::MAIN, action::AUTHENTICATE);
    request.set_body(encode_value(&Value::Tuple(vec![
        Capabilities::local().to_value(),
    ]))?);
    let id = request.id;
    socket.send(&request).await?;
    let reply = socket.recv().await?;
    if reply.id != id || reply.kind != Kind::Reply {
        return Err(Error::Protocol(ProtocolError::NotAuthenticated));
    }
    Ok(())
}

async fn client_loop(gw: Arc<GatewayInner>, client_id: u64, socket: TransportSocket) {
    loop {
        let message = match socket.recv().await {
            Ok(message) => message,
            Err(_) => break,
        };
        handle_client_message(&gw, client_id, &socket, message).await;
    }
    gw.clients.lock().remove(&client_id);
    // Staged messages from this client are discarded; in-flight rewrite
    // entries stay, their replies land on the departed client and drop.
    for staged in gw.pending.lock().values_mut() {
        staged.retain(|(_, owner)| *owner != client_id);
    }
    tracing::debug!(client_id, "gateway client disconnected");
}

// From a client:
//   C.1  endpoint lookup for a service        => answer with the gateway's
//        own endpoints (resolve upstream, rewrite the reply)
//   C.2  message to a service with no socket  => stage it, look the
//        service up, open a socket
//   C.3  message to a known service           => rewrite the id, forward
async fn handle_client_message(
    gw: &Arc<GatewayInner>,
    client_id: u64,
    socket: &TransportSocket,
    message: Message,
) {
    if message.kind == Kind::Call
        && message.service == service::SERVER
        && message.action == action::AUTHENTICATE
    {
        answer_authenticate(socket, &message).await;
        return;
    }
    if message.kind == Kind::Cancel {
        forward_cancel(gw, client_id, &message).await;
        return;
    }

    let rewrite_endpoints = message.kind == Kind::Call
        && message.service == service::DIRECTORY
        && message.action == directory_action::SERVICE;

    let link = gw.services.lock().get(&message.service).cloned();
    match link {
        // C.3 (C.1 rides the always-present directory link)
        Some(ServiceLink::Up(link)) => {
            forward(gw, client_id, &link, message, rewrite_endpoints).await;
        }
        Some(ServiceLink::Opening) => {
            gw.pending
                .lock()
                .entry(message.service)
                .or_default()
                .push((message, client_id));
        }
        // C.2
        None => open_service(gw, client_id, socket, message).await,
    }
}

async fn forward(
    gw: &Arc<GatewayInner>,
    client_id: u64,
    link: &Arc<ServiceLinkUp>,
    message: Message,
    rewrite_endpoints: bool,
) {
    match message.kind {
        Kind::Call => {
            let address = message.address();
            let origin = Origin::Client {
                client: client_id,
                address,
                rewrite_endpoints,
            };
            if !send_upstream(gw, link, message, origin).await {
                notify_client_error(gw, client_id, address, "service unavailable").await;
            }
        }
        // One-way traffic needs no correlation entry.
        _ => {
            let _ = link.socket.send(&message).await;
        }
    }
}

/// Allocate a forwarded id, record the origin, send. Refuses (returns
/// false) if the id is somehow still in flight or the socket is gone.
async fn send_upstream(
    gw: &Arc<GatewayInner>,
    link: &Arc<ServiceLinkUp>,
    mut message: Message,
    origin: Origin,
) -> bool {
    let forwarded = gw.next_forward_id.fetch_add(1, Ordering::Relaxed);
    {
        let mut rewrites = link.rewrites.lock();
        if rewrites.contains_key(&forwarded) {
            // Wrapped all the way around onto an in-flight call.
            tracing::warn!(forwarded, "forwarded id still in flight; refusing");
            return false;
        }
        rewrites.insert(forwarded, origin);
    }
    message.id = forwarded;
    if link.socket.send(&message).await.is_err() {
        link.rewrites.lock().remove(&forwarded);
        return false;
    }
    true
}

async fn open_service(
    gw: &Arc<GatewayInner>,
    client_id: u64,
    client_socket: &TransportSocket,
    message: Message,
) {
    let service_id = message.service;
    let Some(name) = gw.names.lock().get(&service_id).cloned() else {
        tracing::debug!(service = service_id, "message for unresolvable service");
        let reply = Message::error(
            message.address(),
            &format!("service unavailable: unknown service {service_id}"),
        );
        let _ = client_socket.send(&reply).await;
        return;
    };

    // Another client may have started opening this service in the
    // meantime; re-dispatch instead of issuing a second lookup.
    let already_opening = {
        let mut services = gw.services.lock();
        if services.contains_key(&service_id) {
            true
        } else {
            services.insert(service_id, ServiceLink::Opening);
            false
        }
    };
    if already_opening {
        return Box::pin(handle_client_message(gw, client_id, client_socket, message)).await;
    }
    gw.pending
        .lock()
        .entry(service_id)
        .or_default()
        .push((message, client_id));

    let Some(directory) = directory_link(gw) else {
        fail_service(gw, service_id, "directory unavailable").await;
        return;
    };
    let mut lookup = Message::call(service::DIRECTORY, object::MAIN, directory_action::SERVICE);
    let params = Type::parse("(s)").expect("constant signature");
    match encode_value_as(&Value::Tuple(vec![Value::String(name)]), &params) {
        Ok(body) => lookup.set_body(body),
        Err(e) => {
            tracing::warn!(error = %e, "lookup encode failed");
            fail_service(gw, service_id, "internal error").await;
            return;
        }
    }
    if !send_upstream(gw, &directory, lookup, Origin::Lookup { service_id }).await {
        fail_service(gw, service_id, "directory unavailable").await;
    }
}

async fn service_loop(gw: Arc<GatewayInner>, link: Arc<ServiceLinkUp>) {
    loop {
        let message = match link.socket.recv().await {
            Ok(message) => message,
            Err(_) => break,
        };
        match message.kind {
            Kind::Reply | Kind::Error | Kind::Canceled => {
                let origin = link.rewrites.lock().remove(&message.id);
                match origin {
                    // S.3
                    Some(Origin::Client {
                        client,
                        address,
                        rewrite_endpoints,
                    }) => {
                        deliver_to_client(&gw, client, address, message, rewrite_endpoints).await;
                    }
                    // S.1
                    Some(Origin::Lookup { service_id }) => {
                        handle_lookup_reply(&gw, service_id, message);
                    }
                    None => {
                        tracing::debug!(id = message.id, "unmatched service reply dropped");
                    }
                }
            }
            _ => {
                tracing::debug!(%message, "service-sourced message without correlation dropped");
            }
        }
    }
    service_failed(&gw, &link).await;
}

async fn deliver_to_client(
    gw: &Arc<GatewayInner>,
    client: u64,
    address: MessageAddress,
    message: Message,
    rewrite_endpoints: bool,
) {
    let mut out = message;
    out.id = address.id;
    if rewrite_endpoints && out.kind == Kind::Reply {
        match rewrite_endpoint_reply(gw, &out) {
            Some(body) => out.set_body(body),
            // Never pass the backend's real endpoints through.
            None => {
                tracing::warn!(id = address.id, "malformed lookup reply; failing the call");
                out = Message::error(address, "service unavailable: malformed lookup reply");
            }
        }
    }
    let socket = gw.clients.lock().get(&client).cloned();
    match socket {
        Some(socket) => {
            let _ = socket.send(&out).await;
        }
        None => {
            tracing::debug!(client, "reply for departed client dropped");
        }
    }
}

/// C.1 tail: swap the advertised endpoints for the gateway's own and
/// remember the id→name mapping for later C.2 lookups.
fn rewrite_endpoint_reply(gw: &Arc<GatewayInner>, reply: &Message) -> Option<Body> {
    let body = reply.body().to_bytes();
    let value = decode_value_exact(&body, &ServiceInfo::signature()).ok()?;
    let mut info = ServiceInfo::from_value(&value).ok()?;
    gw.names.lock().insert(info.id, info.name.clone());
    info.endpoints = gw.endpoints.iter().map(ToString::to_string).collect();
    encode_value_as(&info.to_value(), &ServiceInfo::signature()).ok()
}

/// S.1: a gateway-internal lookup resolved; open the service socket, then
/// S.2: drain what was staged for it.
fn handle_lookup_reply(gw: &Arc<GatewayInner>, service_id: u32, message: Message) {
    if message.kind != Kind::Reply {
        let gw = gw.clone();
        tokio::spawn(async move {
            fail_service(&gw, service_id, "directory lookup failed").await;
        });
        return;
    }
    let body = message.body().to_bytes();
    let info = decode_value_exact(&body, &ServiceInfo::signature())
        .ok()
        .and_then(|value| ServiceInfo::from_value(&value).ok());
    let gw = gw.clone();
    tokio::spawn(async move {
        let Some(info) = info else {
            fail_service(&gw, service_id, "malformed lookup reply").await;
            return;
        };
        gw.names.lock().insert(info.id, info.name.clone());

        for endpoint in &info.endpoints {
            let Ok(url) = endpoint.parse::<Url>() else {
                continue;
            };
            let Ok(socket) = TransportSocket::connect(&url).await else {
                tracing::debug!(%url, "service endpoint unreachable");
                continue;
            };
            if client_handshake(&socket).await.is_err() {
                continue;
            }
            let link = Arc::new(ServiceLinkUp {
                service_id,
                socket,
                rewrites: Mutex::new(HashMap::new()),
            });
            gw.services
                .lock()
                .insert(service_id, ServiceLink::Up(link.clone()));
            tokio::spawn(service_loop(gw.clone(), link.clone()));
            tracing::debug!(service = service_id, %url, "service socket up");

            // S.2: FIFO drain via C.3.
            let staged = gw.pending.lock().remove(&service_id).unwrap_or_default();
            for (message, client) in staged {
                forward(&gw, client, &link, message, false).await;
            }
            return;
        }
        fail_service(&gw, service_id, "no reachable endpoint").await;
    });
}

/// A service socket died: outstanding forwards fail, staged traffic is
/// dropped, the entry is removed.
async fn service_failed(gw: &Arc<GatewayInner>, link: &Arc<ServiceLinkUp>) {
    tracing::warn!(service = link.service_id, "service socket lost");
    {
        let mut services = gw.services.lock();
        if let Some(ServiceLink::Up(current)) = services.get(&link.service_id) {
            if Arc::ptr_eq(current, link) {
                services.remove(&link.service_id);
            }
        }
    }
    let rewrites: Vec<(u32, Origin)> = link.rewrites.lock().drain().collect();
    for (_, origin) in rewrites {
        match origin {
            Origin::Client {
                client, address, ..
            } => {
                notify_client_error(gw, client, address, "service unavailable").await;
            }
            Origin::Lookup { service_id } => {
                fail_service(gw, service_id, "directory lost").await;
            }
        }
    }
    fail_service(gw, link.service_id, "service disconnected").await;
}

async fn fail_service(gw: &Arc<GatewayInner>, service_id: u32, why: &str) {
    gw.services.lock().remove(&service_id);
    let staged = gw.pending.lock().remove(&service_id).unwrap_or_default();
    for (message, client) in staged {
        notify_client_error(
            gw,
            client,
            message.address(),
            &format!("service unavailable: {why}"),
        )
        .await;
    }
}

async fn notify_client_error(
    gw: &Arc<GatewayInner>,
    client: u64,
    address: MessageAddress,
    description: &str,
) {
    let socket = gw.clients.lock().get(&client).cloned();
    if let Some(socket) = socket {
        let _ = socket.send(&Message::error(address, description)).await;
    }
}

/// A client cancelled an in-flight call: translate the id and pass the
/// cancel along.
async fn forward_cancel(gw: &Arc<GatewayInner>, client_id: u64, message: &Message) {
    let link = match gw.services.lock().get(&message.service) {
        Some(ServiceLink::Up(link)) => Some(link.clone()),
        _ => None,
    };
    let Some(link) = link else {
        return;
    };
    let forwarded = link.rewrites.lock().iter().find_map(|(fid, origin)| match origin {
        Origin::Client {
            client, address, ..
        } if *client == client_id && address.id == message.id => Some(*fid),
        _ => None,
    });
    if let Some(forwarded) = forwarded {
        let mut cancel = message.clone();
        cancel.id = forwarded;
        let _ = link.socket.send(&cancel).await;
    }
}

/// The gateway answers the capability exchange in the services' stead.
async fn answer_authenticate(socket: &TransportSocket, message: &Message) {
    let body = message.body().to_bytes();
    let params = Type::parse("({sm})").expect("constant signature");
    // Declared tuple: trailing garbage is a protocol violation.
    let theirs = decode_value_exact(&body, &params)
        .ok()
        .and_then(Value::into_tuple)
        .and_then(|mut tuple| tuple.pop())
        .and_then(|map| Capabilities::from_value(&map).ok());
    let Some(theirs) = theirs else {
        tracing::warn!(peer = socket.peer(), "malformed capability map");
        socket.disconnect().await;
        return;
    };
    let negotiated = Capabilities::local().intersect(&theirs);
    match encode_value(&negotiated.to_value()) {
        Ok(body) => {
            let reply = Message::reply_to(message).with_body(body);
            let _ = socket.send(&reply).await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "capability reply encode failed");
        }
    }
}

fn directory_link(gw: &Arc<GatewayInner>) -> Option<Arc<ServiceLinkUp>> {
    match gw.services.lock().get(&service::DIRECTORY) {
        Some(ServiceLink::Up(link)) => Some(link.clone()),
        _ => None,
    }
}
