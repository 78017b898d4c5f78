//! qilink-directory: the authoritative registry of running services.
//!
//! The directory is itself a qilink service (service 1, object 1) exposing
//! the lookup/registration protocol plus the `serviceAdded` and
//! `serviceRemoved` signals. Entries die with their owning socket.

#![forbid(unsafe_code)]

mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use qilink::{BoundObject, Channel, DispatchPolicy, DynamicObject, ObjectBuilder};
use qilink_core::{
    object, service, Error, Result, ServiceInfo, TransportServer, Url, Value,
};

use registry::Registry;

struct DirectoryState {
    registry: Mutex<Registry>,
    /// Directory RPCs answered so far; a cached client lookup must not
    /// move this.
    lookup_count: AtomicU64,
}

/// Handle on a running service directory.
pub struct ServiceDirectory {
    state: Arc<DirectoryState>,
    endpoints: Vec<Url>,
    accept_task: JoinHandle<()>,
    // Keeps the directory object (and its signal links) alive.
    _object: Arc<DynamicObject>,
}

impl Drop for ServiceDirectory {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl ServiceDirectory {
    /// Bind `url` and start serving the directory protocol.
    pub async fn listen(url: &Url) -> Result<ServiceDirectory> {
        let mut server = TransportServer::bind(std::slice::from_ref(url)).await?;
        let endpoints = server.endpoints().to_vec();

        let own_info = ServiceInfo {
            id: service::DIRECTORY,
            name: "ServiceDirectory".to_owned(),
            endpoints: endpoints.iter().map(ToString::to_string).collect(),
            machine_id: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()),
            process_id: std::process::id().to_string(),
            session_id: "directory".to_owned(),
        };
        let state = Arc::new(DirectoryState {
            registry: Mutex::new(Registry::new(own_info)),
            lookup_count: AtomicU64::new(0),
        });

        let object = build_directory_object(&state);
        let bound = BoundObject::new(object.clone(), DispatchPolicy::Direct);
        bound.set_service(service::DIRECTORY);

        let accept_state = state.clone();
        let accept_object = object.clone();
        let accept_task = tokio::spawn(async move {
            while let Some(socket) = server.accept().await {
                let channel = Channel::serve(socket);
                channel.add_object(service::DIRECTORY, object::MAIN, bound.clone());
                tracing::debug!(peer = channel.peer(), "directory client connected");

                let state = accept_state.clone();
                let object = accept_object.clone();
                tokio::spawn(async move {
                    let owner = channel.id();
                    channel.closed().await;
                    let removed = state.registry.lock().remove_owner(owner);
                    for (info, was_ready) in removed {
                        tracing::debug!(
                            name = %info.name,
                            id = info.id,
                            "owner disconnected; service removed"
                        );
                        if was_ready {
                            emit_removed(&object, &info);
                        }
                    }
                });
            }
        });

        tracing::debug!(endpoint = %endpoints[0], "service directory up");
        Ok(ServiceDirectory {
            state,
            endpoints,
            accept_task,
            _object: object,
        })
    }

    /// The bound endpoints, ephemeral ports resolved.
    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// The primary endpoint, for clients.
    pub fn url(&self) -> Url {
        self.endpoints[0].clone()
    }

    /// Number of entries, the directory itself included.
    pub fn service_count(&self) -> usize {
        self.state.registry.lock().len()
    }

    /// Lookup RPCs answered so far (diagnostics for cache tests).
    pub fn lookup_count(&self) -> u64 {
        self.state.lookup_count.load(Ordering::Relaxed)
    }
}

fn emit_added(object: &DynamicObject, info: &ServiceInfo) {
    let _ = object.emit(
        "serviceAdded",
        vec![Value::UInt32(info.id), Value::String(info.name.clone())],
    );
}

fn emit_removed(object: &DynamicObject, info: &ServiceInfo) {
    let _ = object.emit(
        "serviceRemoved",
        vec![Value::UInt32(info.id), Value::String(info.name.clone())],
    );
}

/// The directory's own metaobject: actions 100..105, signals 106..107.
fn build_directory_object(state: &Arc<DirectoryState>) -> Arc<DynamicObject> {
    // Handlers need to emit signals through the object they live in; the
    // slot is filled right after build.
    let slot: Arc<OnceLock<Weak<DynamicObject>>> = Arc::new(OnceLock::new());

    let lookup_state = state.clone();
    let services_state = state.clone();
    let register_state = state.clone();
    let unregister_state = state.clone();
    let ready_state = state.clone();
    let update_state = state.clone();
    let ready_slot = slot.clone();
    let unregister_slot = slot.clone();

    let object = ObjectBuilder::new()
        .description("the service directory")
        .method_with_uid(100, "service", "(s)", ServiceInfo::SIGNATURE, move |_ctx, args| {
            let state = lookup_state.clone();
            async move {
                state.lookup_count.fetch_add(1, Ordering::Relaxed);
                let name = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Remote("service: expected a name".to_owned()))?
                    .to_owned();
                let info = state
                    .registry
                    .lock()
                    .lookup(&name)
                    .ok_or(Error::ServiceNotFound(name))?;
                Ok(info.to_value())
            }
        })
        .method_with_uid(101, "services", "()", "[(I[s][s]s)]", move |_ctx, _args| {
            let state = services_state.clone();
            async move {
                let entries = state.registry.lock().list();
                Ok(Value::List(
                    entries.iter().map(ServiceInfo::to_value).collect(),
                ))
            }
        })
        .method_with_uid(
            102,
            "registerService",
            "((I[s][s]s))",
            "I",
            move |ctx, args| {
                let state = register_state.clone();
                async move {
                    let info = decode_info(&args)?;
                    let name = info.name.clone();
                    let id = state.registry.lock().register(info, ctx.channel.id())?;
                    tracing::debug!(%name, id, owner = ctx.channel.id(), "service registered");
                    Ok(Value::UInt32(id))
                }
            },
        )
        .method_with_uid(103, "unregisterService", "(I)", "v", move |_ctx, args| {
            let state = unregister_state.clone();
            let slot = unregister_slot.clone();
            async move {
                let id = arg_id(&args)?;
                let info = state.registry.lock().unregister(id)?;
                tracing::debug!(name = %info.name, id, "service unregistered");
                if let Some(object) = slot.get().and_then(Weak::upgrade) {
                    emit_removed(&object, &info);
                }
                Ok(Value::Void)
            }
        })
        .method_with_uid(104, "serviceReady", "(I)", "v", move |_ctx, args| {
            let state = ready_state.clone();
            let slot = ready_slot.clone();
            async move {
                let id = arg_id(&args)?;
                let info = state.registry.lock().mark_ready(id)?;
                tracing::debug!(name = %info.name, id, "service ready");
                if let Some(object) = slot.get().and_then(Weak::upgrade) {
                    emit_added(&object, &info);
                }
                Ok(Value::Void)
            }
        })
        .method_with_uid(
            105,
            "updateServiceInfo",
            "((I[s][s]s))",
            "v",
            move |_ctx, args| {
                let state = update_state.clone();
                async move {
                    let info = decode_info(&args)?;
                    state.registry.lock().update(info)?;
                    Ok(Value::Void)
                }
            },
        )
        .signal_with_uid(106, "serviceAdded", "(Is)")
        .signal_with_uid(107, "serviceRemoved", "(Is)")
        .build();

    let _ = slot.set(Arc::downgrade(&object));
    object
}

fn decode_info(args: &[Value]) -> Result<ServiceInfo> {
    let value = args
        .first()
        .ok_or_else(|| Error::Remote("expected a service info argument".to_owned()))?;
    Ok(ServiceInfo::from_value(value)?)
}

fn arg_id(args: &[Value]) -> Result<u32> {
    args.first()
        .and_then(Value::as_u32)
        .ok_or_else(|| Error::Remote("expected a service id".to_owned()))
}
