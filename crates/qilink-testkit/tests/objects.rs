//! Objects travelling as arguments: host-side hooking, proxy calls back,
//! terminate-on-drop.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use qilink::{ObjectBuilder, RemoteObject};
use qilink_core::{Error, Value};
use qilink_testkit as testkit;

fn store_service(slot: Arc<Mutex<Option<RemoteObject>>>) -> Arc<qilink::DynamicObject> {
    let store_slot = slot.clone();
    let poke_slot = slot.clone();
    let drop_slot = slot;
    ObjectBuilder::new()
        .method("store", "(o)", "v", move |ctx, args| {
            let slot = store_slot.clone();
            async move {
                let reference = args
                    .first()
                    .and_then(Value::as_object)
                    .cloned()
                    .ok_or_else(|| Error::Remote("expected an object".to_owned()))?;
                *slot.lock() = Some(ctx.proxy(&reference));
                Ok(Value::Void)
            }
        })
        .method("poke", "()", "s", move |_ctx, _args| {
            let slot = poke_slot.clone();
            async move {
                let proxy = slot
                    .lock()
                    .clone()
                    .ok_or_else(|| Error::Remote("nothing stored".to_owned()))?;
                proxy.call("echo", vec!["ping".into()]).await
            }
        })
        .method("release", "()", "v", move |_ctx, _args| {
            let slot = drop_slot.clone();
            async move {
                *slot.lock() = None;
                Ok(Value::Void)
            }
        })
        .build()
}

#[tokio::test]
async fn object_argument_roundtrip_and_terminate_on_drop() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    let slot: Arc<Mutex<Option<RemoteObject>>> = Arc::new(Mutex::new(None));
    server
        .register_service("store", store_service(slot))
        .await
        .unwrap();

    let client = testkit::connected_session(&directory).await;
    let proxy = client.service("store").await.unwrap();

    let baseline = proxy.channel().object_count();
    let local = testkit::echo_object();
    let argument = proxy.bind_object(local.clone());
    assert_eq!(proxy.channel().object_count(), baseline + 1);

    proxy.call("store", vec![argument]).await.unwrap();
    // The client keeps no handle; the hooked bound object keeps it alive.
    drop(local);

    let answer = proxy.call("poke", vec![]).await.unwrap();
    assert_eq!(answer.as_str(), Some("ping"));

    // The service drops its proxy: terminate releases the hooked object.
    proxy.call("release", vec![]).await.unwrap();
    assert!(
        testkit::wait_until(Duration::from_secs(2), || {
            proxy.channel().object_count() == baseline
        })
        .await,
        "hooked object was not released"
    );
}

#[tokio::test]
async fn stored_proxy_survives_repeated_calls() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    let slot: Arc<Mutex<Option<RemoteObject>>> = Arc::new(Mutex::new(None));
    server
        .register_service("store", store_service(slot))
        .await
        .unwrap();

    let client = testkit::connected_session(&directory).await;
    let proxy = client.service("store").await.unwrap();

    let local = testkit::echo_object();
    let argument = proxy.bind_object(local);
    proxy.call("store", vec![argument]).await.unwrap();

    for _ in 0..5 {
        assert_eq!(
            proxy.call("poke", vec![]).await.unwrap().as_str(),
            Some("ping")
        );
    }
}
