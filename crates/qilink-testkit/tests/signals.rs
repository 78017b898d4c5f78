//! Signal fanout, subscription lifecycle, and properties.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use qilink_core::Value;
use qilink_testkit as testkit;

#[tokio::test]
async fn two_subscribers_receive_ten_ticks_in_order() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    let object = testkit::echo_object();
    server.register_service("echo", object.clone()).await.unwrap();

    let client_a = testkit::connected_session(&directory).await;
    let client_b = testkit::connected_session(&directory).await;
    let proxy_a = client_a.service("echo").await.unwrap();
    let proxy_b = client_b.service("echo").await.unwrap();

    let seen_a: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_b: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_a = seen_a.clone();
    proxy_a
        .subscribe("tick", move |args| {
            if let Some(v) = args.first().and_then(Value::as_i32) {
                sink_a.lock().push(v);
            }
        })
        .await
        .unwrap();
    let sink_b = seen_b.clone();
    proxy_b
        .subscribe("tick", move |args| {
            if let Some(v) = args.first().and_then(Value::as_i32) {
                sink_b.lock().push(v);
            }
        })
        .await
        .unwrap();

    for i in 0..10 {
        object.emit("tick", vec![Value::Int32(i)]).unwrap();
    }

    let expected: Vec<i32> = (0..10).collect();
    assert!(
        testkit::wait_until(Duration::from_secs(2), || {
            seen_a.lock().len() == 10 && seen_b.lock().len() == 10
        })
        .await
    );
    assert_eq!(*seen_a.lock(), expected);
    assert_eq!(*seen_b.lock(), expected);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    let object = testkit::echo_object();
    server.register_service("echo", object.clone()).await.unwrap();

    let client = testkit::connected_session(&directory).await;
    let proxy = client.service("echo").await.unwrap();

    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = proxy
        .subscribe("tick", move |args| {
            if let Some(v) = args.first().and_then(Value::as_i32) {
                sink.lock().push(v);
            }
        })
        .await
        .unwrap();

    object.emit("tick", vec![Value::Int32(1)]).unwrap();
    assert!(testkit::wait_until(Duration::from_secs(2), || seen.lock().len() == 1).await);

    proxy.unsubscribe(subscription).await.unwrap();
    object.emit("tick", vec![Value::Int32(2)]).unwrap();

    // The second emission must not arrive.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*seen.lock(), vec![1]);
}

#[tokio::test]
async fn property_set_then_get_and_change_signal() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    let object = testkit::echo_object();
    server.register_service("echo", object.clone()).await.unwrap();

    let client = testkit::connected_session(&directory).await;
    let proxy = client.service("echo").await.unwrap();

    let changes: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    proxy
        .subscribe("volume", move |args| {
            if let Some(v) = args.first().and_then(Value::as_i32) {
                sink.lock().push(v);
            }
        })
        .await
        .unwrap();

    assert_eq!(proxy.property("volume").await.unwrap().as_i32(), Some(0));
    proxy.set_property("volume", Value::Int32(7)).await.unwrap();
    assert_eq!(proxy.property("volume").await.unwrap().as_i32(), Some(7));

    // Change signal follows the store.
    assert!(testkit::wait_until(Duration::from_secs(2), || changes.lock().as_slice() == [7]).await);

    let properties = proxy.properties().await.unwrap();
    let uid = proxy.meta().property_uid("volume").unwrap();
    assert!(properties
        .iter()
        .any(|(id, value)| *id == uid && value.as_i32() == Some(7)));
}
