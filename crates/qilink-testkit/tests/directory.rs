//! Directory lifecycle: registration collisions, unregistration, and
//! owner-disconnect cleanup.

use std::time::Duration;

use qilink_core::Error;
use qilink_testkit as testkit;

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let other = testkit::connected_session(&directory).await;
    let err = other
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyRegistered(_)));
}

#[tokio::test]
async fn unregister_frees_the_name() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    let id = server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();
    server.unregister_service(id).await.unwrap();

    let client = testkit::connected_session(&directory).await;
    assert!(matches!(
        client.service("echo").await,
        Err(Error::ServiceNotFound(_))
    ));

    // The name is reusable.
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();
    assert!(client.service("echo").await.is_ok());
}

#[tokio::test]
async fn owner_disconnect_removes_services_within_bounded_time() {
    let directory = testkit::spawn_directory().await;
    let client = testkit::connected_session(&directory).await;

    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();
    let proxy = client.service("echo").await.unwrap();
    assert!(proxy.call("echo", vec!["up".into()]).await.is_ok());
    let count_before = directory.service_count();

    server.close().await;

    // serviceRemoved fires, the cache invalidates, and fresh lookups miss.
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        match client.service("echo").await {
            Err(Error::ServiceNotFound(_)) => break,
            _ if std::time::Instant::now() > deadline => {
                panic!("service still resolvable after owner disconnect")
            }
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    assert!(
        testkit::wait_until(Duration::from_secs(2), || {
            directory.service_count() == count_before - 1
        })
        .await
    );
}
