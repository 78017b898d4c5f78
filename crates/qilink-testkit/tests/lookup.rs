//! Directory lookup, caching, and coalescing.

use qilink::SessionConfig;
use qilink_core::Error;
use qilink_testkit as testkit;

#[tokio::test]
async fn lookup_miss_then_register_then_cached_hit() {
    let directory = testkit::spawn_directory().await;
    let client = testkit::connected_session(&directory).await;

    // Nothing registered yet.
    assert!(matches!(
        client.service("echo").await,
        Err(Error::ServiceNotFound(_))
    ));

    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let proxy = client.service("echo").await.unwrap();
    assert!(proxy.call("echo", vec!["x".into()]).await.is_ok());

    // A second resolution takes the cached path: no further directory RPC.
    let lookups = directory.lookup_count();
    let proxy = client.service("echo").await.unwrap();
    assert!(proxy.call("echo", vec!["y".into()]).await.is_ok());
    assert_eq!(directory.lookup_count(), lookups);
}

#[tokio::test]
async fn concurrent_lookups_coalesce_into_one_rpc() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let client = testkit::connected_session(&directory).await;
    let lookups_before = directory.lookup_count();
    let (a, b, c) = tokio::join!(
        client.service("echo"),
        client.service("echo"),
        client.service("echo"),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(directory.lookup_count(), lookups_before + 1);
}

#[tokio::test]
async fn cache_can_be_disabled() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let client = qilink::Session::new(
        SessionConfig::default()
            .directory_url(directory.url())
            .service_cache(false),
    );
    client.connect().await.unwrap();

    let lookups_before = directory.lookup_count();
    client.service("echo").await.unwrap();
    client.service("echo").await.unwrap();
    assert_eq!(directory.lookup_count(), lookups_before + 2);
}

#[tokio::test]
async fn services_lists_directory_and_registered() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let client = testkit::connected_session(&directory).await;
    let services = client.services().await.unwrap();
    let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"ServiceDirectory"));
    assert!(names.contains(&"echo"));

    let echo = services.iter().find(|s| s.name == "echo").unwrap();
    assert!(!echo.endpoints.is_empty());
    assert_eq!(echo.process_id, std::process::id().to_string());
}
