//! Gateway scenarios: a client that only ever talks to the gateway.

use std::time::Duration;

use qilink_core::{Error, Url, Value};
use qilink_gateway::Gateway;
use qilink_testkit as testkit;

#[tokio::test]
async fn hundred_concurrent_calls_through_the_gateway() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let gateway = Gateway::listen(&directory.url(), &Url::tcp("127.0.0.1", 0))
        .await
        .unwrap();

    // The client knows only the gateway.
    let client = testkit::session_via(&gateway.url()).await;
    let proxy = client.service("echo").await.unwrap();

    let mut join_set = tokio::task::JoinSet::new();
    for i in 0..100 {
        let proxy = proxy.clone();
        join_set.spawn(async move {
            let reply = proxy
                .call("echo", vec![Value::from(format!("msg-{i}"))])
                .await
                .unwrap();
            (i, reply.as_str().unwrap().to_owned())
        });
    }
    while let Some(result) = join_set.join_next().await {
        let (i, reply) = result.unwrap();
        assert_eq!(reply, format!("msg-{i}"));
    }

    // At quiescence the rewrite table is empty again.
    assert!(
        testkit::wait_until(Duration::from_secs(2), || {
            gateway.outstanding_forwards() == 0 && gateway.staged_messages() == 0
        })
        .await,
        "rewrite table not drained: {} forwards, {} staged",
        gateway.outstanding_forwards(),
        gateway.staged_messages(),
    );
}

#[tokio::test]
async fn lookup_reply_advertises_gateway_endpoints() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let gateway = Gateway::listen(&directory.url(), &Url::tcp("127.0.0.1", 0))
        .await
        .unwrap();
    let gateway_endpoint = gateway.url().to_string();

    let client = testkit::session_via(&gateway.url()).await;
    let services = client.services().await.unwrap();
    // The listing is forwarded verbatim; only the targeted lookup is
    // rewritten. Resolve and check the proxy ended up on the gateway.
    assert!(services.iter().any(|s| s.name == "echo"));

    let proxy = client.service("echo").await.unwrap();
    assert!(proxy.channel().peer().contains(&gateway_endpoint) || {
        // Accepted sockets report the gateway's address:port pair.
        let port = gateway.url().port().to_string();
        proxy.channel().peer().contains(&port)
    });
    assert!(proxy.call("echo", vec!["via".into()]).await.is_ok());
}

#[tokio::test]
async fn dead_service_fails_pending_forwards() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let gateway = Gateway::listen(&directory.url(), &Url::tcp("127.0.0.1", 0))
        .await
        .unwrap();
    let client = testkit::session_via(&gateway.url()).await;
    let proxy = client.service("echo").await.unwrap();
    assert!(proxy.call("echo", vec!["ok".into()]).await.is_ok());

    // Kill the backend while a slow call is in flight.
    let slow = proxy
        .start_call("sleepy", vec![Value::Int32(5_000)])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.close().await;

    let outcome = tokio::time::timeout(Duration::from_secs(3), slow)
        .await
        .expect("pending forward must fail in bounded time");
    match outcome {
        Err(Error::Remote(description)) => {
            assert!(description.contains("service unavailable"), "{description}");
        }
        Err(Error::ConnectionClosed) => {}
        other => panic!("expected a failed forward, got {other:?}"),
    }
}
