//! Request/reply basics against a real directory and TCP sockets.

use std::time::Duration;

use qilink_core::{Error, Value};
use qilink_testkit as testkit;

#[tokio::test]
async fn echo_roundtrip_within_a_second() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let client = testkit::connected_session(&directory).await;
    let proxy = client.service("echo").await.unwrap();

    let reply = tokio::time::timeout(
        Duration::from_secs(1),
        proxy.call("echo", vec!["hello".into()]),
    )
    .await
    .expect("reply within one second")
    .unwrap();
    assert_eq!(reply.as_str(), Some("hello"));
}

#[tokio::test]
async fn call_by_qualified_name_and_overload_inference() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let client = testkit::connected_session(&directory).await;
    let proxy = client.service("echo").await.unwrap();

    let reply = proxy.call("echo::(s)", vec!["qualified".into()]).await.unwrap();
    assert_eq!(reply.as_str(), Some("qualified"));

    let sum = proxy
        .call("sum", vec![Value::Int32(20), Value::Int32(22)])
        .await
        .unwrap();
    assert_eq!(sum.as_i32(), Some(42));
}

#[tokio::test]
async fn remote_errors_and_unknown_methods() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let client = testkit::connected_session(&directory).await;
    let proxy = client.service("echo").await.unwrap();

    let err = proxy.call("fail", vec!["rip".into()]).await.unwrap_err();
    match err {
        Error::Remote(description) => assert!(description.contains("rip")),
        other => panic!("expected a remote error, got {other}"),
    }

    // Resolution failure is local; no message leaves the process.
    assert!(matches!(
        proxy.call("no_such_method", vec![]).await,
        Err(Error::MethodNotFound(_))
    ));
}

#[tokio::test]
async fn per_call_timeout_fires() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let client = testkit::connected_session(&directory).await;
    let proxy = client.service("echo").await.unwrap();

    let err = proxy
        .call_with_timeout(
            "sleepy",
            vec![Value::Int32(2_000)],
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
}

#[tokio::test]
async fn cancellation_settles_without_waiting() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let client = testkit::connected_session(&directory).await;
    let proxy = client.service("echo").await.unwrap();

    let call = proxy
        .start_call("sleepy", vec![Value::Int32(5_000)])
        .await
        .unwrap();
    call.cancel();
    let settled = tokio::time::timeout(Duration::from_millis(200), call)
        .await
        .expect("cancel must settle immediately");
    assert!(matches!(settled, Err(Error::Cancelled)));
}

#[tokio::test]
async fn concurrent_calls_pair_correctly() {
    let directory = testkit::spawn_directory().await;
    let server = testkit::connected_session(&directory).await;
    server
        .register_service("echo", testkit::echo_object())
        .await
        .unwrap();

    let client = testkit::connected_session(&directory).await;
    let proxy = client.service("echo").await.unwrap();

    let mut join_set = tokio::task::JoinSet::new();
    for i in 0..32 {
        let proxy = proxy.clone();
        join_set.spawn(async move {
            let reply = proxy
                .call("sum", vec![Value::Int32(i), Value::Int32(1000)])
                .await
                .unwrap();
            (i, reply.as_i32().unwrap())
        });
    }
    while let Some(result) = join_set.join_next().await {
        let (i, sum) = result.unwrap();
        assert_eq!(sum, i + 1000);
    }
}
