//! qilink-testkit: shared fixtures for the scenario suites.
//!
//! Provides an in-process service directory, a reference echo service,
//! and bounded-wait helpers. Scenario tests for the session/object layer
//! live in this crate's `tests/` directory so the library crates stay
//! free of dev-dependency cycles.

use std::sync::Once;
use std::time::{Duration, Instant};

use qilink::{DynamicObject, ObjectBuilder, Session, SessionConfig};
use qilink_core::{Error, Url, Value};
use qilink_directory::ServiceDirectory;
use std::sync::Arc;

/// Install a test subscriber once; `QILINK_LOG` selects the filter.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("QILINK_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A directory on an ephemeral local port.
pub async fn spawn_directory() -> ServiceDirectory {
    init_tracing();
    ServiceDirectory::listen(&Url::tcp("127.0.0.1", 0))
        .await
        .expect("directory bind")
}

/// A session connected to `directory`, listening on an ephemeral port.
pub async fn connected_session(directory: &ServiceDirectory) -> Session {
    let session = Session::new(SessionConfig::default().directory_url(directory.url()));
    session.connect().await.expect("session connect");
    session
}

/// Same, but pointed at an arbitrary URL (e.g. a gateway).
pub async fn session_via(url: &Url) -> Session {
    let session = Session::new(SessionConfig::default().directory_url(url.clone()));
    session.connect().await.expect("session connect");
    session
}

/// The reference test service: echo/sum/fail/sleepy methods, a `tick`
/// signal, and a `volume` property.
pub fn echo_object() -> Arc<DynamicObject> {
    ObjectBuilder::new()
        .description("test echo service")
        .method("echo", "(s)", "s", |_ctx, mut args| async move {
            Ok(args.remove(0))
        })
        .method("sum", "(ii)", "i", |_ctx, args| async move {
            let a = args.first().and_then(Value::as_i32).unwrap_or(0);
            let b = args.get(1).and_then(Value::as_i32).unwrap_or(0);
            Ok(Value::Int32(a + b))
        })
        .method("fail", "(s)", "v", |_ctx, args| async move {
            let why = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("unspecified")
                .to_owned();
            Err(Error::Remote(why))
        })
        .method("sleepy", "(i)", "i", |_ctx, args| async move {
            let millis = args.first().and_then(Value::as_i32).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis as u64)).await;
            Ok(Value::Int32(millis))
        })
        .signal("tick", "(i)")
        .property("volume", "i", Value::Int32(0))
        .build()
}

/// Poll `condition` until it holds or `deadline` elapses.
pub async fn wait_until<F>(deadline: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
