//! Session configuration.

use std::time::Duration;

use qilink_core::{Url, DEFAULT_PORT};

/// Directory URL used when `QI_URL` is unset.
pub fn default_directory_url() -> Url {
    Url::tcp("127.0.0.1", DEFAULT_PORT)
}

/// Listen URL used when `QI_LISTEN_URL` is unset. Port 0 binds an
/// ephemeral port.
pub fn default_listen_url() -> Url {
    Url::tcp("127.0.0.1", 0)
}

/// Tunables for a [`crate::Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub directory_url: Url,
    pub listen_url: Url,
    /// Cache successful service lookups until invalidated.
    pub service_cache: bool,
    /// Default per-call timeout; `None` means unbounded.
    pub call_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            directory_url: default_directory_url(),
            listen_url: default_listen_url(),
            service_cache: true,
            call_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Read `QI_URL`, `QI_LISTEN_URL`, and
    /// `QI_DISABLE_REMOTEOBJECT_CACHE`. Unparseable values fall back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = env_url("QI_URL") {
            config.directory_url = url;
        }
        if let Some(url) = env_url("QI_LISTEN_URL") {
            config.listen_url = url;
        }
        if env_bool("QI_DISABLE_REMOTEOBJECT_CACHE") {
            config.service_cache = false;
        }
        config
    }

    pub fn directory_url(mut self, url: Url) -> Self {
        self.directory_url = url;
        self
    }

    pub fn listen_url(mut self, url: Url) -> Self {
        self.listen_url = url;
        self
    }

    pub fn service_cache(mut self, enabled: bool) -> Self {
        self.service_cache = enabled;
        self
    }

    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }
}

fn env_url(key: &str) -> Option<Url> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring unparseable URL");
            None
        }
    }
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
