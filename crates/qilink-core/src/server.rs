//! Listening side of the transport.

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{Error, Result, Scheme, TransportSocket, Url};

/// Accepts inbound connections on one or more bind URLs and yields the
/// resulting sockets. The server keeps no ownership after handoff.
#[derive(Debug)]
pub struct TransportServer {
    endpoints: Vec<Url>,
    incoming: mpsc::Receiver<TransportSocket>,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl TransportServer {
    /// Bind every URL; the scheme selects the listener type. A port of 0
    /// binds an ephemeral port, reflected in [`Self::endpoints`].
    pub async fn bind(urls: &[Url]) -> Result<TransportServer> {
        let (tx, incoming) = mpsc::channel(16);
        let mut endpoints = Vec::with_capacity(urls.len());
        let mut accept_tasks = Vec::with_capacity(urls.len());

        for url in urls {
            match url.scheme() {
                Scheme::Tcp => {
                    let listener = TcpListener::bind((url.host(), url.port())).await?;
                    let port = listener.local_addr()?.port();
                    let endpoint = url.with_port(port);
                    tracing::debug!(%endpoint, "listening");
                    endpoints.push(endpoint);
                    accept_tasks.push(tokio::spawn(accept_tcp(listener, tx.clone())));
                }
                #[cfg(unix)]
                Scheme::Unix => {
                    // A stale socket file from a dead process would fail the
                    // bind.
                    let _ = std::fs::remove_file(url.path());
                    let listener = tokio::net::UnixListener::bind(url.path())?;
                    tracing::debug!(endpoint = %url, "listening");
                    endpoints.push(url.clone());
                    accept_tasks.push(tokio::spawn(accept_unix(listener, tx.clone())));
                }
                #[cfg(not(unix))]
                Scheme::Unix => return Err(Error::UnsupportedScheme("unix".to_owned())),
                Scheme::Tcps => return Err(Error::UnsupportedScheme("tcps".to_owned())),
            }
        }

        Ok(TransportServer {
            endpoints,
            incoming,
            accept_tasks,
        })
    }

    /// The bound endpoints, with ephemeral ports resolved.
    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Next accepted connection. `None` once every listener has stopped.
    pub async fn accept(&mut self) -> Option<TransportSocket> {
        self.incoming.recv().await
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        for task in &self.accept_tasks {
            task.abort();
        }
    }
}

async fn accept_tcp(listener: TcpListener, tx: mpsc::Sender<TransportSocket>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                let socket = TransportSocket::from_stream(stream, format!("tcp://{addr}"));
                if tx.send(socket).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                return;
            }
        }
    }
}

#[cfg(unix)]
async fn accept_unix(listener: tokio::net::UnixListener, tx: mpsc::Sender<TransportSocket>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let socket = TransportSocket::from_stream(stream, "unix-peer".to_owned());
                if tx.send(socket).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    #[tokio::test]
    async fn accepts_tcp_connections() {
        let mut server = TransportServer::bind(&[Url::tcp("127.0.0.1", 0)])
            .await
            .unwrap();
        let endpoint = server.endpoints()[0].clone();
        assert_ne!(endpoint.port(), 0);

        let client = TransportSocket::connect(&endpoint).await.unwrap();
        let accepted = server.accept().await.unwrap();

        client.send(&Message::call(2, 1, 100)).await.unwrap();
        let msg = accepted.recv().await.unwrap();
        assert_eq!(msg.service, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn accepts_unix_connections() {
        let dir = std::env::temp_dir().join(format!("qilink-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("server.sock");
        let url = Url::unix(path.to_str().unwrap());

        let mut server = TransportServer::bind(std::slice::from_ref(&url)).await.unwrap();
        let client = TransportSocket::connect(&url).await.unwrap();
        let accepted = server.accept().await.unwrap();

        client.send(&Message::call(2, 1, 100)).await.unwrap();
        assert_eq!(accepted.recv().await.unwrap().service, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn rejects_tls_bind() {
        let err = TransportServer::bind(&["tcps://127.0.0.1:0".parse().unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(_)));
    }
}
