//! Framed transport sockets.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::{Body, Error, Message, ProtocolError, Result, Scheme, Url, HEADER_SIZE};

/// Why a socket left the `Connected` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local `disconnect()`.
    Requested,
    /// Clean EOF from the peer.
    PeerClosed,
    /// Header validation failed; the connection was dropped.
    Protocol(ProtocolError),
    Io(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "disconnect requested"),
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

enum State {
    Connected,
    Disconnected(DisconnectReason),
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct SocketInner {
    reader: AsyncMutex<BoxedReader>,
    writer: AsyncMutex<BoxedWriter>,
    state: Mutex<State>,
    peer: String,
}

/// A bidirectional framed connection. Sends are ordered; `recv` yields
/// only whole messages and is intended to be driven by exactly one task.
#[derive(Clone)]
pub struct TransportSocket {
    inner: Arc<SocketInner>,
}

impl std::fmt::Debug for TransportSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSocket")
            .field("peer", &self.inner.peer)
            .finish_non_exhaustive()
    }
}

impl TransportSocket {
    /// Open a connection to `url`. Resolves once the transport is
    /// established; the capability exchange is layered above.
    pub async fn connect(url: &Url) -> Result<TransportSocket> {
        match url.scheme() {
            Scheme::Tcp => {
                let stream = TcpStream::connect((url.host(), url.port())).await?;
                stream.set_nodelay(true)?;
                Ok(Self::from_stream(stream, url.to_string()))
            }
            #[cfg(unix)]
            Scheme::Unix => {
                let stream = tokio::net::UnixStream::connect(url.path()).await?;
                Ok(Self::from_stream(stream, url.to_string()))
            }
            #[cfg(not(unix))]
            Scheme::Unix => Err(Error::UnsupportedScheme("unix".to_owned())),
            Scheme::Tcps => Err(Error::UnsupportedScheme("tcps".to_owned())),
        }
    }

    /// Wrap an already-established stream (an accepted connection, or an
    /// in-process duplex in tests).
    pub fn from_stream<S>(stream: S, peer: String) -> TransportSocket
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        TransportSocket {
            inner: Arc::new(SocketInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                state: Mutex::new(State::Connected),
                peer,
            }),
        }
    }

    /// An in-process connected pair.
    pub fn pair() -> (TransportSocket, TransportSocket) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Self::from_stream(a, "duplex:a".to_owned()),
            Self::from_stream(b, "duplex:b".to_owned()),
        )
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Connected)
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match &*self.inner.state.lock() {
            State::Connected => None,
            State::Disconnected(reason) => Some(reason.clone()),
        }
    }

    fn mark_disconnected(&self, reason: DisconnectReason) {
        let mut state = self.inner.state.lock();
        if matches!(*state, State::Connected) {
            tracing::debug!(peer = %self.inner.peer, %reason, "socket disconnected");
            *state = State::Disconnected(reason);
        }
    }

    /// Send one message. Concurrent senders serialize on the write half,
    /// so wire order matches completion order. The message must be treated
    /// as immutable from this point.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        let header = message.header_bytes();
        let mut writer = self.inner.writer.lock().await;
        let write = async {
            writer.write_all(&header).await?;
            for segment in message.body().segments() {
                if !segment.is_empty() {
                    writer.write_all(segment).await?;
                }
            }
            writer.flush().await
        };
        if let Err(e) = write.await {
            tracing::debug!(peer = %self.inner.peer, error = %e, "send failed");
            self.mark_disconnected(DisconnectReason::Io(e.to_string()));
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Receive the next whole message.
    pub async fn recv(&self) -> Result<Message> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        let mut reader = self.inner.reader.lock().await;

        let mut header = [0u8; HEADER_SIZE];
        if let Err(e) = reader.read_exact(&mut header).await {
            let reason = if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DisconnectReason::PeerClosed
            } else {
                DisconnectReason::Io(e.to_string())
            };
            self.mark_disconnected(reason);
            return Err(Error::ConnectionClosed);
        }

        let (mut message, size) = match Message::parse_header(&header) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(peer = %self.inner.peer, error = %e, "malformed header, closing");
                self.mark_disconnected(DisconnectReason::Protocol(e.clone()));
                return Err(Error::Protocol(e));
            }
        };

        if size > 0 {
            let mut payload = BytesMut::zeroed(size as usize);
            if let Err(e) = reader.read_exact(&mut payload).await {
                self.mark_disconnected(DisconnectReason::Io(e.to_string()));
                return Err(Error::ConnectionClosed);
            }
            message.set_body(Body::from(payload.freeze()));
        } else {
            message.set_body(Body::from(Bytes::new()));
        }

        tracing::trace!(peer = %self.inner.peer, %message, "received");
        Ok(message)
    }

    /// Close the connection. Pending `recv` callers observe
    /// `ConnectionClosed`.
    pub async fn disconnect(&self) {
        self.mark_disconnected(DisconnectReason::Requested);
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
