//! Per-connection dispatch: handshake → protocol → registry → I/O loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::FramedWrite;

use crate::net::acceptor::TcpHandler;
use crate::net::connection::Connection;
use crate::observability::metrics;
use crate::protocol::frame::{Frame, FrameCodec};
use crate::protocol::{Client, HandshakeTag, Protocol, ProtocolError, ProtocolTable, E_BAD_PROTOCOL};
use crate::server::registry::ConnectionRegistry;

/// Why a connection never got past the handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("failed to read protocol version - {0}")]
    Read(#[from] std::io::Error),

    #[error("no protocol version within {0:?}")]
    Timeout(Duration),

    #[error("bad protocol magic '{0}'")]
    UnknownProtocol(HandshakeTag),
}

impl HandshakeError {
    /// Metric label for this failure.
    pub fn reason(&self) -> &'static str {
        match self {
            HandshakeError::Read(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => "short_read",
            HandshakeError::Read(_) => "read_error",
            HandshakeError::Timeout(_) => "timeout",
            HandshakeError::UnknownProtocol(_) => "bad_protocol",
        }
    }
}

/// Dispatches accepted connections to the protocol their handshake names.
pub struct TcpServer<P: Protocol> {
    protocols: ProtocolTable<P>,
    registry: Arc<ConnectionRegistry<P::Client>>,
    handshake_timeout: Option<Duration>,
}

impl<P: Protocol> TcpServer<P> {
    pub fn new(protocols: ProtocolTable<P>, registry: Arc<ConnectionRegistry<P::Client>>) -> Self {
        Self {
            protocols,
            registry,
            handshake_timeout: None,
        }
    }

    /// Bound how long a new connection may take to send its tag.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<P::Client>> {
        &self.registry
    }

    /// Serve one connection from handshake to close.
    pub async fn dispatch(&self, mut conn: Connection) {
        let peer_addr = conn.peer_addr();
        tracing::info!(peer_addr = %peer_addr, conn_id = %conn.id(), "TCP: new client");

        let tag = match self.read_handshake(&mut conn).await {
            Ok(tag) => tag,
            Err(e) => {
                metrics::record_handshake_failure(e.reason());
                tracing::error!(peer_addr = %peer_addr, error = %e, "Handshake failed");
                return;
            }
        };
        tracing::info!(peer_addr = %peer_addr, magic = %tag, "Client desired protocol magic");

        let Some(protocol) = self.protocols.resolve(&tag) else {
            self.reject(conn, tag).await;
            return;
        };

        let client = protocol.new_client(conn);
        let registration = Registration::new(&self.registry, peer_addr, Arc::clone(&client));

        match protocol.io_loop(client).await {
            Ok(()) => {}
            Err(ProtocolError::Closed) => {
                tracing::debug!(
                    peer_addr = %peer_addr,
                    client_id = %registration.client.id(),
                    "Client closed by server"
                );
            }
            Err(e) => {
                metrics::record_io_loop_error();
                tracing::error!(
                    peer_addr = %peer_addr,
                    client_id = %registration.client.id(),
                    protocol = protocol.name(),
                    error = %e,
                    "Client I/O loop ended with error"
                );
            }
        }
        drop(registration);
    }

    async fn read_handshake(&self, conn: &mut Connection) -> Result<HandshakeTag, HandshakeError> {
        let mut buf = [0u8; 4];
        let read = conn.stream_mut().read_exact(&mut buf);

        match self.handshake_timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, read)
                    .await
                    .map_err(|_| HandshakeError::Timeout(timeout))??;
            }
            None => {
                read.await?;
            }
        }
        Ok(HandshakeTag::from(buf))
    }

    /// Send the bad-protocol error frame and close.
    async fn reject(&self, mut conn: Connection, tag: HandshakeTag) {
        let peer_addr = conn.peer_addr();
        let err = HandshakeError::UnknownProtocol(tag);
        metrics::record_handshake_failure(err.reason());

        let mut frames = FramedWrite::new(conn.stream_mut(), FrameCodec);
        if let Err(e) = frames.send(Frame::error(E_BAD_PROTOCOL)).await {
            tracing::debug!(peer_addr = %peer_addr, error = %e, "Failed to send bad protocol frame");
        }
        let _ = frames.get_mut().shutdown().await;
        drop(frames);
        drop(conn);

        tracing::error!(peer_addr = %peer_addr, error = %err, "Rejected client");
    }
}

impl<P: Protocol> TcpHandler for TcpServer<P> {
    async fn handle(&self, conn: Connection) {
        self.dispatch(conn).await;
    }

    fn close_all(&self) -> usize {
        self.registry.close_all()
    }
}

/// Keeps a client registered for as long as it lives.
///
/// Dropping it removes the entry and closes the client, on every exit path
/// out of [`TcpServer::dispatch`], unwinding included.
struct Registration<'a, C: Client> {
    registry: &'a ConnectionRegistry<C>,
    key: SocketAddr,
    client: Arc<C>,
}

impl<'a, C: Client> Registration<'a, C> {
    fn new(registry: &'a ConnectionRegistry<C>, key: SocketAddr, client: Arc<C>) -> Self {
        if let Some(displaced) = registry.insert(key, Arc::clone(&client)) {
            tracing::warn!(
                peer_addr = %key,
                displaced = %displaced.id(),
                client_id = %client.id(),
                "Peer address reused while still registered, closing previous client"
            );
            let _ = displaced.close();
        }
        Self { registry, key, client }
    }
}

impl<C: Client> Drop for Registration<'_, C> {
    fn drop(&mut self) {
        self.registry.remove(&self.key, &self.client);
        if let Err(e) = self.client.close() {
            tracing::debug!(client_id = %self.client.id(), error = %e, "Close after I/O loop failed");
        }
    }
}
