//! Accepted connections and their identities.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Bundle the socket with its peer address and listener permit
//! - Hold the permit for as long as the connection object lives

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::net::TcpStream;

use crate::net::listener::ConnectionPermit;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough since we only need uniqueness.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A raw client connection handed from the acceptor to a handler.
///
/// Dropping it closes the socket and frees the listener slot.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    accepted_at: SystemTime,
    stream: TcpStream,
    _permit: Option<ConnectionPermit>,
}

impl Connection {
    /// Wrap a freshly accepted stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, permit: Option<ConnectionPermit>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer_addr,
            accepted_at: SystemTime::now(),
            stream,
            _permit: permit,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn accepted_at(&self) -> SystemTime {
        self.accepted_at
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}
