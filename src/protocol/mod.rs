//! Protocol boundary.
//!
//! # Data Flow
//! ```text
//! 4-byte handshake tag
//!     → ProtocolTable::resolve (tag → protocol)
//!     → Protocol::new_client (wraps the connection, no I/O)
//!     → Protocol::io_loop (owns the connection until it ends)
//! ```
//!
//! # Design Decisions
//! - The set of protocols is a closed table built once at startup
//! - A build that speaks several versions uses an enum implementing `Protocol`
//! - `Client::close` only signals; the I/O loop observes it and returns

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use crate::net::connection::{Connection, ConnectionId};

pub mod frame;
pub mod v2;

pub use frame::{Frame, FrameCodec, FrameError, FrameType};
pub use v2::{ClientV2, ProtocolV2};

/// Payload of the error frame sent for an unrecognized handshake tag.
pub const E_BAD_PROTOCOL: &str = "E_BAD_PROTOCOL";

/// The 4-byte sequence a client sends first to pick a protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandshakeTag([u8; 4]);

impl HandshakeTag {
    /// Tag of the V2 protocol.
    pub const V2: HandshakeTag = HandshakeTag(*b"  V2");

    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl From<[u8; 4]> for HandshakeTag {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for HandshakeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

/// Which side of the broker a client is acting as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Consumer,
    Producer,
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientRole::Consumer => write!(f, "consumer"),
            ClientRole::Producer => write!(f, "producer"),
        }
    }
}

/// Point-in-time statistics for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub client_id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub role: ClientRole,
    pub connected_at: SystemTime,
    /// Commands received that match the requested scope.
    pub commands: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
}

/// Errors raised by a protocol while serving a client.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("E_INVALID {0}")]
    InvalidCommand(String),

    #[error("E_BAD_BODY {0}")]
    BadBody(String),

    /// The client was closed from outside its I/O loop.
    #[error("client closed by server")]
    Closed,

    /// `io_loop` was invoked twice for the same client.
    #[error("I/O loop already started for this client")]
    AlreadyRunning,
}

/// A protocol-specific handle bound to one connection for its lifetime.
pub trait Client: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    fn peer_addr(&self) -> SocketAddr;

    fn role(&self) -> ClientRole;

    /// Snapshot of this client's counters. `scope` narrows the command count
    /// to one command name; an empty scope counts everything.
    fn stats(&self, scope: &str) -> ClientStats;

    /// Ask the client's I/O loop to stop. Safe to call any number of times,
    /// before, during or after the loop.
    fn close(&self) -> Result<(), ProtocolError>;
}

/// A wire protocol the dispatcher can hand connections to.
pub trait Protocol: Send + Sync + 'static {
    type Client: Client;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Wrap a connection in a client. Must not perform blocking I/O.
    fn new_client(&self, conn: Connection) -> Arc<Self::Client>;

    /// Serve `client` until its connection ends.
    fn io_loop(&self, client: Arc<Self::Client>) -> impl Future<Output = Result<(), ProtocolError>> + Send;
}

/// Immutable mapping from handshake tag to protocol.
pub struct ProtocolTable<P> {
    entries: Vec<(HandshakeTag, P)>,
}

impl<P: Protocol> ProtocolTable<P> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register `protocol` under `tag`, replacing any previous entry.
    pub fn with(mut self, tag: HandshakeTag, protocol: P) -> Self {
        self.entries.retain(|(existing, _)| *existing != tag);
        self.entries.push((tag, protocol));
        self
    }

    /// Find the protocol registered for `tag`.
    pub fn resolve(&self, tag: &HandshakeTag) -> Option<&P> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == tag)
            .map(|(_, protocol)| protocol)
    }

    pub fn tags(&self) -> impl Iterator<Item = &HandshakeTag> {
        self.entries.iter().map(|(tag, _)| tag)
    }
}

impl<P: Protocol> Default for ProtocolTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_display_escapes_binary() {
        assert_eq!(HandshakeTag::V2.to_string(), "  V2");
        assert_eq!(HandshakeTag::new([0, b'A', 0xff, b'\n']).to_string(), "\\x00A\\xff\\n");
    }

    #[test]
    fn table_resolves_only_registered_tags() {
        let table = ProtocolTable::new().with(HandshakeTag::V2, ProtocolV2::default());

        assert!(table.resolve(&HandshakeTag::V2).is_some());
        assert!(table.resolve(&HandshakeTag::from(*b"XXXX")).is_none());
        assert!(table.resolve(&HandshakeTag::from(*b"  V1")).is_none());
    }

    #[test]
    fn registering_a_tag_twice_replaces_it() {
        let table = ProtocolTable::new()
            .with(HandshakeTag::V2, ProtocolV2::default())
            .with(HandshakeTag::V2, ProtocolV2::default());
        assert_eq!(table.tags().count(), 1);
    }
}
