//! TCP listener with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Classify accept errors (transient vs fatal)

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::config::ListenerConfig;
use crate::net::acceptor::Accept;
use crate::net::connection::Connection;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    /// Failed to accept connection.
    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),
    /// The connection-limit semaphore was closed.
    #[error("connection limit closed")]
    LimitClosed,
}

/// How the accept loop should react to an accept error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorClass {
    /// Retry after yielding to the scheduler.
    Transient,
    /// Stop accepting and report the error.
    Fatal,
}

impl AcceptErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcceptErrorClass::Transient => "transient",
            AcceptErrorClass::Fatal => "fatal",
        }
    }
}

/// Classify an accept error.
///
/// Per-connection failures and descriptor exhaustion are retryable. Anything
/// else means the listener can no longer do its job.
pub fn classify_accept_error(err: &io::Error) -> AcceptErrorClass {
    if is_descriptor_exhaustion(err) {
        return AcceptErrorClass::Transient;
    }
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => AcceptErrorClass::Transient,
        _ => AcceptErrorClass::Fatal,
    }
}

/// EMFILE (process) or ENFILE (system) descriptor limits.
fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        const ENFILE: i32 = 23;
        const EMFILE: i32 = 24;
        matches!(err.raw_os_error(), Some(ENFILE | EMFILE))
    }

    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

impl ListenerError {
    /// Classify this error for the accept loop.
    pub fn class(&self) -> AcceptErrorClass {
        match self {
            ListenerError::Accept(e) => classify_accept_error(e),
            ListenerError::Bind { .. } | ListenerError::LimitClosed => AcceptErrorClass::Fatal,
        }
    }
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections wait in the kernel backlog until a slot frees up.
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Configured maximum connections.
    max_connections: usize,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind {
            address: config.tcp_address.clone(),
            source,
        };

        let addr: SocketAddr = config
            .tcp_address
            .parse()
            .map_err(|e| bind_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        let listener = Self::from_tokio(listener, config.max_connections);

        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            "TCP: listening"
        );
        Ok(listener)
    }

    /// Wrap an already bound tokio listener.
    ///
    /// `max_connections` is capped at [`Semaphore::MAX_PERMITS`].
    pub fn from_tokio(inner: TcpListener, max_connections: usize) -> Self {
        let max_connections = max_connections.min(Semaphore::MAX_PERMITS);
        Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached. The returned
    /// connection holds its slot until it is dropped.
    pub async fn accept(&self) -> Result<Connection, ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::LimitClosed)?;

        let (stream, peer_addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %peer_addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok(Connection::new(
            stream,
            peer_addr,
            Some(ConnectionPermit { _permit: permit }),
        ))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.inner.local_addr()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl Accept for Listener {
    async fn accept(&self) -> Result<Connection, ListenerError> {
        Listener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Listener::local_addr(self)
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the slot is released back to the listener, even if the
/// handler panicked.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_connection_failures_are_transient() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
            io::ErrorKind::TimedOut,
        ] {
            let err = io::Error::from(kind);
            assert_eq!(classify_accept_error(&err), AcceptErrorClass::Transient, "{kind:?}");
        }
    }

    #[test]
    fn other_failures_are_fatal() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(classify_accept_error(&err), AcceptErrorClass::Fatal);
        assert_eq!(ListenerError::LimitClosed.class(), AcceptErrorClass::Fatal);
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_is_transient() {
        for errno in [23, 24] {
            let err = ListenerError::Accept(io::Error::from_raw_os_error(errno));
            assert_eq!(err.class(), AcceptErrorClass::Transient, "errno {errno}");
        }
    }

    #[tokio::test]
    async fn oversized_limit_is_capped() {
        let listener = Listener::from_tokio(TcpListener::bind("127.0.0.1:0").await.unwrap(), usize::MAX);
        assert_eq!(listener.max_connections(), Semaphore::MAX_PERMITS);
    }

    #[tokio::test]
    async fn bind_rejects_bad_address() {
        let config = ListenerConfig {
            tcp_address: "not-an-address".to_string(),
            ..ListenerConfig::default()
        };
        let err = Listener::bind(&config).await.err().unwrap();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[tokio::test]
    async fn accepted_connection_holds_a_permit() {
        let listener = Listener::from_tokio(TcpListener::bind("127.0.0.1:0").await.unwrap(), 2);
        let addr = listener.local_addr().unwrap();

        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let conn = listener.accept().await.unwrap();
        assert_eq!(listener.available_permits(), 1);
        assert_eq!(conn.peer_addr(), client.local_addr().unwrap());

        drop(conn);
        assert_eq!(listener.available_permits(), 2);
        assert_eq!(listener.max_connections(), 2);
    }
}
