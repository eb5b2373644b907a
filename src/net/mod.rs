//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limits, error classification)
//!     → connection.rs (identity, peer address, permit)
//!     → acceptor.rs (spawn tracked handler task)
//!     → Hand off to server::TcpServer
//!
//! Shutdown:
//!     signal → accept loop exits → listener dropped → drain handler tasks
//! ```
//!
//! # Design Decisions
//! - Bounded accept (semaphore) prevents resource exhaustion
//! - Shutdown is observed via a typed signal, never from accept error text
//! - Each handler task is tracked so shutdown can wait for it

pub mod acceptor;
pub mod connection;
pub mod listener;

pub use acceptor::{serve, Accept, DrainConfig, ServeError, TcpHandler};
pub use connection::{Connection, ConnectionId};
pub use listener::Listener;
