//! TCP front door of a message-broker daemon.
//!
//! Accepts connections, negotiates the wire protocol from a 4-byte handshake,
//! tracks live clients and drains them on shutdown.

pub mod config;
pub mod daemon;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod server;

pub use config::BrokerConfig;
pub use daemon::Daemon;
pub use lifecycle::Shutdown;
pub use server::{ConnectionRegistry, TcpServer};
