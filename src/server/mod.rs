//! Connection dispatch and client tracking.
//!
//! # Data Flow
//! ```text
//! Connection (from net::acceptor)
//!     → dispatcher.rs (read 4-byte tag, resolve protocol)
//!         ├─ unknown tag → E_BAD_PROTOCOL frame → close
//!         └─ known tag   → new_client → registry.rs insert
//!                          → io_loop (connection lifetime)
//!                          → registry remove + client close
//! ```
//!
//! # Design Decisions
//! - Every connection is fault-isolated; nothing here returns an error
//! - The registry is injected, never global
//! - Deregistration is tied to a drop guard, not to the happy path

pub mod dispatcher;
pub mod registry;

pub use dispatcher::{HandshakeError, TcpServer};
pub use registry::ConnectionRegistry;
