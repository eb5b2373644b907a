//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! acceptor, dispatcher, registry produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout log stream
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Connection identity (peer address, client id) travels as log fields
//! - Metrics are cheap no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
