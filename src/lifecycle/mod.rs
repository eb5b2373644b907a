//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Tasks (task_group.rs):
//!     wrap(unit) → spawned + counted → guard dropped on exit → wait() wakes
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     Second signal  → Immediate exit
//! ```
//!
//! # Design Decisions
//! - Completion is tracked by RAII guards, so panicking tasks still count down
//! - Shutdown is a level-triggered watch, not an edge-triggered broadcast
//! - Drain has a deadline: forced close, then abort

pub mod shutdown;
pub mod signals;
pub mod task_group;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use task_group::TaskGroup;
