//! Accept loop.
//!
//! # Responsibilities
//! - Accept connections until shutdown or a fatal listener error
//! - Spawn one tracked handler task per connection
//! - Retry transient accept failures after yielding
//! - Drain handler tasks before returning, within a deadline

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::lifecycle::{ShutdownSignal, TaskGroup};
use crate::net::connection::Connection;
use crate::net::listener::{AcceptErrorClass, ListenerError};
use crate::observability::metrics;

/// A source of accepted connections, normally a [`Listener`](crate::net::Listener).
pub trait Accept: Send + Sync + 'static {
    /// Wait for the next connection. Must be cancel-safe.
    fn accept(&self) -> impl Future<Output = Result<Connection, ListenerError>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Receives every accepted connection.
pub trait TcpHandler: Send + Sync + 'static {
    /// Serve one connection to completion. Errors are the handler's to log.
    fn handle(&self, conn: Connection) -> impl Future<Output = ()> + Send;

    /// Signal every live connection to close. Returns how many were signalled.
    fn close_all(&self) -> usize;
}

/// How in-flight connections are drained once accepting stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainConfig {
    /// Call [`TcpHandler::close_all`] as soon as the loop exits.
    pub close_clients_on_shutdown: bool,
    /// Deadline for handler tasks to finish. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Extra time after a forced close before remaining tasks are aborted.
    pub force_grace: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            close_clients_on_shutdown: true,
            timeout: Some(Duration::from_secs(30)),
            force_grace: Duration::from_secs(5),
        }
    }
}

/// The only error the accept loop reports.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("listener.accept() error - {0}")]
    Accept(#[source] ListenerError),
}

/// Accept connections from `listener` and hand each one to `handler` in its
/// own task.
///
/// Returns `Ok(())` once `shutdown` fires and in-flight connections have been
/// drained, or the fatal accept error that stopped the loop. The listener is
/// dropped, and so closed, as soon as the loop exits. Clients are only closed
/// early when the loop stopped for shutdown.
pub async fn serve<L: Accept, H: TcpHandler>(
    listener: L,
    handler: Arc<H>,
    mut shutdown: ShutdownSignal,
    drain: DrainConfig,
) -> Result<(), ServeError> {
    let local_addr = listener.local_addr().ok();
    tracing::info!(address = ?local_addr, "TCP: accepting connections");

    let tasks = TaskGroup::new();

    let result = loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.recv() => None,
            accepted = listener.accept() => Some(accepted),
        };
        let Some(accepted) = accepted else {
            break Ok(());
        };

        match accepted {
            Ok(conn) => {
                metrics::record_connection_accepted();
                let handler = Arc::clone(&handler);
                tasks.wrap(async move { handler.handle(conn).await });
            }
            Err(e) => {
                let class = e.class();
                metrics::record_accept_error(class.as_str());
                match class {
                    AcceptErrorClass::Transient => {
                        tracing::warn!(error = %e, "Temporary accept failure");
                        tokio::task::yield_now().await;
                    }
                    AcceptErrorClass::Fatal => {
                        tracing::error!(error = %e, "Accept failed, stopping listener");
                        break Err(ServeError::Accept(e));
                    }
                }
            }
        }
    };

    drop(listener);
    tracing::info!(address = ?local_addr, "TCP: closing");

    let close_early = drain.close_clients_on_shutdown && result.is_ok();
    drain_tasks(&tasks, handler.as_ref(), &drain, close_early).await;
    result
}

/// Wait for every handler task, escalating from close to abort.
async fn drain_tasks<H: TcpHandler>(tasks: &TaskGroup, handler: &H, drain: &DrainConfig, close_early: bool) {
    if tasks.active() == 0 {
        return;
    }
    tracing::info!(active = tasks.active(), "Draining connections");

    if close_early {
        let closed = handler.close_all();
        tracing::debug!(closed, "Signalled clients to close");
    }

    let Some(timeout) = drain.timeout else {
        tasks.wait().await;
        return;
    };
    if tasks.wait_timeout(timeout).await {
        return;
    }

    tracing::warn!(
        outstanding = tasks.active(),
        timeout_secs = timeout.as_secs_f64(),
        "Drain timed out, forcing clients closed"
    );
    handler.close_all();
    if tasks.wait_timeout(drain.force_grace).await {
        return;
    }

    let aborted = tasks.abort_all();
    tracing::error!(aborted, "Aborting handler tasks that ignored close");
    tasks.wait().await;
}
