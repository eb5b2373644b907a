//! Daemon wiring: config → listener → dispatcher → accept loop.

use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::lifecycle::Shutdown;
use crate::net::acceptor::{self, ServeError};
use crate::net::listener::{Listener, ListenerError};
use crate::protocol::{ClientV2, HandshakeTag, ProtocolTable, ProtocolV2};
use crate::server::{ConnectionRegistry, TcpServer};

/// Errors that stop the daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Serve(#[from] ServeError),
}

/// The TCP front door of the broker.
pub struct Daemon {
    config: BrokerConfig,
    shutdown: Shutdown,
    registry: Arc<ConnectionRegistry<ClientV2>>,
}

impl Daemon {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            shutdown: Shutdown::new(),
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }

    /// Handle used to stop the daemon.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// The live client registry.
    pub fn registry(&self) -> Arc<ConnectionRegistry<ClientV2>> {
        Arc::clone(&self.registry)
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> Result<(), DaemonError> {
        let listener = Listener::bind(&self.config.listener).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(self, listener: Listener) -> Result<(), DaemonError> {
        let protocols = ProtocolTable::new().with(HandshakeTag::V2, ProtocolV2::from_config(&self.config.protocol));
        let server = TcpServer::new(protocols, Arc::clone(&self.registry))
            .with_handshake_timeout(self.config.protocol.handshake_timeout());

        acceptor::serve(
            listener,
            Arc::new(server),
            self.shutdown.subscribe(),
            self.config.shutdown.drain(),
        )
        .await?;

        tracing::info!(remaining_clients = self.registry.len(), "TCP front door stopped");
        Ok(())
    }
}
