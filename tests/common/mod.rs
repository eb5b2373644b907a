//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use brokerd::config::BrokerConfig;
use brokerd::daemon::DaemonError;
use brokerd::net::{Connection, Listener};
use brokerd::protocol::{ClientV2, Protocol, ProtocolError, ProtocolV2};
use brokerd::{ConnectionRegistry, Daemon, Shutdown};

/// A daemon serving on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry<ClientV2>>,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), DaemonError>>,
}

/// Config with heartbeats off so idle clients stay silent.
pub fn quiet_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.protocol.heartbeat_interval_ms = 0;
    config.shutdown.drain_timeout_secs = 5;
    config.shutdown.force_grace_secs = 1;
    config
}

/// Start a daemon with `config` on 127.0.0.1:0.
pub async fn start_server(config: BrokerConfig) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener = Listener::from_tokio(listener, config.listener.max_connections);
    let addr = listener.local_addr().unwrap();

    let daemon = Daemon::new(config);
    let registry = daemon.registry();
    let shutdown = daemon.shutdown();
    let handle = tokio::spawn(daemon.serve(listener));

    TestServer {
        addr,
        registry,
        shutdown,
        handle,
    }
}

/// Connect and send the V2 handshake.
pub async fn connect_v2(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"  V2").await.unwrap();
    stream
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// V2 protocol that counts how many clients it constructs.
#[derive(Clone, Default)]
pub struct CountingProtocol {
    inner: ProtocolV2,
    pub constructed: Arc<AtomicUsize>,
}

impl CountingProtocol {
    pub fn quiet() -> Self {
        Self {
            inner: ProtocolV2::new(None, 1024),
            constructed: Arc::default(),
        }
    }

    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }
}

impl Protocol for CountingProtocol {
    type Client = ClientV2;

    fn name(&self) -> &'static str {
        "counting-V2"
    }

    fn new_client(&self, conn: Connection) -> Arc<ClientV2> {
        self.constructed.fetch_add(1, Ordering::SeqCst);
        self.inner.new_client(conn)
    }

    fn io_loop(&self, client: Arc<ClientV2>) -> impl Future<Output = Result<(), ProtocolError>> + Send {
        self.inner.io_loop(client)
    }
}
