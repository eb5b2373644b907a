//! The `  V2` protocol.
//!
//! Only connection-level commands are served here:
//!
//! | command | reply                                  |
//! |---------|----------------------------------------|
//! | `NOP`   | none                                   |
//! | `CLS`   | response `CLOSE_WAIT`, loop ends       |
//! | other   | error `E_INVALID ...`, loop ends       |
//!
//! The server also sends a `_heartbeat_` response frame every
//! `heartbeat_interval` while the client is idle or busy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::{self, Instant, Interval};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::config::ProtocolConfig;
use crate::net::connection::{Connection, ConnectionId};
use crate::protocol::frame::{Frame, FrameCodec, FrameError};
use crate::protocol::{Client, ClientRole, ClientStats, Protocol, ProtocolError};

const HEARTBEAT: &[u8] = b"_heartbeat_";
const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Protocol settings shared by every V2 client.
#[derive(Debug, Clone)]
pub struct ProtocolV2 {
    heartbeat_interval: Option<Duration>,
    max_line_length: usize,
}

impl ProtocolV2 {
    pub fn new(heartbeat_interval: Option<Duration>, max_line_length: usize) -> Self {
        Self {
            heartbeat_interval,
            max_line_length,
        }
    }

    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(config.heartbeat_interval(), config.max_line_length)
    }
}

impl Default for ProtocolV2 {
    fn default() -> Self {
        Self::from_config(&ProtocolConfig::default())
    }
}

/// A V2 client.
pub struct ClientV2 {
    id: ConnectionId,
    peer_addr: SocketAddr,
    connected_at: SystemTime,
    /// Taken by the I/O loop when it starts.
    conn: Mutex<Option<Connection>>,
    closed: watch::Sender<bool>,
    commands: DashMap<String, u64>,
    frames_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ClientV2 {
    fn new(conn: Connection) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: conn.id(),
            peer_addr: conn.peer_addr(),
            connected_at: conn.accepted_at(),
            conn: Mutex::new(Some(conn)),
            closed,
            commands: DashMap::new(),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn take_connection(&self) -> Option<Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn record_command(&self, name: &str) {
        *self.commands.entry(name.to_string()).or_insert(0) += 1;
    }

    async fn send<W>(&self, writer: &mut W, frame: Frame) -> Result<(), ProtocolError>
    where
        W: Sink<Frame, Error = FrameError> + Unpin,
    {
        writer.send(frame).await?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Client for ClientV2 {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// This build does not accept publishes, so every V2 client is a consumer.
    fn role(&self) -> ClientRole {
        ClientRole::Consumer
    }

    fn stats(&self, scope: &str) -> ClientStats {
        let commands = if scope.is_empty() {
            self.commands.iter().map(|entry| *entry.value()).sum()
        } else {
            self.commands.get(scope).map(|count| *count).unwrap_or(0)
        };

        ClientStats {
            client_id: self.id,
            peer_addr: self.peer_addr,
            role: self.role(),
            connected_at: self.connected_at,
            commands,
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    fn close(&self) -> Result<(), ProtocolError> {
        self.closed.send_replace(true);
        Ok(())
    }
}

impl Protocol for ProtocolV2 {
    type Client = ClientV2;

    fn name(&self) -> &'static str {
        "V2"
    }

    fn new_client(&self, conn: Connection) -> Arc<ClientV2> {
        Arc::new(ClientV2::new(conn))
    }

    async fn io_loop(&self, client: Arc<ClientV2>) -> Result<(), ProtocolError> {
        let mut conn = client.take_connection().ok_or(ProtocolError::AlreadyRunning)?;

        let mut closed = client.closed.subscribe();
        if *closed.borrow() {
            return Err(ProtocolError::Closed);
        }

        let mut heartbeat = self.heartbeat_interval.map(|period| time::interval_at(Instant::now() + period, period));
        let (reader, writer) = conn.stream_mut().split();
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(self.max_line_length));
        let mut writer = FramedWrite::new(writer, FrameCodec);

        loop {
            tokio::select! {
                _ = closed.changed() => {
                    return Err(ProtocolError::Closed);
                }
                _ = tick(&mut heartbeat) => {
                    client.send(&mut writer, Frame::response(HEARTBEAT)).await?;
                }
                line = lines.next() => {
                    let line = match line {
                        None => {
                            tracing::debug!(client_id = %client.id, "Client closed connection");
                            return Ok(());
                        }
                        Some(Ok(line)) => line,
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            let msg = format!("command line exceeds {} bytes", self.max_line_length);
                            client.send(&mut writer, Frame::error(format!("E_BAD_BODY {msg}"))).await?;
                            return Err(ProtocolError::BadBody(msg));
                        }
                        Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                    };
                    // Count the stripped newline too.
                    client.bytes_received.fetch_add(line.len() as u64 + 1, Ordering::Relaxed);

                    let name = line.split(' ').next().unwrap_or_default();
                    match name {
                        "NOP" => client.record_command(name),
                        "CLS" => {
                            client.record_command(name);
                            client.send(&mut writer, Frame::response(CLOSE_WAIT)).await?;
                            return Ok(());
                        }
                        _ => {
                            let msg = format!("invalid command {name:?}");
                            client.send(&mut writer, Frame::error(format!("E_INVALID {msg}"))).await?;
                            return Err(ProtocolError::InvalidCommand(msg));
                        }
                    }
                }
            }
        }
    }
}

/// Resolve on the next heartbeat tick, or never if heartbeats are disabled.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameType;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    /// Accept one loopback connection and wrap it as a V2 client.
    async fn connected_client(protocol: &ProtocolV2) -> (Arc<ClientV2>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, addr) = listener.accept().await.unwrap();
        (protocol.new_client(Connection::new(stream, addr, None)), peer)
    }

    async fn next_frame(peer: &mut TcpStream) -> Frame {
        FramedRead::new(peer, FrameCodec).next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn nop_then_eof_ends_cleanly() {
        let protocol = ProtocolV2::new(None, 64);
        let (client, mut peer) = connected_client(&protocol).await;

        peer.write_all(b"NOP\nNOP\n").await.unwrap();
        peer.shutdown().await.unwrap();

        protocol.io_loop(client.clone()).await.unwrap();
        let stats = client.stats("NOP");
        assert_eq!(stats.commands, 2);
        assert_eq!(stats.bytes_received, 8);
        assert_eq!(stats.frames_sent, 0);
        assert_eq!(stats.role, ClientRole::Consumer);
    }

    #[tokio::test]
    async fn cls_replies_close_wait() {
        let protocol = ProtocolV2::new(None, 64);
        let (client, mut peer) = connected_client(&protocol).await;

        peer.write_all(b"NOP\r\nCLS\n").await.unwrap();
        protocol.io_loop(client.clone()).await.unwrap();

        let frame = next_frame(&mut peer).await;
        assert_eq!(frame.frame_type, FrameType::Response);
        assert_eq!(frame.data, CLOSE_WAIT);
        assert_eq!(client.stats("").commands, 2);
        assert_eq!(client.stats("CLS").commands, 1);
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let protocol = ProtocolV2::new(None, 64);
        let (client, mut peer) = connected_client(&protocol).await;

        peer.write_all(b"PUB topic\n").await.unwrap();
        let err = protocol.io_loop(client).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(_)));

        let frame = next_frame(&mut peer).await;
        assert_eq!(frame.frame_type, FrameType::Error);
        assert!(frame.data.starts_with(b"E_INVALID"));
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let protocol = ProtocolV2::new(None, 8);
        let (client, mut peer) = connected_client(&protocol).await;

        peer.write_all(b"NOPNOPNOP").await.unwrap();
        let err = protocol.io_loop(client).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadBody(_)));

        let frame = next_frame(&mut peer).await;
        assert!(frame.data.starts_with(b"E_BAD_BODY"));
    }

    #[tokio::test]
    async fn line_split_across_heartbeats_is_reassembled() {
        let protocol = ProtocolV2::new(Some(Duration::from_millis(5)), 64);
        let (client, mut peer) = connected_client(&protocol).await;

        let task = tokio::spawn({
            let protocol = protocol.clone();
            let client = client.clone();
            async move { protocol.io_loop(client).await }
        });

        peer.write_all(b"NO").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        peer.write_all(b"P\nCLS\n").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
        let stats = client.stats("NOP");
        assert_eq!(stats.commands, 1);
        assert_eq!(stats.bytes_received, 8);
        assert!(stats.frames_sent > 1, "heartbeats and CLOSE_WAIT");
    }

    #[tokio::test]
    async fn heartbeats_are_sent_while_idle() {
        let protocol = ProtocolV2::new(Some(Duration::from_millis(20)), 64);
        let (client, mut peer) = connected_client(&protocol).await;

        let task = tokio::spawn({
            let protocol = protocol.clone();
            let client = client.clone();
            async move { protocol.io_loop(client).await }
        });

        let frame = next_frame(&mut peer).await;
        assert_eq!(frame.data, HEARTBEAT);

        client.close().unwrap();
        assert!(matches!(task.await.unwrap(), Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn close_unblocks_a_parked_loop_and_is_idempotent() {
        let protocol = ProtocolV2::new(None, 64);
        let (client, _peer) = connected_client(&protocol).await;

        let task = tokio::spawn({
            let protocol = protocol.clone();
            let client = client.clone();
            async move { protocol.io_loop(client).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.close().unwrap();
        client.close().unwrap();
        assert!(client.is_closed());
        let res = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(res, Err(ProtocolError::Closed)));

        client.close().unwrap();
    }

    #[tokio::test]
    async fn loop_runs_only_once() {
        let protocol = ProtocolV2::new(None, 64);
        let (client, mut peer) = connected_client(&protocol).await;

        peer.shutdown().await.unwrap();
        protocol.io_loop(client.clone()).await.unwrap();
        assert!(matches!(protocol.io_loop(client).await, Err(ProtocolError::AlreadyRunning)));
    }
}
