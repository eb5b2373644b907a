//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the daemon.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::acceptor::DrainConfig;

/// Root configuration for the broker daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// TCP listener configuration.
    pub listener: ListenerConfig,

    /// Handshake and protocol settings.
    pub protocol: ProtocolConfig,

    /// Drain behaviour on shutdown.
    pub shutdown: ShutdownConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:4150").
    pub tcp_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            tcp_address: "0.0.0.0:4150".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Protocol configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How long a new connection may take to send its 4-byte tag.
    /// 0 disables the timeout.
    pub handshake_timeout_ms: u64,

    /// Interval between server heartbeats. 0 disables heartbeats.
    pub heartbeat_interval_ms: u64,

    /// Longest command line a client may send.
    pub max_line_length: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 0,
            heartbeat_interval_ms: 30_000,
            max_line_length: 1024,
        }
    }
}

impl ProtocolConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        non_zero_millis(self.heartbeat_interval_ms)
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long to wait for connections to drain. 0 waits forever.
    pub drain_timeout_secs: u64,

    /// How long to wait after forcing clients closed before aborting.
    pub force_grace_secs: u64,

    /// Close every client as soon as the listener stops.
    pub close_clients_on_shutdown: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
            force_grace_secs: 5,
            close_clients_on_shutdown: true,
        }
    }
}

impl ShutdownConfig {
    pub fn drain(&self) -> DrainConfig {
        DrainConfig {
            close_clients_on_shutdown: self.close_clients_on_shutdown,
            timeout: (self.drain_timeout_secs > 0).then(|| Duration::from_secs(self.drain_timeout_secs)),
            force_grace: Duration::from_secs(self.force_grace_secs),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter, overridden by `RUST_LOG`.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Address the Prometheus exporter listens on.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Full,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9150".to_string(),
        }
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
