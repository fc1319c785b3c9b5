//! Configuration schema definitions.
//!
//! `ServerOptions` is the read-only snapshot every server consumes at start
//! time. `AppConfig` wraps it for the demo binary's TOML file.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::flow::bridge::Prefetch;
use crate::net::event_loop::{self, EventLoopGroup};
use crate::net::pipeline::ConnectionSetup;

/// Root configuration for the demo binary.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server socket and flow-control options.
    pub server: ServerOptions,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Directories served over HTTP.
    pub mounts: Vec<MountConfig>,
}

/// Address family used by UDP servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    /// Follow the bind address.
    #[default]
    Default,
    Ipv4,
    Ipv6,
}

/// Interface used for multicast group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MulticastInterface {
    /// IPv4 interface address.
    Address(Ipv4Addr),
    /// IPv6 interface index.
    Index(u32),
}

/// Server options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Bind address (e.g., "0.0.0.0:8080"). Port 0 picks an ephemeral port.
    pub bind_address: String,

    /// SO_KEEPALIVE on TCP sockets and HTTP persistent connections.
    pub keep_alive: bool,

    /// SO_LINGER seconds for accepted TCP sockets.
    pub linger_secs: Option<u64>,

    /// TCP_NODELAY.
    pub tcp_no_delay: bool,

    /// SO_RCVBUF.
    pub receive_buffer_size: Option<u32>,

    /// SO_SNDBUF.
    pub send_buffer_size: Option<u32>,

    /// SO_REUSEADDR on the listening socket.
    pub reuse_address: bool,

    /// Maximum concurrent TCP/HTTP connections (backpressure).
    pub max_connections: usize,

    /// Client connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Read-idle timeout in seconds; surfaces as a terminal error.
    pub idle_timeout_secs: Option<u64>,

    /// Demand window applied when a consumer attaches.
    pub prefetch: Prefetch,

    /// Number of loops in a server-owned event-loop group.
    pub io_threads: usize,

    /// UDP address family.
    pub protocol_family: ProtocolFamily,

    /// Default interface for UDP multicast membership.
    pub multicast_interface: Option<MulticastInterface>,

    /// Graceful drain deadline before connections are force-closed.
    pub shutdown_timeout_secs: u64,

    /// Log every chunk crossing a connection at TRACE level.
    pub wire_logging: bool,

    /// Externally owned event loops. Never shut down by the server.
    #[serde(skip)]
    pub event_loops: Option<Arc<EventLoopGroup>>,

    /// Per-connection setup callback.
    #[serde(skip)]
    pub on_connection: Option<ConnectionSetup>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:12012".to_string(),
            keep_alive: true,
            linger_secs: Some(5),
            tcp_no_delay: true,
            receive_buffer_size: None,
            send_buffer_size: None,
            reuse_address: true,
            max_connections: 10_000,
            connect_timeout_ms: 30_000,
            idle_timeout_secs: None,
            prefetch: Prefetch::UNBOUNDED,
            io_threads: event_loop::default_threads(),
            protocol_family: ProtocolFamily::Default,
            multicast_interface: None,
            shutdown_timeout_secs: 30,
            wire_logging: false,
            event_loops: None,
            on_connection: None,
        }
    }
}

impl ServerOptions {
    /// Options bound to `address`, everything else defaulted.
    pub fn bind(address: impl Into<String>) -> Self {
        Self {
            bind_address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_event_loops(mut self, group: Arc<EventLoopGroup>) -> Self {
        self.event_loops = Some(group);
        self
    }

    pub fn with_prefetch(mut self, prefetch: Prefetch) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_connection_setup(mut self, setup: ConnectionSetup) -> Self {
        self.on_connection = Some(setup);
        self
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.bind_address.parse()
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// A directory served under a URL prefix.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MountConfig {
    /// URL prefix, e.g. "/static".
    pub prefix: String,

    /// Filesystem directory.
    pub root: String,
}
