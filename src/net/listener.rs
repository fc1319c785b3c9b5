//! TCP listener with socket options and backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address with listener options applied
//! - Accept incoming TCP connections
//! - Enforce max_connections via semaphore
//! - Apply per-connection socket options to accepted streams

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ServerOptions;
use crate::error::NetError;

const BACKLOG: u32 = 1024;

/// A bounded TCP listener that limits concurrent connections.
///
/// When the limit is reached, accept waits until a slot frees up.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind with SO_REUSEADDR, SO_KEEPALIVE and buffer sizes from `options`.
    ///
    /// Must run inside the runtime that will drive the listener.
    pub fn bind(options: &ServerOptions) -> Result<Self, NetError> {
        let address = options.bind_address.clone();
        let bind_err = |source: io::Error| NetError::Bind {
            address: address.clone(),
            source,
        };

        let addr: SocketAddr = options
            .socket_addr()
            .map_err(|e| bind_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;

        socket.set_reuseaddr(options.reuse_address).map_err(bind_err)?;
        socket.set_keepalive(options.keep_alive).map_err(bind_err)?;
        if let Some(size) = options.receive_buffer_size {
            socket.set_recv_buffer_size(size).map_err(bind_err)?;
        }
        if let Some(size) = options.send_buffer_size {
            socket.set_send_buffer_size(size).map_err(bind_err)?;
        }
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(BACKLOG).map_err(bind_err)?;

        let local_addr = listener.local_addr().map_err(bind_err)?;
        tracing::info!(
            address = %local_addr,
            max_connections = options.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(options.max_connections.max(1))),
            max_connections: options.max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream and a permit that must be held for the
    /// connection's lifetime.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr, ConnectionPermit)> {
        // Acquire permit first (backpressure)
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "connection limit closed"))?;

        let (stream, addr) = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot, released on drop.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Apply TCP_NODELAY and SO_LINGER to an accepted stream.
pub(crate) fn configure_stream(stream: &TcpStream, options: &ServerOptions) {
    if let Err(e) = stream.set_nodelay(options.tcp_no_delay) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    if let Err(e) = set_linger(stream, options) {
        tracing::debug!(error = %e, "Failed to set SO_LINGER");
    }
}

#[allow(deprecated)]
fn set_linger(stream: &TcpStream, options: &ServerOptions) -> io::Result<()> {
    stream.set_linger(options.linger())
}
