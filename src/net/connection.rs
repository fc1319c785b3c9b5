//! Connection identity, state and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track connection state (Open → Closing → Closed)
//! - Own the set of active connections for graceful shutdown
//! - Expose the inbound/outbound surface handed to handlers

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::Stream;
use tokio::sync::watch;

use crate::error::Result;
use crate::flow::bridge::{Demand, DemandBridge, Inbound, Prefetch};
use crate::flow::outbound::Outbound;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough since only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport a connection was opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static facts about a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub transport: TransportKind,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

impl ConnectionInfo {
    pub fn new(transport: TransportKind, remote_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            transport,
            remote_addr,
            local_addr,
        }
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Reads and writes flow.
    Open = 0,
    /// A write failed or close was requested; no new writes are accepted.
    Closing = 1,
    /// Underlying socket released.
    Closed = 2,
}

/// Shared, atomically updated connection state.
#[derive(Debug, Default)]
pub struct ConnectionStatus(AtomicU8);

impl ConnectionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Move to `Closing` unless already further along.
    pub fn mark_closing(&self) {
        let _ = self.0.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn mark_closed(&self) {
        self.0.store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

/// Tracks active connections for graceful shutdown.
///
/// The watch channel carries the live count so shutdown can wait for zero
/// without polling.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<DashMap<ConnectionId, ConnectionInfo>>,
    count: Arc<watch::Sender<usize>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            active: Arc::new(DashMap::new()),
            count: Arc::new(tx),
        }
    }

    /// Record a new active connection. Returns a guard that removes it on drop.
    pub fn track(&self, info: ConnectionInfo) -> ConnectionGuard {
        let id = info.id;
        let transport = info.transport;
        self.active.insert(id, info);
        self.count.send_modify(|n| *n += 1);
        metrics::record_connection_opened(transport);
        tracing::trace!(connection_id = %id, %transport, "Connection opened");

        ConnectionGuard {
            tracker: self.clone(),
            id,
            transport,
        }
    }

    pub fn active_count(&self) -> usize {
        *self.count.borrow()
    }

    /// Snapshot of the currently open connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    /// Wait until every tracked connection closed. Returns `false` on timeout.
    pub async fn wait_for_drain(&self, deadline: Duration) -> bool {
        let mut rx = self.count.subscribe();
        let drained = matches!(
            tokio::time::timeout(deadline, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        drained
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
    transport: TransportKind,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.active.remove(&self.id);
        self.tracker.count.send_modify(|n| *n = n.saturating_sub(1));
        metrics::record_connection_closed(self.transport);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// A live connection as seen by a handler.
///
/// Cloning yields another handle onto the same socket.
#[derive(Debug, Clone)]
pub struct Connection {
    info: ConnectionInfo,
    inbound: DemandBridge<Bytes>,
    outbound: Outbound,
    status: Arc<ConnectionStatus>,
    prefetch: Prefetch,
}

impl Connection {
    pub(crate) fn new(
        info: ConnectionInfo,
        inbound: DemandBridge<Bytes>,
        outbound: Outbound,
        status: Arc<ConnectionStatus>,
        prefetch: Prefetch,
    ) -> Self {
        Self {
            info,
            inbound,
            outbound,
            status,
            prefetch,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.info.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.info.local_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.status.get()
    }

    /// Attach the inbound consumer using the configured prefetch window.
    pub fn receive(&self) -> Result<Inbound<Bytes>> {
        self.inbound.attach(Demand::Window(self.prefetch))
    }

    /// Attach the inbound consumer with an explicit demand mode.
    pub fn receive_with(&self, demand: Demand) -> Result<Inbound<Bytes>> {
        self.inbound.attach(demand)
    }

    /// True while no inbound demand is outstanding.
    pub fn reads_paused(&self) -> bool {
        self.inbound.reads_paused()
    }

    /// Write one chunk; resolves once it reached the socket.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<()> {
        self.outbound.send(chunk.into()).await
    }

    /// Write every chunk of a stream in order.
    pub async fn send_all<S>(&self, chunks: S) -> Result<()>
    where
        S: Stream<Item = Bytes> + Send,
    {
        self.outbound.send_all(chunks).await
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Flush pending writes and release the socket.
    pub async fn close(&self) -> Result<()> {
        self.inbound.abandon();
        self.outbound.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ConnectionInfo {
        ConnectionInfo::new(
            TransportKind::Tcp,
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:12012".parse().unwrap(),
        )
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(info());
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(info());
        assert_eq!(tracker.active_count(), 2);
        assert_eq!(tracker.connections().len(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
        assert!(tracker.connections().is_empty());
    }

    #[test]
    fn status_only_moves_forward() {
        let status = ConnectionStatus::new();
        assert_eq!(status.get(), ConnectionState::Open);
        status.mark_closing();
        assert_eq!(status.get(), ConnectionState::Closing);
        status.mark_closed();
        status.mark_closing();
        assert_eq!(status.get(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn drain_resolves_when_last_guard_drops() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(info());

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_drain(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn drain_times_out_with_open_connections() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track(info());
        assert!(!tracker.wait_for_drain(Duration::from_millis(20)).await);
    }
}
