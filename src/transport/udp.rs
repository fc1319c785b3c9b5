//! UDP server: one socket, one `Connection` per remote endpoint.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::{MulticastInterface, ServerOptions};
use crate::error::{NetError, Result};
use crate::flow::bridge::{self, BridgeProducer};
use crate::flow::outbound::Outbound;
use crate::lifecycle::server::{Bound, ServeContext, ServerCore};
use crate::lifecycle::Phase;
use crate::net::connection::{
    Connection, ConnectionId, ConnectionInfo, ConnectionStatus, TransportKind,
};
use crate::net::pipeline::Pipeline;
use crate::net::udp::{self as udp_socket, DatagramSink};
use crate::transport::{boxed_handler, ConnectionContext, ConnectionHandler};

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 64 * 1024;

/// A UDP server invoking one handler per remote endpoint.
pub struct UdpServer {
    core: ServerCore,
}

impl UdpServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            core: ServerCore::new(TransportKind::Udp, options),
        }
    }

    /// Bind and start receiving. Resolves with the bound address.
    pub async fn start<F, Fut>(&self, handler: F) -> Result<SocketAddr>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = boxed_handler(handler);
        self.core.start(move |ctx| serve(ctx, handler)).await
    }

    /// Like [`start`](Self::start), failing with `StartTimeout` after `timeout`.
    pub async fn start_and_await<F, Fut>(&self, handler: F, timeout: Duration) -> Result<SocketAddr>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = boxed_handler(handler);
        self.core
            .start_within(move |ctx| serve(ctx, handler), timeout)
            .await
    }

    /// Join a multicast group. `interface` falls back to the configured
    /// `multicast_interface`.
    pub async fn join_group(&self, group: IpAddr, interface: Option<MulticastInterface>) -> Result<()> {
        let socket = self.bound_socket()?;
        let interface = interface.or(self.core.options().multicast_interface);
        udp_socket::join(&socket, group, interface)?;
        tracing::info!(%group, ?interface, "Joined multicast group");
        Ok(())
    }

    /// Leave a multicast group.
    pub async fn leave_group(&self, group: IpAddr, interface: Option<MulticastInterface>) -> Result<()> {
        let socket = self.bound_socket()?;
        let interface = interface.or(self.core.options().multicast_interface);
        udp_socket::leave(&socket, group, interface)?;
        tracing::info!(%group, ?interface, "Left multicast group");
        Ok(())
    }

    fn bound_socket(&self) -> Result<Arc<UdpSocket>> {
        self.core
            .udp_socket()
            .ok_or(NetError::NotRunning("UDP socket is not bound"))
    }

    /// Graceful shutdown. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.core.shutdown().await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    pub fn phase(&self) -> Phase {
        self.core.phase()
    }

    pub fn is_started(&self) -> bool {
        self.phase().is_running()
    }

    pub fn is_terminated(&self) -> bool {
        self.phase().is_terminated()
    }

    pub fn active_connections(&self) -> usize {
        self.core.tracker().active_count()
    }
}

/// Datagrams buffered per peer while its consumer has no demand.
const PEER_QUEUE: usize = 64;

/// Serve-loop side of one remote endpoint.
struct Peer {
    id: ConnectionId,
    queue: mpsc::Sender<Bytes>,
}

type Finished = mpsc::UnboundedSender<(SocketAddr, ConnectionId)>;

async fn serve(ctx: ServeContext, handler: ConnectionHandler) {
    let ServeContext {
        options,
        tracker,
        shutdown,
        ready,
        released,
        ..
    } = ctx;

    let bound = udp_socket::bind(&options).and_then(|socket| {
        let local_addr = socket.local_addr().map_err(NetError::from)?;
        Ok((Arc::new(socket), local_addr))
    });
    let (socket, local_addr) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let bound = Bound {
        local_addr,
        udp: Some(Arc::clone(&socket)),
    };
    if ready.send(Ok(bound)).is_err() {
        return;
    }

    let mut peers: HashMap<SocketAddr, Peer> = HashMap::new();
    let (finished_tx, mut finished) = mpsc::unbounded_channel();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut stop = shutdown.clone();

    loop {
        let (len, remote_addr) = tokio::select! {
            _ = stop.draining() => break,
            Some((addr, id)) = finished.recv() => {
                release(&mut peers, addr, id);
                continue;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!(error = %e, "UDP receive failed");
                    continue;
                }
            },
        };
        let mut payload = Bytes::copy_from_slice(&buf[..len]);

        // Never wait on a peer here: one slow consumer must not stall the socket.
        if let Some(peer) = peers.get(&remote_addr) {
            match peer.queue.try_send(payload) {
                Ok(()) => continue,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(peer_addr = %remote_addr, "Datagram dropped, peer queue full");
                    continue;
                }
                Err(TrySendError::Closed(back)) => {
                    peers.remove(&remote_addr);
                    payload = back;
                }
            }
        }

        let cx = ConnectionContext {
            info: ConnectionInfo::new(TransportKind::Udp, remote_addr, local_addr),
            options: Arc::clone(&options),
            tracker: tracker.clone(),
            shutdown: shutdown.clone(),
        };
        let peer = open_peer(cx, Arc::clone(&socket), Arc::clone(&handler), finished_tx.clone());
        let _ = peer.queue.try_send(payload);
        peers.insert(remote_addr, peer);
    }

    // Dropping the queues completes every peer's inbound stream.
    peers.clear();
    tracing::info!(address = %local_addr, "UDP socket closed");
    let _ = released.send(());
}

/// Forget a peer whose handler finished, unless the address was reused since.
fn release(peers: &mut HashMap<SocketAddr, Peer>, addr: SocketAddr, id: ConnectionId) {
    if peers.get(&addr).is_some_and(|peer| peer.id == id) {
        peers.remove(&addr);
        tracing::trace!(peer_addr = %addr, connection_id = %id, "UDP peer released");
    }
}

fn open_peer(
    cx: ConnectionContext,
    socket: Arc<UdpSocket>,
    handler: ConnectionHandler,
    finished: Finished,
) -> Peer {
    let pipeline = cx.pipeline();
    let (bridge, producer) = bridge::channel();
    let status = Arc::new(ConnectionStatus::new());
    let outbound = Outbound::spawn(
        DatagramSink::new(socket, cx.info.remote_addr),
        bridge.state(),
        pipeline.clone(),
        Arc::clone(&status),
    );
    let connection = Connection::new(
        cx.info.clone(),
        bridge.clone(),
        outbound,
        status,
        cx.options.prefetch,
    );

    let (queue, datagrams) = mpsc::channel(PEER_QUEUE);
    tokio::spawn(pump_datagrams(datagrams, producer, pipeline));

    tracing::debug!(connection_id = %cx.info.id, peer_addr = %cx.info.remote_addr, "New UDP peer");
    let id = cx.info.id;
    tokio::spawn(async move {
        let _guard = cx.tracker.track(cx.info.clone());
        let mut shutdown = cx.shutdown;
        let outcome = tokio::select! {
            outcome = handler(connection) => outcome,
            _ = shutdown.forced() => Err(NetError::NotRunning("server shut down")),
        };
        if let Err(e) = outcome {
            tracing::warn!(connection_id = %cx.info.id, error = %e, "Handler failed");
        }
        bridge.abandon();
        let _ = finished.send((cx.info.remote_addr, cx.info.id));
    });

    Peer { id, queue }
}

/// Move queued datagrams into the peer's bridge as demand allows.
async fn pump_datagrams(mut datagrams: mpsc::Receiver<Bytes>, producer: BridgeProducer<Bytes>, pipeline: Pipeline) {
    loop {
        let payload = tokio::select! {
            payload = datagrams.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
            _ = producer.closed() => break,
        };
        if producer.deliver(pipeline.inbound(payload)).await.is_err() {
            tracing::trace!("Datagram dropped, handler finished");
            break;
        }
    }
}
