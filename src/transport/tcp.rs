//! TCP server.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;

use crate::config::ServerOptions;
use crate::error::{NetError, Result};
use crate::flow::bridge::{self, BridgeProducer, Readiness};
use crate::flow::outbound::{Outbound, WriteSink};
use crate::lifecycle::server::{Bound, ServeContext, ServerCore};
use crate::lifecycle::Phase;
use crate::net::connection::{Connection, ConnectionInfo, ConnectionStatus, TransportKind};
use crate::net::listener::{configure_stream, Listener};
use crate::net::pipeline::Pipeline;
use crate::transport::{boxed_handler, ConnectionContext, ConnectionHandler};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8 * 1024;

/// Pause after a failed accept (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A TCP server invoking one handler per accepted connection.
pub struct TcpServer {
    core: ServerCore,
}

impl TcpServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            core: ServerCore::new(TransportKind::Tcp, options),
        }
    }

    /// Bind and start accepting. Resolves with the bound address.
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

    pub fn options(&self) -> &ServerOptions {
        self.core.options()
    }
}

async fn serve(ctx: ServeContext, handler: ConnectionHandler) {
    accept_loop(ctx, TransportKind::Tcp, move |stream, cx| {
        run_connection(stream, cx, Arc::clone(&handler))
    })
    .await
}

/// Accept until draining starts, moving each socket to the next event loop.
pub(crate) async fn accept_loop<F, Fut>(ctx: ServeContext, transport: TransportKind, on_accept: F)
where
    F: Fn(TcpStream, ConnectionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let ServeContext {
        options,
        group,
        tracker,
        shutdown,
        ready,
        released,
    } = ctx;

    let bound = Listener::bind(&options).and_then(|listener| {
        let local_addr = listener.local_addr().map_err(NetError::from)?;
        Ok((listener, local_addr))
    });
    let (listener, local_addr) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(Bound { local_addr, udp: None })).is_err() {
        // start() gave up waiting.
        return;
    }

    let on_accept = Arc::new(on_accept);
    let mut stop = shutdown.clone();
    loop {
        let (stream, remote_addr, permit) = tokio::select! {
            _ = stop.draining() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let std_stream = match stream.into_std() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(peer_addr = %remote_addr, error = %e, "Failed to detach accepted socket");
                continue;
            }
        };

        let cx = ConnectionContext {
            info: ConnectionInfo::new(transport, remote_addr, local_addr),
            options: Arc::clone(&options),
            tracker: tracker.clone(),
            shutdown: shutdown.clone(),
        };
        let on_accept = Arc::clone(&on_accept);
        group.next().spawn(async move {
            let _permit = permit;
            let stream = match TcpStream::from_std(std_stream) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to register socket on event loop");
                    return;
                }
            };
            configure_stream(&stream, &cx.options);
            let _guard = cx.tracker.track(cx.info.clone());
            on_accept(stream, cx).await;
        });
    }

    drop(listener);
    tracing::info!(address = %local_addr, "Listener closed");
    let _ = released.send(());
}

async fn run_connection(stream: TcpStream, cx: ConnectionContext, handler: ConnectionHandler) {
    let pipeline = cx.pipeline();
    let (reader, writer) = stream.into_split();
    let (bridge, producer) = bridge::channel();
    let status = Arc::new(ConnectionStatus::new());

    let outbound = Outbound::spawn(
        TcpSink(writer),
        bridge.state(),
        pipeline.clone(),
        Arc::clone(&status),
    );
    tokio::spawn(read_loop(
        reader,
        producer,
        pipeline,
        cx.options.idle_timeout(),
        Arc::clone(&status),
    ));

    let connection = Connection::new(
        cx.info.clone(),
        bridge.clone(),
        outbound.clone(),
        Arc::clone(&status),
        cx.options.prefetch,
    );

    let mut shutdown = cx.shutdown;
    let outcome = tokio::select! {
        outcome = handler(connection) => outcome,
        _ = shutdown.forced() => Err(NetError::NotRunning("server shut down")),
    };
    match outcome {
        Ok(()) => tracing::debug!(connection_id = %cx.info.id, "Handler completed"),
        Err(e) if e.is_remote_closed() => {
            tracing::debug!(connection_id = %cx.info.id, "Peer went away")
        }
        Err(e) => tracing::warn!(connection_id = %cx.info.id, error = %e, "Handler failed"),
    }

    bridge.abandon();
    if let Err(e) = outbound.close().await {
        tracing::debug!(connection_id = %cx.info.id, error = %e, "Close failed");
    }
    status.mark_closed();
}

/// Demand-gated read loop feeding a bridge.
///
/// EOF completes the bridge; a read error (including the idle timeout)
/// becomes its terminal error.
pub(crate) async fn read_loop<R>(
    mut reader: R,
    producer: BridgeProducer<Bytes>,
    pipeline: Pipeline,
    idle_timeout: Option<Duration>,
    status: Arc<ConnectionStatus>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        if producer.ready().await == Readiness::Closed {
            return;
        }

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let read = tokio::select! {
            read = read_with_timeout(&mut reader, &mut buf, idle_timeout) => read,
            _ = producer.closed() => return,
        };

        match read {
            Ok(0) => {
                tracing::trace!("Peer closed its write side");
                producer.complete();
                return;
            }
            Ok(_) => {
                // A cancel during the read parks the chunk until the next consumer.
                if let Err(e) = producer.deliver(pipeline.inbound(buf.freeze())).await {
                    tracing::debug!(error = %e, "Dropping inbound chunk");
                    return;
                }
            }
            Err(e) => {
                status.mark_closing();
                producer.error(e.into());
                return;
            }
        }
    }
}

async fn read_with_timeout<R>(reader: &mut R, buf: &mut BytesMut, idle: Option<Duration>) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match idle {
        None => reader.read_buf(buf).await,
        Some(limit) => tokio::time::timeout(limit, reader.read_buf(buf))
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "read idle timeout"))),
    }
}

/// Write half of an accepted TCP socket.
#[derive(Debug)]
pub(crate) struct TcpSink(pub(crate) OwnedWriteHalf);

impl WriteSink for TcpSink {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.0.write_all(&chunk).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        AsyncWriteExt::flush(&mut self.0).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(&mut self.0).await
    }
}
