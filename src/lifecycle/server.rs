//! Shared server lifecycle: bind handshake, phase tracking, graceful shutdown.
//!
//! # Responsibilities
//! - Acquire event loops (owned or borrowed from the options)
//! - Run the transport's serve task on a loop and wait for its bind result
//! - Drain connections on shutdown, force-close after the deadline
//! - Release owned loops exactly once
//!
//! # Design Decisions
//! - The state mutex is never held across an await
//! - A borrowed event-loop group is never shut down here

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use crate::config::ServerOptions;
use crate::error::{NetError, Result};
use crate::lifecycle::shutdown::{Shutdown, ShutdownListener};
use crate::lifecycle::state::{Phase, ShutdownStep};
use crate::net::connection::{ConnectionTracker, TransportKind};
use crate::net::event_loop::EventLoopGroup;

/// Extra time granted to connections after a forced close.
const FORCE_GRACE: Duration = Duration::from_secs(1);

/// Result of a successful bind, reported by the serve task.
#[derive(Debug)]
pub(crate) struct Bound {
    pub local_addr: SocketAddr,
    pub udp: Option<Arc<UdpSocket>>,
}

/// Everything a serve task needs, handed over when it is spawned.
pub(crate) struct ServeContext {
    pub options: Arc<ServerOptions>,
    pub group: Arc<EventLoopGroup>,
    pub tracker: ConnectionTracker,
    pub shutdown: ShutdownListener,
    /// Bind handshake: exactly one message.
    pub ready: oneshot::Sender<Result<Bound>>,
    /// Sent once the listening resource was dropped.
    pub released: oneshot::Sender<()>,
}

struct Loops {
    group: Arc<EventLoopGroup>,
    owned: bool,
}

struct CoreState {
    phase: Phase,
    local_addr: Option<SocketAddr>,
    shutdown: Option<Shutdown>,
    loops: Option<Loops>,
    released: Option<oneshot::Receiver<()>>,
    udp: Option<Arc<UdpSocket>>,
}

/// Lifecycle shared by the TCP, UDP and HTTP servers.
pub(crate) struct ServerCore {
    transport: TransportKind,
    options: Arc<ServerOptions>,
    tracker: ConnectionTracker,
    state: Mutex<CoreState>,
}

impl ServerCore {
    pub(crate) fn new(transport: TransportKind, options: ServerOptions) -> Self {
        Self {
            transport,
            options: Arc::new(options),
            tracker: ConnectionTracker::new(),
            state: Mutex::new(CoreState {
                phase: Phase::Unstarted,
                local_addr: None,
                shutdown: None,
                loops: None,
                released: None,
                udp: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn options(&self) -> &Arc<ServerOptions> {
        &self.options
    }

    pub(crate) fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub(crate) fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    pub(crate) fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.lock().udp.clone()
    }

    fn acquire_loops(&self) -> Result<Loops> {
        if let Some(group) = &self.options.event_loops {
            return Ok(Loops {
                group: Arc::clone(group),
                owned: false,
            });
        }
        // Datagram servers are served from a single loop.
        let threads = match self.transport {
            TransportKind::Udp => 1,
            _ => self.options.io_threads,
        };
        let group = EventLoopGroup::new(format!("{}-io", self.transport), threads)?;
        Ok(Loops { group, owned: true })
    }

    /// Bind and begin serving. Resolves with the bound address once the
    /// serve task reported success.
    pub(crate) async fn start<F, Fut>(&self, serve: F) -> Result<SocketAddr>
    where
        F: FnOnce(ServeContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start_inner(serve, None).await
    }

    /// Like [`start`](Self::start) but fails with `StartTimeout` when the
    /// bind handshake does not arrive within `timeout`.
    pub(crate) async fn start_within<F, Fut>(&self, serve: F, timeout: Duration) -> Result<SocketAddr>
    where
        F: FnOnce(ServeContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start_inner(serve, Some(timeout)).await
    }

    async fn start_inner<F, Fut>(&self, serve: F, timeout: Option<Duration>) -> Result<SocketAddr>
    where
        F: FnOnce(ServeContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.lock();
            state.phase = state.phase.begin_start()?;
        }

        let loops = match self.acquire_loops() {
            Ok(loops) => loops,
            Err(e) => {
                self.lock().phase = Phase::Unstarted;
                return Err(e);
            }
        };

        let shutdown = Shutdown::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (released_tx, released_rx) = oneshot::channel();
        let ctx = ServeContext {
            options: Arc::clone(&self.options),
            group: Arc::clone(&loops.group),
            tracker: self.tracker.clone(),
            shutdown: shutdown.subscribe(),
            ready: ready_tx,
            released: released_tx,
        };
        loops.group.next().spawn(serve(ctx));

        let outcome = match timeout {
            None => ready_rx.await,
            Some(limit) => match tokio::time::timeout(limit, ready_rx).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(NetError::StartTimeout(limit))),
            },
        };

        match outcome {
            Ok(Ok(bound)) => {
                let mut state = self.lock();
                state.phase = Phase::Started;
                state.local_addr = Some(bound.local_addr);
                state.shutdown = Some(shutdown);
                state.loops = Some(loops);
                state.released = Some(released_rx);
                state.udp = bound.udp;
                tracing::info!(
                    transport = %self.transport,
                    address = %bound.local_addr,
                    "Server started"
                );
                Ok(bound.local_addr)
            }
            failed => {
                let err = match failed {
                    Ok(Err(e)) => e,
                    _ => NetError::NotRunning("serve task exited before binding"),
                };
                shutdown.force();
                if loops.owned {
                    loops.group.shutdown().await;
                }
                self.lock().phase = Phase::Unstarted;
                tracing::warn!(transport = %self.transport, error = %err, "Server failed to start");
                Err(err)
            }
        }
    }

    /// Stop accepting, drain, force-close after the deadline, release owned
    /// loops. Safe to call in any phase and any number of times.
    ///
    /// Must not be awaited from a task running on the server's own loops.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let (shutdown, released, loops) = {
            let mut state = self.lock();
            if state.phase.shutdown_step() == ShutdownStep::Noop {
                return Ok(());
            }
            state.phase = Phase::ShuttingDown;
            (state.shutdown.take(), state.released.take(), state.loops.take())
        };
        tracing::info!(transport = %self.transport, "Server shutting down");

        if let Some(shutdown) = &shutdown {
            shutdown.drain();
        }
        if let Some(released) = released {
            let _ = released.await;
        }

        let deadline = self.options.shutdown_timeout();
        if !self.tracker.wait_for_drain(deadline).await {
            tracing::warn!(
                transport = %self.transport,
                remaining = self.tracker.active_count(),
                "Drain deadline passed, forcing close"
            );
            if let Some(shutdown) = &shutdown {
                shutdown.force();
            }
            self.tracker.wait_for_drain(FORCE_GRACE).await;
        }
        if let Some(shutdown) = &shutdown {
            shutdown.force();
        }

        if let Some(loops) = loops {
            if loops.owned {
                loops.group.shutdown().await;
            }
        }

        {
            let mut state = self.lock();
            state.phase = Phase::Shutdown;
            state.udp = None;
        }
        tracing::info!(transport = %self.transport, "Server shut down");
        Ok(())
    }
}

impl Drop for ServerCore {
    fn drop(&mut self) {
        let state = self.lock();
        if let Some(shutdown) = &state.shutdown {
            shutdown.force();
        }
        if let Some(loops) = &state.loops {
            if loops.owned {
                loops.group.signal_stop();
            }
        }
    }
}
