//! Raw transports: TCP and UDP servers handing `Connection`s to handlers.
//!
//! # Data Flow
//! ```text
//! TcpServer::start(handler)
//!     → accept loop on one event loop
//!     → each accepted socket moved to the next loop (round robin)
//!     → reader task (demand-gated) + writer task + handler future
//!     → handler returns → inbound abandoned, outbound flushed and closed
//!
//! UdpServer::start(handler)
//!     → one socket on one loop
//!     → first datagram from a peer opens that peer's Connection
//!     → later datagrams wait for that peer's demand
//! ```

pub mod tcp;
pub mod udp;

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::config::ServerOptions;
use crate::error::Result;
use crate::lifecycle::shutdown::ShutdownListener;
use crate::net::connection::{Connection, ConnectionInfo, ConnectionTracker};
use crate::net::pipeline::{self, Pipeline};

pub use tcp::TcpServer;
pub use udp::UdpServer;

/// Type-erased connection handler.
pub type ConnectionHandler = Arc<dyn Fn(Connection) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Erase a handler closure.
pub(crate) fn boxed_handler<F, Fut>(handler: F) -> ConnectionHandler
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |conn| -> BoxFuture<'static, Result<()>> { Box::pin(handler(conn)) })
}

/// Per-connection view of the server, handed to connection tasks.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub info: ConnectionInfo,
    pub options: Arc<ServerOptions>,
    pub tracker: ConnectionTracker,
    pub shutdown: ShutdownListener,
}

impl ConnectionContext {
    pub(crate) fn pipeline(&self) -> Pipeline {
        pipeline::for_connection(
            self.options.wire_logging,
            self.options.on_connection.as_ref(),
            &self.info,
        )
    }
}
