//! Reactive network servers: TCP, UDP and HTTP/WebSocket over Tokio event
//! loops, exposing connections as demand-driven streams.

pub mod config;
pub mod error;
pub mod flow;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod transport;

pub use config::{AppConfig, ServerOptions};
pub use error::{NetError, Result};
pub use flow::{Demand, Inbound, Prefetch};
pub use http::{HttpChannel, HttpClient, HttpServer, WebSocketSession};
pub use lifecycle::{Phase, Shutdown};
pub use net::connection::Connection;
pub use net::event_loop::EventLoopGroup;
pub use transport::{TcpServer, UdpServer};
