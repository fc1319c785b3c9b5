//! HTTP and WebSocket on top of the transport layer.
//!
//! # Data Flow
//! ```text
//! TCP connection (accept loop, event loop affinity)
//!     → server.rs (hyper http1 codec, upgrades enabled)
//!     → routing (every matching route, registration order)
//!     → channel.rs (request head + body bridge, mutable response head)
//!     → handlers run one after another on the same channel
//!     → body.rs (outbound writer → hyper response body)
//!
//! Upgrade request
//!     → websocket.rs (handshake, 101, frame session over the upgraded socket)
//! multipart/* body
//!     → multipart.rs (lazy part sequence over the body bridge)
//! ```

pub mod body;
pub mod channel;
pub mod client;
pub mod files;
pub mod multipart;
pub mod server;
pub mod websocket;

pub use body::ResponseBody;
pub use channel::{HttpChannel, X_REQUEST_ID};
pub use client::{ClientResponse, HttpClient};
pub use multipart::{Multipart, Part};
pub use server::{HttpHandler, HttpServer};
pub use websocket::WebSocketSession;
