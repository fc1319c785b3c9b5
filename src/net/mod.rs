//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits, socket options)
//!     → event_loop.rs (round-robin hand-off to a loop thread)
//!     → connection.rs (identity, state, tracking for graceful shutdown)
//!     → pipeline.rs (per-connection stages built by the setup callback)
//!     → transport / HTTP layer
//!
//! UDP datagrams
//!     → udp.rs (bind, per-peer sink, multicast membership)
//!
//! Connection States:
//!     Open → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - A connection's reads and writes stay on one loop thread

pub mod connection;
pub mod event_loop;
pub mod listener;
pub mod pipeline;
pub mod udp;
