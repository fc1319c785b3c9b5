//! Flow control between sockets and handlers.
//!
//! # Data Flow
//! ```text
//! socket readable
//!     → I/O task waits on BridgeProducer::ready()   (reads paused at zero demand)
//!     → pipeline inbound stages
//!     → BridgeProducer::emit()                        (consumes one unit of demand)
//!     → Inbound stream polled by the handler          (request(n) grows demand)
//!
//! handler send()
//!     → Outbound queue → writer task
//!     → pipeline outbound stages → socket write (+ flush when queue drains)
//! ```

pub mod bridge;
pub mod outbound;

pub use bridge::{Demand, DemandBridge, Inbound, Prefetch, Readiness};
pub use outbound::Outbound;
