//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Start (server.rs):
//!     phase Unstarted → Starting
//!     → acquire loops (owned or external)
//!     → spawn serve task on a loop → bind → report Bound
//!     → phase Started (or back to Unstarted on failure)
//!
//! Shutdown (server.rs + shutdown.rs):
//!     phase ShuttingDown → drain signal (stop accepting, HTTP graceful close)
//!     → wait for connections until the deadline → force signal
//!     → release owned loops → phase Shutdown
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary triggers graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Shutdown is idempotent and a no-op before start
//! - Shutdown has a timeout: forced close after the deadline

pub mod server;
pub mod shutdown;
pub mod signals;
pub mod state;

pub use shutdown::{Shutdown, ShutdownListener};
pub use state::Phase;
