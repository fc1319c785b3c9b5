//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (connection ids, request ids, addresses as fields)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! The binary installs:
//!     → logging.rs (EnvFilter + fmt subscriber)
//!     → Prometheus scrape endpoint
//! ```

pub mod logging;
pub mod metrics;
