//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (method, path)
//!     → router.rs (scan routes in registration order)
//!     → predicate.rs (method + template match, parameter capture)
//!     → Selection: every matching handler + merged params
//! ```
//!
//! # Design Decisions
//! - Routes registered before start, immutable at runtime
//! - Deterministic: same input always yields the same ordered handler list
//! - Multiplexed: all matching routes run, not just the first

pub mod predicate;
pub mod router;

pub use predicate::{HttpPredicate, Params, PathTemplate, Predicate, PrefixPredicate};
pub use router::{RouteTable, Selection};
