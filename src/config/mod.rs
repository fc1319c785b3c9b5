//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → AppConfig (validated, immutable)
//!     → ServerOptions snapshot handed to each server at construction
//! ```
//!
//! # Design Decisions
//! - Options are read once at start; later changes need a new server
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Runtime-only collaborators (event loops, setup callback) are not serialized

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{AppConfig, MountConfig, MulticastInterface, ObservabilityConfig, ProtocolFamily, ServerOptions};
