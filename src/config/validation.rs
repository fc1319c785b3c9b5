//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (threads > 0, prefetch > 0, timeouts > 0)
//! - Check addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Pure function: AppConfig → Result<(), Vec<ValidationError>>

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{AppConfig, ServerOptions};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate the whole application config.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_server(&config.server, &mut errors);

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }

    for (i, mount) in config.mounts.iter().enumerate() {
        if !mount.prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("mounts[{i}].prefix"),
                "must start with '/'",
            ));
        }
        if mount.root.is_empty() {
            errors.push(ValidationError::new(format!("mounts[{i}].root"), "must not be empty"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate server options alone.
pub fn validate_options(options: &ServerOptions) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_server(options, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_server(options: &ServerOptions, errors: &mut Vec<ValidationError>) {
    if options.socket_addr().is_err() {
        errors.push(ValidationError::new("server.bind_address", "not a socket address"));
    }
    if options.io_threads == 0 {
        errors.push(ValidationError::new("server.io_threads", "must be greater than 0"));
    }
    if options.prefetch.get() == 0 {
        errors.push(ValidationError::new("server.prefetch", "must be greater than 0"));
    }
    if options.max_connections == 0 {
        errors.push(ValidationError::new("server.max_connections", "must be greater than 0"));
    }
    if options.shutdown_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "server.shutdown_timeout_secs",
            "must be greater than 0",
        ));
    }
    if options.connect_timeout_ms == 0 {
        errors.push(ValidationError::new("server.connect_timeout_ms", "must be greater than 0"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::MountConfig;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = AppConfig::default();
        config.server.bind_address = "nope".into();
        config.server.io_threads = 0;
        config.mounts.push(MountConfig {
            prefix: "static".into(),
            root: String::new(),
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "server.bind_address",
                "server.io_threads",
                "mounts[0].prefix",
                "mounts[0].root"
            ]
        );
    }
}
