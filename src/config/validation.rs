//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (interval > 0, usable ports)
//! - Detect settings that cannot work together
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: DevServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{ConcurrencyMode, DevServerConfig, TlsSource};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a configuration for semantic errors.
pub fn validate_config(config: &DevServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.host.trim().is_empty() {
        errors.push(ValidationError::new("server.host", "must not be empty"));
    }

    // Every respawned worker would pick a different ephemeral port.
    if config.reloader.enabled && config.server.port == 0 {
        errors.push(ValidationError::new(
            "server.port",
            "a fixed port is required when the reloader is enabled",
        ));
    }

    if config.reloader.interval_ms == 0 {
        errors.push(ValidationError::new(
            "reloader.interval_ms",
            "must be greater than zero",
        ));
    }

    if let TlsSource::Files {
        cert_path,
        key_path,
    } = &config.server.tls
    {
        if cert_path.as_os_str().is_empty() {
            errors.push(ValidationError::new("server.tls.cert_path", "must be set"));
        }
        if key_path.as_os_str().is_empty() {
            errors.push(ValidationError::new("server.tls.key_path", "must be set"));
        }
    }

    if cfg!(not(unix)) && config.server.concurrency == ConcurrencyMode::Forked {
        errors.push(ValidationError::new(
            "server.concurrency",
            "forked mode is only available on unix",
        ));
    }

    if let Some(addr) = &config.observability.metrics_address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "observability.metrics_address",
                format!("'{}' is not a socket address", addr),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
