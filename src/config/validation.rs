//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (queue length, timeouts, dump level)
//! - Check that addresses and prefixes parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HostConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::schema::HostConfig;
use crate::queue::MAX_QUEUE_LENGTH;
use crate::session::url::UrlPrefix;

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

pub fn validate_config(config: &HostConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.logging.hex_dump_level > 3 {
        errors.push(ValidationError::new(
            "logging.hex_dump_level",
            "must be between 0 and 3",
        ));
    }

    let listener = &config.listener;
    if listener.ipv4_address.is_none() && listener.ipv6_address.is_none() {
        errors.push(ValidationError::new(
            "listener",
            "at least one address family must be configured",
        ));
    }
    for (field, address) in [
        ("listener.ipv4_address", &listener.ipv4_address),
        ("listener.ipv6_address", &listener.ipv6_address),
    ] {
        if let Some(address) = address {
            if address.parse::<IpAddr>().is_err() {
                errors.push(ValidationError::new(field, format!("'{address}' is not an IP address")));
            }
        }
    }

    let length = config.limits.queue_length;
    if length == 0 || length > MAX_QUEUE_LENGTH {
        errors.push(ValidationError::new(
            "limits.queue_length",
            format!("must be between 1 and {MAX_QUEUE_LENGTH}"),
        ));
    }

    if config.timeouts.min_send_rate == 0 {
        errors.push(ValidationError::new(
            "timeouts.min_send_rate",
            "must be greater than zero",
        ));
    }

    for (i, account) in config.auth.accounts.iter().enumerate() {
        if account.user.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("auth.accounts[{i}].user"),
                "must not be empty",
            ));
        }
    }

    if let Some(address) = &config.observability.metrics_address {
        if address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "observability.metrics_address",
                format!("'{address}' is not a socket address"),
            ));
        }
    }

    for (i, prefix) in config.prefixes.iter().enumerate() {
        if let Err(e) = UrlPrefix::parse(&prefix.url, prefix.context) {
            errors.push(ValidationError::new(format!("prefixes[{i}].url"), e.to_string()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
