//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check the trusted proxy list before it reaches the sanitizer
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use axum::http::uri::Authority;

use crate::config::schema::ProxyConfig;
use crate::security::TrustedProxies;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
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

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if SocketAddr::from_str(&config.listener.bind_address).is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if Authority::from_str(&config.origin.address).is_err() {
        errors.push(ValidationError::new(
            "origin.address",
            format!("'{}' is not a host:port authority", config.origin.address),
        ));
    }
    if config.origin.max_body_size == 0 {
        errors.push(ValidationError::new("origin.max_body_size", "must be greater than 0"));
    }

    let cache = &config.cache;
    if cache.default_ttl < 0 {
        errors.push(ValidationError::new("cache.default_ttl", "must not be negative"));
    }
    if cache.stale_while_revalidate < 0 {
        errors.push(ValidationError::new("cache.stale_while_revalidate", "must not be negative"));
    }
    if cache.stale_if_error < 0 {
        errors.push(ValidationError::new("cache.stale_if_error", "must not be negative"));
    }
    if cache.max_fragment_depth == 0 {
        errors.push(ValidationError::new("cache.max_fragment_depth", "must be at least 1"));
    }

    if config.store.root.trim().is_empty() {
        errors.push(ValidationError::new("store.root", "must not be empty"));
    }
    if config.store.lock_lease_secs == Some(0) {
        errors.push(ValidationError::new("store.lock_lease_secs", "must be greater than 0 when set"));
    }

    if let Err(e) = TrustedProxies::parse(&config.security.trusted_proxies) {
        errors.push(ValidationError::new("security.trusted_proxies", e));
    }
    if config.security.max_body_size == 0 {
        errors.push(ValidationError::new("security.max_body_size", "must be greater than 0"));
    }

    let timeouts = &config.timeouts;
    for (field, value) in [
        ("timeouts.connect_secs", timeouts.connect_secs),
        ("timeouts.request_secs", timeouts.request_secs),
        ("timeouts.idle_secs", timeouts.idle_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.observability.metrics_enabled
        && SocketAddr::from_str(&config.observability.metrics_address).is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if config.admin.enabled {
        if SocketAddr::from_str(&config.admin.bind_address).is_err() {
            errors.push(ValidationError::new(
                "admin.bind_address",
                format!("'{}' is not a socket address", config.admin.bind_address),
            ));
        }
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
