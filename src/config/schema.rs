//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the caching proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::surrogate::Surrogate;

/// Root configuration for the caching reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Origin server the cache sits in front of.
    pub origin: OriginConfig,

    /// Cache coordinator options.
    pub cache: CacheConfig,

    /// On-disk store settings.
    pub store: StoreConfig,

    /// Surrogate dialects processed by the cache.
    pub surrogate: SurrogateConfig,

    /// Trust boundary and request limits.
    pub security: SecurityConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Origin server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Origin address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Largest origin response body that will be buffered, in bytes.
    pub max_body_size: usize,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3000".to_string(),
            max_body_size: 64 * 1024 * 1024,
        }
    }
}

/// Cache coordinator options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Surface store errors and emit the `X-Cache-Trace` header.
    pub debug: bool,

    /// Shared freshness (seconds) given to responses without any; 0 disables.
    pub default_ttl: i64,

    /// Request headers that make a request private.
    pub private_headers: Vec<String>,

    /// Let clients force a reload with `Cache-Control: no-cache`.
    pub allow_reload: bool,

    /// Let clients force revalidation with `Cache-Control: max-age`.
    pub allow_revalidate: bool,

    /// Default window (seconds) for serving stale content while another request revalidates.
    pub stale_while_revalidate: i64,

    /// Default window (seconds) for serving stale content when the origin fails.
    pub stale_if_error: i64,

    /// How long a request waits for another request's revalidation, in milliseconds.
    pub lock_wait_ms: u64,

    /// Deepest allowed chain of nested fragments.
    pub max_fragment_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            debug: false,
            default_ttl: 0,
            private_headers: vec!["Authorization".to_string(), "Cookie".to_string()],
            allow_reload: false,
            allow_revalidate: false,
            stale_while_revalidate: 2,
            stale_if_error: 60,
            lock_wait_ms: 5000,
            max_fragment_depth: 8,
        }
    }
}

/// On-disk store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory holding `md/` and `en/`.
    pub root: String,

    /// Seconds after which another process may take over an abandoned lock.
    pub lock_lease_secs: Option<u64>,

    /// Prune the store after this many writes; 0 disables automatic pruning.
    pub prune_threshold: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: "./cache".to_string(),
            lock_lease_secs: None,
            prune_threshold: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SurrogateConfig {
    /// Dialects advertised to and processed for the origin ("esi", "ssi").
    pub dialects: Vec<Surrogate>,
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self {
            dialects: vec![Surrogate::Esi],
        }
    }
}

/// Security hardening configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Proxies whose forwarding headers are believed (addresses or CIDR ranges).
    pub trusted_proxies: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            trusted_proxies: Vec::new(),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,

    /// Idle connection timeout in seconds.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
            idle_secs: 60,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
