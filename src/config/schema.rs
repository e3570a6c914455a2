//! Configuration schema definitions.
//!
//! This module defines the host configuration structure. All types derive
//! Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the host process.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HostConfig {
    /// Log filter and wire dump level.
    pub logging: LoggingConfig,

    /// Addresses listeners bind to.
    pub listener: ListenerConfig,

    /// Connection, endpoint and queue quotas.
    pub limits: LimitsConfig,

    /// Default timeouts inherited by every URL group.
    pub timeouts: TimeoutConfig,

    /// Certificate store location.
    pub tls: TlsConfig,

    /// Local accounts and failed-logon throttling.
    pub auth: AuthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// URL ACL and certificate binding store.
    pub registry: RegistryConfig,

    /// Request queue used by the host binary.
    pub queue: QueueConfig,

    /// Prefixes the host binary registers at startup.
    pub prefixes: Vec<PrefixConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub level: String,

    /// Session logging level: 0 off, 1 errors, 2 info, 3 hex dumps.
    pub hex_dump_level: u8,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "httpsys=info".to_string(),
            hex_dump_level: 0,
        }
    }
}

/// Listener bind addresses, one per address family.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// IPv4 address, `None` to skip the family.
    pub ipv4_address: Option<String>,

    /// IPv6 address, `None` to skip the family.
    pub ipv6_address: Option<String>,

    /// Value of the `Server` header added to responses.
    pub server_header: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            ipv4_address: Some("0.0.0.0".to_string()),
            ipv6_address: Some("::".to_string()),
            server_header: crate::DEFAULT_SERVER_HEADER.to_string(),
        }
    }
}

/// Quotas. Zero means unlimited.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: u32,
    pub max_endpoints: u32,
    pub queue_length: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            max_endpoints: 0,
            queue_length: crate::queue::DEFAULT_QUEUE_LENGTH,
        }
    }
}

/// Timeout defaults in seconds, rate in bytes per second.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub entity_body_secs: u32,
    pub drain_entity_body_secs: u32,
    pub request_queue_secs: u32,
    pub idle_connection_secs: u32,
    pub header_wait_secs: u32,
    pub min_send_rate: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            entity_body_secs: 120,
            drain_entity_body_secs: 120,
            request_queue_secs: 120,
            idle_connection_secs: 120,
            header_wait_secs: 120,
            min_send_rate: 150,
        }
    }
}

/// Certificate store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Directory holding one subdirectory of PEM files per store name.
    pub certificate_root: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            certificate_root: "certs".to_string(),
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Failed Basic logons tolerated per peer address per minute.
    pub max_failed_logons_per_minute: u32,

    /// Accounts accepted by Basic authentication.
    pub accounts: Vec<AccountConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_failed_logons_per_minute: 10,
            accounts: Vec::new(),
        }
    }
}

/// A local account.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Prometheus scrape address; disabled when absent.
    pub metrics_address: Option<String>,
}

/// Registry file location.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: Option<String>,

    /// Reload the registry when the file changes.
    pub watch: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: None,
            watch: true,
        }
    }
}

/// Request queue configuration for the host binary.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct QueueConfig {
    pub name: Option<String>,
}

/// A prefix registered at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrefixConfig {
    pub url: String,

    /// Context value reported with every request matching this prefix.
    #[serde(default)]
    pub context: u64,
}
