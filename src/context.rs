//! Shared services for one server instance.
//!
//! Everything that used to be process-global (handle table, configuration
//! store, certificate store, credential checks) lives here, behind an
//! `Arc`, so each instance and each test gets its own set.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::config::schema::HostConfig;
use crate::config::{ConfigStore, SslBinding};
use crate::handles::HandleTable;
use crate::net::tls::{
    accept_any_client_certificate, local_host_name, CertificateStore, ClientCertCheck, PemDirectoryStore,
    ServerConfigCache, TlsAcceptor,
};
use crate::security::{CredentialProvider, DenyAll, LocalAccounts, LogonThrottle, SecurityProvider};

/// Listener-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub ipv4: Option<IpAddr>,
    pub ipv6: Option<IpAddr>,
    pub server_header: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ipv4: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            ipv6: Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            server_header: crate::DEFAULT_SERVER_HEADER.to_string(),
        }
    }
}

impl ServerSettings {
    /// Settings from the `[listener]` table. Addresses were validated on load.
    pub fn from_config(config: &HostConfig) -> Self {
        let parse = |addr: &Option<String>| addr.as_deref().and_then(|a| a.parse().ok());
        Self {
            ipv4: parse(&config.listener.ipv4_address),
            ipv6: parse(&config.listener.ipv6_address),
            server_header: config.listener.server_header.clone(),
        }
    }

    /// Loopback IPv4 only.
    pub fn loopback() -> Self {
        Self {
            ipv4: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ipv6: None,
            ..Self::default()
        }
    }
}

pub struct Services {
    pub handles: HandleTable,
    pub config_store: Arc<dyn ConfigStore>,
    pub certificates: Arc<dyn CertificateStore>,
    pub tls_configs: Arc<ServerConfigCache>,
    pub client_cert_check: ClientCertCheck,
    pub credentials: Arc<dyn CredentialProvider>,
    pub security: Arc<dyn SecurityProvider>,
    pub logon_throttle: LogonThrottle,
    pub settings: ServerSettings,
}

impl Services {
    pub fn new(config_store: Arc<dyn ConfigStore>) -> Self {
        Self {
            handles: HandleTable::new(),
            config_store,
            certificates: Arc::new(PemDirectoryStore::new("certs")),
            tls_configs: Arc::new(ServerConfigCache::new()),
            client_cert_check: accept_any_client_certificate(),
            credentials: Arc::new(LocalAccounts::new()),
            security: Arc::new(DenyAll),
            logon_throttle: LogonThrottle::default(),
            settings: ServerSettings::default(),
        }
    }

    pub fn with_certificates(mut self, store: Arc<dyn CertificateStore>) -> Self {
        self.certificates = store;
        self
    }

    pub fn with_client_cert_check(mut self, check: ClientCertCheck) -> Self {
        self.client_cert_check = check;
        self
    }

    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = provider;
        self
    }

    pub fn with_security_provider(mut self, provider: Arc<dyn SecurityProvider>) -> Self {
        self.security = provider;
        self
    }

    pub fn with_logon_throttle(mut self, throttle: LogonThrottle) -> Self {
        self.logon_throttle = throttle;
        self
    }

    pub fn with_settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Acceptor for connections on a port bound to `binding`.
    pub fn tls_acceptor(&self, binding: SslBinding) -> TlsAcceptor {
        TlsAcceptor {
            binding,
            certificates: Arc::clone(&self.certificates),
            configs: Arc::clone(&self.tls_configs),
            client_cert_check: Arc::clone(&self.client_cert_check),
            local_name: local_host_name(),
        }
    }
}
