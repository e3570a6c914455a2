//! Read-only key/value configuration store.
//!
//! The store answers two questions for the core: is a URL prefix reserved
//! for this host (URL ACL), and which certificate is bound to a secure
//! port. The default implementation is a TOML file:
//!
//! ```text
//! url_acl = ["http://+:8080/", "https://+:8443/"]
//!
//! [[ssl_binding]]
//! address = "0.0.0.0:8443"
//! cert_hash = "3F1A..."
//! cert_store = "MY"
//! default_flags = 2     # 0x2 = negotiate client certificate
//! ```
//!
//! The current contents sit behind an `ArcSwap` so the watcher can
//! replace them while lookups are in flight.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::config::loader::ConfigError;

/// Flag bit in `default_flags` requesting a client certificate.
pub const SSL_FLAG_NEGOTIATE_CLIENT_CERT: u32 = 0x2;

/// Read interface consumed by URL groups.
pub trait ConfigStore: Send + Sync {
    /// True if `url` or an ancestor prefix at a segment boundary is reserved.
    fn is_url_registered(&self, url: &str) -> bool;

    /// Certificate binding for a secure port, if any.
    fn ssl_binding(&self, port: u16) -> Option<SslBinding>;
}

/// Certificate binding for one `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SslBinding {
    pub address: String,
    pub cert_hash: String,
    #[serde(default = "default_cert_store")]
    pub cert_store: String,
    #[serde(default)]
    pub default_flags: u32,
}

fn default_cert_store() -> String {
    "MY".to_string()
}

impl SslBinding {
    pub fn client_certificate_required(&self) -> bool {
        self.default_flags & SSL_FLAG_NEGOTIATE_CLIENT_CERT != 0
    }

    /// Thumbprint as uppercase hex without separators.
    pub fn thumbprint(&self) -> String {
        normalize_thumbprint(&self.cert_hash)
    }

    fn port(&self) -> Option<u16> {
        let (host, port) = self.address.rsplit_once(':')?;
        let wildcard = matches!(host, "0.0.0.0" | "[::]" | "*" | "+");
        if wildcard {
            port.parse().ok()
        } else {
            None
        }
    }
}

/// Strip separators and uppercase a hex thumbprint.
pub fn normalize_thumbprint(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Parsed contents of the registry file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Registry {
    pub url_acl: Vec<String>,
    pub ssl_binding: Vec<SslBinding>,
}

impl Registry {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    pub fn with_acl<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            url_acl: urls.into_iter().map(Into::into).collect(),
            ssl_binding: Vec::new(),
        }
    }

    pub fn add_binding(&mut self, binding: SslBinding) {
        self.ssl_binding.push(binding);
    }

    /// Walk up the prefix one segment at a time looking for a reservation.
    pub fn allows(&self, url: &str) -> bool {
        let floor = url.find("://").map(|p| p + 3).unwrap_or(0);
        let mut candidate = url;
        loop {
            if self
                .url_acl
                .iter()
                .any(|acl| acl.eq_ignore_ascii_case(candidate))
            {
                return true;
            }
            let trimmed = candidate.strip_suffix('/').unwrap_or(candidate);
            match trimmed.rfind('/') {
                Some(pos) if pos + 1 > floor => candidate = &trimmed[..=pos],
                _ => return false,
            }
        }
    }

    pub fn binding_for(&self, port: u16) -> Option<&SslBinding> {
        self.ssl_binding.iter().find(|b| b.port() == Some(port))
    }
}

/// Registry file held behind an atomically swappable pointer.
pub struct RegistryStore {
    current: ArcSwap<Registry>,
    path: Option<PathBuf>,
}

impl RegistryStore {
    pub fn new(registry: Registry) -> Self {
        Self {
            current: ArcSwap::from_pointee(registry),
            path: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let registry = load_registry(path)?;
        tracing::info!(
            path = %path.display(),
            url_acl = registry.url_acl.len(),
            ssl_bindings = registry.ssl_binding.len(),
            "Registry loaded"
        );
        Ok(Self {
            current: ArcSwap::from_pointee(registry),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn replace(&self, registry: Registry) {
        self.current.store(Arc::new(registry));
    }

    pub fn snapshot(&self) -> Arc<Registry> {
        self.current.load_full()
    }
}

impl ConfigStore for RegistryStore {
    fn is_url_registered(&self, url: &str) -> bool {
        self.current.load().allows(url)
    }

    fn ssl_binding(&self, port: u16) -> Option<SslBinding> {
        self.current.load().binding_for(port).cloned()
    }
}

pub fn load_registry(path: &Path) -> Result<Registry, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    Registry::from_toml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acl_walks_up_to_reserved_ancestor() {
        let registry = Registry::with_acl(["http://+:8080/"]);
        assert!(registry.allows("http://+:8080/"));
        assert!(registry.allows("http://+:8080/app/"));
        assert!(registry.allows("http://+:8080/app/deep/"));
        assert!(!registry.allows("http://+:9090/app/"));
        assert!(!registry.allows("https://+:8080/app/"));
    }

    #[test]
    fn acl_terminates_on_unreserved_url() {
        let registry = Registry::default();
        assert!(!registry.allows("http://localhost:80/a/b/c/"));
        assert!(!registry.allows("garbage"));
    }

    #[test]
    fn binding_parsed_from_toml() {
        let registry = Registry::from_toml(
            r#"
            url_acl = ["https://+:8443/"]

            [[ssl_binding]]
            address = "0.0.0.0:8443"
            cert_hash = "ab:cd:ef:01"
            default_flags = 2
            "#,
        )
        .unwrap();

        let binding = registry.binding_for(8443).unwrap();
        assert_eq!(binding.thumbprint(), "ABCDEF01");
        assert_eq!(binding.cert_store, "MY");
        assert!(binding.client_certificate_required());
        assert!(registry.binding_for(443).is_none());
    }

    #[test]
    fn store_swaps_contents() {
        let store = RegistryStore::new(Registry::default());
        assert!(!store.is_url_registered("http://+:80/"));
        store.replace(Registry::with_acl(["http://+:80/"]));
        assert!(store.is_url_registered("http://+:80/x/"));
    }
}
