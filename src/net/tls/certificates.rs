//! Server certificate stores.
//!
//! The default store is a directory tree, one subdirectory per store name,
//! each holding PEM files with a certificate chain and its private key:
//!
//! ```text
//! certs/
//!   MY/
//!     localhost.pem      # CERTIFICATE ... PRIVATE KEY
//!     www.example.com.pem
//! ```
//!
//! Certificates are found by the SHA-1 thumbprint of the leaf, or by the
//! file stem, which is treated as the host name it serves.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use sha1::{Digest, Sha1};

use crate::net::tls::TlsError;

/// A loaded certificate chain with its signing key.
#[derive(Debug)]
pub struct ServerCertificate {
    /// Uppercase hex SHA-1 of the leaf certificate.
    pub thumbprint: String,
    /// Host name taken from the file stem, lowercased.
    pub name: String,
    pub certified: Arc<CertifiedKey>,
}

/// Lookup interface for server certificates.
pub trait CertificateStore: Send + Sync {
    fn find_by_thumbprint(&self, store: &str, thumbprint: &str) -> Option<Arc<ServerCertificate>>;

    fn find_by_name(&self, store: &str, name: &str) -> Option<Arc<ServerCertificate>>;
}

/// SHA-1 thumbprint of a DER certificate, uppercase hex.
pub fn thumbprint(der: &[u8]) -> String {
    Sha1::digest(der).iter().map(|b| format!("{b:02X}")).collect()
}

/// Directory of PEM files per store name. Each store is read once.
pub struct PemDirectoryStore {
    root: PathBuf,
    loaded: DashMap<String, Arc<Vec<Arc<ServerCertificate>>>>,
}

impl PemDirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loaded: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Forget loaded stores so the next lookup reads the disk again.
    pub fn reload(&self) {
        self.loaded.clear();
    }

    fn store(&self, name: &str) -> Arc<Vec<Arc<ServerCertificate>>> {
        let key = name.to_ascii_uppercase();
        if let Some(found) = self.loaded.get(&key) {
            return Arc::clone(found.value());
        }
        let certificates = Arc::new(self.read_store(name));
        self.loaded.insert(key, Arc::clone(&certificates));
        certificates
    }

    fn read_store(&self, name: &str) -> Vec<Arc<ServerCertificate>> {
        let dir = self.root.join(name);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(store = %dir.display(), error = %e, "Certificate store not readable");
                return Vec::new();
            }
        };

        let mut certificates = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            match load_pem_file(&path) {
                Ok(cert) => {
                    tracing::debug!(path = %path.display(), thumbprint = %cert.thumbprint, "Certificate loaded");
                    certificates.push(Arc::new(cert));
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping certificate file"),
            }
        }
        certificates
    }
}

impl CertificateStore for PemDirectoryStore {
    fn find_by_thumbprint(&self, store: &str, thumbprint: &str) -> Option<Arc<ServerCertificate>> {
        self.store(store)
            .iter()
            .find(|c| c.thumbprint.eq_ignore_ascii_case(thumbprint))
            .cloned()
    }

    fn find_by_name(&self, store: &str, name: &str) -> Option<Arc<ServerCertificate>> {
        self.store(store)
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .cloned()
    }
}

/// Read a PEM file holding a certificate chain and a private key.
pub fn load_pem_file(path: &Path) -> Result<ServerCertificate, TlsError> {
    let data = std::fs::read(path).map_err(|e| TlsError::Material(format!("{}: {e}", path.display())))?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_pem(&data, name)
}

/// Build a certificate from PEM bytes.
pub fn parse_pem(data: &[u8], name: String) -> Result<ServerCertificate, TlsError> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &data[..])
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::Material(e.to_string()))?;
    let leaf = chain
        .first()
        .ok_or_else(|| TlsError::Material("no certificate in PEM data".into()))?;
    let thumbprint = thumbprint(leaf.as_ref());

    let key = rustls_pemfile::private_key(&mut &data[..])
        .map_err(|e| TlsError::Material(e.to_string()))?
        .ok_or_else(|| TlsError::Material("no private key in PEM data".into()))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;

    Ok(ServerCertificate {
        thumbprint,
        name,
        certified: Arc::new(CertifiedKey::new(chain, signing_key)),
    })
}
