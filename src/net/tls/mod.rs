//! TLS for secure listeners.
//!
//! # Data Flow
//! ```text
//! SecureStream::negotiate()
//!     → client_hello.rs (sniff SNI from the first record, pure parsing)
//!     → TlsAcceptor::session_for() picks a certificate:
//!           binding thumbprint → certificates.rs (CertificateStore)
//!           otherwise SNI name, or the local host name
//!     → session.rs (TlsSession over rustls, cached ServerConfig)
//!     → handshake loop, then the client-certificate predicate
//!     → secure.rs encrypts/decrypts records for the request
//! ```

pub mod certificates;
pub mod client_hello;
pub mod secure;
pub mod session;

use std::sync::Arc;

use thiserror::Error;

use crate::config::SslBinding;

pub use certificates::{CertificateStore, PemDirectoryStore, ServerCertificate};
pub use client_hello::{ClientHello, HelloError, HelloStatus};
pub use secure::SecureStream;
pub use session::{RustlsSession, ServerConfigCache, TlsSession};

/// Predicate over the client's leaf certificate (DER).
pub type ClientCertCheck = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Accept any certificate the client managed to prove possession of.
pub fn accept_any_client_certificate() -> ClientCertCheck {
    Arc::new(|_| true)
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error(transparent)]
    Hello(#[from] HelloError),
    #[error("handshake failed: {0}")]
    Handshake(#[from] rustls::Error),
    #[error("no certificate {thumbprint:?} or {name:?} in store {store}")]
    NoCertificate {
        store: String,
        thumbprint: String,
        name: String,
    },
    #[error("invalid certificate material: {0}")]
    Material(String),
    #[error("client certificate required but not presented")]
    ClientCertificateMissing,
    #[error("client certificate rejected")]
    ClientCertificateRejected,
    #[error("tls session is not established")]
    NotEstablished,
}

/// Negotiated connection parameters, surfaced on received requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslInfo {
    pub protocol: String,
    pub cipher_suite: String,
    pub server_name: Option<String>,
    /// Leaf certificate the client presented, DER encoded.
    pub client_certificate: Option<Vec<u8>>,
}

/// Everything a secure listener needs to accept one connection.
#[derive(Clone)]
pub struct TlsAcceptor {
    pub binding: SslBinding,
    pub certificates: Arc<dyn CertificateStore>,
    pub configs: Arc<ServerConfigCache>,
    pub client_cert_check: ClientCertCheck,
    pub local_name: String,
}

impl TlsAcceptor {
    /// Pick the certificate for this hello and start a session with it.
    pub fn session_for(&self, hello: &ClientHello) -> Result<Box<dyn TlsSession>, TlsError> {
        let name = hello
            .server_name
            .clone()
            .unwrap_or_else(|| self.local_name.clone());
        let store = &self.binding.cert_store;
        let thumbprint = self.binding.thumbprint();

        let certificate = (!thumbprint.is_empty())
            .then(|| self.certificates.find_by_thumbprint(store, &thumbprint))
            .flatten()
            .or_else(|| self.certificates.find_by_name(store, &name))
            .ok_or_else(|| TlsError::NoCertificate {
                store: store.clone(),
                thumbprint: thumbprint.clone(),
                name: name.clone(),
            })?;

        tracing::debug!(
            server_name = %name,
            thumbprint = %certificate.thumbprint,
            client_cert = self.binding.client_certificate_required(),
            "Server certificate selected"
        );
        let config = self
            .configs
            .get_or_build(&certificate, self.binding.client_certificate_required())?;
        let session = RustlsSession::new(config, hello.server_name.clone())?;
        Ok(Box::new(session))
    }

    /// Judge the client certificate once the handshake is done.
    pub fn check_client(&self, leaf: Option<&[u8]>) -> Result<(), TlsError> {
        match leaf {
            None if self.binding.client_certificate_required() => Err(TlsError::ClientCertificateMissing),
            None => Ok(()),
            Some(der) if (self.client_cert_check)(der) => Ok(()),
            Some(_) => Err(TlsError::ClientCertificateRejected),
        }
    }
}

/// DNS name of this host, used when the client sends no SNI.
pub fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .map(|h| h.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acceptor(default_flags: u32, check: ClientCertCheck) -> TlsAcceptor {
        TlsAcceptor {
            binding: SslBinding {
                address: "0.0.0.0:443".into(),
                cert_hash: String::new(),
                cert_store: "MY".into(),
                default_flags,
            },
            certificates: Arc::new(PemDirectoryStore::new("/nonexistent")),
            configs: Arc::new(ServerConfigCache::new()),
            client_cert_check: check,
            local_name: "localhost".into(),
        }
    }

    #[test]
    fn missing_certificate_fails_only_when_required() {
        let optional = acceptor(0, accept_any_client_certificate());
        assert!(optional.check_client(None).is_ok());

        let required = acceptor(0x2, accept_any_client_certificate());
        assert!(matches!(
            required.check_client(None),
            Err(TlsError::ClientCertificateMissing)
        ));
    }

    #[test]
    fn presented_certificate_goes_to_the_predicate() {
        let only_known: ClientCertCheck = Arc::new(|der: &[u8]| der == b"known");
        let required = acceptor(0x2, Arc::clone(&only_known));
        assert!(required.check_client(Some(&b"known"[..])).is_ok());
        assert!(matches!(
            required.check_client(Some(&b"stranger"[..])),
            Err(TlsError::ClientCertificateRejected)
        ));

        // An unrequested certificate is still judged.
        let optional = acceptor(0, only_known);
        assert!(matches!(
            optional.check_client(Some(&b"stranger"[..])),
            Err(TlsError::ClientCertificateRejected)
        ));
    }
}
