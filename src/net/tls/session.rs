//! TLS session engine.
//!
//! [`TlsSession`] is the seam between the socket stream and the TLS
//! library: bytes from the wire go in through `feed`, bytes for the wire
//! come out through `write_outgoing`, plaintext moves through `encrypt`
//! and `read_plaintext`. [`RustlsSession`] implements it with a rustls
//! `ServerConnection`.

use std::io::{Read, Write};
use std::sync::Arc;

use dashmap::DashMap;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello as RustlsHello, ResolvesServerCert, ServerConfig, ServerConnection};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};

use crate::net::tls::certificates::ServerCertificate;
use crate::net::tls::{SslInfo, TlsError};

/// Result of pulling plaintext out of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlainRead {
    Data(usize),
    /// No plaintext until more records are fed.
    WouldBlock,
    /// Peer sent close_notify.
    Closed,
}

pub trait TlsSession: Send {
    /// Feed received bytes. Returns how many were consumed.
    fn feed(&mut self, data: &[u8]) -> Result<usize, TlsError>;

    fn is_handshaking(&self) -> bool;

    fn wants_write(&self) -> bool;

    /// Append pending wire bytes (handshake, records, alerts) to `out`.
    fn write_outgoing(&mut self, out: &mut Vec<u8>) -> Result<(), TlsError>;

    /// Queue plaintext for encryption. Returns bytes accepted.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<usize, TlsError>;

    fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<PlainRead, TlsError>;

    fn send_close(&mut self);

    /// Client chain, leaf first, DER encoded.
    fn peer_certificates(&self) -> Vec<Vec<u8>>;

    fn info(&self) -> SslInfo;
}

pub struct RustlsSession {
    conn: ServerConnection,
    server_name: Option<String>,
}

impl RustlsSession {
    pub fn new(config: Arc<ServerConfig>, server_name: Option<String>) -> Result<Self, TlsError> {
        Ok(Self {
            conn: ServerConnection::new(config)?,
            server_name,
        })
    }
}

impl TlsSession for RustlsSession {
    fn feed(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        let mut rd = data;
        let consumed = match self.conn.read_tls(&mut rd) {
            Ok(n) => n,
            // Plaintext buffer is full; caller drains it and feeds again.
            Err(e) if e.kind() == std::io::ErrorKind::Other => 0,
            Err(e) => return Err(TlsError::Material(e.to_string())),
        };
        self.conn.process_new_packets()?;
        Ok(consumed)
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn write_outgoing(&mut self, out: &mut Vec<u8>) -> Result<(), TlsError> {
        while self.conn.wants_write() {
            self.conn
                .write_tls(out)
                .map_err(|e| TlsError::Material(e.to_string()))?;
        }
        Ok(())
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<usize, TlsError> {
        if self.conn.is_handshaking() {
            return Err(TlsError::NotEstablished);
        }
        self.conn
            .writer()
            .write(plaintext)
            .map_err(|e| TlsError::Material(e.to_string()))
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<PlainRead, TlsError> {
        match self.conn.reader().read(buf) {
            Ok(0) if !buf.is_empty() => Ok(PlainRead::Closed),
            Ok(n) => Ok(PlainRead::Data(n)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(PlainRead::WouldBlock),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(PlainRead::Closed),
            Err(e) => Err(TlsError::Material(e.to_string())),
        }
    }

    fn send_close(&mut self) {
        self.conn.send_close_notify();
    }

    fn peer_certificates(&self) -> Vec<Vec<u8>> {
        self.conn
            .peer_certificates()
            .map(|chain| chain.iter().map(|c| c.as_ref().to_vec()).collect())
            .unwrap_or_default()
    }

    fn info(&self) -> SslInfo {
        SslInfo {
            protocol: self
                .conn
                .protocol_version()
                .map(|v| format!("{v:?}"))
                .unwrap_or_default(),
            cipher_suite: self
                .conn
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite()))
                .unwrap_or_default(),
            server_name: self.server_name.clone(),
            client_certificate: self.peer_certificates().into_iter().next(),
        }
    }
}

/// Always hands out the one certificate the config was built for.
#[derive(Debug)]
struct FixedCertificate(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertificate {
    fn resolve(&self, _hello: RustlsHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Requests a client certificate and checks the handshake signature, but
/// leaves the accept decision to the listener's predicate.
#[derive(Debug)]
struct PredicateClientVerifier {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for PredicateClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Server configurations keyed by thumbprint and client-certificate mode.
pub struct ServerConfigCache {
    provider: Arc<CryptoProvider>,
    configs: DashMap<(String, bool), Arc<ServerConfig>>,
}

impl ServerConfigCache {
    pub fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            configs: DashMap::new(),
        }
    }

    pub fn get_or_build(&self, certificate: &ServerCertificate, client_auth: bool) -> Result<Arc<ServerConfig>, TlsError> {
        let key = (certificate.thumbprint.clone(), client_auth);
        if let Some(config) = self.configs.get(&key) {
            return Ok(Arc::clone(config.value()));
        }

        let builder = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?;
        let builder = if client_auth {
            builder.with_client_cert_verifier(Arc::new(PredicateClientVerifier {
                provider: Arc::clone(&self.provider),
            }))
        } else {
            builder.with_no_client_auth()
        };
        let mut config = builder.with_cert_resolver(Arc::new(FixedCertificate(Arc::clone(&certificate.certified))));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.configs.insert(key, Arc::clone(&config));
        Ok(config)
    }

    pub fn clear(&self) {
        self.configs.clear();
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

impl Default for ServerConfigCache {
    fn default() -> Self {
        Self::new()
    }
}
