//! Secure listeners with a certificate bound by thumbprint.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use httpsys::config::registry::SSL_FLAG_NEGOTIATE_CLIENT_CERT;
use httpsys::config::{Registry, SslBinding};
use httpsys::error::HttpSysError;
use httpsys::http::HttpResponse;

mod common;

/// The fixture certificate is self-signed.
#[derive(Debug)]
struct SkipVerification;

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        default_provider().signature_verification_algorithms.supported_schemes()
    }
}

fn connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipVerification))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn registry(port: u16) -> Registry {
    registry_with_flags(port, 0)
}

fn registry_with_flags(port: u16, default_flags: u32) -> Registry {
    let mut registry = Registry::with_acl([format!("https://+:{port}/")]);
    registry.add_binding(SslBinding {
        address: format!("0.0.0.0:{port}"),
        cert_hash: common::CERT_THUMBPRINT.to_string(),
        cert_store: "MY".to_string(),
        default_flags,
    });
    registry
}

#[tokio::test]
async fn request_over_tls_carries_ssl_info() {
    let server = common::start(common::services(registry(28320)), &[("https://+:28320/", 11)]).await;

    let client = tokio::spawn(async move {
        let tcp = TcpStream::connect(common::loopback(28320)).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        let mut tls = connector().connect(name, tcp).await.unwrap();
        tls.write_all(b"GET /secure/page HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        let _ = tls.read_to_end(&mut response).await;
        String::from_utf8_lossy(&response).into_owned()
    });

    let request = server.receive().await;
    assert_eq!(request.url_context, 11);
    assert!(request.cooked_url.full.starts_with("https://localhost"));
    let ssl = request.ssl_info.clone().expect("secure request without ssl info");
    assert!(!ssl.protocol.is_empty());
    assert!(!ssl.cipher_suite.is_empty());
    assert_eq!(ssl.server_name.as_deref(), Some("localhost"));
    assert!(ssl.client_certificate.is_none());

    server.respond(&request, HttpResponse::new(200).with_body("secret")).await;
    let response = tokio::time::timeout(Duration::from_secs(5), client)
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("secret"));
    server.stop().await;
}

#[tokio::test]
async fn plain_client_on_secure_port_is_dropped() {
    let server = common::start(common::services(registry(28321)), &[("https://+:28321/", 0)]).await;
    let response = common::raw_exchange(28321, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await;
    assert!(!response.starts_with("HTTP/1.1 200"));
    server.stop().await;
}

#[tokio::test]
async fn secure_prefix_without_binding_is_rejected() {
    let registry = Registry::with_acl(["https://+:28322/"]);
    let server = common::start(common::services(registry), &[]).await;
    let err = server
        .api
        .add_url_to_url_group(server.group, "https://+:28322/", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, HttpSysError::InvalidConfiguration(_)));
    assert!(TcpStream::connect(common::loopback(28322)).await.is_err());
    server.stop().await;
}

#[tokio::test]
async fn two_requests_share_one_tls_connection() {
    let server = common::start(common::services(registry(28323)), &[("https://+:28323/", 23)]).await;
    let worker = server.serve_context();

    let tcp = TcpStream::connect(common::loopback(28323)).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector().connect(name, tcp).await.unwrap();
    for path in ["/first", "/second"] {
        let head = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        tls.write_all(head.as_bytes()).await.unwrap();
        let response = common::read_response(&mut tls).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("23"), "{response}");
    }

    drop(tls);
    server.stop().await;
    let _ = worker.await;
}

#[tokio::test]
async fn required_client_certificate_turns_away_anonymous_clients() {
    let registry = registry_with_flags(28324, SSL_FLAG_NEGOTIATE_CLIENT_CERT);
    let server = common::start(common::services(registry), &[("https://+:28324/", 0)]).await;
    let worker = server.serve_context();

    let exchange = async {
        let tcp = TcpStream::connect(common::loopback(28324)).await.ok()?;
        let name = ServerName::try_from("localhost").ok()?;
        let mut tls = connector().connect(name, tcp).await.ok()?;
        tls.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .ok()?;
        let mut response = Vec::new();
        let _ = tls.read_to_end(&mut response).await;
        Some(String::from_utf8_lossy(&response).into_owned())
    };
    let response = tokio::time::timeout(Duration::from_secs(5), exchange)
        .await
        .expect("server kept an anonymous client waiting");
    if let Some(response) = response {
        assert!(!response.starts_with("HTTP/1.1 200"), "{response}");
    }

    server.stop().await;
    let _ = worker.await;
}
