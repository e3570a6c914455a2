//! TLS stream over a plain transport.
//!
//! `negotiate` sniffs the ClientHello before any engine exists, so the
//! certificate can be chosen from SNI. Bytes read past the end of a record
//! stay in `incoming` and are fed on the next call.

use crate::net::stream::{PlainStream, StreamError};
use crate::net::tls::client_hello::{self, HelloStatus};
use crate::net::tls::session::{PlainRead, TlsSession};
use crate::net::tls::{SslInfo, TlsAcceptor, TlsError};
use crate::observability::metrics;

const READ_CHUNK: usize = 16 * 1024;

pub struct SecureStream {
    plain: PlainStream,
    session: Option<Box<dyn TlsSession>>,
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
    info: Option<SslInfo>,
}

impl SecureStream {
    pub fn new(plain: PlainStream) -> Self {
        Self {
            plain,
            session: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            info: None,
        }
    }

    pub fn transport(&self) -> &PlainStream {
        &self.plain
    }

    pub fn transport_mut(&mut self) -> &mut PlainStream {
        &mut self.plain
    }

    pub fn info(&self) -> Option<&SslInfo> {
        self.info.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.info.is_some()
    }

    /// Run the handshake to completion and vet the client certificate.
    pub async fn negotiate(&mut self, acceptor: &TlsAcceptor) -> Result<(), StreamError> {
        let result = self.handshake(acceptor).await;
        metrics::record_tls_handshake(if result.is_ok() { "ok" } else { "failed" });
        if let Err(e) = &result {
            tracing::debug!(peer_addr = %self.plain.peer_addr(), error = %e, "TLS negotiation failed");
        }
        result
    }

    async fn handshake(&mut self, acceptor: &TlsAcceptor) -> Result<(), StreamError> {
        let hello = loop {
            match client_hello::parse(&self.incoming).map_err(TlsError::from)? {
                HelloStatus::Complete(hello) => break hello,
                HelloStatus::NeedMoreData => {
                    tracing::trace!(buffered = self.incoming.len(), "ClientHello incomplete, reading more");
                    self.read_more().await?;
                }
            }
        };
        tracing::debug!(
            peer_addr = %self.plain.peer_addr(),
            server_name = hello.server_name.as_deref().unwrap_or(""),
            version = format_args!("{:#06x}", hello.version),
            "ClientHello received"
        );

        self.session = Some(acceptor.session_for(&hello)?);
        while self.session()?.is_handshaking() {
            let consumed = if self.incoming.is_empty() {
                0
            } else {
                self.feed_incoming().await?
            };
            self.flush_outgoing().await?;
            if self.session()?.is_handshaking() && (self.incoming.is_empty() || consumed == 0) {
                self.read_more().await?;
            }
        }
        self.flush_outgoing().await?;

        let session = self.session()?;
        let info = session.info();
        acceptor.check_client(info.client_certificate.as_deref())?;
        tracing::debug!(
            peer_addr = %self.plain.peer_addr(),
            protocol = %info.protocol,
            cipher = %info.cipher_suite,
            "TLS established"
        );
        self.info = Some(info);
        Ok(())
    }

    pub async fn recv_partial(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        loop {
            match self.session_mut()?.read_plaintext(buf)? {
                PlainRead::Data(n) => return Ok(n),
                PlainRead::Closed => return Err(StreamError::Closed),
                PlainRead::WouldBlock => {}
            }
            if self.incoming.is_empty() {
                self.read_more().await?;
            }
            self.feed_incoming().await?;
            if self.session()?.wants_write() {
                self.flush_outgoing().await?;
            }
        }
    }

    pub async fn send_partial(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        let accepted = self.session_mut()?.encrypt(buf)?;
        self.flush_outgoing().await?;
        Ok(accepted)
    }

    pub async fn send_exact(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        let mut sent = 0;
        while sent < buf.len() {
            sent += self.send_partial(&buf[sent..]).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.send_close();
            let _ = self.flush_outgoing().await;
        }
        self.plain.shutdown().await;
    }

    async fn read_more(&mut self) -> Result<(), StreamError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.plain.recv_partial(&mut chunk).await?;
        self.incoming.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Feed buffered bytes to the engine. Alerts are flushed before an
    /// engine error is returned.
    async fn feed_incoming(&mut self) -> Result<usize, StreamError> {
        let session = self.session.as_mut().ok_or(TlsError::NotEstablished)?;
        match session.feed(&self.incoming) {
            Ok(n) => {
                self.incoming.drain(..n);
                Ok(n)
            }
            Err(e) => {
                let _ = self.flush_outgoing().await;
                Err(e.into())
            }
        }
    }

    async fn flush_outgoing(&mut self) -> Result<(), StreamError> {
        let session = self.session.as_mut().ok_or(TlsError::NotEstablished)?;
        session.write_outgoing(&mut self.outgoing)?;
        if !self.outgoing.is_empty() {
            let out = std::mem::take(&mut self.outgoing);
            self.plain.send_exact(&out).await?;
            self.plain.flush().await?;
        }
        Ok(())
    }

    fn session(&self) -> Result<&dyn TlsSession, TlsError> {
        self.session.as_deref().ok_or(TlsError::NotEstablished)
    }

    fn session_mut(&mut self) -> Result<&mut Box<dyn TlsSession>, TlsError> {
        self.session.as_mut().ok_or(TlsError::NotEstablished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    use crate::config::SslBinding;
    use crate::net::tls::client_hello::tests::client_hello;
    use crate::net::tls::{accept_any_client_certificate, PemDirectoryStore, ServerConfigCache};

    fn acceptor(thumbprint: &str) -> TlsAcceptor {
        TlsAcceptor {
            binding: SslBinding {
                address: "0.0.0.0:443".into(),
                cert_hash: thumbprint.into(),
                cert_store: "MY".into(),
                default_flags: 0,
            },
            certificates: Arc::new(PemDirectoryStore::new(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/tests/fixtures/certs"
            ))),
            configs: Arc::new(ServerConfigCache::new()),
            client_cert_check: accept_any_client_certificate(),
            local_name: "localhost".into(),
        }
    }

    fn stream() -> (SecureStream, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        (
            SecureStream::new(PlainStream::new(a, addr, addr, Duration::from_secs(2))),
            b,
        )
    }

    #[tokio::test]
    async fn truncated_hello_waits_for_one_more_read() {
        let (mut secure, mut client) = stream();
        let hello = client_hello(Some("unknown.test"));
        client.write_all(&hello[..3]).await.unwrap();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.write_all(&hello[3..]).await.unwrap();
            client
        });

        // The whole record arrives after a second read; selection then fails
        // because neither the empty thumbprint nor the SNI name is in the store.
        let err = secure.negotiate(&acceptor("")).await.unwrap_err();
        assert!(matches!(err, StreamError::Tls(TlsError::NoCertificate { .. })));
        let _client = writer.await.unwrap();
    }

    #[tokio::test]
    async fn plain_http_on_secure_port_is_rejected() {
        let (mut secure, mut client) = stream();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let err = secure.negotiate(&acceptor("")).await.unwrap_err();
        assert!(matches!(err, StreamError::Tls(TlsError::Hello(_))));
    }

    #[tokio::test]
    async fn io_before_negotiation_is_an_error() {
        let (mut secure, _client) = stream();
        let mut buf = [0u8; 4];
        assert!(secure.recv_partial(&mut buf).await.is_err());
    }
}
