//! Socket streams: the byte transport under a request.
//!
//! # Responsibilities
//! - Timeout-bounded partial and exact reads/writes
//! - Plain and TLS variants behind one enum
//! - Overlapped variants that run on a spawned task and report through a
//!   callback
//! - Out-of-band abort so a cancelled request wakes a blocked reader

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::net::tls::secure::SecureStream;
use crate::net::tls::{SslInfo, TlsError};
use crate::observability::logging;

/// Error type for stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection closed by peer")]
    Closed,
    #[error("operation timed out")]
    Timeout,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] TlsError),
}

/// Anything a stream can run over: a TCP socket, or a duplex pipe in tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// Shared abort flag for one connection.
#[derive(Debug, Default)]
pub struct StreamAbort {
    aborted: AtomicBool,
    notify: Notify,
}

impl StreamAbort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// Unencrypted transport with a per-operation timeout.
pub struct PlainStream {
    io: Box<dyn Transport>,
    peer: SocketAddr,
    local: SocketAddr,
    timeout: Duration,
    abort: Arc<StreamAbort>,
    dump_level: u8,
}

impl PlainStream {
    pub fn new(io: impl Transport, peer: SocketAddr, local: SocketAddr, timeout: Duration) -> Self {
        Self {
            io: Box::new(io),
            peer,
            local,
            timeout,
            abort: StreamAbort::new(),
            dump_level: 0,
        }
    }

    pub fn with_dump_level(mut self, level: u8) -> Self {
        self.dump_level = level;
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn abort_handle(&self) -> Arc<StreamAbort> {
        Arc::clone(&self.abort)
    }

    /// One read. Zero bytes from the peer is reported as `Closed`.
    pub async fn recv_partial(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if self.abort.is_aborted() {
            return Err(StreamError::Closed);
        }
        let n = tokio::select! {
            _ = self.abort.wait() => return Err(StreamError::Closed),
            read = tokio::time::timeout(self.timeout, self.io.read(buf)) => {
                read.map_err(|_| StreamError::Timeout)??
            }
        };
        if n == 0 {
            return Err(StreamError::Closed);
        }
        logging::hex_dump(self.dump_level, "recv", &buf[..n]);
        Ok(n)
    }

    /// One write.
    pub async fn send_partial(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        if self.abort.is_aborted() {
            return Err(StreamError::Closed);
        }
        let n = tokio::select! {
            _ = self.abort.wait() => return Err(StreamError::Closed),
            written = tokio::time::timeout(self.timeout, self.io.write(buf)) => {
                written.map_err(|_| StreamError::Timeout)??
            }
        };
        if n == 0 {
            return Err(StreamError::Closed);
        }
        logging::hex_dump(self.dump_level, "send", &buf[..n]);
        Ok(n)
    }

    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.recv_partial(&mut buf[filled..]).await?;
        }
        Ok(())
    }

    pub async fn send_exact(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        let mut sent = 0;
        while sent < buf.len() {
            sent += self.send_partial(&buf[sent..]).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), StreamError> {
        tokio::time::timeout(self.timeout, self.io.flush())
            .await
            .map_err(|_| StreamError::Timeout)??;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = tokio::time::timeout(Duration::from_secs(1), self.io.shutdown()).await;
    }
}

/// A connection's transport, plain or secure.
pub enum SocketStream {
    Plain(PlainStream),
    Secure(Box<SecureStream>),
}

/// A stream shared between a request, its body readers and WebSocket.
pub type SharedStream = Arc<tokio::sync::Mutex<SocketStream>>;

impl SocketStream {
    pub fn is_secure(&self) -> bool {
        matches!(self, SocketStream::Secure(_))
    }

    fn plain(&self) -> &PlainStream {
        match self {
            SocketStream::Plain(p) => p,
            SocketStream::Secure(s) => s.transport(),
        }
    }

    fn plain_mut(&mut self) -> &mut PlainStream {
        match self {
            SocketStream::Plain(p) => p,
            SocketStream::Secure(s) => s.transport_mut(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.plain().peer_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.plain().local_addr()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.plain_mut().set_timeout(timeout);
    }

    pub fn abort_handle(&self) -> Arc<StreamAbort> {
        self.plain().abort_handle()
    }

    pub fn ssl_info(&self) -> Option<&SslInfo> {
        match self {
            SocketStream::Plain(_) => None,
            SocketStream::Secure(s) => s.info(),
        }
    }

    pub async fn recv_partial(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        match self {
            SocketStream::Plain(p) => p.recv_partial(buf).await,
            SocketStream::Secure(s) => s.recv_partial(buf).await,
        }
    }

    pub async fn send_partial(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        match self {
            SocketStream::Plain(p) => p.send_partial(buf).await,
            SocketStream::Secure(s) => s.send_partial(buf).await,
        }
    }

    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.recv_partial(&mut buf[filled..]).await?;
        }
        Ok(())
    }

    pub async fn send_exact(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        match self {
            SocketStream::Plain(p) => {
                p.send_exact(buf).await?;
                p.flush().await
            }
            SocketStream::Secure(s) => s.send_exact(buf).await,
        }
    }

    pub async fn shutdown(&mut self) {
        match self {
            SocketStream::Plain(p) => p.shutdown().await,
            SocketStream::Secure(s) => s.shutdown().await,
        }
    }
}

/// Read up to `len` bytes on a spawned task and report through `done`.
pub fn recv_overlapped<F>(stream: SharedStream, len: usize, done: F) -> JoinHandle<()>
where
    F: FnOnce(Result<Vec<u8>, StreamError>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; len.max(1)];
        let result = {
            let mut stream = stream.lock().await;
            stream.recv_partial(&mut buf).await
        };
        done(result.map(|n| {
            buf.truncate(n);
            buf
        }));
    })
}

/// Write all of `data` on a spawned task and report the count through `done`.
pub fn send_overlapped<F>(stream: SharedStream, data: Vec<u8>, done: F) -> JoinHandle<()>
where
    F: FnOnce(Result<usize, StreamError>) + Send + 'static,
{
    tokio::spawn(async move {
        let result = {
            let mut stream = stream.lock().await;
            stream.send_exact(&data).await
        };
        done(result.map(|()| data.len()));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::sync::oneshot;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn pair(timeout: Duration) -> (PlainStream, tokio::io::DuplexStream) {
        let (a, b) = duplex(1024);
        (PlainStream::new(a, addr(), addr(), timeout), b)
    }

    #[tokio::test]
    async fn partial_and_exact_reads() {
        let (mut stream, mut peer) = pair(Duration::from_secs(5));
        peer.write_all(b"hello world").await.unwrap();

        let mut five = [0u8; 5];
        stream.recv_exact(&mut five).await.unwrap();
        assert_eq!(&five, b"hello");

        let mut rest = [0u8; 64];
        let n = stream.recv_partial(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b" world");
    }

    #[tokio::test]
    async fn peer_close_is_closed_not_zero() {
        let (mut stream, peer) = pair(Duration::from_secs(5));
        drop(peer);
        let mut buf = [0u8; 8];
        assert!(matches!(stream.recv_partial(&mut buf).await, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn read_times_out() {
        let (mut stream, _peer) = pair(Duration::from_millis(50));
        let mut buf = [0u8; 8];
        assert!(matches!(stream.recv_partial(&mut buf).await, Err(StreamError::Timeout)));
    }

    #[tokio::test]
    async fn abort_wakes_a_blocked_reader() {
        let (stream, _peer) = pair(Duration::from_secs(30));
        let abort = stream.abort_handle();
        let shared: SharedStream = Arc::new(tokio::sync::Mutex::new(SocketStream::Plain(stream)));

        let (tx, rx) = oneshot::channel();
        recv_overlapped(Arc::clone(&shared), 16, move |result| {
            let _ = tx.send(result.is_err());
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.abort();

        let failed = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert!(failed);
    }

    #[tokio::test]
    async fn overlapped_send_reports_length() {
        let (stream, mut peer) = pair(Duration::from_secs(5));
        let shared: SharedStream = Arc::new(tokio::sync::Mutex::new(SocketStream::Plain(stream)));

        let (tx, rx) = oneshot::channel();
        send_overlapped(shared, b"abc".to_vec(), move |result| {
            let _ = tx.send(result.ok());
        });
        assert_eq!(rx.await.unwrap(), Some(3));

        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }
}
