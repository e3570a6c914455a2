//! WebSocket connections over an upgraded request.
//!
//! # Data Flow
//! ```text
//! Application                      pump task (owns the socket)
//!   write_fragment ──► outgoing ──► send_exact
//!   read_fragment  ◄── incoming ◄── recv_partial
//!                                   keep-alive ping every interval
//! ```
//!
//! The application answers the upgrade with a 101 and the opaque send
//! flag; `WebSocket::accept` then takes over the request's stream.

pub mod frame;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{HttpSysError, Result};
use crate::http::request::{Request, RequestStatus};
use crate::net::connection::ConnectionLease;
use crate::net::stream::{SharedStream, StreamAbort};
use crate::session::lock;

pub use frame::{accept_key, Frame, FrameError, Opcode, CLOSE_NORMAL, CLOSE_NO_STATUS};

pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(120);
const MIN_KEEPALIVE: Duration = Duration::from_secs(15);
const MAX_KEEPALIVE: Duration = Duration::from_secs(160);

const INCOMING_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketSettings {
    pub receive_buffer_size: usize,
    pub keepalive: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            keepalive: DEFAULT_KEEPALIVE,
        }
    }
}

impl WebSocketSettings {
    pub fn with_receive_buffer_size(mut self, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(HttpSysError::InvalidParameter("zero receive buffer size"));
        }
        self.receive_buffer_size = size;
        Ok(self)
    }

    /// Keep-alive ping interval, clamped to 15..=160 seconds.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval.clamp(MIN_KEEPALIVE, MAX_KEEPALIVE);
        self
    }
}

/// What a read produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    Utf8Message,
    Utf8Fragment,
    BinaryMessage,
    BinaryFragment,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub buffer_type: BufferType,
    /// Payload, or the close reason for `BufferType::Close`.
    pub data: Vec<u8>,
}

enum Outgoing {
    Bytes(Vec<u8>, Option<oneshot::Sender<Result<()>>>),
    Shutdown,
}

/// Payload not yet handed to the application.
struct Pending {
    text: bool,
    data: Vec<u8>,
    fin: bool,
}

struct Reader {
    incoming: mpsc::Receiver<Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: Option<Pending>,
    /// Kind of the data message in progress, for continuation frames.
    message_text: Option<bool>,
}

pub struct WebSocket {
    request: Arc<Request>,
    settings: WebSocketSettings,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    reader: tokio::sync::Mutex<Reader>,
    /// Opcode a fragmented outgoing message continues with.
    writing: Mutex<Option<Opcode>>,
    close_status: Mutex<Option<(u16, String)>>,
    close_sent: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
    overlapped: Mutex<Vec<JoinHandle<()>>>,
    abort: Arc<StreamAbort>,
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("connection_id", &self.request.connection_id())
            .field("settings", &self.settings)
            .field("close_sent", &self.close_sent.load(Ordering::Acquire))
            .field("close_status", &self.close_status())
            .finish_non_exhaustive()
    }
}

impl WebSocket {
    /// Take over a request whose 101 response went out with the opaque flag.
    pub fn accept(request: Arc<Request>, settings: WebSocketSettings) -> Result<Arc<Self>> {
        if request.status() != RequestStatus::Opaque {
            return Err(HttpSysError::InvalidState("request was not upgraded"));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INCOMING_DEPTH);
        let pump = tokio::spawn(pump(
            request.take_lease(),
            request.stream(),
            out_rx,
            in_tx,
            settings.keepalive,
            settings.receive_buffer_size,
        ));
        tracing::debug!(
            connection_id = %request.connection_id(),
            keepalive_secs = settings.keepalive.as_secs(),
            "WebSocket established"
        );
        Ok(Arc::new(Self {
            abort: request.abort_handle(),
            request,
            settings,
            outgoing: out_tx,
            reader: tokio::sync::Mutex::new(Reader {
                incoming: in_rx,
                buffer: Vec::new(),
                pending: None,
                message_text: None,
            }),
            writing: Mutex::new(None),
            close_status: Mutex::new(None),
            close_sent: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
            overlapped: Mutex::new(Vec::new()),
        }))
    }

    pub fn settings(&self) -> WebSocketSettings {
        self.settings
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    /// Next piece of data, at most `buffer_len` bytes of it.
    ///
    /// A message longer than the buffer comes back as fragments; the last
    /// one is typed as a message.
    pub async fn read_fragment(&self, buffer_len: usize) -> Result<Fragment> {
        if buffer_len == 0 {
            return Err(HttpSysError::InvalidParameter("zero length buffer"));
        }
        let mut reader = self.reader.lock().await;
        loop {
            if let Some(mut pending) = reader.pending.take() {
                let rest = if pending.data.len() > buffer_len {
                    pending.data.split_off(buffer_len)
                } else {
                    Vec::new()
                };
                let last = rest.is_empty() && pending.fin;
                let buffer_type = match (pending.text, last) {
                    (true, true) => BufferType::Utf8Message,
                    (true, false) => BufferType::Utf8Fragment,
                    (false, true) => BufferType::BinaryMessage,
                    (false, false) => BufferType::BinaryFragment,
                };
                if last {
                    reader.message_text = None;
                } else if !rest.is_empty() {
                    reader.pending = Some(Pending {
                        text: pending.text,
                        data: rest,
                        fin: pending.fin,
                    });
                }
                return Ok(Fragment {
                    buffer_type,
                    data: pending.data,
                });
            }

            let decoded = Frame::decode(&mut reader.buffer);
            match decoded {
                Ok(Some(frame)) => match frame.opcode {
                    Opcode::Ping => {
                        self.queue(Frame::new(Opcode::Pong, true, frame.payload).encode(None), None)?;
                    }
                    Opcode::Pong => {}
                    Opcode::Close => {
                        let (status, reason) = frame.close_payload();
                        tracing::debug!(connection_id = %self.request.connection_id(), status, %reason, "WebSocket close received");
                        *lock(&self.close_status) = Some((status, reason.clone()));
                        if !self.close_sent.swap(true, Ordering::AcqRel) {
                            let echo = if status == CLOSE_NO_STATUS { CLOSE_NORMAL } else { status };
                            let _ = self.queue(Frame::close(echo, "").encode(None), None);
                        }
                        return Ok(Fragment {
                            buffer_type: BufferType::Close,
                            data: reason.into_bytes(),
                        });
                    }
                    Opcode::Text | Opcode::Binary => {
                        let text = frame.opcode == Opcode::Text;
                        reader.message_text = Some(text);
                        reader.pending = Some(Pending {
                            text,
                            data: frame.payload,
                            fin: frame.fin,
                        });
                    }
                    Opcode::Continuation => {
                        let text = reader
                            .message_text
                            .ok_or(HttpSysError::InvalidHeader("continuation without a message".into()))?;
                        reader.pending = Some(Pending {
                            text,
                            data: frame.payload,
                            fin: frame.fin,
                        });
                    }
                },
                Ok(None) => match reader.incoming.recv().await {
                    Some(Ok(bytes)) => reader.buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => return Err(e),
                    None => return Err(HttpSysError::HandleEof),
                },
                Err(e) => {
                    tracing::debug!(connection_id = %self.request.connection_id(), error = %e, "Bad WebSocket frame");
                    let _ = self.send_close(1002, "protocol error").await;
                    return Err(HttpSysError::InvalidHeader(e.to_string()));
                }
            }
        }
    }

    /// Send one data frame. Fragment types leave the message open.
    pub async fn write_fragment(&self, buffer_type: BufferType, data: &[u8]) -> Result<()> {
        let bytes = self.data_frame(buffer_type, data)?.encode(None);
        let (tx, rx) = oneshot::channel();
        self.queue(bytes, Some(tx))?;
        rx.await.unwrap_or(Err(HttpSysError::ConnectionAborted))
    }

    fn data_frame(&self, buffer_type: BufferType, data: &[u8]) -> Result<Frame> {
        if self.close_sent.load(Ordering::Acquire) {
            return Err(HttpSysError::InvalidState("close already sent"));
        }
        let (opcode, fin) = match buffer_type {
            BufferType::Utf8Message => (Opcode::Text, true),
            BufferType::Utf8Fragment => (Opcode::Text, false),
            BufferType::BinaryMessage => (Opcode::Binary, true),
            BufferType::BinaryFragment => (Opcode::Binary, false),
            BufferType::Close => return Err(HttpSysError::InvalidParameter("use send_close to close")),
        };
        let mut writing = lock(&self.writing);
        let opcode = match *writing {
            Some(open) if open != opcode => {
                return Err(HttpSysError::InvalidParameter("message type changed mid-message"));
            }
            Some(_) => Opcode::Continuation,
            None => opcode,
        };
        *writing = if fin {
            None
        } else {
            Some(if opcode == Opcode::Continuation {
                writing.unwrap_or(Opcode::Binary)
            } else {
                opcode
            })
        };
        Ok(Frame::new(opcode, fin, data))
    }

    /// Start the closing handshake.
    pub async fn send_close(&self, status: u16, reason: &str) -> Result<()> {
        if self.close_sent.swap(true, Ordering::AcqRel) {
            return Err(HttpSysError::InvalidState("close already sent"));
        }
        let (tx, rx) = oneshot::channel();
        self.queue(Frame::close(status, reason).encode(None), Some(tx))?;
        rx.await.unwrap_or(Err(HttpSysError::ConnectionAborted))
    }

    /// Status and reason from the peer's close frame, once received.
    pub fn close_status(&self) -> Option<(u16, String)> {
        lock(&self.close_status).clone()
    }

    /// Drop the connection without a closing handshake.
    pub fn close_transport(&self) {
        let _ = self.outgoing.send(Outgoing::Shutdown);
        self.cancel_io();
    }

    /// Abort outstanding overlapped reads and writes.
    pub fn cancel_io(&self) {
        let tasks = std::mem::take(&mut *lock(&self.overlapped));
        if !tasks.is_empty() {
            tracing::debug!(connection_id = %self.request.connection_id(), count = tasks.len(), "Cancelling WebSocket I/O");
        }
        for task in tasks {
            task.abort();
        }
    }

    /// Overlapped `read_fragment`.
    pub fn read_overlapped<F>(self: &Arc<Self>, buffer_len: usize, done: F)
    where
        F: FnOnce(Result<Fragment>) + Send + 'static,
    {
        let socket = Arc::clone(self);
        self.track(tokio::spawn(async move {
            done(socket.read_fragment(buffer_len).await);
        }));
    }

    /// Overlapped `write_fragment`.
    pub fn write_overlapped<F>(self: &Arc<Self>, buffer_type: BufferType, data: Vec<u8>, done: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let socket = Arc::clone(self);
        self.track(tokio::spawn(async move {
            done(socket.write_fragment(buffer_type, &data).await);
        }));
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.overlapped);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn queue(&self, bytes: Vec<u8>, ack: Option<oneshot::Sender<Result<()>>>) -> Result<()> {
        if self.abort.is_aborted() {
            return Err(HttpSysError::ConnectionAborted);
        }
        self.outgoing
            .send(Outgoing::Bytes(bytes, ack))
            .map_err(|_| HttpSysError::ConnectionAborted)
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            // The pump exits on its own once the sender is gone; this only
            // stops it waiting on a silent peer.
            if !pump.is_finished() {
                self.abort.abort();
            }
        }
    }
}

async fn pump(
    lease: Option<ConnectionLease>,
    stream: SharedStream,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    incoming: mpsc::Sender<Result<Vec<u8>>>,
    keepalive: Duration,
    buffer_size: usize,
) {
    let mut stream = stream.lock().await;
    // Pongs to our pings keep an idle socket readable.
    stream.set_timeout(keepalive * 2 + MIN_KEEPALIVE);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
    let mut buf = vec![0u8; buffer_size.max(2)];

    loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(Outgoing::Bytes(bytes, ack)) => {
                    let sent = stream.send_exact(&bytes).await.map_err(HttpSysError::from);
                    let failed = sent.is_err();
                    if let Some(ack) = ack {
                        let _ = ack.send(sent);
                    }
                    if failed {
                        break;
                    }
                }
                Some(Outgoing::Shutdown) | None => break,
            },
            read = stream.recv_partial(&mut buf) => match read {
                Ok(n) => {
                    if incoming.send(Ok(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = incoming.send(Err(e.into())).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                let nonce = fastrand::u64(..).to_be_bytes();
                let ping = Frame::new(Opcode::Ping, true, nonce.to_vec()).encode(None);
                if stream.send_exact(&ping).await.is_err() {
                    break;
                }
                tracing::trace!("WebSocket keep-alive ping sent");
            }
        }
    }
    stream.shutdown().await;
    drop(lease);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_is_clamped() {
        let settings = WebSocketSettings::default().with_keepalive(Duration::from_secs(1));
        assert_eq!(settings.keepalive, MIN_KEEPALIVE);
        let settings = WebSocketSettings::default().with_keepalive(Duration::from_secs(600));
        assert_eq!(settings.keepalive, MAX_KEEPALIVE);
        assert_eq!(WebSocketSettings::default().keepalive, DEFAULT_KEEPALIVE);
    }

    #[test]
    fn zero_receive_buffer_is_rejected() {
        assert!(WebSocketSettings::default().with_receive_buffer_size(0).is_err());
        assert_eq!(
            WebSocketSettings::default()
                .with_receive_buffer_size(1024)
                .unwrap()
                .receive_buffer_size,
            1024
        );
    }
}
