//! One connection's HTTP exchanges.
//!
//! # Data Flow
//! ```text
//! Listener accepts → Request::run()
//!     → TLS negotiate (secure listeners)
//!     → read_head() → parse, cook URL, longest-prefix match
//!         ├─ malformed → 400, close
//!         ├─ no prefix → 404, close
//!         └─ protected group → Authenticator (401 legs loop here)
//!     → RequestQueue::enqueue_incoming() (503 straight back when full)
//!     → wait for the application's final send
//!         ├─ Recycle → reset, keep buffered bytes, next request
//!         ├─ Close   → shut the socket
//!         └─ Opaque  → the stream now belongs to a WebSocket
//! ```
//!
//! The exchange state sits behind a std mutex that is never held across an
//! await; socket access goes through the shared stream's async mutex.

use std::net::SocketAddr;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;

use crate::context::Services;
use crate::error::{HttpSysError, Result};
use crate::handles::Handle;
use crate::http::auth::{challenges, AuthInfo, AuthOutcome, Authenticator, CredentialCache};
use crate::http::headers::{HttpVersion, RequestHeader, RequestHeaders, ResponseHeader, Verb};
use crate::http::parser::{cook_url, parse_head, BodyFraming, CookedUrl, RequestHead, MAX_HEAD_LEN};
use crate::http::response::{
    error_response, error_text, resolve_chunks, service_unavailable, DataChunk, EntitySource, HttpResponse,
    SendFlags, FILE_BLOCK_SIZE,
};
use crate::net::connection::{ConnectionId, ConnectionLease};
use crate::net::stream::{recv_overlapped, send_overlapped, SharedStream, SocketStream, StreamAbort};
use crate::net::tls::{SslInfo, TlsAcceptor};
use crate::observability::metrics;
use crate::queue::{RequestQueue, Verbosity};
use crate::session::lock;
use crate::session::policy::Timeouts;
use crate::session::url::normalize_request_path;
use crate::session::url_group::UrlMatch;

const READ_BUFFER_LEN: usize = MAX_HEAD_LEN;

/// Space taken by the fixed part of a received request.
pub const REQUEST_BLOCK_LEN: usize = 512;

/// Flags for receiving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ReceiveFlags(u32);

impl ReceiveFlags {
    pub const NONE: ReceiveFlags = ReceiveFlags(0);
    /// Copy buffered entity body into the request, as far as it fits.
    pub const COPY_BODY: ReceiveFlags = ReceiveFlags(0x01);
    /// Copy all buffered entity body regardless of the buffer length.
    pub const FLUSH_BODY: ReceiveFlags = ReceiveFlags(0x02);

    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !0x03 != 0 {
            return Err(HttpSysError::InvalidParameter("unknown receive flag"));
        }
        Ok(Self(bits))
    }

    pub fn contains(&self, other: ReceiveFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for ReceiveFlags {
    type Output = ReceiveFlags;

    fn bitor(self, rhs: ReceiveFlags) -> ReceiveFlags {
        ReceiveFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Created,
    Received,
    Reading,
    Answering,
    Writing,
    Serviced,
    Opaque,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Recycle,
    Close,
    Opaque,
}

/// A received request as handed to the application.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub request_id: Handle,
    pub connection_id: u64,
    /// Context of the matched prefix.
    pub url_context: u64,
    pub version: HttpVersion,
    pub verb: Verb,
    pub raw_url: String,
    pub cooked_url: CookedUrl,
    pub headers: RequestHeaders,
    pub remote_address: SocketAddr,
    pub local_address: SocketAddr,
    pub ssl_info: Option<SslInfo>,
    pub auth: AuthInfo,
    pub entity_body: Vec<u8>,
    /// More body can be read with `receive_entity_body`.
    pub more_entity_body: bool,
}

impl HttpRequest {
    /// Buffer length needed to receive this request.
    pub fn serialized_len(&self) -> usize {
        let client_cert = self
            .ssl_info
            .as_ref()
            .and_then(|s| s.client_certificate.as_ref())
            .map_or(0, Vec::len);
        REQUEST_BLOCK_LEN
            + self.raw_url.len()
            + self.cooked_url.full.len()
            + self.headers.wire_len()
            + client_cert
            + self.entity_body.len()
    }
}

struct Exchange {
    status: RequestStatus,
    head: Option<RequestHead>,
    cooked: CookedUrl,
    url_match: Option<UrlMatch>,
    /// Bytes read past the current head: body, or the next pipelined request.
    buffer: Vec<u8>,
    framing: BodyFraming,
    keep_alive: bool,
    enqueued_at: Option<Instant>,
    queue_timeout: Duration,
    bytes_read: u64,
    bytes_written: u64,
    auth: AuthInfo,
    disposition: Option<Disposition>,
}

impl Exchange {
    fn new(buffer: Vec<u8>) -> Self {
        Self {
            status: RequestStatus::Created,
            head: None,
            cooked: CookedUrl::default(),
            url_match: None,
            buffer,
            framing: BodyFraming::Length { remaining: 0 },
            keep_alive: false,
            enqueued_at: None,
            queue_timeout: Timeouts::default().request_queue,
            bytes_read: 0,
            bytes_written: 0,
            auth: AuthInfo::default(),
            disposition: None,
        }
    }

    fn timeouts(&self) -> Timeouts {
        self.url_match
            .as_ref()
            .map(|m| m.group.timeouts())
            .unwrap_or_default()
    }

    /// Move up to `max` decoded body bytes out of the buffer.
    fn take_body(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        if self.framing.is_done() {
            return Err(HttpSysError::HandleEof);
        }
        let data = self
            .framing
            .take(&mut self.buffer, max)
            .map_err(|e| HttpSysError::InvalidHeader(e.to_string()))?;
        if data.is_empty() {
            return if self.framing.is_done() {
                Err(HttpSysError::HandleEof)
            } else {
                Ok(None)
            };
        }
        self.bytes_read += data.len() as u64;
        Ok(Some(data))
    }
}

/// A connection and the exchange currently running on it.
pub struct Request {
    id: AtomicU64,
    connection: ConnectionId,
    peer: SocketAddr,
    local: SocketAddr,
    port: u16,
    secure: bool,
    stream: SharedStream,
    abort: Arc<StreamAbort>,
    ssl: OnceLock<SslInfo>,
    queue: Weak<RequestQueue>,
    services: Arc<Services>,
    state: Mutex<Exchange>,
    finished: Notify,
    lease: Mutex<Option<ConnectionLease>>,
}

impl Request {
    pub fn new(
        stream: SocketStream,
        connection: ConnectionId,
        port: u16,
        queue: Weak<RequestQueue>,
        services: Arc<Services>,
    ) -> Arc<Self> {
        let peer = stream.peer_addr();
        let local = stream.local_addr();
        let secure = stream.is_secure();
        let abort = stream.abort_handle();
        Arc::new(Self {
            id: AtomicU64::new(0),
            connection,
            peer,
            local,
            port,
            secure,
            stream: Arc::new(tokio::sync::Mutex::new(stream)),
            abort,
            ssl: OnceLock::new(),
            queue,
            services,
            state: Mutex::new(Exchange::new(Vec::new())),
            finished: Notify::new(),
            lease: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Handle {
        Handle::from_raw(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn set_id(&self, handle: Handle) {
        self.id.store(handle.as_raw(), Ordering::Release);
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn status(&self) -> RequestStatus {
        self.state().status
    }

    pub(crate) fn set_status(&self, status: RequestStatus) {
        self.state().status = status;
    }

    pub fn bytes_read(&self) -> u64 {
        self.state().bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.state().bytes_written
    }

    pub(crate) fn stream(&self) -> SharedStream {
        Arc::clone(&self.stream)
    }

    pub(crate) fn abort_handle(&self) -> Arc<StreamAbort> {
        Arc::clone(&self.abort)
    }

    /// Keep the connection counted until the lease is taken or released.
    pub(crate) fn hold_lease(&self, lease: ConnectionLease) {
        *lock(&self.lease) = Some(lease);
    }

    /// Hand the lease to whoever owns the socket next.
    pub(crate) fn take_lease(&self) -> Option<ConnectionLease> {
        lock(&self.lease).take()
    }

    fn release_lease(&self) {
        drop(self.take_lease());
    }

    pub(crate) fn mark_enqueued(&self) {
        self.state().enqueued_at = Some(Instant::now());
    }

    /// True once the request sat in the queue past its group's timeout.
    pub(crate) fn waited_too_long(&self) -> bool {
        let state = self.state();
        state
            .enqueued_at
            .is_some_and(|at| at.elapsed() > state.queue_timeout)
    }

    // ----- connection task ------------------------------------------------

    /// Serve the connection until it closes or is handed over.
    pub(crate) async fn run(self: Arc<Self>, acceptor: Option<TlsAcceptor>) {
        if let Some(acceptor) = acceptor {
            let negotiated = {
                let mut stream = self.stream.lock().await;
                match &mut *stream {
                    SocketStream::Secure(secure) => secure.negotiate(&acceptor).await.map(|()| secure.info().cloned()),
                    SocketStream::Plain(_) => Ok(None),
                }
            };
            match negotiated {
                Ok(Some(info)) => {
                    let _ = self.ssl.set(info);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(connection_id = %self.connection, error = %e, "Dropping connection after TLS failure");
                    self.close_transport().await;
                    self.release_lease();
                    return;
                }
            }
        }

        let mut credentials = CredentialCache::default();
        loop {
            match self.exchange(&mut credentials).await {
                Ok(Disposition::Recycle) => self.recycle(),
                Ok(Disposition::Close) => break,
                Ok(Disposition::Opaque) => {
                    // The lease stays behind for the WebSocket to take.
                    tracing::debug!(connection_id = %self.connection, "Connection handed to the application");
                    self.services.security.release(self.connection.as_u64());
                    return;
                }
                Err(e) => {
                    if e.is_disconnect() {
                        tracing::trace!(connection_id = %self.connection, error = %e, "Connection ended");
                    } else {
                        tracing::debug!(connection_id = %self.connection, error = %e, "Connection failed");
                    }
                    break;
                }
            }
        }
        self.services.security.release(self.connection.as_u64());
        self.close_transport().await;
        self.release_lease();
    }

    async fn exchange(self: &Arc<Self>, credentials: &mut CredentialCache) -> Result<Disposition> {
        let queue = self.queue.upgrade().ok_or(HttpSysError::HandleEof)?;
        let timeouts = queue.session().map(|s| s.timeouts()).unwrap_or_default();

        let head = match self.read_head(&timeouts).await {
            Ok(head) => head,
            Err(HttpSysError::InvalidHeader(reason)) => {
                tracing::debug!(connection_id = %self.connection, %reason, "Malformed request");
                self.reply_error(400).await;
                return Ok(Disposition::Close);
            }
            Err(e) => return Err(e),
        };
        let Ok(framing) = head.framing() else {
            self.reply_error(400).await;
            return Ok(Disposition::Close);
        };

        let default_host = self.local.to_string();
        let cooked = cook_url(
            &head.raw_url,
            head.headers.get(RequestHeader::Host),
            self.secure,
            &default_host,
        );
        let path = normalize_request_path(&cooked.abs_path);
        let authorization = head.headers.get(RequestHeader::Authorization).map(str::to_string);
        let url_match = queue.match_url(self.port, &path);
        tracing::debug!(
            connection_id = %self.connection,
            verb = %head.verb,
            url = %cooked.full,
            matched = url_match.as_ref().map(|m| m.prefix.as_str()).unwrap_or(""),
            "Request received"
        );
        {
            let mut state = self.state();
            state.status = RequestStatus::Received;
            state.keep_alive = head.keep_alive();
            state.head = Some(head);
            state.cooked = cooked;
            state.framing = framing;
            state.url_match = url_match.clone();
        }

        let Some(url_match) = url_match else {
            self.reply_error(404).await;
            return Ok(Disposition::Close);
        };

        let group_timeouts = url_match.group.timeouts();
        let settings = url_match.group.authentication();
        let authenticator = Authenticator {
            services: &self.services,
            settings: &settings,
            peer: self.peer.ip(),
            connection: self.connection.as_u64(),
            idle_timeout: group_timeouts.idle_connection,
        };
        match authenticator.authenticate(authorization.as_deref(), credentials) {
            AuthOutcome::Challenge(challenge) => return self.reply_challenge(challenge, &group_timeouts).await,
            AuthOutcome::Proceed(info) => {
                let mut state = self.state();
                state.auth = info;
                state.queue_timeout = group_timeouts.request_queue;
            }
        }

        match queue.enqueue_incoming(Arc::clone(self)) {
            Ok(()) => {}
            Err(HttpSysError::ServiceUnavailable) => {
                let reply = service_unavailable(
                    queue.verbosity(),
                    "request queue is full or disabled",
                    &self.services.settings.server_header,
                );
                if let Err(e) = self.write_raw(&reply).await {
                    tracing::debug!(connection_id = %self.connection, error = %e, "Could not send 503");
                }
                return Ok(Disposition::Close);
            }
            Err(e) => return Err(e),
        }

        Ok(self.wait_finished().await)
    }

    async fn read_head(&self, timeouts: &Timeouts) -> Result<RequestHead> {
        loop {
            let idle = {
                let mut state = self.state();
                match parse_head(&state.buffer) {
                    Ok(Some((head, consumed))) => {
                        state.buffer.drain(..consumed);
                        return Ok(head);
                    }
                    Ok(None) => state.buffer.is_empty(),
                    Err(e) => return Err(HttpSysError::InvalidHeader(e.to_string())),
                }
            };
            let timeout = if idle {
                timeouts.idle_connection
            } else {
                timeouts.header_wait
            };
            self.fill(timeout).await?;
        }
    }

    /// One socket read appended to the exchange buffer.
    async fn fill(&self, timeout: Duration) -> Result<usize> {
        let mut chunk = vec![0u8; READ_BUFFER_LEN];
        let n = {
            let mut stream = self.stream.lock().await;
            stream.set_timeout(timeout);
            stream.recv_partial(&mut chunk).await?
        };
        self.state().buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn wait_finished(&self) -> Disposition {
        loop {
            let notified = self.finished.notified();
            if let Some(disposition) = self.state().disposition.take() {
                return disposition;
            }
            notified.await;
        }
    }

    fn finish(&self, disposition: Disposition) {
        self.state().disposition = Some(disposition);
        self.finished.notify_one();
    }

    /// Reset for the next request on a kept-alive connection.
    fn recycle(&self) {
        self.id.store(0, Ordering::Release);
        let mut state = self.state();
        let buffer = std::mem::take(&mut state.buffer);
        *state = Exchange::new(buffer);
    }

    async fn reply_challenge(&self, challenge: String, timeouts: &Timeouts) -> Result<Disposition> {
        let drained = self.drain_body(timeouts.drain_entity_body).await;
        let keep_alive = drained && self.state().keep_alive;

        let body = crate::http::response::error_page(401, error_text(401));
        let mut response = HttpResponse::new(401)
            .with_header(ResponseHeader::WwwAuthenticate, challenge)
            .with_header(ResponseHeader::ContentType, "text/html")
            .with_header(ResponseHeader::ContentLength, body.len().to_string());
        if !keep_alive {
            response.headers.set(ResponseHeader::Connection, "close");
        }
        response.add_default_headers(&self.services.settings.server_header);
        let mut bytes = response.head_bytes();
        bytes.extend_from_slice(body.as_bytes());
        self.write_raw(&bytes).await?;
        metrics::record_response(401, Instant::now());

        Ok(if keep_alive {
            Disposition::Recycle
        } else {
            Disposition::Close
        })
    }

    async fn reply_error(&self, status: u16) {
        let bytes = error_response(status, error_text(status), &self.services.settings.server_header, true);
        match self.write_raw(&bytes).await {
            Ok(()) => metrics::record_response(status, Instant::now()),
            Err(e) => tracing::debug!(connection_id = %self.connection, status, error = %e, "Could not send error page"),
        }
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut stream = self.stream.lock().await;
        stream.send_exact(bytes).await?;
        drop(stream);
        self.state().bytes_written += bytes.len() as u64;
        Ok(())
    }

    async fn close_transport(&self) {
        self.stream.lock().await.shutdown().await;
    }

    // ----- application side -----------------------------------------------

    /// Build the application's view of the request.
    ///
    /// Fails with `MoreData` when `buffer_len` cannot hold it; the request
    /// then stays where it is and can be received again by id.
    pub fn snapshot(&self, flags: ReceiveFlags, buffer_len: usize) -> Result<HttpRequest> {
        let mut state = self.state();
        let head = state
            .head
            .as_ref()
            .ok_or(HttpSysError::InvalidState("request head not received"))?;
        let mut request = HttpRequest {
            request_id: self.id(),
            connection_id: self.connection.as_u64(),
            url_context: state.url_match.as_ref().map_or(0, |m| m.context),
            version: head.version,
            verb: head.verb.clone(),
            raw_url: head.raw_url.clone(),
            cooked_url: state.cooked.clone(),
            headers: head.headers.clone(),
            remote_address: self.peer,
            local_address: self.local,
            ssl_info: self.ssl.get().cloned(),
            auth: state.auth.clone(),
            entity_body: Vec::new(),
            more_entity_body: !state.framing.is_done(),
        };

        let required = request.serialized_len();
        if buffer_len < required {
            return Err(HttpSysError::MoreData {
                required,
                request: self.id(),
            });
        }

        let copy = flags.contains(ReceiveFlags::COPY_BODY) || flags.contains(ReceiveFlags::FLUSH_BODY);
        if copy && !state.framing.is_done() {
            let room = if flags.contains(ReceiveFlags::FLUSH_BODY) {
                usize::MAX
            } else {
                buffer_len - required
            };
            if let Some(body) = state.take_body(room).or_else(ignore_eof)? {
                request.entity_body = body;
            }
            request.more_entity_body = !state.framing.is_done();
        }
        Ok(request)
    }

    /// Read the next piece of entity body. `HandleEof` once it is exhausted.
    pub async fn receive_entity_body(&self, buffer_len: usize) -> Result<Vec<u8>> {
        if buffer_len == 0 {
            return Err(HttpSysError::InvalidParameter("zero length body buffer"));
        }
        self.ensure_readable()?;
        let timeout = self.state().timeouts().entity_body;
        loop {
            if let Some(data) = self.state().take_body(buffer_len)? {
                return Ok(data);
            }
            self.fill(timeout).await?;
        }
    }

    /// Overlapped body read. `done` runs on whichever task completes it.
    pub fn receive_entity_body_overlapped<F>(self: &Arc<Self>, buffer_len: usize, done: F)
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        if buffer_len == 0 {
            return done(Err(HttpSysError::InvalidParameter("zero length body buffer")));
        }
        if let Err(e) = self.ensure_readable() {
            return done(Err(e));
        }
        let taken = self.state().take_body(buffer_len);
        match taken {
            Ok(Some(data)) => done(Ok(data)),
            Err(e) => done(Err(e)),
            Ok(None) => {
                let request = Arc::clone(self);
                recv_overlapped(self.stream(), READ_BUFFER_LEN, move |read| match read {
                    Ok(bytes) => {
                        request.state().buffer.extend_from_slice(&bytes);
                        request.receive_entity_body_overlapped(buffer_len, done);
                    }
                    Err(e) => done(Err(e.into())),
                });
            }
        }
    }

    fn ensure_readable(&self) -> Result<()> {
        match self.status() {
            RequestStatus::Reading | RequestStatus::Answering => Ok(()),
            RequestStatus::Cancelled => Err(HttpSysError::ConnectionAborted),
            _ => Err(HttpSysError::InvalidState("request body is no longer readable")),
        }
    }

    /// Discard unread body. False if the connection cannot be reused.
    async fn drain_body(&self, limit: Duration) -> bool {
        let drain = async {
            loop {
                match self.receive_entity_body_unchecked().await {
                    Ok(_) => {}
                    Err(HttpSysError::HandleEof) => return true,
                    Err(_) => return false,
                }
            }
        };
        tokio::time::timeout(limit, drain).await.unwrap_or(false)
    }

    async fn receive_entity_body_unchecked(&self) -> Result<Vec<u8>> {
        let timeout = self.state().timeouts().drain_entity_body;
        loop {
            if let Some(data) = self.state().take_body(READ_BUFFER_LEN)? {
                return Ok(data);
            }
            self.fill(timeout).await?;
        }
    }

    /// Send the status line, headers and any chunks given.
    ///
    /// Without `MORE_DATA` the exchange is complete afterwards and the
    /// connection is recycled or closed.
    pub async fn send_response(self: &Arc<Self>, mut response: HttpResponse, flags: SendFlags) -> Result<u64> {
        let (keep_alive, version, head_only, group, started, timeouts) = {
            let mut state = self.state();
            match state.status {
                RequestStatus::Reading | RequestStatus::Answering => {}
                RequestStatus::Cancelled => return Err(HttpSysError::ConnectionAborted),
                _ => return Err(HttpSysError::InvalidState("response already sent")),
            }
            state.status = RequestStatus::Answering;
            let head = state.head.as_ref();
            (
                state.keep_alive,
                head.map(|h| h.version).unwrap_or_default(),
                head.is_some_and(|h| h.verb == Verb::Head),
                state.url_match.as_ref().map(|m| Arc::clone(&m.group)),
                state.enqueued_at.unwrap_or_else(Instant::now),
                state.timeouts(),
            )
        };
        let queue = self.queue.upgrade().ok_or(HttpSysError::HandleEof)?;
        let sources = resolve_chunks(&response.chunks, queue.fragments()).await?;
        let total: u64 = sources.iter().map(EntitySource::len).sum();
        let more = flags.contains(SendFlags::MORE_DATA);
        let opaque = flags.contains(SendFlags::OPAQUE);

        let mut keep_alive = keep_alive && !flags.contains(SendFlags::DISCONNECT);
        if !opaque && !self.state().framing.is_done() && !self.drain_body(timeouts.drain_entity_body).await {
            keep_alive = false;
        }

        response.add_default_headers(&self.services.settings.server_header);
        if response.status == 401 && response.headers.get(ResponseHeader::WwwAuthenticate).is_none() {
            if let Some(group) = &group {
                let settings = group.authentication();
                for challenge in challenges(&settings, &self.services) {
                    response.headers.add_unknown("WWW-Authenticate", challenge);
                }
            }
        }
        if !opaque {
            if !response.has_framing() {
                if more {
                    // Nothing else delimits the body.
                    keep_alive = false;
                } else {
                    response.headers.set(ResponseHeader::ContentLength, total.to_string());
                }
            }
            if !keep_alive {
                response.headers.set(ResponseHeader::Connection, "close");
            } else if version == HttpVersion::HTTP_1_0 {
                response.headers.set(ResponseHeader::Connection, "keep-alive");
            }
        }
        {
            let mut state = self.state();
            state.keep_alive = keep_alive;
            state.status = RequestStatus::Writing;
        }

        let head = response.head_bytes();
        let send_timeout = timeouts.send_timeout(head.len() + total as usize);
        let result = async {
            let mut stream = self.stream.lock().await;
            stream.set_timeout(send_timeout);
            stream.send_exact(&head).await?;
            let mut written = head.len() as u64;
            if !head_only {
                written += write_sources(&mut stream, &sources).await?;
            }
            Ok::<u64, HttpSysError>(written)
        }
        .await;

        match result {
            Ok(written) => {
                self.state().bytes_written += written;
                metrics::record_response(response.status, started);
                tracing::debug!(
                    request_id = %self.id(),
                    status = response.status,
                    bytes = written,
                    keep_alive,
                    "Response sent"
                );
                if !more {
                    self.complete(flags);
                }
                Ok(written)
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Send more entity body after a `MORE_DATA` response.
    pub async fn send_entity_body(self: &Arc<Self>, chunks: &[DataChunk], flags: SendFlags) -> Result<u64> {
        if self.status() != RequestStatus::Writing {
            return Err(HttpSysError::InvalidState("no response in progress"));
        }
        let queue = self.queue.upgrade().ok_or(HttpSysError::HandleEof)?;
        let sources = resolve_chunks(chunks, queue.fragments()).await?;
        let total: u64 = sources.iter().map(EntitySource::len).sum();
        let timeout = self.state().timeouts().send_timeout(total as usize);

        let result = async {
            let mut stream = self.stream.lock().await;
            stream.set_timeout(timeout);
            write_sources(&mut stream, &sources).await
        }
        .await;
        match result {
            Ok(written) => {
                self.state().bytes_written += written;
                if !flags.contains(SendFlags::MORE_DATA) {
                    self.complete(flags);
                }
                Ok(written)
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    fn complete(self: &Arc<Self>, flags: SendFlags) {
        if flags.contains(SendFlags::OPAQUE) {
            // Stays in servicing until a WebSocket claims it.
            self.set_status(RequestStatus::Opaque);
            self.finish(Disposition::Opaque);
            return;
        }
        let keep_alive = {
            let mut state = self.state();
            state.status = RequestStatus::Serviced;
            state.keep_alive && !flags.contains(SendFlags::DISCONNECT)
        };
        if let Some(queue) = self.queue.upgrade() {
            queue.release_request(self);
        }
        self.finish(if keep_alive {
            Disposition::Recycle
        } else {
            Disposition::Close
        });
    }

    fn fail(self: &Arc<Self>) {
        self.state().keep_alive = false;
        self.set_status(RequestStatus::Cancelled);
        if let Some(queue) = self.queue.upgrade() {
            queue.release_request(self);
        }
        self.finish(Disposition::Close);
    }

    /// Close the connection under whoever is using it.
    pub fn abort(&self) {
        let upgraded = {
            let mut state = self.state();
            let upgraded = state.status == RequestStatus::Opaque;
            state.status = RequestStatus::Cancelled;
            state.keep_alive = false;
            state.disposition = Some(Disposition::Close);
            upgraded
        };
        self.abort.abort();
        self.finished.notify_one();
        // An upgraded connection no longer has a task of its own.
        if upgraded {
            self.release_lease();
        }
    }

    /// Answer 503 in the background and close.
    pub(crate) fn reject_unavailable(self: &Arc<Self>, verbosity: Verbosity) {
        self.set_status(RequestStatus::Cancelled);
        let reply = service_unavailable(
            verbosity,
            "request waited too long in the queue",
            &self.services.settings.server_header,
        );
        let request = Arc::clone(self);
        send_overlapped(self.stream(), reply, move |sent| {
            if let Err(e) = sent {
                tracing::debug!(connection_id = %request.connection, error = %e, "Could not send 503");
            }
            request.finish(Disposition::Close);
        });
    }

    fn state(&self) -> MutexGuard<'_, Exchange> {
        lock(&self.state)
    }
}

fn ignore_eof(e: HttpSysError) -> Result<Option<Vec<u8>>> {
    match e {
        HttpSysError::HandleEof => Ok(None),
        other => Err(other),
    }
}

async fn write_sources(stream: &mut SocketStream, sources: &[EntitySource]) -> Result<u64> {
    let mut written = 0u64;
    for source in sources {
        match source {
            EntitySource::Bytes(data) => {
                stream.send_exact(data).await?;
                written += data.len() as u64;
            }
            EntitySource::File { path, offset, length } => {
                let mut file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| HttpSysError::NotFound(format!("{}: {e}", path.display())))?;
                file.seek(std::io::SeekFrom::Start(*offset))
                    .await
                    .map_err(|_| HttpSysError::ConnectionAborted)?;
                let mut block = vec![0u8; FILE_BLOCK_SIZE];
                let mut remaining = *length;
                while remaining > 0 {
                    let want = remaining.min(FILE_BLOCK_SIZE as u64) as usize;
                    let n = file
                        .read(&mut block[..want])
                        .await
                        .map_err(|_| HttpSysError::ConnectionAborted)?;
                    if n == 0 {
                        return Err(HttpSysError::HandleEof);
                    }
                    stream.send_exact(&block[..n]).await?;
                    remaining -= n as u64;
                    written += n as u64;
                }
            }
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use crate::config::{Registry, RegistryStore};
    use crate::net::stream::PlainStream;

    fn request() -> (Arc<Request>, DuplexStream) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let addr = SocketAddr::from(([127, 0, 0, 1], 8080));
        let stream = SocketStream::Plain(PlainStream::new(server, addr, addr, Duration::from_secs(2)));
        let services = Arc::new(Services::new(Arc::new(RegistryStore::new(Registry::default()))));
        (
            Request::new(stream, ConnectionId::new(), 8080, Weak::new(), services),
            client,
        )
    }

    async fn received(request: &Arc<Request>) {
        let head = request.read_head(&Timeouts::default()).await.unwrap();
        let mut state = request.state();
        state.framing = head.framing().unwrap();
        state.cooked = cook_url(&head.raw_url, head.headers.get(RequestHeader::Host), false, "local");
        state.head = Some(head);
        state.status = RequestStatus::Reading;
    }

    #[tokio::test]
    async fn head_arriving_in_pieces_is_parsed() {
        let (request, mut client) = request();
        let writer = tokio::spawn(async move {
            client.write_all(b"GET /app/users?x=1 HTTP/1.1\r\nHo").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"st: example\r\n\r\n").await.unwrap();
            client
        });
        received(&request).await;
        let snapshot = request.snapshot(ReceiveFlags::NONE, 4096).unwrap();
        assert_eq!(snapshot.verb, Verb::Get);
        assert_eq!(snapshot.cooked_url.full, "http://example/app/users?x=1");
        assert!(!snapshot.more_entity_body);
        let _client = writer.await.unwrap();
    }

    #[tokio::test]
    async fn small_buffer_reports_required_length() {
        let (request, mut client) = request();
        client.write_all(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();
        received(&request).await;
        let err = request.snapshot(ReceiveFlags::NONE, 10).unwrap_err();
        let HttpSysError::MoreData { required, .. } = err else {
            panic!("expected MoreData");
        };
        assert!(required > REQUEST_BLOCK_LEN);
        assert!(request.snapshot(ReceiveFlags::NONE, required).is_ok());
    }

    #[tokio::test]
    async fn copy_body_takes_buffered_bytes() {
        let (request, mut client) = request();
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello")
            .await
            .unwrap();
        received(&request).await;
        let snapshot = request.snapshot(ReceiveFlags::COPY_BODY, 8192).unwrap();
        assert_eq!(snapshot.entity_body, b"hello");
        assert!(snapshot.more_entity_body);

        client.write_all(b"world").await.unwrap();
        assert_eq!(request.receive_entity_body(100).await.unwrap(), b"world");
        assert_eq!(request.receive_entity_body(100).await, Err(HttpSysError::HandleEof));
        assert_eq!(request.bytes_read(), 10);
    }

    #[tokio::test]
    async fn chunked_body_is_dechunked() {
        let (request, mut client) = request();
        client
            .write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n")
            .await
            .unwrap();
        received(&request).await;
        let mut body = Vec::new();
        loop {
            match request.receive_entity_body(3).await {
                Ok(data) => body.extend(data),
                Err(HttpSysError::HandleEof) => break,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(body, b"Wikipedia");
    }

    #[tokio::test]
    async fn overlapped_body_read_completes_later() {
        let (request, mut client) = request();
        client
            .write_all(b"PUT / HTTP/1.1\r\nContent-Length: 3\r\n\r\n")
            .await
            .unwrap();
        received(&request).await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        request.receive_entity_body_overlapped(16, move |result| {
            let _ = tx.send(result);
        });
        client.write_all(b"abc").await.unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), b"abc");
    }

    #[tokio::test]
    async fn malformed_head_is_invalid_header() {
        let (request, mut client) = request();
        client.write_all(b"GARBAGE\r\n\r\n").await.unwrap();
        let err = request.read_head(&Timeouts::default()).await.unwrap_err();
        assert!(matches!(err, HttpSysError::InvalidHeader(_)));
    }

    #[tokio::test]
    async fn abort_cancels_and_wakes_reader() {
        let (request, _client) = request();
        let reader = {
            let request = Arc::clone(&request);
            tokio::spawn(async move { request.fill(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        request.abort();
        assert!(reader.await.unwrap().is_err());
        assert_eq!(request.status(), RequestStatus::Cancelled);
    }
}
