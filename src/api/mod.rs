//! Handle-based operation catalog.
//!
//! # Data Flow
//! ```text
//! caller ──handle──► HandleTable::resolve (type-checked)
//!     → ServerSession / UrlGroup / RequestQueue / Request
//!     → blocking call, or overlapped call completed through the
//!       queue's completion port
//! ```
//!
//! Every handle argument is resolved before use. A handle of the wrong
//! kind, or one that was closed, fails with `InvalidParameter`.

pub mod properties;

use std::ops::BitOr;
use std::sync::{Arc, Mutex};

use crate::context::Services;
use crate::error::{HttpSysError, Result};
use crate::handles::Handle;
use crate::http::request::{HttpRequest, ReceiveFlags, Request};
use crate::http::response::{DataChunk, HttpResponse, SendFlags};
use crate::http::websocket::{WebSocket, WebSocketSettings};
use crate::queue::{
    ByteRange, CachePolicy, CompletionData, CompletionPort, IoOutcome, Overlapped, RequestQueue,
};
use crate::session::{lock, ApiVersion, ServerSession, UrlGroup};

pub use properties::{Property, PropertyId};

/// Flags for `initialize` and `terminate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct InitFlags(u32);

impl InitFlags {
    pub const SERVER: InitFlags = InitFlags(0x1);
    pub const CONFIG: InitFlags = InitFlags(0x2);

    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits == 0 || bits & !0x3 != 0 {
            return Err(HttpSysError::InvalidParameter("initialize flags"));
        }
        Ok(Self(bits))
    }

    pub fn contains(&self, other: InitFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for InitFlags {
    type Output = InitFlags;

    fn bitor(self, rhs: InitFlags) -> InitFlags {
        InitFlags(self.0 | rhs.0)
    }
}

/// One server instance: a session, its groups and its queues.
pub struct HttpSys {
    services: Arc<Services>,
    session: Mutex<Option<Arc<ServerSession>>>,
    queues: Mutex<Vec<Arc<RequestQueue>>>,
}

impl HttpSys {
    pub fn new(services: Services) -> Self {
        Self {
            services: Arc::new(services),
            session: Mutex::new(None),
            queues: Mutex::new(Vec::new()),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    // ----- session ----------------------------------------------------

    /// Create the server session. A second call before `terminate` fails.
    pub fn initialize(&self, version: ApiVersion, flags: InitFlags) -> Result<Handle> {
        let version = version.check()?;
        if flags == InitFlags::default() {
            return Err(HttpSysError::InvalidParameter("initialize flags"));
        }
        let mut current = lock(&self.session);
        if current.is_some() {
            return Err(HttpSysError::AlreadyExists("server session".into()));
        }
        let session = ServerSession::new(version);
        let handle = self.services.handles.create(Arc::clone(&session))?;
        session.set_id(handle);
        *current = Some(session);
        tracing::info!(
            session = %handle,
            ?version,
            "Server session initialized"
        );
        Ok(handle)
    }

    /// Close every group, then every queue, then the session itself.
    /// Terminating without a session is a no-op.
    pub async fn terminate(&self, flags: InitFlags) -> Result<()> {
        if flags == InitFlags::default() {
            return Err(HttpSysError::InvalidParameter("terminate flags"));
        }
        let Some(session) = lock(&self.session).take() else {
            return Ok(());
        };
        for group in session.groups() {
            group.close().await;
        }
        let queues = std::mem::take(&mut *lock(&self.queues));
        for queue in &queues {
            queue.close().await;
        }
        self.services.handles.remove(session.id());
        tracing::info!(session = %session.id(), queues = queues.len(), "Server session terminated");
        Ok(())
    }

    /// The live session.
    pub fn session(&self) -> Result<Arc<ServerSession>> {
        lock(&self.session)
            .clone()
            .ok_or(HttpSysError::InvalidState("not initialized"))
    }

    pub fn set_server_session_property(&self, session: Handle, property: Property) -> Result<()> {
        properties::set_session(&*self.resolve_session(session)?, property)
    }

    pub fn query_server_session_property(&self, session: Handle, id: PropertyId) -> Result<Property> {
        properties::query_session(&*self.resolve_session(session)?, id)
    }

    // ----- request queues ---------------------------------------------

    /// Create a queue. Names are unique, compared case-insensitively.
    pub fn create_request_queue(&self, name: Option<&str>) -> Result<Handle> {
        let session = self.session()?;
        let queue = RequestQueue::new(name, &session, Arc::clone(&self.services));
        let mut queues = lock(&self.queues);
        if queues.iter().any(|q| q.name().eq_ignore_ascii_case(queue.name())) {
            return Err(HttpSysError::AlreadyExists(queue.name().to_string()));
        }
        let handle = self.services.handles.create(Arc::clone(&queue))?;
        queue.set_id(handle);
        queues.push(Arc::clone(&queue));
        tracing::info!(queue = %queue.name(), handle = %handle, "Request queue created");
        Ok(handle)
    }

    /// Stop the queue's listeners and fail its waiters; the handle stays valid.
    pub async fn shutdown_request_queue(&self, queue: Handle) -> Result<()> {
        self.resolve_queue(queue)?.shutdown().await;
        Ok(())
    }

    pub async fn close_request_queue(&self, queue: Handle) -> Result<()> {
        let queue = self.resolve_queue(queue)?;
        lock(&self.queues).retain(|q| !Arc::ptr_eq(q, &queue));
        queue.close().await;
        Ok(())
    }

    pub fn set_request_queue_property(&self, queue: Handle, property: Property) -> Result<()> {
        properties::set_queue(&*self.resolve_queue(queue)?, property)
    }

    pub fn query_request_queue_property(&self, queue: Handle, id: PropertyId) -> Result<Property> {
        properties::query_queue(&*self.resolve_queue(queue)?, id)
    }

    /// Route overlapped completions of this queue to `port`. Once only.
    pub fn associate_completion_port(&self, queue: Handle, port: CompletionPort, key: u64) -> Result<()> {
        self.resolve_queue(queue)?.associate_completion_port(port, key)
    }

    // ----- URL groups -------------------------------------------------

    pub fn create_url_group(&self, session: Handle) -> Result<Handle> {
        let session = self.resolve_session(session)?;
        let group = UrlGroup::new(&session, Arc::clone(&self.services));
        let handle = match self.services.handles.create(Arc::clone(&group)) {
            Ok(handle) => handle,
            Err(e) => {
                session.remove_group(&group);
                return Err(e);
            }
        };
        group.set_id(handle);
        tracing::debug!(group = %handle, "Url group created");
        Ok(handle)
    }

    pub async fn close_url_group(&self, group: Handle) -> Result<()> {
        self.resolve_group(group)?.close().await;
        Ok(())
    }

    pub async fn add_url_to_url_group(&self, group: Handle, url: &str, context: u64) -> Result<()> {
        self.resolve_group(group)?.add_prefix(url, context).await
    }

    /// Remove `url`, or every prefix when `remove_all` is set.
    pub async fn remove_url_from_url_group(&self, group: Handle, url: Option<&str>, remove_all: bool) -> Result<()> {
        self.resolve_group(group)?.remove_prefix(url, remove_all).await
    }

    pub fn set_url_group_property(&self, group: Handle, property: Property) -> Result<()> {
        let group = self.resolve_group(group)?;
        match property {
            Property::Binding(queue) => {
                let queue = if queue.is_null() {
                    None
                } else {
                    Some(self.resolve_queue(queue)?)
                };
                group.bind_queue(queue)
            }
            other => properties::set_group(&group, other),
        }
    }

    pub fn query_url_group_property(&self, group: Handle, id: PropertyId) -> Result<Property> {
        properties::query_group(&*self.resolve_group(group)?, id)
    }

    // ----- request I/O ------------------------------------------------

    /// Receive the next request (`id` null) or re-receive one in servicing.
    pub async fn receive_http_request(
        &self,
        queue: Handle,
        id: Handle,
        flags: ReceiveFlags,
        buffer_len: usize,
        overlapped: Option<Overlapped>,
    ) -> Result<IoOutcome<HttpRequest>> {
        self.resolve_queue(queue)?
            .receive_request(id, flags, buffer_len, overlapped)
            .await
    }

    /// Read entity body. `HandleEof` once it is exhausted.
    pub async fn receive_request_entity_body(
        &self,
        queue: Handle,
        request: Handle,
        buffer_len: usize,
        overlapped: Option<Overlapped>,
    ) -> Result<IoOutcome<Vec<u8>>> {
        let (queue, request) = self.resolve_request(queue, request)?;
        let Some(overlapped) = overlapped else {
            return request.receive_entity_body(buffer_len).await.map(IoOutcome::Complete);
        };
        let association = queue
            .completion()
            .cloned()
            .ok_or(HttpSysError::InvalidParameter("no completion port associated"))?;
        request.receive_entity_body_overlapped(buffer_len, move |result| {
            association.complete(overlapped, result.map(CompletionData::Body));
        });
        Ok(IoOutcome::Pending)
    }

    pub async fn send_http_response(
        &self,
        queue: Handle,
        request: Handle,
        response: HttpResponse,
        flags: SendFlags,
        overlapped: Option<Overlapped>,
    ) -> Result<IoOutcome<u64>> {
        let (queue, request) = self.resolve_request(queue, request)?;
        let Some(overlapped) = overlapped else {
            return request.send_response(response, flags).await.map(IoOutcome::Complete);
        };
        let association = queue
            .completion()
            .cloned()
            .ok_or(HttpSysError::InvalidParameter("no completion port associated"))?;
        tokio::spawn(async move {
            let result = request.send_response(response, flags).await;
            association.complete(overlapped, result.map(CompletionData::Sent));
        });
        Ok(IoOutcome::Pending)
    }

    pub async fn send_response_entity_body(
        &self,
        queue: Handle,
        request: Handle,
        chunks: Vec<DataChunk>,
        flags: SendFlags,
        overlapped: Option<Overlapped>,
    ) -> Result<IoOutcome<u64>> {
        let (queue, request) = self.resolve_request(queue, request)?;
        let Some(overlapped) = overlapped else {
            return request.send_entity_body(&chunks, flags).await.map(IoOutcome::Complete);
        };
        let association = queue
            .completion()
            .cloned()
            .ok_or(HttpSysError::InvalidParameter("no completion port associated"))?;
        tokio::spawn(async move {
            let result = request.send_entity_body(&chunks, flags).await;
            association.complete(overlapped, result.map(CompletionData::Sent));
        });
        Ok(IoOutcome::Pending)
    }

    /// Close the request's connection and drop it from the queue.
    pub fn cancel_http_request(&self, queue: Handle, request: Handle) -> Result<()> {
        let (queue, request) = self.resolve_request(queue, request)?;
        tracing::debug!(queue = %queue.name(), request_id = %request.id(), "Request cancelled");
        queue.remove_request(&request);
        Ok(())
    }

    // ----- fragment cache ---------------------------------------------

    pub fn add_fragment_to_cache(
        &self,
        queue: Handle,
        name: &str,
        data: impl Into<Arc<[u8]>>,
        policy: CachePolicy,
    ) -> Result<()> {
        self.resolve_queue(queue)?.fragments().add(name, data, policy)
    }

    pub fn read_fragment_from_cache(
        &self,
        queue: Handle,
        name: &str,
        range: Option<ByteRange>,
        buffer_len: usize,
    ) -> Result<Vec<u8>> {
        self.resolve_queue(queue)?
            .fragments()
            .read(name, range.unwrap_or_else(ByteRange::whole), buffer_len)
    }

    /// Remove `name`, and with `recursive` every fragment below it.
    pub fn flush_response_cache(&self, queue: Handle, name: &str, recursive: bool) -> Result<usize> {
        self.resolve_queue(queue)?.fragments().flush(name, recursive)
    }

    // ----- WebSocket --------------------------------------------------

    /// Take over a request upgraded with an opaque 101 response.
    pub fn receive_websocket(
        &self,
        queue: Handle,
        request: Handle,
        settings: WebSocketSettings,
    ) -> Result<Arc<WebSocket>> {
        let (queue, request) = self.resolve_request(queue, request)?;
        let socket = WebSocket::accept(Arc::clone(&request), settings)?;
        queue.release_request(&request);
        Ok(socket)
    }

    // ----- handle resolution ------------------------------------------

    fn resolve_session(&self, handle: Handle) -> Result<Arc<ServerSession>> {
        let session = self.services.handles.resolve::<ServerSession>(handle)?;
        match lock(&self.session).as_ref() {
            Some(current) if Arc::ptr_eq(current, &session) => Ok(session),
            _ => Err(HttpSysError::InvalidParameter("stale server session handle")),
        }
    }

    fn resolve_queue(&self, handle: Handle) -> Result<Arc<RequestQueue>> {
        self.services.handles.resolve::<RequestQueue>(handle)
    }

    fn resolve_group(&self, handle: Handle) -> Result<Arc<UrlGroup>> {
        self.services.handles.resolve::<UrlGroup>(handle)
    }

    fn resolve_request(&self, queue: Handle, request: Handle) -> Result<(Arc<RequestQueue>, Arc<Request>)> {
        let queue = self.resolve_queue(queue)?;
        let request = queue.servicing_request(request)?;
        Ok((queue, request))
    }
}
