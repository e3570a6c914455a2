//! Request queue subsystem.
//!
//! # Data Flow
//! ```text
//! Listener accepts → Request parses head
//!     → enqueue_incoming()
//!         ├─ pending overlapped receive? → servicing, completion packet
//!         └─ otherwise → incoming list, wake one waiter
//!
//! Application
//!     → receive_request(id = 0) → head of incoming → servicing (Reading)
//!     → receive_request(id ≠ 0) → continue the same servicing request
//!     → send_response → Request recycles or closes → release_request()
//! ```
//!
//! # Design Decisions
//! - A request is in at most one of {incoming, servicing}
//! - The list lock is never held across an await
//! - The queue owns the port → Listener map; URL groups drive it

pub mod completion;
pub mod fragment;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tokio::sync::Notify;

use crate::context::Services;
use crate::error::{HttpSysError, Result};
use crate::handles::Handle;
use crate::http::request::{HttpRequest, ReceiveFlags, Request, RequestStatus};
use crate::net::listener::{Listener, ListenerSettings};
use crate::observability::metrics;
use crate::session::lock;
use crate::session::policy::Timeouts;
use crate::session::url::UrlPrefix;
use crate::session::url_group::{UrlGroup, UrlMatch};
use crate::session::ServerSession;

pub use completion::{CompletionData, CompletionPacket, CompletionPort, IoOutcome, Overlapped};
pub use fragment::{ByteRange, CachePolicy, FragmentCache};

use completion::Association;

pub const DEFAULT_QUEUE_NAME: &str = "HTTPSYS_DEFAULT_QUEUE";
pub const DEFAULT_QUEUE_LENGTH: u32 = 400;
pub const MAX_QUEUE_LENGTH: u32 = 64_000;

/// How much a 503 reply tells the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Status line only.
    #[default]
    Basic,
    /// Generic error page.
    Limited,
    /// Error page naming the reason.
    Full,
}

struct PendingReceive {
    flags: ReceiveFlags,
    buffer_len: usize,
    overlapped: Overlapped,
}

struct QueueState {
    incoming: VecDeque<Arc<Request>>,
    servicing: Vec<Arc<Request>>,
    pending: VecDeque<PendingReceive>,
    groups: Vec<Weak<UrlGroup>>,
    max_length: usize,
    verbosity: Verbosity,
    enabled: bool,
    shut_down: bool,
}

/// Rendezvous between accepted connections and the application.
pub struct RequestQueue {
    id: AtomicU64,
    name: String,
    services: Arc<Services>,
    session: Weak<ServerSession>,
    state: Mutex<QueueState>,
    arrived: Notify,
    fragments: FragmentCache,
    listeners: tokio::sync::Mutex<HashMap<u16, Listener>>,
    completion: OnceLock<Association>,
}

impl RequestQueue {
    pub fn new(name: Option<&str>, session: &Arc<ServerSession>, services: Arc<Services>) -> Arc<Self> {
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_QUEUE_NAME)
            .to_string();
        Arc::new(Self {
            id: AtomicU64::new(0),
            name,
            services,
            session: Arc::downgrade(session),
            state: Mutex::new(QueueState {
                incoming: VecDeque::new(),
                servicing: Vec::new(),
                pending: VecDeque::new(),
                groups: Vec::new(),
                max_length: DEFAULT_QUEUE_LENGTH as usize,
                verbosity: Verbosity::default(),
                enabled: true,
                shut_down: false,
            }),
            arrived: Notify::new(),
            fragments: FragmentCache::new(),
            listeners: tokio::sync::Mutex::new(HashMap::new()),
            completion: OnceLock::new(),
        })
    }

    pub fn id(&self) -> Handle {
        Handle::from_raw(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn set_id(&self, handle: Handle) {
        self.id.store(handle.as_raw(), Ordering::Release);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn session(&self) -> Option<Arc<ServerSession>> {
        self.session.upgrade()
    }

    pub fn fragments(&self) -> &FragmentCache {
        &self.fragments
    }

    // ----- properties -------------------------------------------------

    pub fn max_length(&self) -> u32 {
        self.state().max_length as u32
    }

    pub fn set_max_length(&self, length: u32) -> Result<()> {
        if length == 0 || length > MAX_QUEUE_LENGTH {
            return Err(HttpSysError::InvalidParameter("queue length out of range"));
        }
        self.state().max_length = length as usize;
        Ok(())
    }

    pub fn verbosity(&self) -> Verbosity {
        self.state().verbosity
    }

    pub fn set_verbosity(&self, verbosity: Verbosity) {
        self.state().verbosity = verbosity;
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state().enabled = enabled;
    }

    /// Associate a completion port. Only one association is ever accepted.
    pub fn associate_completion_port(&self, port: CompletionPort, key: u64) -> Result<()> {
        self.completion
            .set(Association { port, key })
            .map_err(|_| HttpSysError::AlreadyExists("completion port already associated".into()))
    }

    pub(crate) fn completion(&self) -> Option<&Association> {
        self.completion.get()
    }

    pub fn incoming_len(&self) -> usize {
        self.state().incoming.len()
    }

    pub fn servicing_len(&self) -> usize {
        self.state().servicing.len()
    }

    // ----- url groups -------------------------------------------------

    pub(crate) fn attach_group(&self, group: Weak<UrlGroup>) {
        let mut state = self.state();
        state.groups.retain(|g| g.strong_count() > 0);
        state.groups.push(group);
    }

    pub(crate) fn detach_group(&self, group: &UrlGroup) {
        self.state()
            .groups
            .retain(|g| g.strong_count() > 0 && !std::ptr::eq(g.as_ptr(), group));
    }

    fn groups(&self) -> Vec<Arc<UrlGroup>> {
        self.state().groups.iter().filter_map(Weak::upgrade).collect()
    }

    /// Route a normalized path on `port` to the longest registered prefix.
    pub fn match_url(&self, port: u16, path: &str) -> Option<UrlMatch> {
        let mut best: Option<UrlMatch> = None;
        for group in self.groups() {
            if let Some((context, length, prefix)) = group.find_longest(port, path) {
                if length > best.as_ref().map_or(0, |m| m.length) {
                    best = Some(UrlMatch {
                        context,
                        length,
                        prefix,
                        group,
                    });
                    if length == path.len() {
                        break;
                    }
                }
            }
        }
        best
    }

    // ----- listeners --------------------------------------------------

    /// Start a listener for the prefix's port unless one already runs.
    pub(crate) async fn ensure_listener(self: &Arc<Self>, url: &UrlPrefix, timeouts: &Timeouts) -> Result<()> {
        let mut listeners = self.listeners.lock().await;
        if let Some(existing) = listeners.get(&url.port) {
            if existing.is_secure() != url.secure {
                return Err(HttpSysError::AlreadyExists(format!(
                    "port {} is already bound with a different scheme",
                    url.port
                )));
            }
            return Ok(());
        }

        let session = self
            .session()
            .ok_or(HttpSysError::InvalidState("server session is gone"))?;
        let settings = ListenerSettings {
            port: url.port,
            secure: url.secure,
            tls: url.tls.clone(),
            drain_timeout: timeouts.drain_entity_body,
        };
        let listener = Listener::start(settings, Arc::downgrade(self), Arc::clone(&self.services), session).await?;
        listeners.insert(url.port, listener);
        Ok(())
    }

    pub async fn listener_mode(&self, port: u16) -> Option<bool> {
        self.listeners.lock().await.get(&port).map(Listener::is_secure)
    }

    pub async fn listening_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Stop the port's listener if no attached group still uses the port.
    pub(crate) async fn release_port(&self, port: u16) {
        if self.groups().iter().any(|g| g.uses_port(port)) {
            return;
        }
        let listener = self.listeners.lock().await.remove(&port);
        if let Some(listener) = listener {
            listener.stop().await;
        }
    }

    // ----- requests ---------------------------------------------------

    /// Hand a parsed request to the application side.
    pub fn enqueue_incoming(&self, request: Arc<Request>) -> Result<()> {
        let served_pending = {
            let mut state = self.state();
            if state.shut_down {
                return Err(HttpSysError::HandleEof);
            }
            if !state.enabled {
                tracing::debug!(queue = %self.name, "Queue disabled, request dropped");
                return Err(HttpSysError::ServiceUnavailable);
            }
            if state.incoming.len() >= state.max_length {
                metrics::record_queue_rejection(&self.name);
                tracing::warn!(
                    queue = %self.name,
                    max_length = state.max_length,
                    "Request queue full"
                );
                return Err(HttpSysError::ServiceUnavailable);
            }

            let handle = self.services.handles.create(Arc::clone(&request))?;
            request.set_id(handle);
            request.mark_enqueued();

            match state.pending.pop_front() {
                Some(pending) => {
                    request.set_status(RequestStatus::Reading);
                    state.servicing.push(Arc::clone(&request));
                    Some(pending)
                }
                None => {
                    state.incoming.push_back(Arc::clone(&request));
                    None
                }
            }
        };

        metrics::record_request_queued(&self.name);
        tracing::debug!(queue = %self.name, request_id = %request.id(), "Request queued");

        match served_pending {
            Some(pending) => self.complete_receive(&request, pending),
            None => self.arrived.notify_one(),
        }
        Ok(())
    }

    /// Wait for the next request (id zero) or continue one in servicing.
    pub async fn next_request(&self, id: Handle) -> Result<Arc<Request>> {
        if !id.is_null() {
            return self.servicing_request(id);
        }
        loop {
            let arrived = self.arrived.notified();
            let (ready, stale) = {
                let mut state = self.state();
                if state.shut_down {
                    return Err(HttpSysError::HandleEof);
                }
                self.take_next(&mut state)
            };
            self.discard_stale(stale);
            if let Some(request) = ready {
                return Ok(request);
            }
            arrived.await;
        }
    }

    /// Receive a request snapshot, blocking or overlapped.
    pub async fn receive_request(
        &self,
        id: Handle,
        flags: ReceiveFlags,
        buffer_len: usize,
        overlapped: Option<Overlapped>,
    ) -> Result<IoOutcome<HttpRequest>> {
        let Some(overlapped) = overlapped else {
            let request = self.next_request(id).await?;
            return request.snapshot(flags, buffer_len).map(IoOutcome::Complete);
        };

        let association = self
            .completion()
            .ok_or(HttpSysError::InvalidParameter("no completion port associated"))?;
        let pending = PendingReceive {
            flags,
            buffer_len,
            overlapped,
        };

        if !id.is_null() {
            let request = self.servicing_request(id)?;
            association.complete(
                overlapped,
                request
                    .snapshot(flags, buffer_len)
                    .map(|r| CompletionData::Request(Box::new(r))),
            );
            return Ok(IoOutcome::Pending);
        }

        let (ready, stale, pending) = {
            let mut state = self.state();
            if state.shut_down {
                return Err(HttpSysError::HandleEof);
            }
            let (ready, stale) = self.take_next(&mut state);
            let pending = if ready.is_none() {
                state.pending.push_back(pending);
                None
            } else {
                Some(pending)
            };
            (ready, stale, pending)
        };
        self.discard_stale(stale);
        if let (Some(request), Some(pending)) = (ready, pending) {
            self.complete_receive(&request, pending);
        }
        Ok(IoOutcome::Pending)
    }

    /// Look up a request this queue is servicing.
    pub fn servicing_request(&self, id: Handle) -> Result<Arc<Request>> {
        let request = self.services.handles.resolve::<Request>(id)?;
        let state = self.state();
        if state.servicing.iter().any(|r| Arc::ptr_eq(r, &request)) {
            Ok(request)
        } else {
            Err(HttpSysError::InvalidParameter("request is not being serviced by this queue"))
        }
    }

    /// Forget a request without touching its socket. Idempotent.
    pub(crate) fn release_request(&self, request: &Arc<Request>) {
        {
            let mut state = self.state();
            state.incoming.retain(|r| !Arc::ptr_eq(r, request));
            state.servicing.retain(|r| !Arc::ptr_eq(r, request));
        }
        let id = request.id();
        if !id.is_null() {
            self.services.handles.remove(id);
        }
    }

    /// Close the request's connection and forget it. Idempotent.
    pub fn remove_request(&self, request: &Arc<Request>) {
        self.release_request(request);
        request.abort();
    }

    /// Stop listeners, fail waiters and pending receives, drop requests.
    pub async fn shutdown(&self) {
        let (requests, pending) = {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let mut requests: Vec<_> = state.incoming.drain(..).collect();
            requests.append(&mut state.servicing);
            let pending: Vec<_> = state.pending.drain(..).collect();
            (requests, pending)
        };
        self.arrived.notify_waiters();

        if let Some(association) = self.completion() {
            for p in pending {
                association.complete(p.overlapped, Err(HttpSysError::HandleEof));
            }
        }
        for request in &requests {
            self.remove_request(request);
        }

        let listeners: Vec<Listener> = self.listeners.lock().await.drain().map(|(_, l)| l).collect();
        for listener in listeners {
            listener.stop().await;
        }
        tracing::info!(queue = %self.name, dropped = requests.len(), "Request queue shut down");
    }

    /// Shut down, unbind groups and clear the fragment cache.
    pub async fn close(self: &Arc<Self>) {
        self.shutdown().await;
        for group in self.groups() {
            group.close().await;
        }
        self.state().groups.clear();
        self.fragments.clear();
        self.services.handles.remove(self.id());
    }

    fn take_next(&self, state: &mut QueueState) -> (Option<Arc<Request>>, Vec<Arc<Request>>) {
        let mut stale = Vec::new();
        while let Some(request) = state.incoming.pop_front() {
            if request.waited_too_long() {
                stale.push(request);
                continue;
            }
            request.set_status(RequestStatus::Reading);
            state.servicing.push(Arc::clone(&request));
            return (Some(request), stale);
        }
        (None, stale)
    }

    fn discard_stale(&self, stale: Vec<Arc<Request>>) {
        for request in stale {
            tracing::debug!(queue = %self.name, request_id = %request.id(), "Request expired in queue");
            self.release_request(&request);
            request.reject_unavailable(self.verbosity());
        }
    }

    fn complete_receive(&self, request: &Arc<Request>, pending: PendingReceive) {
        let Some(association) = self.completion() else {
            return;
        };
        let result = request
            .snapshot(pending.flags, pending.buffer_len)
            .map(|r| CompletionData::Request(Box::new(r)));
        association.complete(pending.overlapped, result);
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.state)
    }
}
