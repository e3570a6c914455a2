//! Connection identity and per-listener tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing and auth state
//! - Track live connections so a stopping listener can drain them
//! - Close connections that sit between requests when draining starts

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::http::request::{Request, RequestStatus};
use crate::session::{lock, ServerSession};

/// Relaxed ordering is enough; only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Default)]
struct TrackerInner {
    active: Mutex<HashMap<ConnectionId, Arc<Request>>>,
    emptied: Notify,
}

/// Live connections of one listener.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection. The returned guard forgets it on drop.
    pub fn track(&self, request: &Arc<Request>) -> ConnectionGuard {
        let id = request.connection_id();
        lock(&self.inner.active).insert(id, Arc::clone(request));
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    /// Close connections waiting for their next request head.
    pub fn close_idle(&self) -> usize {
        let idle: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|request| request.status() == RequestStatus::Created)
            .collect();
        for request in &idle {
            request.abort();
        }
        idle.len()
    }

    /// Close everything still open.
    pub fn abort_all(&self) -> usize {
        let active = self.snapshot();
        for request in &active {
            request.abort();
        }
        active.len()
    }

    /// Aborting may drop a lease, which takes the map lock again.
    fn snapshot(&self) -> Vec<Arc<Request>> {
        lock(&self.inner.active).values().cloned().collect()
    }

    /// Wait until no connection is left. False if `limit` passed first.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let drained = async {
            loop {
                let emptied = self.inner.emptied.notified();
                if self.active_count() == 0 {
                    return;
                }
                emptied.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }
}

/// Keeps a connection registered for as long as its task runs.
pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let empty = {
            let mut active = lock(&self.inner.active);
            active.remove(&self.id);
            active.is_empty()
        };
        if empty {
            self.inner.emptied.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// A connection's claim on its listener and on the session's connection
/// cap. Released on drop, which for an upgraded connection is when the
/// WebSocket pump exits rather than when the HTTP task returns.
pub struct ConnectionLease {
    _guard: ConnectionGuard,
    session: Arc<ServerSession>,
}

impl ConnectionLease {
    /// `session` must already have admitted the connection.
    pub fn new(guard: ConnectionGuard, session: Arc<ServerSession>) -> Self {
        Self { _guard: guard, session }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.session.remove_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Weak;

    use crate::config::{Registry, RegistryStore};
    use crate::context::Services;
    use crate::net::stream::{PlainStream, SocketStream};
    use crate::session::ApiVersion;

    fn idle_request() -> (Arc<Request>, tokio::io::DuplexStream) {
        let (server, client) = tokio::io::duplex(1024);
        let addr = SocketAddr::from(([127, 0, 0, 1], 80));
        let stream = SocketStream::Plain(PlainStream::new(server, addr, addr, Duration::from_secs(5)));
        let services = Arc::new(Services::new(Arc::new(RegistryStore::new(Registry::default()))));
        (Request::new(stream, ConnectionId::new(), 80, Weak::new(), services), client)
    }

    #[test]
    fn connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[tokio::test]
    async fn guards_count_connections() {
        let tracker = ConnectionTracker::new();
        let (first, _c1) = idle_request();
        let (second, _c2) = idle_request();

        let guard1 = tracker.track(&first);
        let guard2 = tracker.track(&second);
        assert_eq!(tracker.active_count(), 2);
        drop(guard1);
        assert_eq!(tracker.active_count(), 1);
        drop(guard2);
        assert!(tracker.wait_idle(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn wait_idle_times_out_while_connections_remain() {
        let tracker = ConnectionTracker::new();
        let (request, _client) = idle_request();
        let _guard = tracker.track(&request);
        assert!(!tracker.wait_idle(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn lease_releases_tracker_and_session_slot() {
        let tracker = ConnectionTracker::new();
        let session = ServerSession::new(ApiVersion::V2);
        let (request, _client) = idle_request();
        assert!(session.try_add_connection());

        let lease = ConnectionLease::new(tracker.track(&request), Arc::clone(&session));
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(session.connection_count(), 1);
        drop(lease);
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(session.connection_count(), 0);
    }

    #[tokio::test]
    async fn idle_connections_are_closed() {
        let tracker = ConnectionTracker::new();
        let (request, _client) = idle_request();
        let guard = tracker.track(&request);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle(Duration::from_secs(5)).await })
        };
        assert_eq!(tracker.close_idle(), 1);
        assert_eq!(request.status(), RequestStatus::Cancelled);
        drop(guard);
        assert!(waiter.await.unwrap());
    }
}
