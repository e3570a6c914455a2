//! Opaque handle table.
//!
//! Maps integer tokens handed out across the API boundary to the typed
//! objects behind them (session, queue, URL group, request).
//!
//! # Design Decisions
//! - The stored value is an enum, so the variant is the type tag and a
//!   lookup for the wrong kind simply does not match
//! - Handle values come from a counter seeded at a random offset and are
//!   never reissued while occupied; a removed value is not handed out
//!   again until the counter wraps, so stale handles fail lookup
//! - The table lock is held only for the map operation itself

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::error::{HttpSysError, Result};
use crate::http::request::Request;
use crate::queue::RequestQueue;
use crate::session::url_group::UrlGroup;
use crate::session::ServerSession;

/// Upper bound of the random starting offset.
const HANDLE_SEED_RANGE: u64 = 0x07FF;

/// An opaque token for an object owned by the table. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    ServerSession,
    RequestQueue,
    UrlGroup,
    Request,
}

/// A typed reference stored in the table.
#[derive(Clone)]
pub enum HandleObject {
    ServerSession(Arc<ServerSession>),
    RequestQueue(Arc<RequestQueue>),
    UrlGroup(Arc<UrlGroup>),
    Request(Arc<Request>),
}

impl HandleObject {
    pub fn kind(&self) -> HandleKind {
        match self {
            HandleObject::ServerSession(_) => HandleKind::ServerSession,
            HandleObject::RequestQueue(_) => HandleKind::RequestQueue,
            HandleObject::UrlGroup(_) => HandleKind::UrlGroup,
            HandleObject::Request(_) => HandleKind::Request,
        }
    }
}

/// Objects that can live behind a handle.
pub trait Handled: Sized {
    const KIND: HandleKind;

    fn into_object(this: Arc<Self>) -> HandleObject;

    fn from_object(object: &HandleObject) -> Option<Arc<Self>>;
}

macro_rules! handled {
    ($ty:ty, $variant:ident) => {
        impl Handled for $ty {
            const KIND: HandleKind = HandleKind::$variant;

            fn into_object(this: Arc<Self>) -> HandleObject {
                HandleObject::$variant(this)
            }

            fn from_object(object: &HandleObject) -> Option<Arc<Self>> {
                match object {
                    HandleObject::$variant(inner) => Some(Arc::clone(inner)),
                    _ => None,
                }
            }
        }
    };
}

handled!(ServerSession, ServerSession);
handled!(RequestQueue, RequestQueue);
handled!(UrlGroup, UrlGroup);
handled!(Request, Request);

struct TableInner {
    next: u64,
    limit: u64,
    entries: HashMap<u64, HandleObject>,
}

/// Process-wide registry of live handles.
pub struct HandleTable {
    inner: Mutex<TableInner>,
}

impl HandleTable {
    pub fn new() -> Self {
        let seed = rand::thread_rng().gen_range(0..HANDLE_SEED_RANGE);
        Self::with_limit(seed, u64::from(u32::MAX))
    }

    /// Table issuing handles in `1..=limit`, starting after `seed`.
    pub(crate) fn with_limit(seed: u64, limit: u64) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next: seed % limit.max(1),
                limit: limit.max(1),
                entries: HashMap::new(),
            }),
        }
    }

    /// Register an object and return its new handle.
    pub fn create<T: Handled>(&self, object: Arc<T>) -> Result<Handle> {
        let mut inner = self.lock();
        let limit = inner.limit;
        for _ in 0..limit {
            inner.next = inner.next % limit + 1;
            let candidate = inner.next;
            if !inner.entries.contains_key(&candidate) {
                inner.entries.insert(candidate, T::into_object(object));
                tracing::trace!(handle = candidate, kind = ?T::KIND, "Handle created");
                return Ok(Handle(candidate));
            }
        }
        tracing::error!(live = inner.entries.len(), "Handle space exhausted");
        Err(HttpSysError::HandleSpaceExhausted)
    }

    /// Resolve a handle to an object of the expected kind.
    pub fn lookup<T: Handled>(&self, handle: Handle) -> Option<Arc<T>> {
        if handle.is_null() {
            return None;
        }
        let inner = self.lock();
        inner.entries.get(&handle.0).and_then(T::from_object)
    }

    /// Like [`lookup`](Self::lookup) but fails with `InvalidParameter`.
    pub fn resolve<T: Handled>(&self, handle: Handle) -> Result<Arc<T>> {
        self.lookup(handle)
            .ok_or(HttpSysError::InvalidParameter("invalid handle"))
    }

    pub fn kind_of(&self, handle: Handle) -> Option<HandleKind> {
        self.lock().entries.get(&handle.0).map(HandleObject::kind)
    }

    /// Drop a handle. Returns false if it was not live.
    pub fn remove(&self, handle: Handle) -> bool {
        let removed = self.lock().entries.remove(&handle.0);
        if removed.is_some() {
            tracing::trace!(handle = handle.0, "Handle removed");
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableInner> {
        // The map stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ServerSession;

    fn session() -> Arc<ServerSession> {
        ServerSession::new(Default::default())
    }

    #[test]
    fn lookup_matches_only_the_created_kind() {
        let table = HandleTable::new();
        let handle = table.create(session()).unwrap();

        assert!(!handle.is_null());
        assert!(table.lookup::<ServerSession>(handle).is_some());
        assert!(table.lookup::<RequestQueue>(handle).is_none());
        assert!(table.lookup::<UrlGroup>(handle).is_none());
        assert!(table.lookup::<Request>(handle).is_none());
        assert_eq!(table.kind_of(handle), Some(HandleKind::ServerSession));
    }

    #[test]
    fn removed_handle_never_resolves() {
        let table = HandleTable::new();
        let handle = table.create(session()).unwrap();

        assert!(table.remove(handle));
        assert!(!table.remove(handle));
        assert!(table.lookup::<ServerSession>(handle).is_none());
        assert_eq!(
            table.resolve::<ServerSession>(handle).err(),
            Some(HttpSysError::InvalidParameter("invalid handle"))
        );
    }

    #[test]
    fn removed_value_is_not_reissued_immediately() {
        let table = HandleTable::new();
        let first = table.create(session()).unwrap();
        table.remove(first);
        let second = table.create(session()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn counter_skips_occupied_values_when_wrapping() {
        let table = HandleTable::with_limit(0, 3);
        let a = table.create(session()).unwrap();
        let b = table.create(session()).unwrap();
        let c = table.create(session()).unwrap();
        assert_eq!((a.as_raw(), b.as_raw(), c.as_raw()), (1, 2, 3));

        table.remove(b);
        let d = table.create(session()).unwrap();
        assert_eq!(d.as_raw(), 2);
    }

    #[test]
    fn exhaustion_is_an_error_not_a_panic() {
        let table = HandleTable::with_limit(0, 2);
        table.create(session()).unwrap();
        table.create(session()).unwrap();
        assert_eq!(
            table.create(session()).err(),
            Some(HttpSysError::HandleSpaceExhausted)
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn null_handle_is_never_valid() {
        let table = HandleTable::new();
        assert!(table.lookup::<ServerSession>(Handle::NULL).is_none());
    }
}
