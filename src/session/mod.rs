//! Server session subsystem.
//!
//! # Data Flow
//! ```text
//! initialize(version)
//!     → ServerSession (one per context)
//!         → url_group.rs (UrlGroup, prefix table, longest match)
//!             → url.rs (prefix parsing, segment compare)
//!             → bound RequestQueue starts/stops listeners per port
//!
//! set property on session
//!     → policy.rs (Timeouts, AuthSettings)
//!     → fan out to every owned UrlGroup
//! ```
//!
//! # Design Decisions
//! - Global properties are copied into groups, so a group always carries
//!   the policy its prefixes were registered under
//! - Connection and endpoint quotas are lock-free counters; 0 = unlimited

pub mod policy;
pub mod url;
pub mod url_group;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{HttpSysError, Result};
use crate::handles::Handle;

pub use policy::{AuthSchemes, AuthSettings, TimeoutKind, Timeouts};
pub use url_group::UrlGroup;

/// API version requested at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion {
    pub major: u16,
    pub minor: u16,
}

impl ApiVersion {
    pub const V1: ApiVersion = ApiVersion { major: 1, minor: 0 };
    pub const V2: ApiVersion = ApiVersion { major: 2, minor: 0 };

    pub fn check(self) -> Result<Self> {
        if self == Self::V1 || self == Self::V2 {
            Ok(self)
        } else {
            Err(HttpSysError::RevisionMismatch {
                major: self.major,
                minor: self.minor,
            })
        }
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        Self::V2
    }
}

#[derive(Debug, Clone)]
struct SessionPolicy {
    timeouts: Timeouts,
    auth: AuthSettings,
}

/// Owner of all URL groups plus global quotas and policy.
pub struct ServerSession {
    id: AtomicU64,
    version: ApiVersion,
    enabled: AtomicBool,
    logging_level: AtomicU8,
    policy: Mutex<SessionPolicy>,
    groups: Mutex<Vec<Arc<UrlGroup>>>,
    connections: AtomicU32,
    max_connections: AtomicU32,
    endpoints: AtomicU32,
    max_endpoints: AtomicU32,
}

impl ServerSession {
    pub fn new(version: ApiVersion) -> Arc<Self> {
        Arc::new(Self {
            id: AtomicU64::new(0),
            version,
            enabled: AtomicBool::new(true),
            logging_level: AtomicU8::new(0),
            policy: Mutex::new(SessionPolicy {
                timeouts: Timeouts::default(),
                auth: AuthSettings::default(),
            }),
            groups: Mutex::new(Vec::new()),
            connections: AtomicU32::new(0),
            max_connections: AtomicU32::new(0),
            endpoints: AtomicU32::new(0),
            max_endpoints: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> Handle {
        Handle::from_raw(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn set_id(&self, handle: Handle) {
        self.id.store(handle.as_raw(), Ordering::Release);
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        for group in self.groups() {
            group.set_enabled(enabled);
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        self.policy().timeouts.clone()
    }

    pub fn set_timeout(&self, kind: TimeoutKind, value: u32) {
        let timeouts = {
            let mut policy = self.policy();
            policy.timeouts.set(kind, value);
            policy.timeouts.clone()
        };
        for group in self.groups() {
            group.set_timeouts(timeouts.clone());
        }
    }

    pub fn set_timeouts(&self, timeouts: Timeouts) {
        self.policy().timeouts = timeouts.clone();
        for group in self.groups() {
            group.set_timeouts(timeouts.clone());
        }
    }

    pub fn authentication(&self) -> AuthSettings {
        self.policy().auth.clone()
    }

    /// Set default authentication. Groups that already hold prefixes keep
    /// their settings.
    pub fn set_authentication(&self, auth: AuthSettings) {
        self.policy().auth = auth.clone();
        for group in self.groups() {
            if let Err(e) = group.set_authentication(auth.clone()) {
                tracing::debug!(group = %group.id(), error = %e, "Group keeps its authentication");
            }
        }
    }

    /// 0 off, 1 errors, 2 info, 3 hex dumps of wire buffers.
    pub fn logging_level(&self) -> u8 {
        self.logging_level.load(Ordering::Relaxed)
    }

    pub fn set_logging_level(&self, level: u8) {
        self.logging_level.store(level.min(3), Ordering::Relaxed);
    }

    pub fn set_connection_limit(&self, max: u32) {
        self.max_connections.store(max, Ordering::Release);
    }

    pub fn connection_limit(&self) -> u32 {
        self.max_connections.load(Ordering::Acquire)
    }

    pub fn set_endpoint_limit(&self, max: u32) {
        self.max_endpoints.store(max, Ordering::Release);
    }

    pub fn endpoint_limit(&self) -> u32 {
        self.max_endpoints.load(Ordering::Acquire)
    }

    /// Admit one connection unless the cap is reached.
    pub fn try_add_connection(&self) -> bool {
        try_increment(&self.connections, &self.max_connections)
    }

    pub fn remove_connection(&self) {
        decrement(&self.connections);
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::Acquire)
    }

    /// Admit one listening endpoint unless the cap is reached.
    pub fn try_add_endpoint(&self) -> bool {
        try_increment(&self.endpoints, &self.max_endpoints)
    }

    pub fn remove_endpoint(&self) {
        decrement(&self.endpoints);
    }

    pub fn endpoint_count(&self) -> u32 {
        self.endpoints.load(Ordering::Acquire)
    }

    pub fn groups(&self) -> Vec<Arc<UrlGroup>> {
        lock(&self.groups).clone()
    }

    pub(crate) fn add_group(&self, group: Arc<UrlGroup>) {
        lock(&self.groups).push(group);
    }

    pub(crate) fn remove_group(&self, group: &UrlGroup) -> bool {
        let mut groups = lock(&self.groups);
        let before = groups.len();
        groups.retain(|g| !std::ptr::eq(Arc::as_ptr(g), group));
        groups.len() != before
    }

    fn policy(&self) -> MutexGuard<'_, SessionPolicy> {
        lock(&self.policy)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn try_increment(counter: &AtomicU32, cap: &AtomicU32) -> bool {
    let max = cap.load(Ordering::Acquire);
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            if max != 0 && current >= max {
                None
            } else {
                Some(current + 1)
            }
        })
        .is_ok()
}

fn decrement(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_check() {
        assert!(ApiVersion::V1.check().is_ok());
        assert!(ApiVersion::V2.check().is_ok());
        assert_eq!(
            ApiVersion { major: 3, minor: 0 }.check(),
            Err(HttpSysError::RevisionMismatch { major: 3, minor: 0 })
        );
    }

    #[test]
    fn connection_cap_admits_until_full() {
        let session = ServerSession::new(ApiVersion::V2);
        session.set_connection_limit(2);
        assert!(session.try_add_connection());
        assert!(session.try_add_connection());
        assert!(!session.try_add_connection());
        session.remove_connection();
        assert!(session.try_add_connection());
        assert_eq!(session.connection_count(), 2);
    }

    #[test]
    fn zero_cap_is_unlimited() {
        let session = ServerSession::new(ApiVersion::V2);
        for _ in 0..1000 {
            assert!(session.try_add_endpoint());
        }
        assert_eq!(session.endpoint_count(), 1000);
    }

    #[test]
    fn decrement_never_underflows() {
        let session = ServerSession::new(ApiVersion::V2);
        session.remove_connection();
        assert_eq!(session.connection_count(), 0);
    }

    #[test]
    fn logging_level_is_clamped() {
        let session = ServerSession::new(ApiVersion::V2);
        session.set_logging_level(9);
        assert_eq!(session.logging_level(), 3);
    }
}
