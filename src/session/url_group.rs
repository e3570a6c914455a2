//! URL groups: registered prefixes, policy, and listener lifetime.
//!
//! # Responsibilities
//! - Validate and register prefixes (URL ACL, TLS binding, duplicates)
//! - Ask the bound queue to start a listener for each new port
//! - Release ports and detach when prefixes go away
//! - Longest segment-aligned prefix match for incoming requests

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::context::Services;
use crate::error::{HttpSysError, Result};
use crate::handles::Handle;
use crate::queue::RequestQueue;
use crate::session::policy::{AuthSettings, TimeoutKind, Timeouts};
use crate::session::url::UrlPrefix;
use crate::session::{lock, ServerSession};

/// Ordered prefix set. Registration order breaks match ties.
#[derive(Debug, Default, Clone)]
pub struct UrlTable {
    urls: Vec<UrlPrefix>,
}

impl UrlTable {
    pub fn insert(&mut self, url: UrlPrefix) -> Result<()> {
        if self.urls.iter().any(|u| u.key == url.key) {
            return Err(HttpSysError::AlreadyExists(url.key));
        }
        self.urls.push(url);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<UrlPrefix> {
        let pos = self.urls.iter().position(|u| u.key == key)?;
        Some(self.urls.remove(pos))
    }

    pub fn drain(&mut self) -> Vec<UrlPrefix> {
        std::mem::take(&mut self.urls)
    }

    pub fn uses_port(&self, port: u16) -> bool {
        self.urls.iter().any(|u| u.port == port)
    }

    /// Longest segment match on `port`, first registered wins ties.
    pub fn find_longest(&self, port: u16, path: &str) -> Option<(&UrlPrefix, usize)> {
        let mut best: Option<(&UrlPrefix, usize)> = None;
        for url in self.urls.iter().filter(|u| u.port == port) {
            let length = url.match_len(path);
            if length > best.map_or(0, |(_, l)| l) {
                best = Some((url, length));
                if length == path.len() {
                    break;
                }
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UrlPrefix> {
        self.urls.iter()
    }
}

/// Result of routing a request path.
#[derive(Clone)]
pub struct UrlMatch {
    pub context: u64,
    pub length: usize,
    pub prefix: String,
    pub group: Arc<UrlGroup>,
}

struct GroupState {
    timeouts: Timeouts,
    auth: AuthSettings,
    urls: UrlTable,
    queue: Option<Arc<RequestQueue>>,
}

/// A set of prefixes sharing policy, bound to at most one queue.
pub struct UrlGroup {
    id: AtomicU64,
    services: Arc<Services>,
    session: Weak<ServerSession>,
    enabled: AtomicBool,
    closed: AtomicBool,
    state: Mutex<GroupState>,
}

impl UrlGroup {
    /// Create a group inheriting the session's current policy.
    pub fn new(session: &Arc<ServerSession>, services: Arc<Services>) -> Arc<Self> {
        let group = Arc::new(Self {
            id: AtomicU64::new(0),
            services,
            session: Arc::downgrade(session),
            enabled: AtomicBool::new(session.is_enabled()),
            closed: AtomicBool::new(false),
            state: Mutex::new(GroupState {
                timeouts: session.timeouts(),
                auth: session.authentication(),
                urls: UrlTable::default(),
                queue: None,
            }),
        });
        session.add_group(Arc::clone(&group));
        group
    }

    pub fn id(&self) -> Handle {
        Handle::from_raw(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn set_id(&self, handle: Handle) {
        self.id.store(handle.as_raw(), Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn timeouts(&self) -> Timeouts {
        self.state().timeouts.clone()
    }

    pub fn set_timeouts(&self, timeouts: Timeouts) {
        self.state().timeouts = timeouts;
    }

    pub fn set_timeout(&self, kind: TimeoutKind, value: u32) {
        self.state().timeouts.set(kind, value);
    }

    pub fn authentication(&self) -> AuthSettings {
        self.state().auth.clone()
    }

    /// Fails with `AlreadyExists` once any prefix is registered.
    pub fn set_authentication(&self, auth: AuthSettings) -> Result<()> {
        let mut state = self.state();
        if !state.urls.is_empty() {
            return Err(HttpSysError::AlreadyExists(
                "authentication is fixed once prefixes are registered".into(),
            ));
        }
        state.auth = auth;
        Ok(())
    }

    pub fn queue(&self) -> Option<Arc<RequestQueue>> {
        self.state().queue.clone()
    }

    /// Bind the group to a queue, or unbind with `None`.
    pub fn bind_queue(self: &Arc<Self>, queue: Option<Arc<RequestQueue>>) -> Result<()> {
        self.ensure_open()?;
        let previous = {
            let mut state = self.state();
            if !state.urls.is_empty() {
                return Err(HttpSysError::InvalidState("group has registered prefixes"));
            }
            std::mem::replace(&mut state.queue, queue.clone())
        };
        if let Some(previous) = previous {
            previous.detach_group(self);
        }
        if let Some(queue) = queue {
            queue.attach_group(Arc::downgrade(self));
            tracing::debug!(group = %self.id(), queue = %queue.name(), "Group bound to queue");
        }
        Ok(())
    }

    pub fn prefixes(&self) -> Vec<UrlPrefix> {
        self.state().urls.iter().cloned().collect()
    }

    pub fn uses_port(&self, port: u16) -> bool {
        self.state().urls.uses_port(port)
    }

    /// Register a prefix and make sure a listener serves its port.
    pub async fn add_prefix(self: &Arc<Self>, prefix: &str, context: u64) -> Result<()> {
        self.ensure_open()?;
        let mut url = UrlPrefix::parse(prefix, context)?;
        let queue = self
            .queue()
            .ok_or(HttpSysError::InvalidParameter("url group is not bound to a request queue"))?;

        let store = &self.services.config_store;
        if !store.is_url_registered(&url.key) {
            return Err(HttpSysError::AccessDenied(format!("{} is not reserved", url.key)));
        }
        if url.secure {
            let binding = store.ssl_binding(url.port).ok_or_else(|| {
                HttpSysError::InvalidConfiguration(format!(
                    "no certificate bound to port {}",
                    url.port
                ))
            })?;
            url.tls = Some(binding);
        }

        let timeouts = {
            let mut state = self.state();
            state.urls.insert(url.clone())?;
            state.timeouts.clone()
        };

        if let Err(e) = queue.ensure_listener(&url, &timeouts).await {
            self.state().urls.remove(&url.key);
            return Err(e);
        }

        tracing::info!(
            group = %self.id(),
            prefix = %url.key,
            port = url.port,
            context = url.context,
            "Prefix registered"
        );
        Ok(())
    }

    /// Remove one prefix, or all with `remove_all`. An emptied group closes.
    pub async fn remove_prefix(self: &Arc<Self>, prefix: Option<&str>, remove_all: bool) -> Result<()> {
        self.ensure_open()?;
        let (removed, empty) = {
            let mut state = self.state();
            let removed = if remove_all {
                state.urls.drain()
            } else {
                let key = prefix
                    .ok_or(HttpSysError::InvalidParameter("prefix required"))?
                    .to_ascii_lowercase();
                let url = state
                    .urls
                    .remove(&key)
                    .ok_or_else(|| HttpSysError::NotFound(key.clone()))?;
                vec![url]
            };
            (removed, state.urls.is_empty())
        };

        for url in &removed {
            tracing::info!(group = %self.id(), prefix = %url.key, "Prefix removed");
        }
        self.release_ports(&removed).await;

        if empty {
            self.close().await;
        }
        Ok(())
    }

    /// Unregister everything and detach from queue, session and handle table.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (removed, queue) = {
            let mut state = self.state();
            (state.urls.drain(), state.queue.take())
        };
        if let Some(queue) = &queue {
            queue.detach_group(self);
            for port in unique_ports(&removed) {
                queue.release_port(port).await;
            }
        }
        if let Some(session) = self.session.upgrade() {
            session.remove_group(self);
        }
        self.services.handles.remove(self.id());
        tracing::debug!(group = %self.id(), "Url group closed");
    }

    /// Longest match among this group's prefixes; disabled groups never match.
    pub fn find_longest(&self, port: u16, path: &str) -> Option<(u64, usize, String)> {
        if !self.is_enabled() {
            return None;
        }
        let state = self.state();
        state
            .urls
            .find_longest(port, path)
            .map(|(url, length)| (url.context, length, url.key.clone()))
    }

    async fn release_ports(&self, removed: &[UrlPrefix]) {
        if let Some(queue) = self.queue() {
            for port in unique_ports(removed) {
                queue.release_port(port).await;
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(HttpSysError::InvalidParameter("url group is closed"))
        } else {
            Ok(())
        }
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        lock(&self.state)
    }
}

fn unique_ports(urls: &[UrlPrefix]) -> BTreeSet<u16> {
    urls.iter().map(|u| u.port).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::url::normalize_request_path;

    fn table(prefixes: &[(&str, u64)]) -> UrlTable {
        let mut table = UrlTable::default();
        for (prefix, context) in prefixes {
            table.insert(UrlPrefix::parse(prefix, *context).unwrap()).unwrap();
        }
        table
    }

    fn context_for(table: &UrlTable, port: u16, path: &str) -> Option<u64> {
        let path = normalize_request_path(path);
        table.find_longest(port, &path).map(|(u, _)| u.context)
    }

    #[test]
    fn scenario_app_prefix_routes_by_segment() {
        let table = table(&[("http://+:8080/app/", 7)]);
        assert_eq!(context_for(&table, 8080, "/app/users?x=1"), Some(7));
        assert_eq!(context_for(&table, 8080, "/other/"), None);
        assert_eq!(context_for(&table, 8081, "/app/users"), None);
    }

    #[test]
    fn nested_prefix_wins_regardless_of_order() {
        let outer_first = table(&[("http://+:80/a/", 1), ("http://+:80/a/b/", 2)]);
        let inner_first = table(&[("http://+:80/a/b/", 2), ("http://+:80/a/", 1)]);
        for t in [&outer_first, &inner_first] {
            assert_eq!(context_for(t, 80, "/a/b/c"), Some(2));
            assert_eq!(context_for(t, 80, "/a/x"), Some(1));
        }
    }

    #[test]
    fn prefix_is_not_a_substring_match() {
        let table = table(&[("http://+:80/ab/", 1)]);
        assert_eq!(context_for(&table, 80, "/abc/"), None);
    }

    #[test]
    fn first_registered_wins_ties() {
        let table = table(&[("http://+:80/same/", 1), ("http://localhost:80/same/", 2)]);
        assert_eq!(context_for(&table, 80, "/same/x"), Some(1));
    }

    #[test]
    fn duplicates_rejected_case_insensitively() {
        let mut table = table(&[("http://+:80/a/", 1)]);
        let dup = UrlPrefix::parse("HTTP://+:80/A/", 2).unwrap();
        assert!(matches!(table.insert(dup), Err(HttpSysError::AlreadyExists(_))));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn root_prefix_catches_everything_on_its_port() {
        let table = table(&[("http://+:80/", 1), ("http://+:80/api/", 2)]);
        assert_eq!(context_for(&table, 80, "/"), Some(1));
        assert_eq!(context_for(&table, 80, "/static/site.css"), Some(1));
        assert_eq!(context_for(&table, 80, "/api/v1"), Some(2));
    }
}
