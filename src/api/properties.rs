//! Settable and queryable properties of sessions, URL groups and queues.

use crate::error::{HttpSysError, Result};
use crate::handles::Handle;
use crate::queue::{RequestQueue, Verbosity};
use crate::session::policy::{AuthSettings, TimeoutKind, Timeouts};
use crate::session::{ServerSession, UrlGroup};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    /// Enabled state.
    State(bool),
    Timeouts(Timeouts),
    /// A single timeout in seconds (bytes per second for `MinSendRate`).
    Timeout(TimeoutKind, u32),
    Authentication(AuthSettings),
    /// Queue a URL group delivers to; a null handle unbinds.
    Binding(Handle),
    QueueLength(u32),
    Verbosity(Verbosity),
    /// Session logging level, 0..=3.
    Logging(u8),
    ConnectionLimit(u32),
    EndpointLimit(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyId {
    State,
    Timeouts,
    Timeout(TimeoutKind),
    Authentication,
    Binding,
    QueueLength,
    Verbosity,
    Logging,
    ConnectionLimit,
    EndpointLimit,
}

fn unsupported<T>(target: &'static str) -> Result<T> {
    tracing::debug!(target, "Unsupported property");
    Err(HttpSysError::InvalidParameter("property not supported on this object"))
}

pub(crate) fn set_session(session: &ServerSession, property: Property) -> Result<()> {
    match property {
        Property::State(enabled) => session.set_enabled(enabled),
        Property::Timeouts(timeouts) => session.set_timeouts(timeouts),
        Property::Timeout(kind, value) => session.set_timeout(kind, value),
        Property::Authentication(auth) => session.set_authentication(auth),
        Property::Logging(level) => session.set_logging_level(level),
        Property::ConnectionLimit(max) => session.set_connection_limit(max),
        Property::EndpointLimit(max) => session.set_endpoint_limit(max),
        _ => return unsupported("session"),
    }
    Ok(())
}

pub(crate) fn query_session(session: &ServerSession, id: PropertyId) -> Result<Property> {
    Ok(match id {
        PropertyId::State => Property::State(session.is_enabled()),
        PropertyId::Timeouts => Property::Timeouts(session.timeouts()),
        PropertyId::Timeout(kind) => Property::Timeout(kind, session.timeouts().get(kind)),
        PropertyId::Authentication => Property::Authentication(session.authentication()),
        PropertyId::Logging => Property::Logging(session.logging_level()),
        PropertyId::ConnectionLimit => Property::ConnectionLimit(session.connection_limit()),
        PropertyId::EndpointLimit => Property::EndpointLimit(session.endpoint_limit()),
        _ => return unsupported("session"),
    })
}

/// Binding is handled by the caller, which can resolve queue handles.
pub(crate) fn set_group(group: &UrlGroup, property: Property) -> Result<()> {
    match property {
        Property::State(enabled) => group.set_enabled(enabled),
        Property::Timeouts(timeouts) => group.set_timeouts(timeouts),
        Property::Timeout(kind, value) => group.set_timeout(kind, value),
        Property::Authentication(auth) => group.set_authentication(auth)?,
        _ => return unsupported("url group"),
    }
    Ok(())
}

pub(crate) fn query_group(group: &UrlGroup, id: PropertyId) -> Result<Property> {
    Ok(match id {
        PropertyId::State => Property::State(group.is_enabled()),
        PropertyId::Timeouts => Property::Timeouts(group.timeouts()),
        PropertyId::Timeout(kind) => Property::Timeout(kind, group.timeouts().get(kind)),
        PropertyId::Authentication => Property::Authentication(group.authentication()),
        PropertyId::Binding => Property::Binding(group.queue().map_or(Handle::NULL, |q| q.id())),
        _ => return unsupported("url group"),
    })
}

pub(crate) fn set_queue(queue: &RequestQueue, property: Property) -> Result<()> {
    match property {
        Property::State(enabled) => queue.set_enabled(enabled),
        Property::QueueLength(length) => queue.set_max_length(length)?,
        Property::Verbosity(verbosity) => queue.set_verbosity(verbosity),
        _ => return unsupported("request queue"),
    }
    Ok(())
}

pub(crate) fn query_queue(queue: &RequestQueue, id: PropertyId) -> Result<Property> {
    Ok(match id {
        PropertyId::State => Property::State(queue.is_enabled()),
        PropertyId::QueueLength => Property::QueueLength(queue.max_length()),
        PropertyId::Verbosity => Property::Verbosity(queue.verbosity()),
        _ => return unsupported("request queue"),
    })
}
