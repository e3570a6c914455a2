//! Timeout and authentication policy shared by sessions and URL groups.

use std::ops::BitOr;
use std::time::Duration;

use crate::config::schema::TimeoutConfig;
use crate::error::{HttpSysError, Result};

/// No timeout is ever shorter than this.
pub const HTTP_MINIMUM_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// Bytes per second.
pub const DEFAULT_MIN_SEND_RATE: u32 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    EntityBody,
    DrainEntityBody,
    RequestQueue,
    IdleConnection,
    HeaderWait,
    MinSendRate,
}

impl TimeoutKind {
    pub const ALL: [TimeoutKind; 6] = [
        TimeoutKind::EntityBody,
        TimeoutKind::DrainEntityBody,
        TimeoutKind::RequestQueue,
        TimeoutKind::IdleConnection,
        TimeoutKind::HeaderWait,
        TimeoutKind::MinSendRate,
    ];
}

/// Per-kind timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub entity_body: Duration,
    pub drain_entity_body: Duration,
    pub request_queue: Duration,
    pub idle_connection: Duration,
    pub header_wait: Duration,
    pub min_send_rate: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            entity_body: DEFAULT_TIMEOUT,
            drain_entity_body: DEFAULT_TIMEOUT,
            request_queue: DEFAULT_TIMEOUT,
            idle_connection: DEFAULT_TIMEOUT,
            header_wait: DEFAULT_TIMEOUT,
            min_send_rate: DEFAULT_MIN_SEND_RATE,
        }
    }
}

impl Timeouts {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        let mut timeouts = Self::default();
        timeouts.set(TimeoutKind::EntityBody, config.entity_body_secs);
        timeouts.set(TimeoutKind::DrainEntityBody, config.drain_entity_body_secs);
        timeouts.set(TimeoutKind::RequestQueue, config.request_queue_secs);
        timeouts.set(TimeoutKind::IdleConnection, config.idle_connection_secs);
        timeouts.set(TimeoutKind::HeaderWait, config.header_wait_secs);
        timeouts.set(TimeoutKind::MinSendRate, config.min_send_rate);
        timeouts
    }

    /// Set one timeout. Zero restores the default; short values are raised
    /// to the minimum.
    pub fn set(&mut self, kind: TimeoutKind, value: u32) {
        let secs = if value == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_secs(u64::from(value)).max(HTTP_MINIMUM_TIMEOUT)
        };
        match kind {
            TimeoutKind::EntityBody => self.entity_body = secs,
            TimeoutKind::DrainEntityBody => self.drain_entity_body = secs,
            TimeoutKind::RequestQueue => self.request_queue = secs,
            TimeoutKind::IdleConnection => self.idle_connection = secs,
            TimeoutKind::HeaderWait => self.header_wait = secs,
            TimeoutKind::MinSendRate => {
                self.min_send_rate = if value == 0 { DEFAULT_MIN_SEND_RATE } else { value }
            }
        }
    }

    /// Seconds for timeouts, bytes per second for the send rate.
    pub fn get(&self, kind: TimeoutKind) -> u32 {
        let secs = |d: Duration| u32::try_from(d.as_secs()).unwrap_or(u32::MAX);
        match kind {
            TimeoutKind::EntityBody => secs(self.entity_body),
            TimeoutKind::DrainEntityBody => secs(self.drain_entity_body),
            TimeoutKind::RequestQueue => secs(self.request_queue),
            TimeoutKind::IdleConnection => secs(self.idle_connection),
            TimeoutKind::HeaderWait => secs(self.header_wait),
            TimeoutKind::MinSendRate => self.min_send_rate,
        }
    }

    /// Time allowed to send `len` bytes at the minimum send rate.
    pub fn send_timeout(&self, len: usize) -> Duration {
        let rate = u64::from(self.min_send_rate.max(1));
        let at_rate = Duration::from_secs(len as u64 / rate);
        at_rate.max(HTTP_MINIMUM_TIMEOUT)
    }
}

/// Bit set of authentication schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AuthSchemes(u32);

impl AuthSchemes {
    pub const NONE: AuthSchemes = AuthSchemes(0);
    pub const BASIC: AuthSchemes = AuthSchemes(0x01);
    pub const DIGEST: AuthSchemes = AuthSchemes(0x02);
    pub const NTLM: AuthSchemes = AuthSchemes(0x04);
    pub const NEGOTIATE: AuthSchemes = AuthSchemes(0x08);
    pub const KERBEROS: AuthSchemes = AuthSchemes(0x10);

    const ALL_BITS: u32 = 0x1F;

    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL_BITS != 0 {
            return Err(HttpSysError::InvalidParameter("unknown authentication scheme bit"));
        }
        Ok(Self(bits))
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: AuthSchemes) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AuthSchemes {
    type Output = AuthSchemes;

    fn bitor(self, rhs: AuthSchemes) -> AuthSchemes {
        AuthSchemes(self.0 | rhs.0)
    }
}

/// Server-side authentication settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    pub schemes: AuthSchemes,
    pub realm: String,
    pub domain: String,
    /// Keep provider tokens across requests on one connection.
    pub credential_caching: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            schemes: AuthSchemes::NONE,
            realm: String::new(),
            domain: String::new(),
            credential_caching: true,
        }
    }
}

impl AuthSettings {
    pub fn is_enabled(&self) -> bool {
        !self.schemes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_restores_default_and_minimum_applies() {
        let mut timeouts = Timeouts::default();
        timeouts.set(TimeoutKind::HeaderWait, 3);
        assert_eq!(timeouts.header_wait, HTTP_MINIMUM_TIMEOUT);
        timeouts.set(TimeoutKind::HeaderWait, 45);
        assert_eq!(timeouts.get(TimeoutKind::HeaderWait), 45);
        timeouts.set(TimeoutKind::HeaderWait, 0);
        assert_eq!(timeouts.get(TimeoutKind::HeaderWait), 120);
        timeouts.set(TimeoutKind::MinSendRate, 0);
        assert_eq!(timeouts.min_send_rate, DEFAULT_MIN_SEND_RATE);
    }

    #[test]
    fn send_timeout_scales_with_length() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.send_timeout(10), HTTP_MINIMUM_TIMEOUT);
        assert_eq!(timeouts.send_timeout(150 * 60), Duration::from_secs(60));
    }

    #[test]
    fn scheme_bits() {
        let schemes = AuthSchemes::BASIC | AuthSchemes::NTLM;
        assert!(schemes.contains(AuthSchemes::BASIC));
        assert!(!schemes.contains(AuthSchemes::DIGEST));
        assert!(!schemes.contains(AuthSchemes::NONE));
        assert_eq!(schemes.bits(), 0x05);
        assert!(AuthSchemes::from_bits(0x40).is_err());
    }
}
