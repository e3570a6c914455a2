//! Failed-logon throttling per peer address.
//!
//! Each peer gets a token bucket holding `max_per_minute` failures that
//! refills continuously. While the bucket is empty, Basic logons from that
//! peer fail without reaching the credential provider.

use std::net::IpAddr;
use std::time::Instant;

use dashmap::DashMap;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, capacity: f64, per_second: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_second).min(capacity);
        self.last_update = now;
    }
}

#[derive(Debug)]
pub struct LogonThrottle {
    buckets: DashMap<IpAddr, TokenBucket>,
    capacity: f64,
    per_second: f64,
}

impl LogonThrottle {
    /// Zero disables throttling.
    pub fn new(max_per_minute: u32) -> Self {
        let capacity = f64::from(max_per_minute);
        Self {
            buckets: DashMap::new(),
            capacity,
            per_second: capacity / 60.0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0.0
    }

    /// False while `peer` has used up its failures.
    pub fn allows(&self, peer: IpAddr) -> bool {
        if !self.is_enabled() {
            return true;
        }
        match self.buckets.get_mut(&peer) {
            Some(mut bucket) => {
                bucket.refill(self.capacity, self.per_second);
                bucket.tokens >= 1.0
            }
            None => true,
        }
    }

    pub fn record_failure(&self, peer: IpAddr) {
        if !self.is_enabled() {
            return;
        }
        let mut bucket = self
            .buckets
            .entry(peer)
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.refill(self.capacity, self.per_second);
        bucket.tokens = (bucket.tokens - 1.0).max(0.0);
        if bucket.tokens < 1.0 {
            tracing::warn!(peer = %peer, "Failed logon limit reached, throttling peer");
        }
    }

    /// A success clears the peer's history.
    pub fn record_success(&self, peer: IpAddr) {
        self.buckets.remove(&peer);
    }
}

impl Default for LogonThrottle {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn throttles_after_limit_per_peer() {
        let throttle = LogonThrottle::new(3);
        for _ in 0..3 {
            assert!(throttle.allows(peer(1)));
            throttle.record_failure(peer(1));
        }
        assert!(!throttle.allows(peer(1)));
        assert!(throttle.allows(peer(2)));
    }

    #[test]
    fn success_resets() {
        let throttle = LogonThrottle::new(1);
        throttle.record_failure(peer(1));
        assert!(!throttle.allows(peer(1)));
        throttle.record_success(peer(1));
        assert!(throttle.allows(peer(1)));
    }

    #[test]
    fn zero_disables() {
        let throttle = LogonThrottle::new(0);
        for _ in 0..100 {
            throttle.record_failure(peer(1));
        }
        assert!(throttle.allows(peer(1)));
    }
}
