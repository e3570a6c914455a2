//! Exponential backoff with jitter for failing accept calls.

use std::time::Duration;

use rand::Rng;

const BASE_DELAY_MS: u64 = 5;
const MAX_DELAY_MS: u64 = 1000;

/// Delay before accept attempt `attempt` (1-based) after consecutive failures.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let capped_delay = base_ms.saturating_mul(exponential_base).min(max_ms);

    // Up to 10% jitter.
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Failure counter for one accept loop.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    failures: u32,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failure and return how long to pause.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        calculate_backoff(self.failures, BASE_DELAY_MS, MAX_DELAY_MS)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_cap() {
        assert_eq!(calculate_backoff(0, 100, 2000), Duration::ZERO);
        assert!(calculate_backoff(1, 100, 2000).as_millis() >= 100);
        assert!(calculate_backoff(2, 100, 2000).as_millis() >= 200);
        let capped = calculate_backoff(10, 100, 1000).as_millis();
        assert!((1000..1100).contains(&capped));
    }

    #[test]
    fn success_resets_the_counter() {
        let mut backoff = AcceptBackoff::new();
        let first = backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.failures(), 2);
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.next_delay() <= first + Duration::from_millis(1));
    }
}
