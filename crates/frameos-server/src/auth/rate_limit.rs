//! Sliding-window limiter for failed handshakes, keyed by remote IP.
//!
//! API keys are long random strings, but nothing stops a client from
//! hammering `hello` with guesses. Only failed handshakes count, so a fleet
//! of frames behind one NAT can all reconnect at once after a restart.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;

/// Failed handshakes allowed per IP within [`HELLO_WINDOW`].
pub const HELLO_ATTEMPTS_PER_WINDOW: usize = 20;
pub const HELLO_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct HelloRateLimiter {
    max_attempts: usize,
    window: Duration,
    attempts: HashMap<IpAddr, VecDeque<Instant>>,
}

impl Default for HelloRateLimiter {
    fn default() -> Self {
        Self::new(HELLO_ATTEMPTS_PER_WINDOW, HELLO_WINDOW)
    }
}

impl HelloRateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: HashMap::new(),
        }
    }

    fn prune(&mut self, ip: IpAddr, now: Instant) -> &mut VecDeque<Instant> {
        let window = self.window;
        let recent = self.attempts.entry(ip).or_default();
        while recent.front().is_some_and(|t| now.duration_since(*t) >= window) {
            recent.pop_front();
        }
        recent
    }

    /// Whether `ip` may attempt a handshake. `false` once it has used up its
    /// failures for the current window.
    pub fn allows(&mut self, ip: IpAddr) -> bool {
        let max = self.max_attempts;
        self.prune(ip, Instant::now()).len() < max
    }

    /// Count a failed handshake against `ip`.
    pub fn record_failure(&mut self, ip: IpAddr) {
        let now = Instant::now();
        self.prune(ip, now).push_back(now);
    }

    /// Forget addresses with no attempts inside the window.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.attempts.retain(|_, recent| {
            recent.retain(|t| now.duration_since(*t) < window);
            !recent.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn failures_are_limited_per_ip_and_recover() {
        let mut limiter = HelloRateLimiter::new(2, Duration::from_secs(60));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.allows(a));
        limiter.record_failure(a);
        assert!(limiter.allows(a));
        limiter.record_failure(a);
        assert!(!limiter.allows(a));
        assert!(limiter.allows(b));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.allows(a));
        limiter.gc();
        assert!(limiter.attempts.is_empty());
    }

    #[test]
    fn successful_handshakes_never_count() {
        let mut limiter = HelloRateLimiter::default();
        let nat: IpAddr = "192.0.2.1".parse().unwrap();
        for _ in 0..(HELLO_ATTEMPTS_PER_WINDOW * 3) {
            assert!(limiter.allows(nat));
        }
    }
}
