//! Per-handler circuit breaker.
//!
//! CLOSED -> OPEN after `threshold` consecutive failures. OPEN -> HALF_OPEN
//! once `open_timeout` has elapsed. A single success in HALF_OPEN closes it;
//! a single failure in HALF_OPEN reopens it. Uses `tokio::time::Instant` so
//! tests can drive it deterministically with `tokio::time::pause`/`advance`.

use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct HandlerBreaker {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl HandlerBreaker {
    fn new() -> Self {
        Self { state: State::Closed, consecutive_failures: 0, opened_at: None }
    }
}

/// Tracks one breaker per handler name.
pub struct CircuitBreakerRegistry {
    threshold: u32,
    open_timeout: Duration,
    breakers: DashMap<String, Mutex<HandlerBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, open_timeout: Duration) -> Self {
        Self { threshold, open_timeout, breakers: DashMap::new() }
    }

    /// Whether a call to `handler` may proceed right now. An OPEN breaker
    /// past `open_timeout` transitions to HALF_OPEN and allows exactly the
    /// call that observes the transition.
    pub fn allow(&self, handler: &str) -> bool {
        let entry = self.breakers.entry(handler.to_string()).or_insert_with(|| Mutex::new(HandlerBreaker::new()));
        let mut b = entry.lock().unwrap();
        match b.state {
            State::Closed => true,
            State::HalfOpen => true,
            State::Open => {
                let elapsed = b.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_timeout {
                    b.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self, handler: &str) {
        let entry = self.breakers.entry(handler.to_string()).or_insert_with(|| Mutex::new(HandlerBreaker::new()));
        let mut b = entry.lock().unwrap();
        b.state = State::Closed;
        b.consecutive_failures = 0;
        b.opened_at = None;
    }

    pub fn on_failure(&self, handler: &str) {
        let entry = self.breakers.entry(handler.to_string()).or_insert_with(|| Mutex::new(HandlerBreaker::new()));
        let mut b = entry.lock().unwrap();
        match b.state {
            State::HalfOpen => {
                b.state = State::Open;
                b.opened_at = Some(Instant::now());
            }
            State::Closed => {
                b.consecutive_failures += 1;
                if b.consecutive_failures >= self.threshold {
                    b.state = State::Open;
                    b.opened_at = Some(Instant::now());
                }
            }
            State::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let reg = CircuitBreakerRegistry::new(3, Duration::from_secs(30));
        assert!(reg.allow("h"));
        reg.on_failure("h");
        reg.on_failure("h");
        assert!(reg.allow("h"));
        reg.on_failure("h");
        assert!(!reg.allow("h"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_resets_failure_count() {
        let reg = CircuitBreakerRegistry::new(3, Duration::from_secs(30));
        reg.on_failure("h");
        reg.on_failure("h");
        reg.on_success("h");
        reg.on_failure("h");
        reg.on_failure("h");
        assert!(reg.allow("h"));
    }

    #[tokio::test(start_paused = true)]
    async fn half_opens_after_timeout_and_closes_on_success() {
        let reg = CircuitBreakerRegistry::new(1, Duration::from_secs(30));
        reg.on_failure("h");
        assert!(!reg.allow("h"));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(reg.allow("h"));
        reg.on_success("h");
        assert!(reg.allow("h"));
        reg.on_failure("h");
        assert!(!reg.allow("h"));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_immediately() {
        let reg = CircuitBreakerRegistry::new(1, Duration::from_secs(30));
        reg.on_failure("h");
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(reg.allow("h"));
        reg.on_failure("h");
        assert!(!reg.allow("h"));
    }
}
