//! A small, independent circuit breaker. Each backend client owns one; the
//! client factory's ALB health check and shared-master discovery each own
//! another, separate from any particular backend client's.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    failure_count: u32,
    last_failure: Option<Instant>,
    open: bool,
}

/// Counts consecutive failures; opens once `threshold` is reached; after
/// `timeout` elapses in the open state, allows a single half-open probe
/// through. Any success resets the count and closes the breaker.
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        CircuitBreaker {
            threshold,
            timeout,
            inner: Mutex::new(Inner {
                failure_count: 0,
                last_failure: None,
                open: false,
            }),
        }
    }

    /// Whether a call should be allowed through right now. Call this before
    /// attempting the call; an open breaker past its timeout still reports
    /// `HalfOpen` (allowed) rather than `Open` (refused), and the caller
    /// must follow up with `on_success`/`on_failure` based on the probe.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        if !inner.open {
            return CircuitState::Closed;
        }
        match inner.last_failure {
            Some(last) if last.elapsed() >= self.timeout => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }

    pub fn allow_request(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.open = false;
        inner.last_failure = None;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        if inner.failure_count >= self.threshold {
            inner.open = true;
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), CircuitState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_until_threshold_reached() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn reopens_half_open_after_timeout_elapses() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow_request());
    }
}
