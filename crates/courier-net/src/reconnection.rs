//! Reconnect backoff for the client heartbeat.
//!
//! The heartbeat asks [`ReconnectState::ready`] before each reconnect attempt.
//! After a failed attempt [`ReconnectState::record_failure`] pushes the next
//! allowed attempt out by an exponentially growing, jittered delay; a
//! successful connect calls [`ReconnectState::reset`].

use std::time::{Duration, Instant};

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first failure. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied after each further failure. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Upper bound on the delay. Default: 30 s.
    pub max_delay: Duration,
    /// Give up after this many consecutive failures (`None` retries forever).
    pub max_attempts: Option<u32>,
    /// Jitter factor (0.0–1.0), applied as ±jitter. Default: 0.25.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            jitter: 0.25,
        }
    }
}

/// Errors produced by the backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    /// The configured attempt limit was reached.
    #[error("gave up after {0} reconnection attempts")]
    MaxAttemptsExhausted(u32),
}

/// Consecutive-failure counter and next-attempt gate.
#[derive(Debug)]
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
    next_attempt_at: Option<Instant>,
}

impl ReconnectState {
    /// Create a new state from the given config.
    pub fn new(config: ReconnectConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current_delay: initial,
            next_attempt_at: None,
        }
    }

    /// Whether a reconnect attempt may be made at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt_at.is_none_or(|at| now >= at)
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        if let Some(max) = self.config.max_attempts {
            if self.attempts >= max {
                return Err(ReconnectError::MaxAttemptsExhausted(self.attempts));
            }
        }

        let base = self.current_delay;
        self.attempts += 1;

        let jittered = if self.config.jitter > 0.0 {
            let factor = rand::rng()
                .random_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.config.backoff_multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Ok(jittered.min(self.config.max_delay))
    }

    /// Record a failed attempt at `now` and return the wait before the next.
    pub fn record_failure(&mut self, now: Instant) -> Result<Duration, ReconnectError> {
        let delay = self.next_delay()?;
        self.next_attempt_at = Some(now + delay);
        Ok(delay)
    }

    /// Forget past failures (called after a successful connect).
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.initial_delay;
        self.next_attempt_at = None;
    }

    /// Consecutive failures so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_no_jitter() -> ReconnectConfig {
        ReconnectConfig {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_sequence_is_exponential() {
        let mut state = ReconnectState::new(config_no_jitter());

        assert_eq!(state.next_delay().unwrap(), Duration::from_secs(1));
        assert_eq!(state.next_delay().unwrap(), Duration::from_secs(2));
        assert_eq!(state.next_delay().unwrap(), Duration::from_secs(4));
        assert_eq!(state.next_delay().unwrap(), Duration::from_secs(8));
    }

    #[test]
    fn test_max_backoff_is_capped() {
        let mut state = ReconnectState::new(config_no_jitter());
        let mut last = Duration::ZERO;
        for _ in 0..15 {
            last = state.next_delay().unwrap();
        }
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn test_max_attempts_exhausted() {
        let mut state = ReconnectState::new(ReconnectConfig {
            max_attempts: Some(2),
            jitter: 0.0,
            ..Default::default()
        });

        assert!(state.next_delay().is_ok());
        assert!(state.next_delay().is_ok());
        assert_eq!(
            state.next_delay(),
            Err(ReconnectError::MaxAttemptsExhausted(2))
        );
    }

    #[test]
    fn test_failure_gates_next_attempt() {
        let mut state = ReconnectState::new(config_no_jitter());
        let now = Instant::now();
        assert!(state.ready(now));

        let delay = state.record_failure(now).unwrap();
        assert_eq!(delay, Duration::from_secs(1));
        assert!(!state.ready(now));
        assert!(!state.ready(now + Duration::from_millis(999)));
        assert!(state.ready(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut state = ReconnectState::new(config_no_jitter());
        let now = Instant::now();
        state.record_failure(now).unwrap();
        state.record_failure(now).unwrap();
        assert_eq!(state.attempts(), 2);

        state.reset();
        assert_eq!(state.attempts(), 0);
        assert!(state.ready(now));
        assert_eq!(state.next_delay().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        for _ in 0..50 {
            let mut state = ReconnectState::new(ReconnectConfig::default());
            let d = state.next_delay().unwrap();
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250));
        }
    }
}
