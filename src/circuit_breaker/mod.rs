//! Circuit breaker gating connection attempts
//!
//! The breaker is owned by the connection task and driven with explicit
//! `now` instants (tokio's clock), so tests can step it through its states
//! without sleeping.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CircuitState {
    /// Attempts flow through normally
    Closed = 0,
    /// Attempts are rejected until the cooldown elapses
    Open = 1,
    /// One trial attempt is allowed
    HalfOpen = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
        }
    }
}

/// Result of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Breaker stays closed; retrying is allowed
    StillClosed,
    /// This failure opened (or re-opened) the breaker
    Opened,
    /// Breaker was already open; cooldown restarted
    ExtendedOpen,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    /// Consecutive failure count
    failure_count: u32,
    opened_at: Option<Instant>,
    /// Cooldown of the current open window
    cooldown: Duration,
    /// OPEN transitions since the last success
    open_cycles: u32,
    /// Whether the single half-open trial has been handed out
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            cooldown: Duration::ZERO,
            open_cycles: 0,
            trial_in_flight: false,
        }
    }

    /// Current state, applying the OPEN -> HALF_OPEN transition if the
    /// cooldown has elapsed at `now`.
    pub fn state_at(&mut self, now: Instant) -> CircuitState {
        self.check_state_transition(now);
        self.state
    }

    /// Last state without evaluating the cooldown.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Ask for permission to attempt a connection.
    ///
    /// Returns the time left until the next attempt is allowed when the
    /// breaker refuses.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        match self.state_at(now) {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                tracing::info!("Circuit breaker allowing half-open trial attempt");
                Ok(())
            }
            CircuitState::HalfOpen => Err(self.cooldown),
            CircuitState::Open => Err(self.remaining_cooldown(now)),
        }
    }

    /// Time left in the current open window (zero when not open).
    pub fn remaining_cooldown(&self, now: Instant) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                (opened_at + self.cooldown).saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        }
    }

    /// Record a successful connect: closes the breaker and clears counters.
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!(
                previous = %self.state,
                "Circuit breaker closed after successful recovery"
            );
        }
        self.transition_to(CircuitState::Closed);
        self.failure_count = 0;
        self.open_cycles = 0;
    }

    /// Record a failed attempt. `cooldown` is the open window used if this
    /// failure opens the breaker.
    pub fn record_failure(&mut self, now: Instant, cooldown: Duration) -> FailureOutcome {
        self.failure_count = self.failure_count.saturating_add(1);

        match self.state_at(now) {
            CircuitState::Closed => {
                if self.failure_count >= self.config.failure_threshold {
                    self.open(now, cooldown);
                    tracing::warn!(
                        failures = self.failure_count,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "Circuit breaker opened due to failures"
                    );
                    FailureOutcome::Opened
                } else {
                    FailureOutcome::StillClosed
                }
            }
            CircuitState::HalfOpen => {
                self.open(now, cooldown);
                tracing::warn!(
                    failures = self.failure_count,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "Circuit breaker reopened after failure in half-open state"
                );
                FailureOutcome::Opened
            }
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.cooldown = cooldown;
                FailureOutcome::ExtendedOpen
            }
        }
    }

    /// Forget all history (manual disconnect / forced reconnect).
    pub fn reset(&mut self) {
        self.transition_to(CircuitState::Closed);
        self.failure_count = 0;
        self.open_cycles = 0;
    }

    /// Hand back a half-open trial that was cancelled before it finished.
    pub fn abandon_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    /// Forget how many times the breaker has opened, keeping the current
    /// state and cooldown.
    pub fn clear_open_cycles(&mut self) {
        self.open_cycles = 0;
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Number of OPEN transitions since the last success or reset.
    pub fn open_cycles(&self) -> u32 {
        self.open_cycles
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state,
            failure_count: self.failure_count,
            open_cycles: self.open_cycles,
        }
    }

    fn open(&mut self, now: Instant, cooldown: Duration) {
        self.transition_to(CircuitState::Open);
        self.opened_at = Some(now);
        self.cooldown = cooldown;
        self.open_cycles = self.open_cycles.saturating_add(1);
    }

    fn check_state_transition(&mut self, now: Instant) {
        if self.state == CircuitState::Open && self.remaining_cooldown(now).is_zero() {
            self.transition_to(CircuitState::HalfOpen);
            tracing::info!("Circuit breaker transitioning to half-open state");
        }
    }

    fn transition_to(&mut self, new_state: CircuitState) {
        self.state = new_state;
        self.trial_in_flight = false;
        if new_state != CircuitState::Open {
            self.opened_at = None;
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub open_cycles: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: threshold,
        })
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let mut cb = CircuitBreaker::new();
        assert_eq!(cb.state_at(Instant::now()), CircuitState::Closed);
        assert!(cb.try_acquire(Instant::now()).is_ok());
    }

    #[test]
    fn test_circuit_breaker_opens_on_threshold() {
        let mut cb = breaker(3);
        let now = Instant::now();
        let cooldown = Duration::from_secs(4);

        assert_eq!(cb.record_failure(now, cooldown), FailureOutcome::StillClosed);
        assert_eq!(cb.record_failure(now, cooldown), FailureOutcome::StillClosed);
        assert_eq!(cb.state_at(now), CircuitState::Closed);

        assert_eq!(cb.record_failure(now, cooldown), FailureOutcome::Opened);
        assert_eq!(cb.state_at(now), CircuitState::Open);
        assert_eq!(cb.try_acquire(now), Err(cooldown));
        assert_eq!(cb.failure_count(), 3);
        assert_eq!(cb.open_cycles(), 1);
    }

    #[test]
    fn test_open_rejects_until_cooldown_then_half_open() {
        let mut cb = breaker(1);
        let start = Instant::now();
        cb.record_failure(start, Duration::from_millis(500));

        let early = start + Duration::from_millis(200);
        assert_eq!(cb.try_acquire(early), Err(Duration::from_millis(300)));

        let later = start + Duration::from_millis(500);
        assert_eq!(cb.state_at(later), CircuitState::HalfOpen);
        assert!(cb.try_acquire(later).is_ok());
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let mut cb = breaker(1);
        let start = Instant::now();
        cb.record_failure(start, Duration::from_millis(100));

        let after = start + Duration::from_millis(150);
        assert!(cb.try_acquire(after).is_ok());
        assert!(cb.try_acquire(after).is_err());
    }

    #[test]
    fn test_abandoned_trial_can_be_retried() {
        let mut cb = breaker(1);
        let start = Instant::now();
        cb.record_failure(start, Duration::from_millis(100));

        let after = start + Duration::from_millis(100);
        assert!(cb.try_acquire(after).is_ok());
        cb.abandon_trial();
        assert!(cb.try_acquire(after).is_ok());
    }

    #[test]
    fn test_half_open_success_closes_and_resets() {
        let mut cb = breaker(2);
        let start = Instant::now();
        cb.record_failure(start, Duration::from_millis(100));
        cb.record_failure(start, Duration::from_millis(100));

        let after = start + Duration::from_millis(100);
        assert!(cb.try_acquire(after).is_ok());
        cb.record_success();

        assert_eq!(cb.state_at(after), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.open_cycles(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = breaker(1);
        let start = Instant::now();
        cb.record_failure(start, Duration::from_millis(100));

        let trial = start + Duration::from_millis(100);
        assert!(cb.try_acquire(trial).is_ok());
        assert_eq!(
            cb.record_failure(trial, Duration::from_millis(200)),
            FailureOutcome::Opened
        );

        assert_eq!(cb.state_at(trial), CircuitState::Open);
        assert_eq!(cb.remaining_cooldown(trial), Duration::from_millis(200));
        assert_eq!(cb.open_cycles(), 2);
        assert_eq!(cb.failure_count(), 2);
    }

    #[test]
    fn test_success_in_closed_resets_failures() {
        let mut cb = breaker(3);
        let now = Instant::now();
        cb.record_failure(now, Duration::from_secs(1));
        cb.record_failure(now, Duration::from_secs(1));
        cb.record_success();

        cb.record_failure(now, Duration::from_secs(1));
        cb.record_failure(now, Duration::from_secs(1));
        assert_eq!(cb.state_at(now), CircuitState::Closed);
    }

    #[test]
    fn test_reset_clears_open_state() {
        let mut cb = breaker(1);
        let now = Instant::now();
        cb.record_failure(now, Duration::from_secs(60));
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire(now).is_ok());
        assert_eq!(cb.failure_count(), 0);
    }
}
