//! Three-state circuit breakers keyed by service.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::model::ServiceId;
use crate::ports::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Trip threshold and cooldown.
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before allowing a trial call.
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Breaker position.
pub enum CircuitState {
    /// Calls flow normally.
    #[default]
    Closed,
    /// Calls are skipped until the cooldown elapses.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Breaker bookkeeping for one service.
pub struct CircuitBreakerState {
    /// Current position.
    pub state: CircuitState,
    /// Failures since the last success.
    pub failure_count: u32,
    /// When the last failure was recorded.
    pub last_failure_time: Option<Instant>,
    /// Earliest instant an open breaker lets a trial through.
    pub next_attempt_time: Option<Instant>,
    trial_in_flight: bool,
}

/// Breakers shared by all executions targeting the same services.
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: DashMap<ServiceId, CircuitBreakerState>,
}

impl CircuitBreaker {
    /// Create breakers with the given threshold and cooldown.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.cooldown_secs)
    }

    /// Ask permission to call a service.
    ///
    /// An open breaker whose cooldown elapsed moves to half-open and admits a single
    /// trial; further callers are rejected until the trial resolves.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CircuitOpen`] when the service must be skipped.
    pub fn try_acquire(&self, service: &ServiceId) -> Result<(), EngineError> {
        let now = Instant::now();
        let mut entry = self.states.entry(service.clone()).or_default();
        let cooled_down = entry.next_attempt_time.is_none_or(|next| now >= next);

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open if cooled_down => {
                entry.state = CircuitState::HalfOpen;
                entry.trial_in_flight = true;
                entry.next_attempt_time = Some(now + self.cooldown());
                info!(service = %service, "circuit half-open, admitting trial call");
                Ok(())
            }
            CircuitState::HalfOpen if !entry.trial_in_flight || cooled_down => {
                // A trial that never reported back is replaced after another cooldown.
                entry.trial_in_flight = true;
                entry.next_attempt_time = Some(now + self.cooldown());
                Ok(())
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                Err(EngineError::CircuitOpen(service.clone()))
            }
        }
    }

    /// Record a successful call: the breaker closes and forgets past failures.
    pub fn record_success(&self, service: &ServiceId) {
        let mut entry = self.states.entry(service.clone()).or_default();
        if entry.state != CircuitState::Closed {
            info!(service = %service, "circuit closed");
        }
        *entry = CircuitBreakerState::default();
    }

    /// Record a failed call.
    pub fn record_failure(&self, service: &ServiceId) {
        let now = Instant::now();
        let threshold = self.config.failure_threshold;
        let mut entry = self.states.entry(service.clone()).or_default();

        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.last_failure_time = Some(now);

        match entry.state {
            CircuitState::Closed if entry.failure_count >= threshold => {
                entry.state = CircuitState::Open;
                entry.next_attempt_time = Some(now + self.cooldown());
                warn!(
                    service = %service,
                    failures = entry.failure_count,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.trial_in_flight = false;
                entry.next_attempt_time = Some(now + self.cooldown());
                warn!(service = %service, "trial call failed, circuit re-opened");
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Give back a half-open trial slot that never reached the provider.
    pub fn release_trial(&self, service: &ServiceId) {
        if let Some(mut entry) = self.states.get_mut(service) {
            entry.trial_in_flight = false;
        }
    }

    /// Bookkeeping for a service; unknown services report a fresh closed breaker.
    #[must_use]
    pub fn snapshot(&self, service: &ServiceId) -> CircuitBreakerState {
        self.states
            .get(service)
            .map(|entry| *entry)
            .unwrap_or_default()
    }

    /// Current position of a service's breaker.
    #[must_use]
    pub fn state(&self, service: &ServiceId) -> CircuitState {
        self.snapshot(service).state
    }

    /// Close a breaker manually.
    pub fn reset(&self, service: &ServiceId) {
        self.states.remove(service);
    }
}
