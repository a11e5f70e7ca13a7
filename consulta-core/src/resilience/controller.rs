//! Runs one logical provider call through limits, breakers, retries, and fallbacks.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::iter;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, info, warn};

use crate::model::{ServiceCategory, ServiceId, ServiceInfo};
use crate::ports::EngineError;
use crate::resilience::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::resilience::rate_limit::{RateLimitConfig, RateLimiter};
use crate::resilience::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Outbound call deadlines per service category, in seconds.
pub struct TimeoutConfig {
    /// Vehicle registries.
    pub vehicle_secs: u64,
    /// Personal identity registries.
    pub identity_secs: u64,
    /// Company, address, and phone registries.
    pub cadastral_secs: u64,
    /// Credit bureaus.
    pub credit_secs: u64,
    /// Services of unknown category.
    pub default_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            vehicle_secs: 10,
            identity_secs: 15,
            cadastral_secs: 15,
            credit_secs: 20,
            default_secs: 15,
        }
    }
}

impl TimeoutConfig {
    /// Deadline for one attempt against a service of `category`.
    #[must_use]
    pub fn timeout_for(&self, category: Option<ServiceCategory>) -> Duration {
        let secs = match category {
            Some(ServiceCategory::Vehicle) => self.vehicle_secs,
            Some(ServiceCategory::Identity) => self.identity_secs,
            Some(ServiceCategory::Cadastral) => self.cadastral_secs,
            Some(ServiceCategory::Credit) => self.credit_secs,
            None => self.default_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Settings of the resilience controller.
pub struct ResilienceConfig {
    /// Rate-limit ceilings.
    pub rate_limits: RateLimitConfig,
    /// Breaker threshold and cooldown.
    pub circuit_breaker: BreakerConfig,
    /// Default retry policy.
    pub retry: RetryPolicy,
    /// Per-category deadlines.
    pub timeouts: TimeoutConfig,
    /// Ordered alternates tried when a primary service fails.
    pub fallbacks: HashMap<ServiceId, Vec<ServiceId>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Value produced by a guarded call and the service that produced it.
pub struct Served<T> {
    /// Service that answered.
    pub service: ServiceId,
    /// Provider answer.
    pub value: T,
    /// Attempts made against the answering service.
    pub attempts: u32,
}

/// Guards outbound provider calls.
///
/// Rate-limit windows and breakers are shared by every execution using the controller.
pub struct ResilienceController {
    rate_limiter: RateLimiter,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeouts: TimeoutConfig,
    fallbacks: HashMap<ServiceId, Vec<ServiceId>>,
    categories: DashMap<ServiceId, ServiceCategory>,
}

impl Default for ResilienceController {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl ResilienceController {
    /// Build a controller from its settings.
    #[must_use]
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            rate_limiter: RateLimiter::new(config.rate_limits),
            breaker: CircuitBreaker::new(config.circuit_breaker),
            retry: config.retry,
            timeouts: config.timeouts,
            fallbacks: config.fallbacks,
            categories: DashMap::new(),
        }
    }

    /// Learn the categories of a plugin's services.
    pub fn register_services(&self, services: &[ServiceInfo]) {
        for service in services {
            self.categories.insert(service.id.clone(), service.category);
        }
    }

    /// Category of a known service.
    #[must_use]
    pub fn category_of(&self, service: &ServiceId) -> Option<ServiceCategory> {
        self.categories.get(service).map(|category| *category)
    }

    /// Default retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Shared rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Shared circuit breakers.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The primary followed by its configured alternates, without repeats.
    #[must_use]
    pub fn chain_for(&self, primary: &ServiceId) -> Vec<ServiceId> {
        let mut seen = HashSet::new();
        iter::once(primary)
            .chain(self.fallbacks.get(primary).into_iter().flatten())
            .filter(|service| seen.insert((*service).clone()))
            .cloned()
            .collect()
    }

    /// Call `operation` for `primary`, walking its fallback chain on failure.
    ///
    /// `operation` receives the service currently being tried.
    ///
    /// # Errors
    ///
    /// With a single-service chain the service's own error is returned; otherwise
    /// [`EngineError::AllFallbacksExhausted`] wraps the last failure.
    pub async fn call<T, F, Fut>(
        &self,
        primary: &ServiceId,
        retry: &RetryPolicy,
        operation: F,
    ) -> Result<Served<T>, EngineError>
    where
        F: Fn(ServiceId) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let chain = self.chain_for(primary);
        let mut failures = Vec::with_capacity(chain.len());

        for service in chain {
            match self.call_service(&service, retry, &operation).await {
                Ok((value, attempts)) => {
                    if &service != primary {
                        info!(primary = %primary, service = %service, "served by fallback");
                    }
                    return Ok(Served {
                        service,
                        value,
                        attempts,
                    });
                }
                Err(err) => {
                    warn!(service = %service, error = %err, "service failed");
                    failures.push(err);
                }
            }
        }

        Err(aggregate(failures))
    }

    async fn call_service<T, F, Fut>(
        &self,
        service: &ServiceId,
        retry: &RetryPolicy,
        operation: &F,
    ) -> Result<(T, u32), EngineError>
    where
        F: Fn(ServiceId) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.breaker.try_acquire(service)?;

        let category = self.category_of(service);
        let deadline = self.timeouts.timeout_for(category);
        let mut attempt = 0_u32;

        loop {
            attempt += 1;

            // Every attempt is one outbound request and takes its own slot.
            if let Err(err) = self.rate_limiter.acquire(service, category).await {
                if attempt == 1 {
                    self.breaker.release_trial(service);
                }
                return Err(err);
            }
            debug!(service = %service, attempt, "calling provider");

            let outcome = match time::timeout(deadline, operation(service.clone())).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => Err(EngineError::ProviderCallFailed {
                    service: service.clone(),
                    cause: format!("timed out after {}s", deadline.as_secs()),
                }),
            };

            match outcome {
                Ok(value) => {
                    self.breaker.record_success(service);
                    return Ok((value, attempt));
                }
                Err(err) if !err.is_retryable() => {
                    self.breaker.release_trial(service);
                    return Err(err);
                }
                Err(err) => {
                    self.breaker.record_failure(service);
                    let err = as_provider_failure(service, err);

                    if attempt > retry.retries || self.breaker.state(service) == CircuitState::Open
                    {
                        return Err(err);
                    }

                    let delay = retry.delay_for(attempt);
                    debug!(
                        service = %service,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying after backoff"
                    );
                    time::sleep(delay).await;
                }
            }
        }
    }
}

fn as_provider_failure(service: &ServiceId, err: EngineError) -> EngineError {
    match err {
        EngineError::ProviderCallFailed { .. } => err,
        other => EngineError::ProviderCallFailed {
            service: service.clone(),
            cause: other.to_string(),
        },
    }
}

fn aggregate(failures: Vec<EngineError>) -> EngineError {
    if failures.len() > 1 {
        let soonest_retry = failures
            .iter()
            .map(|failure| match failure {
                EngineError::RateLimitExceeded {
                    retry_after_seconds,
                } => Some(*retry_after_seconds),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .and_then(|waits| waits.into_iter().min());

        if let Some(retry_after_seconds) = soonest_retry {
            return EngineError::RateLimitExceeded {
                retry_after_seconds,
            };
        }
    }

    let single = failures.len() == 1;
    match failures.into_iter().last() {
        Some(last) if single => last,
        Some(last) => EngineError::AllFallbacksExhausted(Box::new(last)),
        None => EngineError::Internal("empty fallback chain".to_owned()),
    }
}
