//! Fixed-window request counting keyed by service.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};
use tracing::warn;

use crate::model::{ServiceCategory, ServiceId};
use crate::ports::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Ceilings applied per window.
pub struct RateLimitConfig {
    /// Window length in seconds.
    pub window_secs: u64,
    /// Limit for services with no category or service-specific ceiling.
    pub default_limit: u32,
    /// Limits per service category.
    pub categories: CategoryLimits,
    /// Limits for individual services; these win over category limits.
    pub services: HashMap<ServiceId, u32>,
    /// Minimum spacing between two accepted requests to the same service.
    pub min_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            default_limit: 5,
            categories: CategoryLimits::default(),
            services: HashMap::new(),
            min_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Requests allowed per window for each service category.
pub struct CategoryLimits {
    /// Personal identity registries.
    pub identity: u32,
    /// Vehicle registries.
    pub vehicle: u32,
    /// Company, address, and phone registries.
    pub cadastral: u32,
    /// Credit bureaus.
    pub credit: u32,
}

impl Default for CategoryLimits {
    fn default() -> Self {
        Self {
            identity: 5,
            vehicle: 10,
            cadastral: 8,
            credit: 5,
        }
    }
}

impl CategoryLimits {
    /// Limit for one category.
    #[must_use]
    pub fn limit(&self, category: ServiceCategory) -> u32 {
        match category {
            ServiceCategory::Identity => self.identity,
            ServiceCategory::Vehicle => self.vehicle,
            ServiceCategory::Cadastral => self.cadastral,
            ServiceCategory::Credit => self.credit,
        }
    }
}

impl RateLimitConfig {
    /// Ceiling for a service.
    #[must_use]
    pub fn limit_for(&self, service: &ServiceId, category: Option<ServiceCategory>) -> u32 {
        self.services
            .get(service)
            .copied()
            .or_else(|| category.map(|category| self.categories.limit(category)))
            .unwrap_or(self.default_limit)
    }

    /// Window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Request counter for one service.
pub struct RateLimitWindow {
    /// Requests accepted since `window_start`.
    pub request_count: u32,
    /// Start of the current window.
    pub window_start: Instant,
    /// Window length.
    pub window_size: Duration,
    last_slot: Option<Instant>,
}

impl RateLimitWindow {
    fn new(now: Instant, window_size: Duration) -> Self {
        Self {
            request_count: 0,
            window_start: now,
            window_size,
            last_slot: None,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.window_start) >= self.window_size
    }
}

/// Rate limiter shared by all executions targeting the same services.
///
/// Windows reset lazily when a request observes them expired.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<ServiceId, RateLimitWindow>,
}

impl RateLimiter {
    /// Create a limiter with the given ceilings.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Configured ceilings.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count a request and wait out the minimum spacing, if configured.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RateLimitExceeded`] when the window is full. Nothing is
    /// queued: the request is rejected immediately.
    pub async fn acquire(
        &self,
        service: &ServiceId,
        category: Option<ServiceCategory>,
    ) -> Result<(), EngineError> {
        if let Some(slot) = self.try_acquire(service, category)? {
            time::sleep_until(slot).await;
        }
        Ok(())
    }

    /// Count a request without waiting.
    ///
    /// Returns the instant the caller should wait for when pacing applies.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RateLimitExceeded`] when the window is full.
    pub fn try_acquire(
        &self,
        service: &ServiceId,
        category: Option<ServiceCategory>,
    ) -> Result<Option<Instant>, EngineError> {
        let limit = self.config.limit_for(service, category);
        let window_size = self.config.window();
        let now = Instant::now();

        let mut window = self
            .windows
            .entry(service.clone())
            .or_insert_with(|| RateLimitWindow::new(now, window_size));

        if window.expired(now) {
            window.request_count = 0;
            window.window_start = now;
        }

        if window.request_count >= limit {
            let resets_at = window.window_start + window.window_size;
            let remaining = resets_at.saturating_duration_since(now);
            let retry_after_seconds = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            warn!(
                service = %service,
                limit,
                retry_after_seconds,
                "rate limit exceeded"
            );
            return Err(EngineError::RateLimitExceeded {
                retry_after_seconds,
            });
        }

        window.request_count += 1;

        if self.config.min_interval_ms == 0 {
            return Ok(None);
        }

        let spacing = Duration::from_millis(self.config.min_interval_ms);
        let slot = window
            .last_slot
            .map_or(now, |last| (last + spacing).max(now));
        window.last_slot = Some(slot);

        Ok((slot > now).then_some(slot))
    }

    /// Current window of a service, if any request was seen.
    #[must_use]
    pub fn snapshot(&self, service: &ServiceId) -> Option<RateLimitWindow> {
        self.windows.get(service).map(|window| *window)
    }

    /// Forget the window of a service.
    pub fn reset(&self, service: &ServiceId) {
        self.windows.remove(service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(service: &str, limit: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            services: HashMap::from([(ServiceId::from(service), limit)]),
            ..RateLimitConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn third_request_in_window_is_rejected() {
        let limiter = limiter_with("A", 2);
        let service = ServiceId::from("A");

        assert!(limiter.acquire(&service, None).await.is_ok());
        assert!(limiter.acquire(&service, None).await.is_ok());

        match limiter.acquire(&service, None).await {
            Err(EngineError::RateLimitExceeded {
                retry_after_seconds,
            }) => assert!(retry_after_seconds <= 60 && retry_after_seconds > 0),
            other => panic!("expected rate limit rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_lazily_after_expiry() {
        let limiter = limiter_with("A", 1);
        let service = ServiceId::from("A");

        limiter.acquire(&service, None).await.expect("first request");
        assert!(limiter.acquire(&service, None).await.is_err());

        time::advance(Duration::from_secs(60)).await;

        limiter.acquire(&service, None).await.expect("window reset");
        let window = limiter.snapshot(&service).expect("window exists");
        assert_eq!(window.request_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_counts_whole_seconds_left() {
        let limiter = limiter_with("A", 1);
        let service = ServiceId::from("A");

        limiter.acquire(&service, None).await.expect("first request");
        time::advance(Duration::from_millis(45_500)).await;

        match limiter.try_acquire(&service, None) {
            Err(EngineError::RateLimitExceeded {
                retry_after_seconds,
            }) => assert_eq!(retry_after_seconds, 15),
            other => panic!("expected rate limit rejection, got {other:?}"),
        }
    }

    #[test]
    fn limits_resolve_service_then_category_then_default() {
        let config = RateLimitConfig {
            services: HashMap::from([(ServiceId::from("cpf"), 2)]),
            ..RateLimitConfig::default()
        };

        assert_eq!(config.limit_for(&ServiceId::from("cpf"), Some(ServiceCategory::Identity)), 2);
        assert_eq!(
            config.limit_for(&ServiceId::from("vehicle_plate"), Some(ServiceCategory::Vehicle)),
            10
        );
        assert_eq!(
            config.limit_for(&ServiceId::from("cep"), Some(ServiceCategory::Cadastral)),
            8
        );
        assert_eq!(config.limit_for(&ServiceId::from("other"), None), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn minimum_interval_spaces_accepted_requests() {
        let limiter = RateLimiter::new(RateLimitConfig {
            min_interval_ms: 200,
            ..RateLimitConfig::default()
        });
        let service = ServiceId::from("cep");

        assert_eq!(limiter.try_acquire(&service, None).expect("first"), None);
        let second = limiter.try_acquire(&service, None).expect("second").expect("paced");
        let third = limiter.try_acquire(&service, None).expect("third").expect("paced");

        assert_eq!(third.duration_since(second), Duration::from_millis(200));
    }
}
