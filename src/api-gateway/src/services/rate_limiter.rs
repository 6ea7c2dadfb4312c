//! Per-client request budget backed by governor
//!
//! Every client address gets `max_requests` per `window_ms`. The budget
//! refills continuously (GCRA), one request every `window / max_requests`,
//! instead of resetting all at once at a window boundary.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{
    clock::{Clock, DefaultClock},
    middleware::StateInformationMiddleware,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use tracing::debug;

use crate::{
    config::RateLimitConfig,
    error::{GatewayError, Result},
};

type KeyedLimiter = RateLimiter<
    String,
    DefaultKeyedStateStore<String>,
    DefaultClock,
    StateInformationMiddleware,
>;

/// Idle clients are pruned once this many are tracked
const MAX_TRACKED_CLIENTS: usize = 10_000;

/// Outcome of one budget check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32, reset_secs: u64 },
    Limited { retry_after_secs: u64 },
}

/// Rate limiter keyed by client address
pub struct ClientRateLimiter {
    limiter: KeyedLimiter,
    clock: DefaultClock,
    limit: NonZeroU32,
    replenish_interval: Duration,
}

impl ClientRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let limit = NonZeroU32::new(config.max_requests).ok_or_else(|| {
            GatewayError::configuration("rate_limit.max_requests must be positive")
        })?;
        let replenish_interval = Duration::from_millis(config.window_ms) / limit.get();

        let quota = Quota::with_period(replenish_interval)
            .ok_or_else(|| GatewayError::configuration("rate_limit.window_ms is too small"))?
            .allow_burst(limit);

        let clock = DefaultClock::default();
        let limiter = RateLimiter::dashmap_with_clock(quota, &clock)
            .with_middleware::<StateInformationMiddleware>();

        Ok(Self {
            limiter,
            clock,
            limit,
            replenish_interval,
        })
    }

    /// Requests allowed per window
    pub fn limit(&self) -> u32 {
        self.limit.get()
    }

    /// Spend one request from the client's budget
    pub fn check(&self, client: &str) -> RateDecision {
        if self.limiter.len() > MAX_TRACKED_CLIENTS {
            self.limiter.retain_recent();
            debug!(tracked = self.limiter.len(), "Pruned idle rate limit entries");
        }

        match self.limiter.check_key(&client.to_string()) {
            Ok(snapshot) => {
                let remaining = snapshot.remaining_burst_capacity();
                let spent = self.limit.get().saturating_sub(remaining);
                RateDecision::Allowed {
                    remaining,
                    reset_secs: ceil_secs(self.replenish_interval * spent),
                }
            }
            Err(not_until) => RateDecision::Limited {
                retry_after_secs: ceil_secs(not_until.wait_time_from(self.clock.now())).max(1),
            },
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64) -> ClientRateLimiter {
        ClientRateLimiter::new(&RateLimitConfig {
            enabled: true,
            window_ms,
            max_requests,
        })
        .unwrap()
    }

    #[test]
    fn test_budget_is_spent_then_limited() {
        let limiter = limiter(2, 60_000);
        assert_eq!(limiter.limit(), 2);

        assert_eq!(
            limiter.check("10.0.0.1"),
            RateDecision::Allowed {
                remaining: 1,
                reset_secs: 30
            }
        );
        assert_eq!(
            limiter.check("10.0.0.1"),
            RateDecision::Allowed {
                remaining: 0,
                reset_secs: 60
            }
        );

        match limiter.check("10.0.0.1") {
            RateDecision::Limited { retry_after_secs } => {
                assert!((1..=30).contains(&retry_after_secs), "{retry_after_secs}")
            }
            other => panic!("expected limit, got {:?}", other),
        }
    }

    #[test]
    fn test_clients_have_independent_budgets() {
        let limiter = limiter(1, 60_000);
        assert!(matches!(limiter.check("10.0.0.1"), RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check("10.0.0.1"), RateDecision::Limited { .. }));
        assert!(matches!(limiter.check("10.0.0.2"), RateDecision::Allowed { .. }));
    }

    #[test]
    fn test_zero_budget_is_rejected() {
        let config = RateLimitConfig {
            enabled: true,
            window_ms: 60_000,
            max_requests: 0,
        };
        assert!(ClientRateLimiter::new(&config).is_err());
    }
}
