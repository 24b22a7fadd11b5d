//! Per-key API usage counters
//!
//! Fixed-window counters keyed by (API key id, window start). Calls are only
//! counted, never rejected: a call past the soft limit of its window is
//! recorded as a rate-limit hit and the request proceeds.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;

/// Look-back of [`RateLimiter::usage_24h`]
const USAGE_HORIZON_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default)]
struct RateCounter {
    /// Calls in this window
    count: u64,
    /// Calls past the soft limit
    over_limit: u64,
}

/// Result of recording one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Within the window's soft limit
    Allowed {
        /// Calls left in this window
        remaining: u64,
        /// Soft limit
        limit: u64,
    },
    /// Past the soft limit; counted as a hit, still served
    OverLimit {
        /// Time until the window rolls over
        resets_in: Duration,
        /// Soft limit
        limit: u64,
    },
}

impl RateLimitResult {
    /// Whether the call stayed within the soft limit
    pub fn is_within_limit(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }

    /// `X-RateLimit-*` response headers
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            RateLimitResult::Allowed { remaining, limit } => vec![
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", remaining.to_string()),
            ],
            RateLimitResult::OverLimit { resets_in, limit } => vec![
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", "0".to_string()),
                ("X-RateLimit-Reset", resets_in.num_seconds().max(0).to_string()),
            ],
        }
    }
}

/// Trailing-24h usage rollup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    /// Authenticated calls
    pub api_calls: u64,
    /// Calls past the soft limit of their window
    pub rate_limit_hits: u64,
}

/// Fixed-window usage counter
pub struct RateLimiter {
    window: Duration,
    limit: u64,
    clock: Arc<dyn Clock>,
    counters: RwLock<HashMap<(Uuid, DateTime<Utc>), RateCounter>>,
}

impl RateLimiter {
    /// Create a limiter with `limit` calls per key per `window`
    pub fn new(window: Duration, limit: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            limit,
            clock,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Count one authenticated call by `key_id`
    pub fn record(&self, key_id: Uuid) -> RateLimitResult {
        let now = self.clock.now();
        let start = self.window_start(now);

        let mut counters = self.counters.write();
        let horizon = now - Duration::hours(USAGE_HORIZON_HOURS) - self.window;
        counters.retain(|(_, window_start), _| *window_start >= horizon);

        let counter = counters.entry((key_id, start)).or_default();
        counter.count += 1;

        if counter.count > self.limit {
            counter.over_limit += 1;
            tracing::debug!(key_id = %key_id, count = counter.count, "api key over soft rate limit");
            RateLimitResult::OverLimit {
                resets_in: start + self.window - now,
                limit: self.limit,
            }
        } else {
            RateLimitResult::Allowed {
                remaining: self.limit - counter.count,
                limit: self.limit,
            }
        }
    }

    /// Usage across every key for windows starting in the last 24 hours
    pub fn usage_24h(&self) -> Usage {
        let now = self.clock.now();
        let since = now - Duration::hours(USAGE_HORIZON_HOURS);

        self.counters
            .read()
            .iter()
            .filter(|((_, window_start), _)| *window_start > since && *window_start <= now)
            .fold(Usage::default(), |acc, (_, c)| Usage {
                api_calls: acc.api_calls + c.count,
                rate_limit_hits: acc.rate_limit_hits + c.over_limit,
            })
    }

    /// Usage for one key in the current window
    pub fn current_window(&self, key_id: Uuid) -> u64 {
        let start = self.window_start(self.clock.now());
        self.counters
            .read()
            .get(&(key_id, start))
            .map_or(0, |c| c.count)
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window_ms = self.window.num_milliseconds().max(1);
        let now_ms = now.timestamp_millis();
        let start_ms = now_ms - now_ms.rem_euclid(window_ms);
        DateTime::from_timestamp_millis(start_ms).unwrap_or(now)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.window)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}
