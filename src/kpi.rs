//! Dashboard rollups. Read-only; computed at request time.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;

use crate::clock::Clock;
use crate::models::{DeliveryStatus, KeyMode, KeyStatus, WebhookStatus};
use crate::rate_limit::RateLimiter;
use crate::store::{DeliveryFilter, Store};

/// KPI snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kpis {
    /// Keys whose effective status is `active`
    pub active_keys: usize,
    /// Non-revoked keys expiring within 30 days
    #[serde(rename = "expiringKeys30d")]
    pub expiring_keys_30d: usize,
    /// Webhooks with status `active`
    pub webhooks_active: usize,
    /// Deliveries dead-lettered in the last 7 days
    #[serde(rename = "deliveriesFailed7d")]
    pub deliveries_failed_7d: usize,
    /// Deliveries waiting for a retry
    pub retries_pending: usize,
    /// Calls past the soft rate limit in the last 24 hours
    #[serde(rename = "rateLimitHits24h")]
    pub rate_limit_hits_24h: u64,
    /// Authenticated API-key calls in the last 24 hours
    #[serde(rename = "apiCalls24h")]
    pub api_calls_24h: u64,
    /// Client-mode keys that still validate
    pub client_safe_keys: usize,
}

/// Computes [`Kpis`] from the store and the rate limiter
#[derive(Clone)]
pub struct KpiAggregator {
    store: Arc<Store>,
    rate_limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl KpiAggregator {
    /// Create an aggregator
    pub fn new(store: Arc<Store>, rate_limiter: Arc<RateLimiter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            rate_limiter,
            clock,
        }
    }

    /// Snapshot at the current time
    pub fn snapshot(&self) -> Kpis {
        let now = self.clock.now();
        let mut kpis = Kpis::default();

        for key in self.store.read_keys(|keys| keys.all()) {
            let status = key.effective_status(now);
            if status == KeyStatus::Active {
                kpis.active_keys += 1;
            }
            if status != KeyStatus::Revoked {
                if let Some(expires_at) = key.expires_at {
                    if now < expires_at && expires_at <= now + Duration::days(30) {
                        kpis.expiring_keys_30d += 1;
                    }
                }
            }
            if key.mode == KeyMode::Client && key.is_usable(now) {
                kpis.client_safe_keys += 1;
            }
        }

        kpis.webhooks_active = self.store.webhooks(Some(WebhookStatus::Active)).len();

        let week_ago = now - Duration::days(7);
        for delivery in self.store.deliveries(&DeliveryFilter::default()) {
            match delivery.status {
                DeliveryStatus::Retrying => kpis.retries_pending += 1,
                DeliveryStatus::Dead if delivery.completed_at.is_some_and(|t| t >= week_ago) => {
                    kpis.deliveries_failed_7d += 1
                }
                _ => {}
            }
        }

        let usage = self.rate_limiter.usage_24h();
        kpis.api_calls_24h = usage.api_calls;
        kpis.rate_limit_hits_24h = usage.rate_limit_hits;

        kpis
    }
}

impl std::fmt::Debug for KpiAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KpiAggregator").finish_non_exhaustive()
    }
}
