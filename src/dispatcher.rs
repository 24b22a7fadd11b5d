//! Delivery dispatcher
//!
//! Fans emitted events out to subscribed webhooks and drives each delivery
//! through its state machine:
//!
//! ```text
//!                 fail, attempts < max
//!            ┌──────────────────────────┐
//!            v                          │
//!  queued ─────▶ attempt ─────────▶ retrying ───(nextRetryAt ≤ now)──▶ attempt
//!                  │  │
//!          success │  │ fail, attempts ≥ max
//!                  v  v
//!            success   dead          (both terminal)
//! ```
//!
//! # Serialization
//!
//! Attempts on the same delivery are serialized twice over: a per-delivery
//! async mutex keeps a single attempt in flight inside this process, and the
//! store's version check rejects any commit based on a stale read. A loser of
//! either race gets [`Error::Conflict`] and the row is unchanged.
//!
//! Lock entries live only while an attempt holds or waits on them.
//!
//! Attempts on different deliveries run in parallel, bounded by one semaphore
//! of `max_in_flight` permits shared by every sweep and background dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::models::{
    Actor, DeliveryStatus, Severity, WebhookDelivery, WebhookEvent, WebhookScope, WebhookStatus,
    WEBHOOK_DELIVERIES, WEBHOOK_EVENTS,
};
use crate::retry::RetryPolicy;
use crate::store::{DeliveryFilter, Store};
use crate::transport::{deliver, DeliveryOutcome, Transport, TransportRequest};

/// Input for [`Dispatcher::emit`]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitEvent {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: String,
    /// Arbitrary JSON payload
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Entity collection the event is about
    #[serde(default)]
    pub scope_type: Option<String>,
    /// Entity id the event is about
    #[serde(default)]
    pub scope_id: Option<String>,
}

/// An event and the deliveries it fanned out to
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Emission {
    /// The stored event
    pub event: WebhookEvent,
    /// One queued delivery per receiving webhook
    pub deliveries: Vec<WebhookDelivery>,
}

/// Delivery after an attempt, plus the attempt's own outcome
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptReport {
    /// The committed delivery
    pub delivery: WebhookDelivery,
    /// What the transport reported
    #[serde(flatten)]
    pub outcome: DeliveryOutcome,
}

/// Totals from one batch of attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Deliveries selected
    pub selected: usize,
    /// Delivered
    pub succeeded: usize,
    /// Failed and scheduled for retry
    pub retrying: usize,
    /// Failed and dead-lettered
    pub dead: usize,
    /// Not attempted: no longer due, webhook inactive, or lost a race
    pub skipped: usize,
}

/// Fan-out and attempt engine
pub struct Dispatcher {
    store: Arc<Store>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    transport_timeout: Duration,
    max_in_flight: usize,
    permits: Semaphore,
    in_flight: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// Holds a per-delivery lock entry; drops it from the map once unused
struct InFlightEntry<'a> {
    map: &'a Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    delivery_id: Uuid,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InFlightEntry<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        // One reference in the map, one here: nobody else is waiting
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.delivery_id);
        }
    }
}

impl Dispatcher {
    /// Create a dispatcher
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        metrics: Arc<Metrics>,
        retry: RetryPolicy,
        transport_timeout: Duration,
        max_in_flight: usize,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            store,
            audit,
            clock,
            transport,
            metrics,
            retry,
            transport_timeout,
            max_in_flight,
            permits: Semaphore::new(max_in_flight),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Store an event and create one queued delivery per receiving webhook
    #[instrument(skip_all, fields(event_type = %input.event_type))]
    pub fn emit(&self, input: EmitEvent, actor: &Actor) -> Result<Emission> {
        let event_type = input.event_type.trim();
        if event_type.is_empty() || event_type.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!(
                "invalid event type: {:?}",
                input.event_type
            )));
        }
        let scope = match (input.scope_type, input.scope_id) {
            (None, None) => WebhookScope::Global,
            (Some(scope_type), Some(scope_id)) => WebhookScope::Entity {
                scope_type,
                scope_id,
            },
            _ => {
                return Err(Error::validation(
                    "scopeType and scopeId must be given together",
                ))
            }
        };

        let now = self.clock.now();
        let event = self.store.insert_event(WebhookEvent {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            payload: input.payload,
            scope,
            created_at: now,
        })?;

        let mut deliveries = Vec::new();
        for webhook in self.store.webhooks(Some(WebhookStatus::Active)) {
            if !webhook.receives(&event) {
                continue;
            }
            let delivery = self.store.insert_delivery(WebhookDelivery::queued(
                webhook.id,
                event.id,
                self.retry.max_attempts,
                now,
            ))?;
            deliveries.push(delivery);
        }

        info!(event_id = %event.id, deliveries = deliveries.len(), "event emitted");
        self.audit.append(
            actor,
            AuditRecord::info(
                "event.emitted",
                WEBHOOK_EVENTS,
                event.id,
                format!(
                    "Emitted {} to {} webhook(s)",
                    event.event_type,
                    deliveries.len()
                ),
            ),
        );

        Ok(Emission { event, deliveries })
    }

    /// Attempt a delivery now ("retry now").
    ///
    /// Fails with `Conflict` on terminal deliveries and inactive webhooks. A
    /// failed transport call is not an error: it is reported in the returned
    /// outcome and moves the delivery to `retrying` or `dead`.
    pub async fn attempt(&self, delivery_id: Uuid, actor: &Actor) -> Result<AttemptReport> {
        self.attempt_inner(delivery_id, actor, false)
            .await?
            .ok_or_else(|| Error::Internal(format!("attempt on {delivery_id} was skipped")))
    }

    /// Attempt every delivery that is due and whose webhook is active
    pub async fn run_due(&self) -> SweepReport {
        let now = self.clock.now();
        let active: std::collections::HashSet<Uuid> = self
            .store
            .webhooks(Some(WebhookStatus::Active))
            .into_iter()
            .map(|w| w.id)
            .collect();

        let due: Vec<Uuid> = self
            .store
            .deliveries(&DeliveryFilter::default())
            .into_iter()
            .filter(|d| d.is_due(now) && active.contains(&d.webhook_id))
            .map(|d| d.id)
            .collect();

        if due.is_empty() {
            return SweepReport::default();
        }
        debug!(due = due.len(), "running due deliveries");
        self.dispatch(&due).await
    }

    /// Attempt the given deliveries concurrently, skipping any that are no
    /// longer due by the time their turn comes
    pub async fn dispatch(&self, ids: &[Uuid]) -> SweepReport {
        let actor = Actor::system();

        let results = join_all(ids.iter().map(|id| {
            let actor = &actor;
            async move {
                let Ok(_permit) = self.permits.acquire().await else {
                    return None;
                };
                match self.attempt_inner(*id, actor, true).await {
                    Ok(report) => report.map(|r| r.delivery.status),
                    Err(e) => {
                        debug!(delivery_id = %id, error = %e, "scheduled attempt skipped");
                        None
                    }
                }
            }
        }))
        .await;

        let mut report = SweepReport {
            selected: ids.len(),
            ..SweepReport::default()
        };
        for status in results {
            match status {
                Some(DeliveryStatus::Success) => report.succeeded += 1,
                Some(DeliveryStatus::Retrying) => report.retrying += 1,
                Some(DeliveryStatus::Dead) => report.dead += 1,
                Some(DeliveryStatus::Queued) | None => report.skipped += 1,
            }
        }
        report
    }

    /// Get a delivery by id
    pub fn get_delivery(&self, id: Uuid) -> Result<WebhookDelivery> {
        self.store
            .delivery(&id)
            .ok_or_else(|| Error::not_found("delivery", id))
    }

    /// List deliveries, oldest first
    pub fn list_deliveries(&self, filter: &DeliveryFilter) -> Vec<WebhookDelivery> {
        self.store.deliveries(filter)
    }

    /// Get an event by id
    pub fn get_event(&self, id: Uuid) -> Result<WebhookEvent> {
        self.store
            .event(&id)
            .ok_or_else(|| Error::not_found("event", id))
    }

    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    async fn attempt_inner(
        &self,
        delivery_id: Uuid,
        actor: &Actor,
        only_if_due: bool,
    ) -> Result<Option<AttemptReport>> {
        let entry = self.lock_for(delivery_id);
        let _guard = entry.lock.lock().await;

        let delivery = self.get_delivery(delivery_id)?;
        if delivery.status.is_terminal() {
            return Err(Error::conflict(format!(
                "delivery {delivery_id} is already {}",
                delivery.status
            )));
        }
        if only_if_due && !delivery.is_due(self.clock.now()) {
            return Ok(None);
        }

        let webhook = self
            .store
            .webhook(&delivery.webhook_id)
            .ok_or_else(|| Error::not_found("webhook", delivery.webhook_id))?;
        if webhook.status != WebhookStatus::Active {
            return Err(Error::conflict(format!(
                "webhook {} is {}",
                webhook.id, webhook.status
            )));
        }
        let event = self.store.event(&delivery.event_id).ok_or_else(|| {
            Error::Internal(format!(
                "event {} for delivery {delivery_id} is missing",
                delivery.event_id
            ))
        })?;

        let request = TransportRequest {
            url: webhook.target_url.clone(),
            payload: event.payload.clone(),
            headers: webhook.headers.clone(),
            event_type: event.event_type.clone(),
            delivery_id: Some(delivery.id),
        };
        let outcome = deliver(self.transport.as_ref(), &request, self.transport_timeout).await;

        let expected_version = delivery.version;
        let next = apply_outcome(delivery, &outcome, self.clock.now(), &self.retry);
        let committed = match self.store.commit_delivery(next, expected_version) {
            Ok(committed) => committed,
            Err(e) => {
                self.metrics.record_conflict();
                warn!(delivery_id = %delivery_id, error = %e, "attempt outcome discarded");
                return Err(e);
            }
        };

        self.metrics.record_attempt(
            outcome.success,
            Duration::from_millis(outcome.duration_ms),
        );
        self.record(&committed, &webhook.masked_url, &outcome, actor);

        Ok(Some(AttemptReport {
            delivery: committed,
            outcome,
        }))
    }

    fn record(
        &self,
        delivery: &WebhookDelivery,
        target: &str,
        outcome: &DeliveryOutcome,
        actor: &Actor,
    ) {
        let code = outcome
            .status_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "no response".to_string());

        let (action, severity, summary) = match delivery.status {
            DeliveryStatus::Success => {
                info!(
                    delivery_id = %delivery.id,
                    attempts = delivery.attempts,
                    status_code = ?outcome.status_code,
                    duration_ms = outcome.duration_ms,
                    "delivery succeeded"
                );
                (
                    "delivery.success",
                    Severity::Info,
                    format!(
                        "Delivered to {target} on attempt {} ({code}, {} ms)",
                        delivery.attempts, outcome.duration_ms
                    ),
                )
            }
            DeliveryStatus::Dead => {
                self.metrics.record_dead_letter();
                warn!(
                    delivery_id = %delivery.id,
                    attempts = delivery.attempts,
                    status_code = ?outcome.status_code,
                    "delivery dead-lettered"
                );
                (
                    "delivery.dead",
                    Severity::Warning,
                    format!(
                        "Dead-lettered delivery to {target} after {} attempts ({code})",
                        delivery.attempts
                    ),
                )
            }
            DeliveryStatus::Retrying | DeliveryStatus::Queued => {
                self.metrics.record_retry();
                warn!(
                    delivery_id = %delivery.id,
                    attempts = delivery.attempts,
                    max_attempts = delivery.max_attempts,
                    status_code = ?outcome.status_code,
                    next_retry_at = ?delivery.next_retry_at,
                    "delivery failed, retry scheduled"
                );
                (
                    "delivery.retrying",
                    Severity::Warning,
                    format!(
                        "Attempt {}/{} to {target} failed ({code}); next retry at {}",
                        delivery.attempts,
                        delivery.max_attempts,
                        delivery
                            .next_retry_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_default()
                    ),
                )
            }
        };

        self.audit.append(
            actor,
            AuditRecord::info(action, WEBHOOK_DELIVERIES, delivery.id, summary)
                .with_severity(severity),
        );
    }

    fn lock_for(&self, delivery_id: Uuid) -> InFlightEntry<'_> {
        let lock = self
            .in_flight
            .lock()
            .entry(delivery_id)
            .or_default()
            .clone();
        InFlightEntry {
            map: &self.in_flight,
            delivery_id,
            lock,
        }
    }

    /// Deliveries with an attempt holding or waiting on their lock
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("retry", &self.retry)
            .field("transport_timeout", &self.transport_timeout)
            .field("max_in_flight", &self.max_in_flight)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

/// Next state of `delivery` after one attempt with `outcome` at `now`
pub fn apply_outcome(
    mut delivery: WebhookDelivery,
    outcome: &DeliveryOutcome,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> WebhookDelivery {
    delivery.attempts += 1;
    delivery.last_attempt_at = Some(now);
    delivery.response_code = outcome.status_code;
    delivery.response_body_snippet = outcome.body_snippet.clone();
    delivery.duration_ms = Some(outcome.duration_ms);

    if outcome.success {
        delivery.status = DeliveryStatus::Success;
        delivery.completed_at = Some(now);
        delivery.next_retry_at = None;
    } else if delivery.attempts >= delivery.max_attempts {
        delivery.status = DeliveryStatus::Dead;
        delivery.completed_at = Some(now);
        delivery.next_retry_at = None;
    } else {
        delivery.status = DeliveryStatus::Retrying;
        delivery.next_retry_at = Some(
            now.checked_add_signed(policy.delay_after(delivery.attempts))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
    }
    delivery
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn outcome(success: bool) -> DeliveryOutcome {
        DeliveryOutcome {
            success,
            status_code: Some(if success { 200 } else { 502 }),
            body_snippet: Some("body".to_string()),
            duration_ms: 12,
            error: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_apply_success() {
        let delivery = WebhookDelivery::queued(Uuid::new_v4(), Uuid::new_v4(), 5, t0());
        let next = apply_outcome(delivery, &outcome(true), t0(), &RetryPolicy::default());

        assert_eq!(next.status, DeliveryStatus::Success);
        assert_eq!(next.attempts, 1);
        assert_eq!(next.completed_at, Some(t0()));
        assert_eq!(next.next_retry_at, None);
        assert_eq!(next.response_code, Some(200));
    }

    #[test]
    fn test_apply_failures_walk_backoff_then_dead() {
        let policy = RetryPolicy::default();
        let mut delivery = WebhookDelivery::queued(Uuid::new_v4(), Uuid::new_v4(), 3, t0());

        delivery = apply_outcome(delivery, &outcome(false), t0(), &policy);
        assert_eq!(delivery.status, DeliveryStatus::Retrying);
        assert_eq!(delivery.next_retry_at, Some(t0() + ChronoDuration::minutes(1)));

        let t1 = t0() + ChronoDuration::minutes(1);
        delivery = apply_outcome(delivery, &outcome(false), t1, &policy);
        assert_eq!(delivery.status, DeliveryStatus::Retrying);
        assert_eq!(delivery.next_retry_at, Some(t1 + ChronoDuration::minutes(5)));

        delivery = apply_outcome(delivery, &outcome(false), t1, &policy);
        assert_eq!(delivery.status, DeliveryStatus::Dead);
        assert_eq!(delivery.attempts, 3);
        assert_eq!(delivery.next_retry_at, None);
        assert_eq!(delivery.completed_at, Some(t1));
    }

    #[test]
    fn test_apply_clamps_backoff() {
        let policy = RetryPolicy::default();
        let mut delivery = WebhookDelivery::queued(Uuid::new_v4(), Uuid::new_v4(), 10, t0());
        delivery.attempts = 7;

        let next = apply_outcome(delivery, &outcome(false), t0(), &policy);
        assert_eq!(next.next_retry_at, Some(t0() + ChronoDuration::minutes(240)));
    }

    #[test]
    fn test_apply_saturates_retry_deadline() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: vec![ChronoDuration::MAX],
        };
        let delivery = WebhookDelivery::queued(Uuid::new_v4(), Uuid::new_v4(), 5, t0());
        let next = apply_outcome(delivery, &outcome(false), t0(), &policy);

        assert_eq!(next.status, DeliveryStatus::Retrying);
        assert_eq!(next.next_retry_at, Some(DateTime::<Utc>::MAX_UTC));
    }
}
