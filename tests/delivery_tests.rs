//! Delivery dispatcher integration tests
//!
//! Fan-out, the retry/dead-letter state machine, audit entries and the
//! background scheduler, all against a manual clock and a scripted transport.

mod common;

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{t0, Harness};
use hookdesk::config::Config;
use hookdesk::dispatcher::EmitEvent;
use hookdesk::error::Error;
use hookdesk::models::{Actor, DeliveryStatus, Severity, WEBHOOK_DELIVERIES};
use hookdesk::retry::RetryPolicy;
use hookdesk::scheduler::RetryScheduler;
use hookdesk::store::DeliveryFilter;
use hookdesk::transport::{Scripted, TransportError};
use hookdesk::webhooks::RegisterWebhook;
use pretty_assertions::assert_eq;
use serde_json::json;

fn event(event_type: &str) -> EmitEvent {
    EmitEvent {
        event_type: event_type.to_string(),
        payload: json!({"invoiceId": "inv_42", "amount": 1200}),
        scope_type: None,
        scope_id: None,
    }
}

fn harness_with_max_attempts(max_attempts: u32) -> Harness {
    let mut config = Config::test_config();
    config.retry = RetryPolicy::default().with_max_attempts(max_attempts);
    Harness::with_config(config)
}

#[test]
fn test_emit_fans_out_to_active_subscribers_only() {
    let h = Harness::new();
    let paid_a = h.webhook("billing", &["invoice.paid"]);
    let paid_b = h.webhook("ledger", &["invoice.paid", "invoice.voided"]);
    h.webhook("crm", &["customer.created"]);
    let paused = h.webhook("archive", &["invoice.paid"]);
    h.state.webhooks.pause(paused.id, &Actor::operator()).unwrap();

    let emission = h
        .state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap();

    let mut targets: Vec<_> = emission.deliveries.iter().map(|d| d.webhook_id).collect();
    targets.sort();
    let mut expected = vec![paid_a.id, paid_b.id];
    expected.sort();
    assert_eq!(targets, expected);

    for delivery in &emission.deliveries {
        assert_eq!(delivery.status, DeliveryStatus::Queued);
        assert_eq!(delivery.attempts, 0);
        assert_eq!(delivery.max_attempts, 5);
        assert_eq!(delivery.event_id, emission.event.id);
    }
    assert_eq!(h.audit_actions("event.emitted").len(), 1);
}

#[test]
fn test_emit_without_subscribers_stores_event() {
    let h = Harness::new();
    let emission = h
        .state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap();

    assert!(emission.deliveries.is_empty());
    assert_eq!(
        h.state.dispatcher.get_event(emission.event.id).unwrap(),
        emission.event
    );
}

#[test]
fn test_emit_rejects_blank_type_and_half_scope() {
    let h = Harness::new();

    let err = h
        .state
        .dispatcher
        .emit(event("  "), &Actor::operator())
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let mut half = event("invoice.paid");
    half.scope_type = Some("customer".to_string());
    let err = h
        .state
        .dispatcher
        .emit(half, &Actor::operator())
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn test_entity_scoped_webhook_only_receives_its_entity() {
    let h = Harness::new();
    let scoped = h
        .state
        .webhooks
        .register(
            RegisterWebhook {
                name: "acme".to_string(),
                target_url: "https://acme.example.com/hooks".to_string(),
                event_types: vec!["invoice.paid".to_string()],
                scope_type: Some("customer".to_string()),
                scope_id: Some("cus_acme".to_string()),
                ..RegisterWebhook::default()
            },
            &Actor::operator(),
        )
        .unwrap();
    let global = h.webhook("billing", &["invoice.paid"]);

    let mut for_acme = event("invoice.paid");
    for_acme.scope_type = Some("customer".to_string());
    for_acme.scope_id = Some("cus_acme".to_string());
    let emission = h
        .state
        .dispatcher
        .emit(for_acme, &Actor::operator())
        .unwrap();
    assert_eq!(emission.deliveries.len(), 2);

    let mut for_other = event("invoice.paid");
    for_other.scope_type = Some("customer".to_string());
    for_other.scope_id = Some("cus_other".to_string());
    let emission = h
        .state
        .dispatcher
        .emit(for_other, &Actor::operator())
        .unwrap();
    let targets: Vec<_> = emission.deliveries.iter().map(|d| d.webhook_id).collect();
    assert_eq!(targets, vec![global.id]);
    assert!(!targets.contains(&scoped.id));
}

#[tokio::test]
async fn test_success_on_first_attempt() {
    let h = Harness::new();
    h.webhook("billing", &["invoice.paid"]);
    let emission = h
        .state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap();
    let id = emission.deliveries[0].id;

    let report = h
        .state
        .dispatcher
        .attempt(id, &Actor::operator())
        .await
        .unwrap();

    assert!(report.outcome.success);
    assert_eq!(report.outcome.status_code, Some(200));
    assert_eq!(report.delivery.status, DeliveryStatus::Success);
    assert_eq!(report.delivery.attempts, 1);
    assert_eq!(report.delivery.completed_at, Some(t0()));
    assert_eq!(report.delivery.next_retry_at, None);

    let entries: Vec<_> = h
        .audit
        .entries()
        .into_iter()
        .filter(|e| e.collection == WEBHOOK_DELIVERIES)
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, "delivery.success");
    assert_eq!(entries[0].severity, Severity::Info);
    assert_eq!(entries[0].record_id, id.to_string());

    let sent = h.transport.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].url, "https://hooks.example.com/billing/receive");
    assert_eq!(sent[0].event_type, "invoice.paid");
    assert_eq!(sent[0].delivery_id, Some(id));
    assert_eq!(sent[0].payload["invoiceId"], "inv_42");
}

#[tokio::test]
async fn test_three_failures_dead_letter_with_backoff() {
    let h = harness_with_max_attempts(3);
    h.webhook("billing", &["invoice.paid"]);
    h.transport.push_status(500).push_status(502).push_status(503);

    let emission = h
        .state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap();
    let id = emission.deliveries[0].id;
    let dispatcher = &h.state.dispatcher;

    let first = dispatcher.attempt(id, &Actor::operator()).await.unwrap();
    assert!(!first.outcome.success);
    assert_eq!(first.delivery.status, DeliveryStatus::Retrying);
    assert_eq!(first.delivery.attempts, 1);
    assert_eq!(first.delivery.response_code, Some(500));
    assert_eq!(
        first.delivery.next_retry_at,
        Some(t0() + ChronoDuration::minutes(1))
    );

    h.clock.advance(ChronoDuration::minutes(1));
    let second = dispatcher.attempt(id, &Actor::operator()).await.unwrap();
    assert_eq!(second.delivery.status, DeliveryStatus::Retrying);
    assert_eq!(second.delivery.attempts, 2);
    assert_eq!(
        second.delivery.next_retry_at,
        Some(t0() + ChronoDuration::minutes(1) + ChronoDuration::minutes(5))
    );
    assert!(second.delivery.next_retry_at > first.delivery.next_retry_at);

    h.clock.advance(ChronoDuration::minutes(5));
    let third = dispatcher.attempt(id, &Actor::operator()).await.unwrap();
    assert_eq!(third.delivery.status, DeliveryStatus::Dead);
    assert_eq!(third.delivery.attempts, 3);
    assert_eq!(third.delivery.response_code, Some(503));
    assert_eq!(third.delivery.next_retry_at, None);
    assert_eq!(
        third.delivery.completed_at,
        Some(t0() + ChronoDuration::minutes(6))
    );

    let retrying = h.audit_actions("delivery.retrying");
    assert_eq!(retrying.len(), 2);
    assert!(retrying.iter().all(|e| e.severity == Severity::Warning));
    let dead = h.audit_actions("delivery.dead");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].severity, Severity::Warning);

    // Terminal deliveries are immutable
    let err = dispatcher.attempt(id, &Actor::operator()).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(dispatcher.get_delivery(id).unwrap(), third.delivery);
    assert_eq!(h.transport.requests().len(), 3);
}

#[tokio::test]
async fn test_transport_error_and_timeout_count_as_failures() {
    let mut config = Config::test_config();
    config.transport_timeout = Duration::from_millis(50);
    let h = Harness::with_config(config);
    h.webhook("billing", &["invoice.paid"]);
    h.transport
        .push(Scripted::Fail(TransportError::Connect(
            "connection refused".to_string(),
        )))
        .push(Scripted::Hang);

    let id = h
        .state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap()
        .deliveries[0]
        .id;

    let refused = h
        .state
        .dispatcher
        .attempt(id, &Actor::operator())
        .await
        .unwrap();
    assert!(!refused.outcome.success);
    assert_eq!(refused.outcome.status_code, None);
    assert!(refused.outcome.error.is_some());
    assert_eq!(refused.delivery.response_code, None);

    let timed_out = h
        .state
        .dispatcher
        .attempt(id, &Actor::operator())
        .await
        .unwrap();
    assert!(!timed_out.outcome.success);
    assert_eq!(timed_out.delivery.status, DeliveryStatus::Retrying);
    assert_eq!(timed_out.delivery.attempts, 2);
}

#[tokio::test]
async fn test_attempt_on_paused_webhook_conflicts() {
    let h = Harness::new();
    let webhook = h.webhook("billing", &["invoice.paid"]);
    let id = h
        .state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap()
        .deliveries[0]
        .id;

    h.state.webhooks.pause(webhook.id, &Actor::operator()).unwrap();

    let err = h
        .state
        .dispatcher
        .attempt(id, &Actor::operator())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let report = h.state.dispatcher.run_due().await;
    assert_eq!(report.selected, 0);
    assert!(h.transport.requests().is_empty());

    h.state.webhooks.resume(webhook.id, &Actor::operator()).unwrap();
    let report = h.state.dispatcher.run_due().await;
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn test_run_due_respects_next_retry_at() {
    let h = Harness::new();
    h.webhook("billing", &["invoice.paid"]);
    h.transport.push_status(500);
    h.state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap();

    let first = h.state.dispatcher.run_due().await;
    assert_eq!(first.selected, 1);
    assert_eq!(first.retrying, 1);

    // Not due yet
    h.clock.advance(ChronoDuration::seconds(30));
    let early = h.state.dispatcher.run_due().await;
    assert_eq!(early.selected, 0);

    h.clock.advance(ChronoDuration::seconds(30));
    let due = h.state.dispatcher.run_due().await;
    assert_eq!(due.selected, 1);
    assert_eq!(due.succeeded, 1);

    let pending = h.state.dispatcher.list_deliveries(&DeliveryFilter {
        status: Some(DeliveryStatus::Retrying),
        webhook_id: None,
    });
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_concurrent_attempts_on_one_delivery_are_serialized() {
    let h = Harness::new();
    h.webhook("billing", &["invoice.paid"]);
    let id = h
        .state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap()
        .deliveries[0]
        .id;

    let operator = Actor::operator();
    let (a, b) = tokio::join!(
        h.state.dispatcher.attempt(id, &operator),
        h.state.dispatcher.attempt(id, &operator),
    );

    let results = [a, b];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(Error::Conflict(_))))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 1);

    let delivery = h.state.dispatcher.get_delivery(id).unwrap();
    assert_eq!(delivery.attempts, 1);
    assert_eq!(h.transport.requests().len(), 1);
    assert_eq!(h.audit_actions("delivery.success").len(), 1);
}

#[tokio::test]
async fn test_dispatch_skips_deliveries_already_attempted() {
    let h = Harness::new();
    h.webhook("billing", &["invoice.paid"]);
    let id = h
        .state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap()
        .deliveries[0]
        .id;

    h.state
        .dispatcher
        .attempt(id, &Actor::operator())
        .await
        .unwrap();
    let report = h.state.dispatcher.dispatch(&[id]).await;

    assert_eq!(report.selected, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.transport.requests().len(), 1);
}

#[tokio::test]
async fn test_sweep_records_metrics() {
    let h = harness_with_max_attempts(1);
    h.webhook("billing", &["invoice.paid"]);
    h.webhook("ledger", &["invoice.paid"]);
    h.transport.push_status(500);
    h.state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap();

    let report = h.state.dispatcher.run_due().await;
    assert_eq!(report.selected, 2);
    assert_eq!(report.succeeded + report.dead, 2);
    assert_eq!(report.dead, 1);

    let prometheus = h.state.metrics.to_prometheus_format();
    assert!(prometheus.contains("hookdesk_deliveries_dead_total 1"));
}

#[tokio::test]
async fn test_scheduler_delivers_queued_deliveries() {
    let h = Harness::new();
    h.webhook("billing", &["invoice.paid"]);
    let id = h
        .state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap()
        .deliveries[0]
        .id;

    let (scheduler, handle) =
        RetryScheduler::new(h.state.dispatcher.clone(), Duration::from_millis(10));
    let task = tokio::spawn(scheduler.run());

    let mut status = DeliveryStatus::Queued;
    for _ in 0..200 {
        status = h.state.dispatcher.get_delivery(id).unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("scheduler did not stop")
        .unwrap();

    assert_eq!(status, DeliveryStatus::Success);
}

#[tokio::test]
async fn test_lock_entries_released_after_attempts() {
    let h = Harness::new();
    let webhook = h.webhook("billing", &["invoice.paid"]);
    let operator = Actor::operator();

    for _ in 0..100 {
        let err = h
            .state
            .dispatcher
            .attempt(uuid::Uuid::new_v4(), &operator)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
    assert_eq!(h.state.dispatcher.in_flight_len(), 0);

    // Failed attempt leaves the delivery retrying
    h.transport.push_status(500);
    let id = h
        .state
        .dispatcher
        .emit(event("invoice.paid"), &operator)
        .unwrap()
        .deliveries[0]
        .id;
    let report = h.state.dispatcher.attempt(id, &operator).await.unwrap();
    assert_eq!(report.delivery.status, DeliveryStatus::Retrying);
    assert_eq!(h.state.dispatcher.in_flight_len(), 0);

    h.state.webhooks.pause(webhook.id, &operator).unwrap();
    let err = h.state.dispatcher.attempt(id, &operator).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(h.state.dispatcher.in_flight_len(), 0);

    h.state.webhooks.resume(webhook.id, &operator).unwrap();
    let (a, b) = tokio::join!(
        h.state.dispatcher.attempt(id, &operator),
        h.state.dispatcher.attempt(id, &operator),
    );
    assert!(a.is_ok() != b.is_ok());
    assert_eq!(h.state.dispatcher.in_flight_len(), 0);
}

#[tokio::test]
async fn test_concurrent_dispatches_share_in_flight_limit() {
    let mut config = Config::test_config();
    config.max_in_flight = 1;
    config.transport_timeout = Duration::from_millis(50);
    let h = Harness::with_config(config);
    h.webhook("billing", &["invoice.paid"]);
    h.webhook("ledger", &["invoice.paid"]);
    h.transport.push(Scripted::Hang).push(Scripted::Hang);

    let ids: Vec<_> = h
        .state
        .dispatcher
        .emit(event("invoice.paid"), &Actor::operator())
        .unwrap()
        .deliveries
        .iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids.len(), 2);

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(
        h.state.dispatcher.dispatch(&ids[..1]),
        h.state.dispatcher.dispatch(&ids[1..]),
    );

    // One permit total: the two timed-out attempts ran back to back
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(a.retrying + b.retrying, 2);
}
