//! Webhook registry integration tests

mod common;

use std::collections::BTreeMap;

use common::Harness;
use hookdesk::error::Error;
use hookdesk::models::{Actor, WebhookScope, WebhookStatus};
use hookdesk::store::DeliveryFilter;
use hookdesk::transport::{Scripted, TransportError};
use hookdesk::webhooks::{RegisterWebhook, UpdateWebhook};
use pretty_assertions::assert_eq;

#[test]
fn test_lifecycle_pause_resume_delete() {
    let h = Harness::new();
    let operator = Actor::operator();
    let webhook = h.webhook("billing", &["invoice.paid"]);
    assert_eq!(webhook.status, WebhookStatus::Active);
    assert_eq!(webhook.scope, WebhookScope::Global);

    let paused = h.state.webhooks.pause(webhook.id, &operator).unwrap();
    assert_eq!(paused.status, WebhookStatus::Paused);
    // Pausing twice changes nothing and writes no second entry
    h.state.webhooks.pause(webhook.id, &operator).unwrap();
    assert_eq!(h.audit_actions("webhook.paused").len(), 1);

    let resumed = h.state.webhooks.resume(webhook.id, &operator).unwrap();
    assert_eq!(resumed.status, WebhookStatus::Active);

    let deleted = h.state.webhooks.soft_delete(webhook.id, &operator).unwrap();
    assert_eq!(deleted.status, WebhookStatus::Deleted);
    h.state.webhooks.soft_delete(webhook.id, &operator).unwrap();
    assert_eq!(h.audit_actions("webhook.deleted").len(), 1);

    // Deleted webhooks stay readable but cannot change
    assert_eq!(
        h.state.webhooks.get(webhook.id).unwrap().status,
        WebhookStatus::Deleted
    );
    for result in [
        h.state.webhooks.resume(webhook.id, &operator),
        h.state.webhooks.pause(webhook.id, &operator),
        h.state.webhooks.update(
            webhook.id,
            UpdateWebhook {
                name: Some("renamed".to_string()),
                ..UpdateWebhook::default()
            },
            &operator,
        ),
    ] {
        assert!(matches!(result, Err(Error::Conflict(_))));
    }
}

#[test]
fn test_list_filters_by_status() {
    let h = Harness::new();
    let a = h.webhook("a", &["invoice.paid"]);
    h.webhook("b", &["invoice.paid"]);
    h.state.webhooks.pause(a.id, &Actor::operator()).unwrap();

    assert_eq!(h.state.webhooks.list(None).len(), 2);
    let paused = h.state.webhooks.list(Some(WebhookStatus::Paused));
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0].id, a.id);
    assert!(h.state.webhooks.list(Some(WebhookStatus::Deleted)).is_empty());
}

#[test]
fn test_register_validation_leaves_no_trace() {
    let h = Harness::new();
    let operator = Actor::operator();

    let cases = [
        RegisterWebhook {
            name: "no-events".to_string(),
            target_url: "https://hooks.example.com/in".to_string(),
            ..RegisterWebhook::default()
        },
        RegisterWebhook {
            name: "bad-url".to_string(),
            target_url: "ftp://hooks.example.com/in".to_string(),
            event_types: vec!["invoice.paid".to_string()],
            ..RegisterWebhook::default()
        },
        RegisterWebhook {
            name: "reserved-header".to_string(),
            target_url: "https://hooks.example.com/in".to_string(),
            event_types: vec!["invoice.paid".to_string()],
            headers: BTreeMap::from([("Content-Type".to_string(), "text/plain".to_string())]),
            ..RegisterWebhook::default()
        },
        RegisterWebhook {
            name: "half-scope".to_string(),
            target_url: "https://hooks.example.com/in".to_string(),
            event_types: vec!["invoice.paid".to_string()],
            scope_type: Some("customer".to_string()),
            ..RegisterWebhook::default()
        },
    ];

    for input in cases {
        let name = input.name.clone();
        let result = h.state.webhooks.register(input, &operator);
        assert!(
            matches!(result, Err(Error::Validation(_))),
            "{name} should be rejected"
        );
    }
    assert!(h.state.webhooks.list(None).is_empty());
    assert!(h.audit.is_empty());
}

#[test]
fn test_output_masks_url_and_header_values() {
    let h = Harness::new();
    let webhook = h
        .state
        .webhooks
        .register(
            RegisterWebhook {
                name: "billing".to_string(),
                target_url: "https://hooks.example.com/t/s3cr3t-path?token=abc".to_string(),
                event_types: vec!["invoice.paid".to_string()],
                headers: BTreeMap::from([(
                    "X-Signature-Key".to_string(),
                    "very-secret".to_string(),
                )]),
                ..RegisterWebhook::default()
            },
            &Actor::operator(),
        )
        .unwrap();

    let json = serde_json::to_string(&webhook).unwrap();
    assert!(!json.contains("s3cr3t-path"));
    assert!(!json.contains("token=abc"));
    assert!(!json.contains("very-secret"));
    assert!(json.contains("https://hooks.example.com/***"));
    assert!(json.contains("X-Signature-Key"));

    let audit = serde_json::to_string(&h.audit.entries()).unwrap();
    assert!(!audit.contains("s3cr3t-path"));
}

#[test]
fn test_update_changes_subscriptions() {
    let h = Harness::new();
    let webhook = h.webhook("billing", &["invoice.paid"]);

    let updated = h
        .state
        .webhooks
        .update(
            webhook.id,
            UpdateWebhook {
                event_types: Some(vec!["invoice.voided".to_string()]),
                target_url: Some("https://other.example.com:8443/in".to_string()),
                ..UpdateWebhook::default()
            },
            &Actor::operator(),
        )
        .unwrap();

    assert!(updated.subscribes_to("invoice.voided"));
    assert!(!updated.subscribes_to("invoice.paid"));
    assert_eq!(updated.masked_url, "https://other.example.com:8443/***");

    let empty = h
        .state
        .webhooks
        .update(webhook.id, UpdateWebhook::default(), &Actor::operator());
    assert!(matches!(empty, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_test_send_creates_no_delivery() {
    let h = Harness::new();
    let webhook = h.webhook("billing", &["invoice.paid"]);
    let audit_before = h.audit.len();

    let ok = h.state.webhooks.test(webhook.id).await.unwrap();
    assert!(ok.success);
    assert_eq!(ok.status_code, Some(200));

    h.transport.push(Scripted::Fail(TransportError::Connect(
        "dns failure".to_string(),
    )));
    let failed = h.state.webhooks.test(webhook.id).await.unwrap();
    assert!(!failed.success);
    assert_eq!(failed.status_code, None);

    assert!(h
        .state
        .dispatcher
        .list_deliveries(&DeliveryFilter::default())
        .is_empty());
    assert_eq!(h.audit.len(), audit_before);

    let sent = h.transport.requests();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].event_type, "webhook.test");
    assert_eq!(sent[0].delivery_id, None);
}

#[tokio::test]
async fn test_test_send_on_deleted_webhook_conflicts() {
    let h = Harness::new();
    let webhook = h.webhook("billing", &["invoice.paid"]);
    h.state
        .webhooks
        .soft_delete(webhook.id, &Actor::operator())
        .unwrap();

    let err = h.state.webhooks.test(webhook.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert!(h.transport.requests().is_empty());
}
