//! Webhook endpoint registration and lifecycle.
//!
//! ```text
//!          pause             soft_delete
//!  active ◀──────▶ paused ─────────────▶ deleted
//!     │    resume                          ▲
//!     └────────────────────────────────────┘
//! ```
//!
//! The raw target URL goes in once and only ever comes back out through
//! [`Webhook::target_url`] to the transport. Callers see `maskedUrl`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::{info, instrument};
use url::Url;
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{Actor, Webhook, WebhookScope, WebhookStatus, WEBHOOKS};
use crate::store::Store;
use crate::transport::{deliver, DeliveryOutcome, Transport, TransportRequest};

/// Event type used for synthetic test sends
pub const TEST_EVENT_TYPE: &str = "webhook.test";

/// Header names the service sets itself
const RESERVED_HEADERS: &[&str] = &["host", "content-type", "content-length"];
const RESERVED_HEADER_PREFIX: &str = "x-hookdesk-";

/// Input for [`WebhookRegistry::register`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWebhook {
    /// Display name
    pub name: String,
    /// Raw target URL
    pub target_url: String,
    /// Subscribed event types; must not be empty
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Entity collection, or `global`
    #[serde(default)]
    pub scope_type: Option<String>,
    /// Entity id; required with a non-global `scopeType`
    #[serde(default)]
    pub scope_id: Option<String>,
    /// Extra headers sent with every delivery
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Input for [`WebhookRegistry::update`]. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWebhook {
    /// New display name
    pub name: Option<String>,
    /// New target URL; recomputes the mask
    pub target_url: Option<String>,
    /// Replacement event types
    pub event_types: Option<Vec<String>>,
    /// Replacement header map
    pub headers: Option<BTreeMap<String, String>>,
    /// New scope type (`global` resets the scope)
    pub scope_type: Option<String>,
    /// New scope id
    pub scope_id: Option<String>,
}

impl UpdateWebhook {
    /// Whether no field is set
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.target_url.is_none()
            && self.event_types.is_none()
            && self.headers.is_none()
            && self.scope_type.is_none()
            && self.scope_id.is_none()
    }
}

/// Webhook registry
#[derive(Clone)]
pub struct WebhookRegistry {
    store: Arc<Store>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    transport_timeout: Duration,
}

impl WebhookRegistry {
    /// Create a registry over `store`
    pub fn new(
        store: Arc<Store>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        transport_timeout: Duration,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            transport,
            transport_timeout,
        }
    }

    /// Register a new active webhook
    #[instrument(skip_all)]
    pub fn register(&self, input: RegisterWebhook, actor: &Actor) -> Result<Webhook> {
        let name = validate_name(&input.name)?;
        let masked_url = validate_url(&input.target_url)?;
        let event_types = validate_event_types(input.event_types)?;
        let scope = resolve_scope(input.scope_type, input.scope_id)?;
        validate_headers(&input.headers)?;

        let now = self.clock.now();
        let webhook = self.store.insert_webhook(Webhook {
            id: Uuid::new_v4(),
            name,
            target_url: input.target_url.trim().to_string(),
            masked_url,
            event_types,
            scope,
            status: WebhookStatus::Active,
            headers: input.headers,
            created_at: now,
            updated_at: now,
        })?;

        info!(webhook_id = %webhook.id, target = %webhook.masked_url, "webhook registered");
        self.audit.append(
            actor,
            AuditRecord::info(
                "webhook.registered",
                WEBHOOKS,
                webhook.id,
                format!(
                    "Registered webhook \"{}\" -> {} for {}",
                    webhook.name,
                    webhook.masked_url,
                    join(&webhook.event_types)
                ),
            ),
        );

        Ok(webhook)
    }

    /// Change any subset of name, URL, event types, headers and scope
    #[instrument(skip_all, fields(webhook_id = %id))]
    pub fn update(&self, id: Uuid, input: UpdateWebhook, actor: &Actor) -> Result<Webhook> {
        if input.is_empty() {
            return Err(Error::validation("no fields to update"));
        }
        let name = input.name.as_deref().map(validate_name).transpose()?;
        let target = match input.target_url.as_deref() {
            Some(raw) => Some((raw.trim().to_string(), validate_url(raw)?)),
            None => None,
        };
        let event_types = input.event_types.map(validate_event_types).transpose()?;
        if let Some(headers) = &input.headers {
            validate_headers(headers)?;
        }
        let scope = if input.scope_type.is_some() || input.scope_id.is_some() {
            Some(resolve_scope(input.scope_type, input.scope_id)?)
        } else {
            None
        };

        let now = self.clock.now();
        let (webhook, changed) = self.store.update_webhook(&id, |w| {
            reject_deleted(w)?;
            let mut changed = Vec::new();
            if let Some(name) = name {
                w.name = name;
                changed.push("name");
            }
            if let Some((target_url, masked_url)) = target {
                w.target_url = target_url;
                w.masked_url = masked_url;
                changed.push("targetUrl");
            }
            if let Some(event_types) = event_types {
                w.event_types = event_types;
                changed.push("eventTypes");
            }
            if let Some(headers) = input.headers {
                w.headers = headers;
                changed.push("headers");
            }
            if let Some(scope) = scope {
                w.scope = scope;
                changed.push("scope");
            }
            w.updated_at = now;
            Ok(changed)
        })?;

        self.audit.append(
            actor,
            AuditRecord::info(
                "webhook.updated",
                WEBHOOKS,
                id,
                format!("Updated webhook \"{}\": {}", webhook.name, changed.join(", ")),
            ),
        );

        Ok(webhook)
    }

    /// Stop dispatching to a webhook. No-op on a paused webhook.
    pub fn pause(&self, id: Uuid, actor: &Actor) -> Result<Webhook> {
        self.set_status(id, WebhookStatus::Paused, "webhook.paused", actor)
    }

    /// Resume dispatching. No-op on an active webhook.
    pub fn resume(&self, id: Uuid, actor: &Actor) -> Result<Webhook> {
        self.set_status(id, WebhookStatus::Active, "webhook.resumed", actor)
    }

    /// Mark deleted. Idempotent.
    pub fn soft_delete(&self, id: Uuid, actor: &Actor) -> Result<Webhook> {
        let now = self.clock.now();
        let (webhook, changed) = self.store.update_webhook(&id, |w| {
            if w.status == WebhookStatus::Deleted {
                return Ok(false);
            }
            w.status = WebhookStatus::Deleted;
            w.updated_at = now;
            Ok(true)
        })?;

        if changed {
            info!(webhook_id = %id, "webhook deleted");
            self.audit.append(
                actor,
                AuditRecord::info(
                    "webhook.deleted",
                    WEBHOOKS,
                    id,
                    format!("Deleted webhook \"{}\"", webhook.name),
                ),
            );
        }
        Ok(webhook)
    }

    /// Get a webhook by id
    pub fn get(&self, id: Uuid) -> Result<Webhook> {
        self.store
            .webhook(&id)
            .ok_or_else(|| Error::not_found("webhook", id))
    }

    /// List webhooks, optionally filtered by status
    pub fn list(&self, status: Option<WebhookStatus>) -> Vec<Webhook> {
        self.store.webhooks(status)
    }

    /// Send one synthetic event. Creates no delivery and is never retried.
    #[instrument(skip_all, fields(webhook_id = %id))]
    pub async fn test(&self, id: Uuid) -> Result<DeliveryOutcome> {
        let webhook = self.get(id)?;
        reject_deleted(&webhook)?;

        let request = TransportRequest {
            url: webhook.target_url.clone(),
            payload: serde_json::json!({
                "type": TEST_EVENT_TYPE,
                "webhookId": webhook.id,
                "sentAt": self.clock.now(),
            }),
            headers: webhook.headers.clone(),
            event_type: TEST_EVENT_TYPE.to_string(),
            delivery_id: None,
        };
        let outcome = deliver(self.transport.as_ref(), &request, self.transport_timeout).await;

        info!(
            success = outcome.success,
            status_code = ?outcome.status_code,
            duration_ms = outcome.duration_ms,
            "webhook test send"
        );
        Ok(outcome)
    }

    fn set_status(
        &self,
        id: Uuid,
        target: WebhookStatus,
        action: &'static str,
        actor: &Actor,
    ) -> Result<Webhook> {
        let now = self.clock.now();
        let (webhook, changed) = self.store.update_webhook(&id, |w| {
            reject_deleted(w)?;
            if w.status == target {
                return Ok(false);
            }
            w.status = target;
            w.updated_at = now;
            Ok(true)
        })?;

        if changed {
            info!(webhook_id = %id, status = %target, "webhook status changed");
            self.audit.append(
                actor,
                AuditRecord::info(
                    action,
                    WEBHOOKS,
                    id,
                    format!("Webhook \"{}\" is now {}", webhook.name, target),
                ),
            );
        }
        Ok(webhook)
    }
}

impl std::fmt::Debug for WebhookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookRegistry")
            .field("transport_timeout", &self.transport_timeout)
            .finish_non_exhaustive()
    }
}

fn reject_deleted(webhook: &Webhook) -> Result<()> {
    if webhook.status == WebhookStatus::Deleted {
        return Err(Error::conflict(format!("webhook {} is deleted", webhook.id)));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation("name cannot be empty"));
    }
    Ok(name.to_string())
}

/// Validate a target URL and return its masked form: `scheme://host[:port]/***`
pub fn validate_url(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw.trim())
        .map_err(|e| Error::validation(format!("invalid targetUrl: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(Error::validation(format!(
                "unsupported targetUrl scheme: {scheme}"
            )))
        }
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::validation("targetUrl must have a host"))?;

    Ok(match parsed.port() {
        Some(port) => format!("{}://{}:{}/***", parsed.scheme(), host, port),
        None => format!("{}://{}/***", parsed.scheme(), host),
    })
}

fn validate_event_types(event_types: Vec<String>) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for event_type in event_types {
        let event_type = event_type.trim();
        if event_type.is_empty() || event_type.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!("invalid event type: {event_type:?}")));
        }
        out.insert(event_type.to_string());
    }
    if out.is_empty() {
        return Err(Error::validation("eventTypes must not be empty"));
    }
    Ok(out)
}

fn resolve_scope(scope_type: Option<String>, scope_id: Option<String>) -> Result<WebhookScope> {
    let scope_type = scope_type.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let scope_id = scope_id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    match (scope_type, scope_id) {
        (None, None) => Ok(WebhookScope::Global),
        (Some(t), None) if t == "global" => Ok(WebhookScope::Global),
        (Some(t), Some(_)) if t == "global" => {
            Err(Error::validation("a global webhook cannot have a scopeId"))
        }
        (Some(scope_type), Some(scope_id)) => Ok(WebhookScope::Entity {
            scope_type,
            scope_id,
        }),
        (Some(_), None) => Err(Error::validation("scopeId is required with scopeType")),
        (None, Some(_)) => Err(Error::validation("scopeType is required with scopeId")),
    }
}

fn validate_headers(headers: &BTreeMap<String, String>) -> Result<()> {
    for (name, value) in headers {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::validation(format!("invalid header name: {name:?}")))?;
        let lower = parsed.as_str();
        if RESERVED_HEADERS.contains(&lower) || lower.starts_with(RESERVED_HEADER_PREFIX) {
            return Err(Error::validation(format!("header {name} is reserved")));
        }
        HeaderValue::from_str(value)
            .map_err(|_| Error::validation(format!("invalid value for header {name}")))?;
    }
    Ok(())
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}
