//! Persistent record types.
//!
//! These are the rows of the [`Store`](crate::store::Store) tables. Everything
//! serializes as camelCase JSON for the HTTP surface. Two fields never leave the
//! process: an API key's secret hash and a webhook's raw target URL.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Collection name of API keys, as recorded in audit entries
pub const API_KEYS: &str = "api_keys";
/// Collection name of webhooks
pub const WEBHOOKS: &str = "webhooks";
/// Collection name of emitted events
pub const WEBHOOK_EVENTS: &str = "webhook_events";
/// Collection name of webhook deliveries
pub const WEBHOOK_DELIVERIES: &str = "webhook_deliveries";

// ============================================================================
// Actors
// ============================================================================

/// Role of whoever triggered a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    /// Holder of the bootstrap token
    Operator,
    /// Admin-mode API key
    Admin,
    /// Client-mode API key
    Client,
    /// Background jobs (retry scheduler)
    System,
}

impl ActorRole {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Admin => "admin",
            Self::Client => "client",
            Self::System => "system",
        }
    }

    /// Whether this role may perform mutating operations
    pub fn can_mutate(&self) -> bool {
        !matches!(self, Self::Client)
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who performed an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Key id, or a fixed name for operator/system actors
    pub id: String,
    /// Role carried into audit entries
    pub role: ActorRole,
}

impl Actor {
    /// The bootstrap-token holder
    pub fn operator() -> Self {
        Self {
            id: "operator".to_string(),
            role: ActorRole::Operator,
        }
    }

    /// Background jobs
    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            role: ActorRole::System,
        }
    }

    /// Actor authenticated through an API key
    pub fn from_key(key: &ApiKey) -> Self {
        Self {
            id: key.id.to_string(),
            role: match key.mode {
                KeyMode::Admin => ActorRole::Admin,
                KeyMode::Client => ActorRole::Client,
            },
        }
    }
}

// ============================================================================
// API keys
// ============================================================================

/// What an API key is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// Full access, including mutations
    Admin,
    /// Read-only, safe to embed in client integrations
    Client,
}

impl KeyMode {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Client => "client",
        }
    }
}

/// Lifecycle state of an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Validates normally
    Active,
    /// Superseded by a newer key; validates until `expiresAt`
    Rotating,
    /// Past its expiry
    Expired,
    /// Terminal
    Revoked,
}

impl KeyStatus {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An issued API credential. The raw secret is never part of this record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    /// Key id
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// SHA-256 hex digest of the secret
    #[serde(skip_serializing)]
    pub secret_hash: String,
    /// Non-secret leading characters of the secret, for identification
    pub key_prefix: String,
    /// Admin or client
    pub mode: KeyMode,
    /// Scope keys granted to this credential
    pub scopes: Vec<String>,
    /// Stored status; see [`ApiKey::effective_status`]
    pub status: KeyStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Hard expiry (explicit, or the end of a rotation grace window)
    pub expires_at: Option<DateTime<Utc>>,
    /// Key this one replaced
    pub rotated_from_id: Option<Uuid>,
    /// Key that replaced this one
    pub rotated_to_id: Option<Uuid>,
    /// When the key was revoked
    pub revoked_at: Option<DateTime<Utc>>,
    /// Actor id that revoked the key
    pub revoked_by: Option<String>,
    /// Last successful validation
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Status as observed at `now`, applying lazy expiry.
    ///
    /// The stored status may still say `active`/`rotating` after the expiry
    /// has passed; callers must always go through this accessor.
    pub fn effective_status(&self, now: DateTime<Utc>) -> KeyStatus {
        match self.status {
            KeyStatus::Revoked | KeyStatus::Expired => self.status,
            KeyStatus::Active | KeyStatus::Rotating => match self.expires_at {
                Some(expires_at) if now >= expires_at => KeyStatus::Expired,
                _ => self.status,
            },
        }
    }

    /// Whether a secret for this key would validate at `now`
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.effective_status(now),
            KeyStatus::Active | KeyStatus::Rotating
        )
    }
}

// ============================================================================
// Webhooks
// ============================================================================

/// Lifecycle state of a webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    /// Receives deliveries
    Active,
    /// Registered but excluded from dispatch
    Paused,
    /// Soft-deleted; retained for history
    Deleted,
}

impl WebhookStatus {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WebhookStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "deleted" => Ok(Self::Deleted),
            other => Err(crate::Error::validation(format!(
                "unknown webhook status: {other}"
            ))),
        }
    }
}

/// What a webhook (or an event) is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WebhookScope {
    /// Receives events for every entity
    #[default]
    Global,
    /// Restricted to one entity
    #[serde(rename_all = "camelCase")]
    Entity {
        /// Entity collection, e.g. `customer`
        scope_type: String,
        /// Entity id
        scope_id: String,
    },
}

/// A registered delivery target
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    /// Webhook id
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Raw target URL, only ever handed to the transport
    #[serde(skip_serializing)]
    pub target_url: String,
    /// Host plus a path placeholder; the only URL form returned to callers
    pub masked_url: String,
    /// Subscribed event types (never empty)
    pub event_types: BTreeSet<String>,
    /// Attachment scope
    pub scope: WebhookScope,
    /// Lifecycle state
    pub status: WebhookStatus,
    /// Extra headers sent with every delivery; values are redacted on output
    #[serde(serialize_with = "redact_header_values")]
    pub headers: BTreeMap<String, String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Whether the webhook should receive events of `event_type`
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.status == WebhookStatus::Active && self.event_types.contains(event_type)
    }

    /// Whether `event` fans out to this webhook. Global webhooks see every
    /// event; entity webhooks only events about the same entity.
    pub fn receives(&self, event: &WebhookEvent) -> bool {
        self.subscribes_to(&event.event_type)
            && match &self.scope {
                WebhookScope::Global => true,
                scoped => *scoped == event.scope,
            }
    }
}

fn redact_header_values<S: Serializer>(
    headers: &BTreeMap<String, String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(headers.keys().map(|name| (name, "********")))
}

// ============================================================================
// Events and deliveries
// ============================================================================

/// An immutable fact to be delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    /// Event id
    pub id: Uuid,
    /// Event type, matched against webhook subscriptions
    #[serde(rename = "type")]
    pub event_type: String,
    /// Arbitrary JSON payload
    pub payload: serde_json::Value,
    /// Entity the event is about
    #[serde(default)]
    pub scope: WebhookScope,
    /// Emission time
    pub created_at: DateTime<Utc>,
}

/// Delivery state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Created, not yet attempted
    Queued,
    /// Failed at least once; waiting for `nextRetryAt`
    Retrying,
    /// Delivered (terminal)
    Success,
    /// Dead-lettered after exhausting attempts (terminal)
    Dead,
}

impl DeliveryStatus {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Dead => "dead",
        }
    }

    /// `success` and `dead` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Dead)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "retrying" => Ok(Self::Retrying),
            "success" => Ok(Self::Success),
            "dead" => Ok(Self::Dead),
            other => Err(crate::Error::validation(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

/// Attempt-tracking record for one (webhook, event) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    /// Delivery id
    pub id: Uuid,
    /// Target webhook
    pub webhook_id: Uuid,
    /// Event being delivered
    pub event_id: Uuid,
    /// State machine position
    pub status: DeliveryStatus,
    /// Attempts made so far
    pub attempts: u32,
    /// Attempt budget, fixed at creation
    pub max_attempts: u32,
    /// Time of the most recent attempt
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Present iff `status == retrying`
    pub next_retry_at: Option<DateTime<Utc>>,
    /// HTTP status of the most recent attempt, if a response arrived
    pub response_code: Option<u16>,
    /// Truncated response body (or transport error) of the most recent attempt
    pub response_body_snippet: Option<String>,
    /// Duration of the most recent attempt
    pub duration_ms: Option<u64>,
    /// Present iff the status is terminal
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every commit
    #[serde(skip_serializing)]
    pub version: u64,
}

impl WebhookDelivery {
    /// Fresh `queued` delivery
    pub fn queued(webhook_id: Uuid, event_id: Uuid, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_id,
            event_id,
            status: DeliveryStatus::Queued,
            attempts: 0,
            max_attempts,
            last_attempt_at: None,
            next_retry_at: None,
            response_code: None,
            response_body_snippet: None,
            duration_ms: None,
            completed_at: None,
            created_at: now,
            version: 0,
        }
    }

    /// Whether the scheduler should pick this delivery up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            DeliveryStatus::Queued => true,
            DeliveryStatus::Retrying => self.next_retry_at.is_some_and(|at| at <= now),
            DeliveryStatus::Success | DeliveryStatus::Dead => false,
        }
    }
}

// ============================================================================
// Audit
// ============================================================================

/// How loudly an audit entry should be surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine
    Info,
    /// Failed or degraded outcome
    Warning,
    /// Security-relevant
    Critical,
}

/// Immutable record of one state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Entry id
    pub id: Uuid,
    /// Dotted action name, e.g. `delivery.dead`
    pub action: String,
    /// Affected collection
    pub collection: String,
    /// Affected record id
    pub record_id: String,
    /// Human-readable summary
    pub summary: String,
    /// Role of the actor
    pub actor_role: ActorRole,
    /// Actor id
    pub actor_id: String,
    /// Severity
    pub severity: Severity,
    /// Time of the mutation
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn key(status: KeyStatus, expires_at: Option<DateTime<Utc>>) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            name: "ci".to_string(),
            secret_hash: "hash".to_string(),
            key_prefix: "hk_admin".to_string(),
            mode: KeyMode::Admin,
            scopes: vec![],
            status,
            created_at: Utc::now(),
            expires_at,
            rotated_from_id: None,
            rotated_to_id: None,
            revoked_at: None,
            revoked_by: None,
            last_used_at: None,
        }
    }

    #[test]
    fn test_effective_status_lazy_expiry() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let rotating = key(KeyStatus::Rotating, Some(t0 + Duration::hours(24)));

        assert_eq!(rotating.effective_status(t0), KeyStatus::Rotating);
        assert_eq!(
            rotating.effective_status(t0 + Duration::hours(24)),
            KeyStatus::Expired
        );
        assert!(!rotating.is_usable(t0 + Duration::hours(25)));
    }

    #[test]
    fn test_revoked_is_never_usable() {
        let now = Utc::now();
        let revoked = key(KeyStatus::Revoked, None);
        assert_eq!(revoked.effective_status(now), KeyStatus::Revoked);
        assert!(!revoked.is_usable(now));
    }

    #[test]
    fn test_secret_hash_not_serialized() {
        let json = serde_json::to_value(key(KeyStatus::Active, None)).unwrap();
        assert!(json.get("secretHash").is_none());
        assert_eq!(json["status"], "active");
        assert_eq!(json["keyPrefix"], "hk_admin");
    }

    #[test]
    fn test_webhook_serialization_hides_target() {
        let now = Utc::now();
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer s3cret".to_string());
        let webhook = Webhook {
            id: Uuid::new_v4(),
            name: "billing".to_string(),
            target_url: "https://hooks.example.com/secret/path?token=abc".to_string(),
            masked_url: "https://hooks.example.com/***".to_string(),
            event_types: BTreeSet::from(["invoice.paid".to_string()]),
            scope: WebhookScope::Global,
            status: WebhookStatus::Active,
            headers,
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_string(&webhook).unwrap();
        assert!(!json.contains("secret/path"));
        assert!(!json.contains("s3cret"));
        assert!(json.contains("\"maskedUrl\":\"https://hooks.example.com/***\""));
        assert!(json.contains("\"kind\":\"global\""));
    }

    #[test]
    fn test_delivery_is_due() {
        let now = Utc::now();
        let mut delivery = WebhookDelivery::queued(Uuid::new_v4(), Uuid::new_v4(), 5, now);
        assert!(delivery.is_due(now));

        delivery.status = DeliveryStatus::Retrying;
        delivery.next_retry_at = Some(now + Duration::minutes(1));
        assert!(!delivery.is_due(now));
        assert!(delivery.is_due(now + Duration::minutes(1)));

        delivery.status = DeliveryStatus::Dead;
        delivery.next_retry_at = None;
        assert!(!delivery.is_due(now + Duration::days(1)));
    }

    #[test]
    fn test_scoped_webhook_receives_matching_events_only() {
        let now = Utc::now();
        let customer = WebhookScope::Entity {
            scope_type: "customer".to_string(),
            scope_id: "c_42".to_string(),
        };
        let webhook = Webhook {
            id: Uuid::new_v4(),
            name: "crm".to_string(),
            target_url: "https://crm.example.com/in".to_string(),
            masked_url: "https://crm.example.com/***".to_string(),
            event_types: BTreeSet::from(["invoice.paid".to_string()]),
            scope: customer.clone(),
            status: WebhookStatus::Active,
            headers: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        let mut event = WebhookEvent {
            id: Uuid::new_v4(),
            event_type: "invoice.paid".to_string(),
            payload: serde_json::json!({}),
            scope: WebhookScope::Global,
            created_at: now,
        };

        assert!(!webhook.receives(&event));
        event.scope = customer;
        assert!(webhook.receives(&event));
        event.event_type = "invoice.voided".to_string();
        assert!(!webhook.receives(&event));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            "retrying".parse::<DeliveryStatus>().unwrap(),
            DeliveryStatus::Retrying
        );
        assert!("bogus".parse::<DeliveryStatus>().is_err());
        assert_eq!(
            "paused".parse::<WebhookStatus>().unwrap(),
            WebhookStatus::Paused
        );
    }
}
