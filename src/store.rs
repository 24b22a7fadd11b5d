//! In-memory transactional record store.
//!
//! One table per collection, each keyed by id and guarded by its own lock, so a
//! mutation of a table is applied atomically with respect to every reader of
//! that table. The store is an explicit handle (`Arc<Store>`) handed to each
//! registry; there is no process-wide accessor.
//!
//! # Tables
//!
//! ```text
//! keys        id -> ApiKey            + secret-hash index
//! webhooks    id -> Webhook
//! events      id -> WebhookEvent      (insert-only)
//! deliveries  id -> WebhookDelivery   + unique (webhook_id, event_id) index
//!                                     + version column (compare-and-swap commits)
//! ```

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    ApiKey, DeliveryStatus, Webhook, WebhookDelivery, WebhookEvent, WebhookStatus,
};

/// The API key table with its secret-hash index.
///
/// Only reachable through [`Store::read_keys`] / [`Store::write_keys`], which
/// makes every closure a single atomic unit relative to validation.
#[derive(Debug, Default)]
pub struct KeyTable {
    rows: HashMap<Uuid, ApiKey>,
    by_hash: HashMap<String, Uuid>,
}

impl KeyTable {
    /// Look up a key by id
    pub fn get(&self, id: &Uuid) -> Option<&ApiKey> {
        self.rows.get(id)
    }

    /// Mutable lookup by id
    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut ApiKey> {
        self.rows.get_mut(id)
    }

    /// Look up a key by the SHA-256 digest of its secret
    pub fn by_secret_hash(&self, hash: &str) -> Option<&ApiKey> {
        self.by_hash.get(hash).and_then(|id| self.rows.get(id))
    }

    /// Mutable lookup by secret digest
    pub fn by_secret_hash_mut(&mut self, hash: &str) -> Option<&mut ApiKey> {
        let id = *self.by_hash.get(hash)?;
        self.rows.get_mut(&id)
    }

    /// Insert a new key. Duplicate ids or secret digests are rejected.
    pub fn insert(&mut self, key: ApiKey) -> Result<()> {
        if self.rows.contains_key(&key.id) {
            return Err(Error::conflict(format!("api key {} already exists", key.id)));
        }
        if self.by_hash.contains_key(&key.secret_hash) {
            return Err(Error::conflict("secret digest collision"));
        }
        self.by_hash.insert(key.secret_hash.clone(), key.id);
        self.rows.insert(key.id, key);
        Ok(())
    }

    /// All keys, oldest first
    pub fn all(&self) -> Vec<ApiKey> {
        let mut keys: Vec<ApiKey> = self.rows.values().cloned().collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        keys
    }
}

#[derive(Debug, Default)]
struct DeliveryTable {
    rows: HashMap<Uuid, WebhookDelivery>,
    by_pair: HashSet<(Uuid, Uuid)>,
}

/// Filter for delivery listings
#[derive(Debug, Clone, Default)]
pub struct DeliveryFilter {
    /// Only deliveries in this state
    pub status: Option<DeliveryStatus>,
    /// Only deliveries for this webhook
    pub webhook_id: Option<Uuid>,
}

/// Shared record store
#[derive(Debug, Default)]
pub struct Store {
    keys: RwLock<KeyTable>,
    webhooks: RwLock<HashMap<Uuid, Webhook>>,
    events: RwLock<HashMap<Uuid, WebhookEvent>>,
    deliveries: RwLock<DeliveryTable>,
}

impl Store {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------------

    /// Run `f` under the key table's read lock
    pub fn read_keys<R>(&self, f: impl FnOnce(&KeyTable) -> R) -> R {
        f(&self.keys.read())
    }

    /// Run `f` under the key table's write lock; the whole closure is one
    /// atomic transaction.
    pub fn write_keys<R>(&self, f: impl FnOnce(&mut KeyTable) -> R) -> R {
        f(&mut self.keys.write())
    }

    // ------------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------------

    /// Insert a new webhook
    pub fn insert_webhook(&self, webhook: Webhook) -> Result<Webhook> {
        let mut webhooks = self.webhooks.write();
        if webhooks.contains_key(&webhook.id) {
            return Err(Error::conflict(format!(
                "webhook {} already exists",
                webhook.id
            )));
        }
        webhooks.insert(webhook.id, webhook.clone());
        Ok(webhook)
    }

    /// Get a webhook by id
    pub fn webhook(&self, id: &Uuid) -> Option<Webhook> {
        self.webhooks.read().get(id).cloned()
    }

    /// List webhooks, oldest first, optionally filtered by status
    pub fn webhooks(&self, status: Option<WebhookStatus>) -> Vec<Webhook> {
        let mut items: Vec<Webhook> = self
            .webhooks
            .read()
            .values()
            .filter(|w| status.map_or(true, |s| w.status == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Apply `f` to a webhook atomically. If `f` fails the row is untouched.
    pub fn update_webhook<R>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut Webhook) -> Result<R>,
    ) -> Result<(Webhook, R)> {
        let mut webhooks = self.webhooks.write();
        let current = webhooks
            .get(id)
            .ok_or_else(|| Error::not_found("webhook", id))?;

        let mut draft = current.clone();
        let out = f(&mut draft)?;
        webhooks.insert(*id, draft.clone());
        Ok((draft, out))
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Insert an event. Events are immutable; there is no update path.
    pub fn insert_event(&self, event: WebhookEvent) -> Result<WebhookEvent> {
        let mut events = self.events.write();
        if events.contains_key(&event.id) {
            return Err(Error::conflict(format!("event {} already exists", event.id)));
        }
        events.insert(event.id, event.clone());
        Ok(event)
    }

    /// Get an event by id
    pub fn event(&self, id: &Uuid) -> Option<WebhookEvent> {
        self.events.read().get(id).cloned()
    }

    // ------------------------------------------------------------------------
    // Deliveries
    // ------------------------------------------------------------------------

    /// Insert a new delivery. At most one delivery exists per (webhook, event).
    pub fn insert_delivery(&self, delivery: WebhookDelivery) -> Result<WebhookDelivery> {
        let mut table = self.deliveries.write();
        let pair = (delivery.webhook_id, delivery.event_id);
        if table.by_pair.contains(&pair) {
            return Err(Error::conflict(format!(
                "delivery already exists for webhook {} and event {}",
                pair.0, pair.1
            )));
        }
        table.by_pair.insert(pair);
        table.rows.insert(delivery.id, delivery.clone());
        Ok(delivery)
    }

    /// Get a delivery by id
    pub fn delivery(&self, id: &Uuid) -> Option<WebhookDelivery> {
        self.deliveries.read().rows.get(id).cloned()
    }

    /// List deliveries, oldest first
    pub fn deliveries(&self, filter: &DeliveryFilter) -> Vec<WebhookDelivery> {
        let mut items: Vec<WebhookDelivery> = self
            .deliveries
            .read()
            .rows
            .values()
            .filter(|d| filter.status.map_or(true, |s| d.status == s))
            .filter(|d| filter.webhook_id.map_or(true, |w| d.webhook_id == w))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Commit an attempt outcome with optimistic concurrency.
    ///
    /// Succeeds only if the stored row still carries `expected_version` and is
    /// not terminal. The committed row gets `expected_version + 1`.
    pub fn commit_delivery(
        &self,
        mut updated: WebhookDelivery,
        expected_version: u64,
    ) -> Result<WebhookDelivery> {
        let mut table = self.deliveries.write();
        let current = table
            .rows
            .get(&updated.id)
            .ok_or_else(|| Error::not_found("delivery", updated.id))?;

        if current.status.is_terminal() {
            return Err(Error::conflict(format!(
                "delivery {} is already {}",
                current.id, current.status
            )));
        }
        if current.version != expected_version {
            return Err(Error::conflict(format!(
                "delivery {} was modified concurrently (version {} != {})",
                current.id, current.version, expected_version
            )));
        }
        if current.webhook_id != updated.webhook_id || current.event_id != updated.event_id {
            return Err(Error::Internal(format!(
                "delivery {} identity changed during commit",
                current.id
            )));
        }

        updated.version = expected_version + 1;
        table.rows.insert(updated.id, updated.clone());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};

    use crate::models::WebhookScope;

    fn webhook() -> Webhook {
        let now = Utc::now();
        Webhook {
            id: Uuid::new_v4(),
            name: "ledger".to_string(),
            target_url: "https://example.com/hook".to_string(),
            masked_url: "https://example.com/***".to_string(),
            event_types: BTreeSet::from(["invoice.paid".to_string()]),
            scope: WebhookScope::Global,
            status: WebhookStatus::Active,
            headers: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_delivery_pair_is_unique() {
        let store = Store::new();
        let webhook_id = Uuid::new_v4();
        let event_id = Uuid::new_v4();

        store
            .insert_delivery(WebhookDelivery::queued(webhook_id, event_id, 5, Utc::now()))
            .unwrap();
        let err = store
            .insert_delivery(WebhookDelivery::queued(webhook_id, event_id, 5, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_commit_delivery_checks_version() {
        let store = Store::new();
        let delivery = store
            .insert_delivery(WebhookDelivery::queued(
                Uuid::new_v4(),
                Uuid::new_v4(),
                5,
                Utc::now(),
            ))
            .unwrap();

        let mut first = delivery.clone();
        first.attempts = 1;
        let committed = store.commit_delivery(first, 0).unwrap();
        assert_eq!(committed.version, 1);

        let mut stale = delivery.clone();
        stale.attempts = 1;
        let err = store.commit_delivery(stale, 0).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.delivery(&delivery.id).unwrap().attempts, 1);
    }

    #[test]
    fn test_commit_delivery_refuses_terminal_rows() {
        let store = Store::new();
        let delivery = store
            .insert_delivery(WebhookDelivery::queued(
                Uuid::new_v4(),
                Uuid::new_v4(),
                5,
                Utc::now(),
            ))
            .unwrap();

        let mut done = delivery.clone();
        done.status = DeliveryStatus::Success;
        done.attempts = 1;
        store.commit_delivery(done.clone(), 0).unwrap();

        done.attempts = 2;
        let err = store.commit_delivery(done, 1).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.delivery(&delivery.id).unwrap().attempts, 1);
    }

    #[test]
    fn test_update_webhook_rolls_back_on_error() {
        let store = Store::new();
        let hook = store.insert_webhook(webhook()).unwrap();

        let result: Result<(Webhook, ())> = store.update_webhook(&hook.id, |w| {
            w.name = "changed".to_string();
            Err(Error::validation("nope"))
        });
        assert!(result.is_err());
        assert_eq!(store.webhook(&hook.id).unwrap().name, "ledger");
    }

    #[test]
    fn test_webhooks_filter_by_status() {
        let store = Store::new();
        store.insert_webhook(webhook()).unwrap();
        let mut paused = webhook();
        paused.status = WebhookStatus::Paused;
        store.insert_webhook(paused).unwrap();

        assert_eq!(store.webhooks(None).len(), 2);
        assert_eq!(store.webhooks(Some(WebhookStatus::Paused)).len(), 1);
        assert_eq!(store.webhooks(Some(WebhookStatus::Deleted)).len(), 0);
    }
}
