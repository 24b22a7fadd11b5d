//! API key issuance, rotation, revocation and validation.
//!
//! # State machine
//!
//! ```text
//!            rotate                lazy, on read after grace
//!  active ───────────▶ rotating ─────────────────────────────▶ expired
//!     │                   │
//!     └──── revoke ───────┴──────────▶ revoked (terminal)
//! ```
//!
//! Raw secrets exist only in the [`IssuedKey`] returned by [`create`] and
//! [`rotate`]; the store keeps a SHA-256 digest. Every operation runs inside one
//! key-table transaction, so a `validate` racing a `revoke` sees either the
//! whole revocation or none of it.
//!
//! [`create`]: CredentialRegistry::create
//! [`rotate`]: CredentialRegistry::rotate

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{Actor, ApiKey, KeyMode, KeyStatus, Severity, API_KEYS};
use crate::store::Store;

/// Random bytes in a secret (hex encoded → 48 characters)
const SECRET_BYTES: usize = 24;

/// Characters of the secret kept as a non-secret identifier
const KEY_PREFIX_LEN: usize = 12;

/// Input for [`CredentialRegistry::create`]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApiKey {
    /// Display name
    pub name: String,
    /// Admin or client
    pub mode: KeyMode,
    /// Scope keys
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Optional hard expiry, must be in the future
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Input for [`CredentialRegistry::update`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateApiKey {
    /// New display name
    pub name: Option<String>,
    /// Replacement scope list
    pub scopes: Option<Vec<String>>,
}

/// A key together with its raw secret. Returned exactly once.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedKey {
    /// The stored key
    pub key: ApiKey,
    /// Raw secret; not recoverable afterwards
    pub secret: String,
}

/// Result of a revoke call
#[derive(Debug, Clone)]
pub struct Revocation {
    /// The key after the call
    pub key: ApiKey,
    /// False when the key was already revoked
    pub changed: bool,
}

/// API key lifecycle manager
#[derive(Clone)]
pub struct CredentialRegistry {
    store: Arc<Store>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    rotation_grace: Duration,
}

impl CredentialRegistry {
    /// Create a registry over `store`
    pub fn new(
        store: Arc<Store>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        rotation_grace: Duration,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            rotation_grace,
        }
    }

    /// Issue a new active key
    pub fn create(&self, input: CreateApiKey, actor: &Actor) -> Result<IssuedKey> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("name cannot be empty"));
        }
        let scopes = normalize_scopes(input.scopes)?;
        let now = self.clock.now();
        if let Some(expires_at) = input.expires_at {
            if expires_at <= now {
                return Err(Error::validation("expiresAt must be in the future"));
            }
        }

        let (secret, key) = self.new_key(name, input.mode, scopes, input.expires_at, None, now);
        self.store.write_keys(|keys| keys.insert(key.clone()))?;

        info!(key_id = %key.id, prefix = %key.key_prefix, mode = key.mode.as_str(), "api key created");
        self.audit.append(
            actor,
            AuditRecord::info(
                "key.created",
                API_KEYS,
                key.id,
                format!("Created {} key \"{}\"", key.mode.as_str(), key.name),
            ),
        );

        Ok(IssuedKey { key, secret })
    }

    /// Replace a key with a fresh one; the old key keeps validating for the
    /// grace window.
    pub fn rotate(&self, id: Uuid, actor: &Actor) -> Result<IssuedKey> {
        let now = self.clock.now();
        let grace_end = now
            .checked_add_signed(self.rotation_grace)
            .ok_or_else(|| Error::Internal("rotation grace window overflows".to_string()))?;

        let (old, issued) = self.store.write_keys(|keys| -> Result<(ApiKey, IssuedKey)> {
            let old = keys.get(&id).ok_or_else(|| Error::not_found("api key", id))?;
            let effective = old.effective_status(now);
            if !matches!(effective, KeyStatus::Active | KeyStatus::Rotating) {
                return Err(Error::conflict(format!(
                    "cannot rotate key {id}: key is {effective}"
                )));
            }

            let (secret, new_key) = self.new_key(
                old.name.clone(),
                old.mode,
                old.scopes.clone(),
                None,
                Some(old.id),
                now,
            );
            keys.insert(new_key.clone())?;

            let old = keys
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("api key", id))?;
            old.status = KeyStatus::Rotating;
            old.rotated_to_id = Some(new_key.id);
            old.expires_at = Some(match old.expires_at {
                Some(existing) if existing < grace_end => existing,
                _ => grace_end,
            });

            Ok((
                old.clone(),
                IssuedKey {
                    key: new_key,
                    secret,
                },
            ))
        })?;

        info!(
            old_key_id = %old.id,
            new_key_id = %issued.key.id,
            grace_until = ?old.expires_at,
            "api key rotated"
        );
        self.audit.append(
            actor,
            AuditRecord::info(
                "key.rotated",
                API_KEYS,
                old.id,
                format!(
                    "Rotated key \"{}\" to {}; old key valid until {}",
                    old.name,
                    issued.key.id,
                    old.expires_at.map(|t| t.to_rfc3339()).unwrap_or_default()
                ),
            )
            .with_severity(Severity::Warning),
        );

        Ok(issued)
    }

    /// Revoke immediately, whatever the current status. Idempotent.
    pub fn revoke(&self, id: Uuid, actor: &Actor) -> Result<Revocation> {
        let now = self.clock.now();

        let revocation = self.store.write_keys(|keys| -> Result<Revocation> {
            let key = keys
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("api key", id))?;
            if key.status == KeyStatus::Revoked {
                return Ok(Revocation {
                    key: key.clone(),
                    changed: false,
                });
            }
            key.status = KeyStatus::Revoked;
            key.revoked_at = Some(now);
            key.revoked_by = Some(actor.id.clone());
            Ok(Revocation {
                key: key.clone(),
                changed: true,
            })
        })?;

        if revocation.changed {
            warn!(key_id = %id, revoked_by = %actor.id, "api key revoked");
            self.audit.append(
                actor,
                AuditRecord::info(
                    "key.revoked",
                    API_KEYS,
                    id,
                    format!("Revoked key \"{}\"", revocation.key.name),
                )
                .with_severity(Severity::Critical),
            );
        } else {
            debug!(key_id = %id, "revoke on already-revoked key");
        }

        Ok(revocation)
    }

    /// Change a key's name and/or scopes
    pub fn update(&self, id: Uuid, input: UpdateApiKey, actor: &Actor) -> Result<ApiKey> {
        let name = match input.name {
            Some(name) if name.trim().is_empty() => {
                return Err(Error::validation("name cannot be empty"))
            }
            Some(name) => Some(name.trim().to_string()),
            None => None,
        };
        let scopes = input.scopes.map(normalize_scopes).transpose()?;
        let now = self.clock.now();

        let key = self.store.write_keys(|keys| -> Result<ApiKey> {
            let key = keys
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("api key", id))?;
            let effective = key.effective_status(now);
            if !key.is_usable(now) {
                return Err(Error::conflict(format!(
                    "cannot update key {id}: key is {effective}"
                )));
            }
            if let Some(name) = name {
                key.name = name;
            }
            if let Some(scopes) = scopes {
                key.scopes = scopes;
            }
            Ok(key.clone())
        })?;

        self.audit.append(
            actor,
            AuditRecord::info(
                "key.updated",
                API_KEYS,
                id,
                format!("Updated key \"{}\" (scopes: {})", key.name, key.scopes.join(", ")),
            ),
        );

        Ok(key)
    }

    /// Resolve a raw secret to its key.
    ///
    /// Rejects unknown, revoked and expired keys with [`Error::Unauthorized`].
    /// A key found past its expiry is marked `expired` in the same transaction.
    pub fn validate(&self, secret: &str) -> Result<ApiKey> {
        let hash = hash_secret(secret);
        let now = self.clock.now();

        self.store.write_keys(|keys| {
            let key = keys
                .by_secret_hash_mut(&hash)
                .ok_or_else(|| Error::Unauthorized("unknown api key".to_string()))?;

            match key.effective_status(now) {
                KeyStatus::Revoked => Err(Error::Unauthorized(format!("api key {} is revoked", key.id))),
                KeyStatus::Expired => {
                    if key.status != KeyStatus::Expired {
                        debug!(key_id = %key.id, "marking api key expired");
                        key.status = KeyStatus::Expired;
                    }
                    Err(Error::Unauthorized(format!("api key {} has expired", key.id)))
                }
                KeyStatus::Active | KeyStatus::Rotating => {
                    key.last_used_at = Some(now);
                    Ok(key.clone())
                }
            }
        })
    }

    /// Get a key by id, reporting its effective status
    pub fn get(&self, id: Uuid) -> Result<ApiKey> {
        let now = self.clock.now();
        self.store
            .read_keys(|keys| keys.get(&id).cloned())
            .map(|key| with_effective_status(key, now))
            .ok_or_else(|| Error::not_found("api key", id))
    }

    /// All keys, oldest first, reporting effective status
    pub fn list(&self) -> Vec<ApiKey> {
        let now = self.clock.now();
        self.store
            .read_keys(|keys| keys.all())
            .into_iter()
            .map(|key| with_effective_status(key, now))
            .collect()
    }

    fn new_key(
        &self,
        name: String,
        mode: KeyMode,
        scopes: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
        rotated_from_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> (String, ApiKey) {
        let secret = generate_secret(mode);
        let key = ApiKey {
            id: Uuid::new_v4(),
            name,
            secret_hash: hash_secret(&secret),
            key_prefix: secret.chars().take(KEY_PREFIX_LEN).collect(),
            mode,
            scopes,
            status: KeyStatus::Active,
            created_at: now,
            expires_at,
            rotated_from_id,
            rotated_to_id: None,
            revoked_at: None,
            revoked_by: None,
            last_used_at: None,
        };
        (secret, key)
    }
}

impl std::fmt::Debug for CredentialRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRegistry")
            .field("rotation_grace", &self.rotation_grace)
            .finish_non_exhaustive()
    }
}

/// Generate a secret: `hk_<mode>_` + 48 hex characters from the OS CSPRNG
fn generate_secret(mode: KeyMode) -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    format!("hk_{}_{}", mode.as_str(), hex::encode(bytes))
}

fn with_effective_status(mut key: ApiKey, now: DateTime<Utc>) -> ApiKey {
    key.status = key.effective_status(now);
    key
}

/// SHA-256 hex digest of a secret
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn normalize_scopes(scopes: Vec<String>) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(scopes.len());
    for scope in scopes {
        let scope = scope.trim();
        if scope.is_empty() {
            return Err(Error::validation("scope keys cannot be empty"));
        }
        if scope.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!("invalid scope key: {scope:?}")));
        }
        if !out.iter().any(|s| s == scope) {
            out.push(scope.to_string());
        }
    }
    Ok(out)
}
