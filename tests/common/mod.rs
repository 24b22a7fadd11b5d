//! Shared test harness: manual clock, scripted transport, in-memory audit.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use hookdesk::audit::MemoryAuditSink;
use hookdesk::clock::ManualClock;
use hookdesk::config::Config;
use hookdesk::credentials::{CreateApiKey, IssuedKey};
use hookdesk::handlers::AppState;
use hookdesk::models::{Actor, AuditEvent, KeyMode, Webhook};
use hookdesk::transport::ScriptedTransport;
use hookdesk::webhooks::RegisterWebhook;

/// Operator token accepted by [`Config::test_config`]
pub const BOOTSTRAP_TOKEN: &str = "test-bootstrap-token";

/// Fixed start instant for every harness
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub struct Harness {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<ScriptedTransport>,
    pub audit: Arc<MemoryAuditSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let transport = Arc::new(ScriptedTransport::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let state = AppState::new(config, clock.clone(), transport.clone(), audit.clone());
        Self {
            state,
            clock,
            transport,
            audit,
        }
    }

    /// Active global webhook subscribed to `event_types`
    pub fn webhook(&self, name: &str, event_types: &[&str]) -> Webhook {
        self.state
            .webhooks
            .register(
                RegisterWebhook {
                    name: name.to_string(),
                    target_url: format!("https://hooks.example.com/{name}/receive"),
                    event_types: event_types.iter().map(|s| s.to_string()).collect(),
                    ..RegisterWebhook::default()
                },
                &Actor::operator(),
            )
            .unwrap()
    }

    pub fn key(&self, name: &str, mode: KeyMode) -> IssuedKey {
        self.state
            .credentials
            .create(
                CreateApiKey {
                    name: name.to_string(),
                    mode,
                    scopes: vec!["webhooks:read".to_string()],
                    expires_at: None,
                },
                &Actor::operator(),
            )
            .unwrap()
    }

    /// Audit entries with `action`, oldest first
    pub fn audit_actions(&self, action: &str) -> Vec<AuditEvent> {
        self.audit
            .entries()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }
}
