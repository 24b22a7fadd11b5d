//! HTTP surface.
//!
//! # Routes
//!
//! ```text
//! GET    /health /ready                  no auth
//! GET    /status /metrics
//! GET    /kpis
//! GET    /audit?limit=
//!
//! POST   /keys                GET /keys
//! GET    /keys/:id            PATCH /keys/:id       DELETE /keys/:id (revoke)
//! POST   /keys/:id/rotate
//!
//! POST   /webhooks            GET /webhooks?status=
//! GET    /webhooks/:id        PATCH /webhooks/:id   DELETE /webhooks/:id (soft)
//! POST   /webhooks/:id/test   /pause   /resume
//!
//! POST   /events              GET /events/:id
//! GET    /deliveries?status=&webhookId=
//! GET    /deliveries/:id      POST /deliveries/:id/retry
//! ```
//!
//! Mutations require the operator token or an admin key.

pub mod audit;
pub mod deliveries;
pub mod keys;
pub mod status;
pub mod webhooks;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use uuid::Uuid;

use crate::audit::{AuditLog, AuditSink, MemoryAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::cors::cors_layer;
use crate::credentials::CredentialRegistry;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::kpi::KpiAggregator;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::security::{auth_middleware, security_headers_middleware};
use crate::store::Store;
use crate::transport::{ScriptedTransport, Transport};
use crate::webhooks::WebhookRegistry;

/// Everything the handlers share. Cheap to clone.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Service configuration
    pub config: Arc<Config>,
    /// API keys
    pub credentials: CredentialRegistry,
    /// Webhook endpoints
    pub webhooks: WebhookRegistry,
    /// Fan-out and attempts
    pub dispatcher: Arc<Dispatcher>,
    /// API usage counters
    pub rate_limiter: Arc<RateLimiter>,
    /// Dashboard rollups
    pub kpis: KpiAggregator,
    /// Audit trail
    pub audit: AuditLog,
    /// Counters and latency
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wire every component over one fresh store
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        let store = Arc::new(Store::new());
        let metrics = Arc::new(Metrics::new());
        let audit = AuditLog::new(audit_sink, clock.clone(), metrics.clone());

        let credentials = CredentialRegistry::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
            config.rotation_grace,
        );
        let webhooks = WebhookRegistry::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
            transport.clone(),
            config.transport_timeout,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
            transport,
            metrics.clone(),
            config.retry.clone(),
            config.transport_timeout,
            config.max_in_flight,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_window,
            config.rate_limit_per_window,
            clock.clone(),
        ));
        let kpis = KpiAggregator::new(store, rate_limiter.clone(), clock);

        Self {
            config: Arc::new(config),
            credentials,
            webhooks,
            dispatcher,
            rate_limiter,
            kpis,
            audit,
            metrics,
        }
    }

    /// Self-contained state: wall clock, in-memory audit, and a transport
    /// that accepts every delivery
    pub fn in_memory(config: Config) -> Self {
        Self::new(
            config,
            Arc::new(SystemClock),
            Arc::new(ScriptedTransport::new()),
            Arc::new(MemoryAuditSink::new()),
        )
    }
}

/// Build the full router with auth, CORS and security headers
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(status::status_handler))
        .route("/metrics", get(status::metrics_handler))
        .route("/kpis", get(status::kpis_handler))
        .route("/audit", get(audit::list_audit))
        .route("/keys", post(keys::create_key).get(keys::list_keys))
        .route(
            "/keys/:id",
            get(keys::get_key)
                .patch(keys::update_key)
                .delete(keys::revoke_key),
        )
        .route("/keys/:id/rotate", post(keys::rotate_key))
        .route(
            "/webhooks",
            post(webhooks::register_webhook).get(webhooks::list_webhooks),
        )
        .route(
            "/webhooks/:id",
            get(webhooks::get_webhook)
                .patch(webhooks::update_webhook)
                .delete(webhooks::delete_webhook),
        )
        .route("/webhooks/:id/test", post(webhooks::test_webhook))
        .route("/webhooks/:id/pause", post(webhooks::pause_webhook))
        .route("/webhooks/:id/resume", post(webhooks::resume_webhook))
        .route("/events", post(deliveries::emit_event))
        .route("/events/:id", get(deliveries::get_event))
        .route("/deliveries", get(deliveries::list_deliveries))
        .route("/deliveries/:id", get(deliveries::get_delivery))
        .route("/deliveries/:id/retry", post(deliveries::retry_delivery));

    Router::new()
        .merge(status::probe_router())
        .merge(api)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(cors_layer(&state.config.allowed_origins))
        .with_state(state)
}

/// Parse a path id; malformed ids are reported as not found
pub(crate) fn parse_id(entity: &'static str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::not_found(entity, raw))
}
