//! Hookdesk - Webhook Delivery & API Credential Lifecycle
//!
//! This crate provides an HTTP service that fans domain events out to
//! registered webhook endpoints with at-least-once delivery, and manages the
//! API keys that callers use to reach it.
//!
//! # Features
//!
//! - **Credential Registry**: Issue, rotate (with a grace window), revoke and validate API keys
//! - **Webhook Registry**: Register, pause, resume and soft-delete endpoints
//! - **Delivery Dispatcher**: Per-subscription deliveries with bounded retry and dead-lettering
//! - **Retry Scheduler**: Background sweep over due deliveries
//! - **Audit Log**: Append-only trail of every state-changing operation
//! - **KPIs**: Rolling-window counters for keys, webhooks, deliveries and API usage
//!
//! # Architecture
//!
//! ```text
//! HTTP ──▶ auth middleware ──▶ handlers
//!              │                  │
//!              ▼                  ▼
//!        ┌─────────────┐   ┌──────────────┐     ┌───────────────┐
//!        │ Credentials │   │  Dispatcher  │◀────│RetryScheduler │
//!        └──────┬──────┘   └──────┬───────┘     └───────────────┘
//!               │                 │
//!               ▼                 ▼
//!           Store + AuditLog   Transport (HTTP POST)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hookdesk::config::Config;
//! use hookdesk::handlers::{router, AppState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::in_memory(config);
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3001").await?;
//!     axum::serve(listener, router(state)).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod audit;
pub mod clock;
pub mod config;
pub mod cors;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod kpi;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod security;
pub mod store;
pub mod transport;
pub mod webhooks;

// Re-exports for convenience
pub use credentials::CredentialRegistry;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use handlers::{router, AppState};
pub use scheduler::RetryScheduler;
pub use webhooks::WebhookRegistry;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
