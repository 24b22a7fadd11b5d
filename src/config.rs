//! Service configuration
//!
//! All settings come from environment variables; nothing secret is hardcoded.
//!
//! - `HOOKDESK_BOOTSTRAP_TOKEN` (required): operator bearer token
//! - `HOOKDESK_BIND_ALL`: set to "true" to bind 0.0.0.0 (containers)
//! - `HOOKDESK_MAX_ATTEMPTS`: attempt budget per delivery (default: 5)
//! - `HOOKDESK_BACKOFF_MINUTES`: comma list (default: 1,5,15,60,240)
//! - `HOOKDESK_TRANSPORT_TIMEOUT_MS`: per-attempt timeout (default: 10000)
//! - `HOOKDESK_ROTATION_GRACE_HOURS`: rotation grace window (default: 24)
//! - `HOOKDESK_SCHEDULER_INTERVAL_SECS`: retry sweep interval, 0 disables (default: 30)
//! - `HOOKDESK_MAX_IN_FLIGHT`: concurrent attempts per sweep (default: 16)
//! - `HOOKDESK_RATE_WINDOW_SECS`: rate counter window (default: 60)
//! - `HOOKDESK_RATE_LIMIT_PER_WINDOW`: soft limit per key and window (default: 600)
//! - `HOOKDESK_AUDIT_LOG`: JSON-lines audit file (default: in-memory)
//! - `HOOKDESK_ALLOWED_ORIGINS`: comma list of CORS origins (default: localhost)
//! - `HOOKDESK_DISPATCH_IMMEDIATELY`: attempt new deliveries on emit (default: true)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, DEFAULT_BACKOFF_MINUTES, DEFAULT_MAX_ATTEMPTS};

/// Environment variable holding the operator token
pub const BOOTSTRAP_TOKEN_ENV: &str = "HOOKDESK_BOOTSTRAP_TOKEN";

/// Longest rotation grace window accepted: one year
pub const MAX_ROTATION_GRACE_HOURS: i64 = 365 * 24;

/// Longest usage window accepted: one day
pub const MAX_RATE_WINDOW_SECS: i64 = 24 * 60 * 60;

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SHA-256 of the bootstrap token; the token itself is never kept
    token_hash: [u8; 32],

    /// Whether to bind to all interfaces
    pub bind_all: bool,

    /// Bind address derived from `bind_all`
    pub bind_addr: IpAddr,

    /// Attempt budget and backoff schedule
    pub retry: RetryPolicy,

    /// Upper bound on one transport call
    pub transport_timeout: Duration,

    /// How long a rotated-out key keeps validating
    pub rotation_grace: chrono::Duration,

    /// Retry sweep interval; `None` disables the background scheduler
    pub scheduler_interval: Option<Duration>,

    /// Maximum concurrent attempts per sweep
    pub max_in_flight: usize,

    /// Fixed window length for API usage counters
    pub rate_window: chrono::Duration,

    /// Calls per key and window before hits count as over-limit
    pub rate_limit_per_window: u64,

    /// JSON-lines audit file
    pub audit_log_path: Option<PathBuf>,

    /// CORS origins; empty means localhost only
    pub allowed_origins: Vec<String>,

    /// Attempt fresh deliveries right after `POST /events`
    pub dispatch_immediately: bool,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let token = lookup(BOOTSTRAP_TOKEN_ENV)
            .ok_or_else(|| Error::Config(format!("{BOOTSTRAP_TOKEN_ENV} is not set")))?;
        if token.trim().is_empty() {
            return Err(Error::Config(format!("{BOOTSTRAP_TOKEN_ENV} cannot be empty")));
        }
        if token.len() < 32 {
            warn!("{BOOTSTRAP_TOKEN_ENV} is shorter than 32 characters");
        }

        let bind_all = lookup("HOOKDESK_BIND_ALL")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let bind_addr = if bind_all {
            warn!("binding to 0.0.0.0 (HOOKDESK_BIND_ALL=true)");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };

        let max_attempts: u32 = parse_or(&lookup, "HOOKDESK_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        let backoff: Vec<i64> = match lookup("HOOKDESK_BACKOFF_MINUTES") {
            Some(raw) => parse_list(&raw, "HOOKDESK_BACKOFF_MINUTES")?,
            None => DEFAULT_BACKOFF_MINUTES.to_vec(),
        };
        let retry = RetryPolicy::new(max_attempts, &backoff)?;

        let timeout_ms: u64 = parse_or(&lookup, "HOOKDESK_TRANSPORT_TIMEOUT_MS", 10_000)?;
        if timeout_ms == 0 {
            return Err(Error::Config("transport timeout cannot be 0".to_string()));
        }

        let grace_hours: i64 = parse_or(&lookup, "HOOKDESK_ROTATION_GRACE_HOURS", 24)?;
        if !(0..=MAX_ROTATION_GRACE_HOURS).contains(&grace_hours) {
            return Err(Error::Config(format!(
                "rotation grace must be between 0 and {MAX_ROTATION_GRACE_HOURS} hours"
            )));
        }
        let rotation_grace = chrono::Duration::try_hours(grace_hours)
            .ok_or_else(|| Error::Config("rotation grace is out of range".to_string()))?;

        let interval_secs: u64 = parse_or(&lookup, "HOOKDESK_SCHEDULER_INTERVAL_SECS", 30)?;
        let max_in_flight: usize = parse_or(&lookup, "HOOKDESK_MAX_IN_FLIGHT", 16)?;

        let window_secs: i64 = parse_or(&lookup, "HOOKDESK_RATE_WINDOW_SECS", 60)?;
        if !(1..=MAX_RATE_WINDOW_SECS).contains(&window_secs) {
            return Err(Error::Config(format!(
                "rate window must be between 1 and {MAX_RATE_WINDOW_SECS} seconds"
            )));
        }
        let rate_window = chrono::Duration::try_seconds(window_secs)
            .ok_or_else(|| Error::Config("rate window is out of range".to_string()))?;
        let rate_limit_per_window: u64 =
            parse_or(&lookup, "HOOKDESK_RATE_LIMIT_PER_WINDOW", 600)?;

        let allowed_origins = lookup("HOOKDESK_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let dispatch_immediately = lookup("HOOKDESK_DISPATCH_IMMEDIATELY")
            .map(|v| !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        let config = Self {
            token_hash: hash_token(&token),
            bind_all,
            bind_addr,
            retry,
            transport_timeout: Duration::from_millis(timeout_ms),
            rotation_grace,
            scheduler_interval: (interval_secs > 0).then(|| Duration::from_secs(interval_secs)),
            max_in_flight: max_in_flight.max(1),
            rate_window,
            rate_limit_per_window,
            audit_log_path: lookup("HOOKDESK_AUDIT_LOG").map(PathBuf::from),
            allowed_origins,
            dispatch_immediately,
        };

        info!(
            max_attempts = config.retry.max_attempts,
            transport_timeout_ms = timeout_ms,
            grace_hours,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Deterministic configuration for tests. Bootstrap token: `test-bootstrap-token`.
    pub fn test_config() -> Self {
        Self {
            token_hash: hash_token("test-bootstrap-token"),
            bind_all: false,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            retry: RetryPolicy::default(),
            transport_timeout: Duration::from_millis(500),
            rotation_grace: chrono::Duration::hours(24),
            scheduler_interval: None,
            max_in_flight: 4,
            rate_window: chrono::Duration::seconds(60),
            rate_limit_per_window: 100,
            audit_log_path: None,
            allowed_origins: Vec::new(),
            dispatch_immediately: false,
        }
    }

    /// Verify a bearer token against the bootstrap token (constant time)
    pub fn verify_bootstrap_token(&self, token: &str) -> bool {
        constant_time_compare(&self.token_hash, &hash_token(token))
    }

    /// Get the socket address for binding
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_addr, port)
    }
}

fn hash_token(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Constant-time byte comparison to prevent timing attacks
pub(crate) fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| Error::Config(format!("invalid {key}: {e}"))),
        None => Ok(default),
    }
}

fn parse_list(raw: &str, key: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|e| Error::Config(format!("invalid {key} entry {s:?}: {e}")))
        })
        .collect()
}
