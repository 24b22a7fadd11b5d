//! CORS policy for the admin API
//!
//! - **Allowed Origins**: the configured list, or loopback origins on any port
//!   when the list is empty
//! - **Allowed Methods**: GET, POST, PATCH, DELETE, OPTIONS (preflight)
//! - **Allowed Headers**: Content-Type, Authorization
//! - **Max Age**: 3600 seconds for preflight caching
//!
//! # Example
//!
//! ```rust,ignore
//! use hookdesk::cors::cors_layer;
//!
//! let app = Router::new().layer(cors_layer(&config.allowed_origins));
//! ```

use std::time::Duration;

use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use tower_http::cors::{AllowOrigin, CorsLayer};
use url::{Host, Url};

/// Request headers a browser client may send
pub const ALLOWED_HEADERS: [HeaderName; 2] = [CONTENT_TYPE, AUTHORIZATION];

/// Methods used by the API
pub const ALLOWED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PATCH,
    Method::DELETE,
    Method::OPTIONS,
];

/// Preflight cache lifetime
pub const DEFAULT_MAX_AGE_SECS: u64 = 3600;

/// Build the CORS layer. An empty `allowed_origins` means loopback only.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allowed: Vec<String> = allowed_origins
        .iter()
        .map(|o| o.trim_end_matches('/').to_ascii_lowercase())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            is_origin_allowed(origin, &allowed)
        }))
        .allow_methods(ALLOWED_METHODS)
        .allow_headers(ALLOWED_HEADERS)
        .max_age(Duration::from_secs(DEFAULT_MAX_AGE_SECS))
}

/// Whether `origin` may call the API under `allowed` (lowercased, no trailing slash)
pub fn is_origin_allowed(origin: &HeaderValue, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return is_localhost_origin(origin);
    }
    match origin.to_str() {
        Ok(origin) => {
            let origin = origin.to_ascii_lowercase();
            allowed.iter().any(|a| *a == origin)
        }
        Err(_) => false,
    }
}

/// Check if an origin is `http(s)://localhost`, `127.0.0.1` or `[::1]`, on any port.
///
/// ```rust
/// use http::HeaderValue;
/// use hookdesk::cors::is_localhost_origin;
///
/// assert!(is_localhost_origin(&HeaderValue::from_static("http://localhost:3000")));
/// assert!(!is_localhost_origin(&HeaderValue::from_static("http://localhost.evil.com")));
/// ```
pub fn is_localhost_origin(origin: &HeaderValue) -> bool {
    let Ok(raw) = origin.to_str() else {
        return false;
    };
    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    if !url.username().is_empty() || url.password().is_some() {
        return false;
    }

    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}
