//! Request authentication and response hardening
//!
//! - Bearer authentication: the bootstrap token acts as the `operator`; any
//!   other token must be a valid API key
//! - Role gate: `client`-mode keys are read-only
//! - Usage counting: every API-key request records one rate-limiter hit
//! - Security headers on every response
//!
//! The resolved [`Actor`] is placed in the request extensions for handlers.

use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind};
use crate::handlers::AppState;
use crate::models::{Actor, ApiKey};
use crate::rate_limit::RateLimitResult;

/// Paths served without authentication
pub const AUTH_BYPASS_PATHS: &[&str] = &["/health", "/ready"];

/// Outcome of checking a request's credentials
#[derive(Debug, Clone)]
pub enum AuthResult {
    /// Bootstrap token
    Operator,
    /// Valid API key
    Key(Box<ApiKey>),
    /// Public path
    Bypassed,
    /// No `Authorization` header
    MissingHeader,
    /// Not `Bearer <token>`
    InvalidFormat,
    /// Unknown, expired or revoked credential
    InvalidToken(String),
}

impl AuthResult {
    /// Check if the request may proceed
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            AuthResult::Operator | AuthResult::Key(_) | AuthResult::Bypassed
        )
    }

    /// Actor for an authenticated request
    pub fn actor(&self) -> Option<Actor> {
        match self {
            AuthResult::Operator => Some(Actor::operator()),
            AuthResult::Key(key) => Some(Actor::from_key(key)),
            _ => None,
        }
    }

    /// Error for a rejected request
    pub fn error(&self) -> Option<Error> {
        match self {
            AuthResult::Operator | AuthResult::Key(_) | AuthResult::Bypassed => None,
            AuthResult::MissingHeader => {
                Some(Error::Unauthorized("missing Authorization header".to_string()))
            }
            AuthResult::InvalidFormat => Some(Error::Unauthorized(
                "invalid Authorization format, expected: Bearer <token>".to_string(),
            )),
            AuthResult::InvalidToken(reason) => Some(Error::Unauthorized(reason.clone())),
        }
    }
}

/// Resolve the credentials of a request
pub fn authenticate(state: &AppState, path: &str, auth_header: Option<&str>) -> AuthResult {
    if AUTH_BYPASS_PATHS.contains(&path) {
        return AuthResult::Bypassed;
    }

    let Some(header) = auth_header else {
        return AuthResult::MissingHeader;
    };
    let token = match header.strip_prefix("Bearer ") {
        Some(t) => t.trim(),
        None => return AuthResult::InvalidFormat,
    };
    if token.is_empty() {
        return AuthResult::InvalidFormat;
    }

    if state.config.verify_bootstrap_token(token) {
        return AuthResult::Operator;
    }

    match state.credentials.validate(token) {
        Ok(key) => AuthResult::Key(Box::new(key)),
        Err(e) => AuthResult::InvalidToken(e.to_string()),
    }
}

/// Authentication, role gate and usage accounting
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let auth = authenticate(&state, &path, auth_header);
    if let Some(err) = auth.error() {
        state.metrics.record_auth_failure();
        warn!(path = %path, reason = %err, "authentication failed");
        return record_error(&state, err.into_response());
    }

    let Some(actor) = auth.actor() else {
        return next.run(request).await;
    };

    let usage = match &auth {
        AuthResult::Key(key) => Some(state.rate_limiter.record(key.id)),
        _ => None,
    };

    if is_mutation(request.method()) && !actor.role.can_mutate() {
        debug!(actor = %actor.id, path = %path, "read-only key attempted a mutation");
        let mut response = record_error(
            &state,
            Error::Forbidden(format!("{} keys are read-only", actor.role)).into_response(),
        );
        if let Some(usage) = usage {
            apply_rate_limit_headers(&mut response, &usage);
        }
        return response;
    }

    state.metrics.record_api_request();
    request.extensions_mut().insert(actor);

    let mut response = record_error(&state, next.run(request).await);
    if let Some(usage) = usage {
        apply_rate_limit_headers(&mut response, &usage);
    }
    response
}

/// Add [`SecurityHeaders`] to every response
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    for (name, value) in SecurityHeaders::headers() {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }
    response
}

fn is_mutation(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn record_error(state: &AppState, response: Response) -> Response {
    if let Some(kind) = response.extensions().get::<ErrorKind>() {
        state.metrics.record_error(kind.0);
    }
    response
}

fn apply_rate_limit_headers(response: &mut Response, usage: &RateLimitResult) {
    let headers = response.headers_mut();
    for (name, value) in usage.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

/// Security headers applied to all responses
#[derive(Debug, Clone)]
pub struct SecurityHeaders;

impl SecurityHeaders {
    /// Standard security headers
    pub fn headers() -> Vec<(&'static str, &'static str)> {
        vec![
            ("X-Content-Type-Options", "nosniff"),
            ("X-Frame-Options", "DENY"),
            (
                "Content-Security-Policy",
                "default-src 'none'; frame-ancestors 'none'",
            ),
            ("Referrer-Policy", "no-referrer"),
            // Responses can carry one-time secrets
            (
                "Cache-Control",
                "no-store, no-cache, must-revalidate, private",
            ),
            ("Pragma", "no-cache"),
        ]
    }
}
