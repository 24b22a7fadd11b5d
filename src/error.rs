//! Error types for hookdesk
//!
//! This module provides the error hierarchy used across the registries and the
//! dispatcher, built with `thiserror`.
//!
//! The API-level taxonomy is validation, not-found, conflict and the
//! authentication pair. A failed delivery attempt is *not* an
//! error here; it is a successful call that reports a failed outcome. Transport
//! and audit failures have their own enums and never escape as [`Error`].

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// The main error type for hookdesk operations
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed input, rejected before any state change
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown id
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record that was looked up
        entity: &'static str,
        /// The id that did not resolve
        id: String,
    },

    /// Operation on an entity whose state does not allow it
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Missing, unknown, expired or revoked credential
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but the credential may not perform this operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for hookdesk operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a validation error from a string
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a conflict error from a string
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Error::Conflict(msg.into())
    }

    /// Create a not-found error for an entity kind and id
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// HTTP status code this error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Config(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::Config(_) => "config_error",
            Error::Io(_) => "io_error",
            Error::Json(_) => "invalid_json",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for Error {
    fn from(rejection: QueryRejection) -> Self {
        Error::Validation(rejection.body_text())
    }
}

/// Response extension naming the error kind, read by the metrics middleware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorKind(pub &'static str);

/// JSON error body returned by every API endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error kind
    pub error: String,
    /// Human readable message
    pub message: String,
    /// HTTP status code
    pub status: u16,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        };

        let mut response = (status, axum::Json(body)).into_response();
        response.extensions_mut().insert(ErrorKind(self.kind()));
        response
    }
}
