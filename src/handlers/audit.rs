//! `/audit` handler

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use tracing::instrument;

use crate::error::Result;
use crate::handlers::AppState;
use crate::models::AuditEvent;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

/// `GET /audit` query
#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    /// Entries to return (default 50, max 1000)
    pub limit: Option<usize>,
}

/// `GET /audit?limit=`: newest first
#[instrument(skip_all)]
pub async fn list_audit(
    State(state): State<AppState>,
    query: std::result::Result<Query<AuditQuery>, QueryRejection>,
) -> Result<Json<Vec<AuditEvent>>> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Ok(Json(state.audit.recent(limit)))
}
