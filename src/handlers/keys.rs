//! `/keys` handlers

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::credentials::{CreateApiKey, IssuedKey, UpdateApiKey};
use crate::error::Result;
use crate::handlers::{parse_id, AppState};
use crate::models::{Actor, ApiKey};

/// A key plus its one-time secret
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretResponse {
    /// Id of the issued key
    pub id: Uuid,
    /// Raw secret; shown exactly once
    pub secret: String,
    /// The issued key
    pub api_key: ApiKey,
}

impl From<IssuedKey> for SecretResponse {
    fn from(issued: IssuedKey) -> Self {
        Self {
            id: issued.key.id,
            secret: issued.secret,
            api_key: issued.key,
        }
    }
}

/// `GET /keys/:id` body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyResponse {
    /// The key, with its effective status
    pub api_key: ApiKey,
    /// Granted scopes
    pub scopes: Vec<String>,
}

/// `POST /keys`
#[instrument(skip_all)]
pub async fn create_key(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: std::result::Result<Json<CreateApiKey>, JsonRejection>,
) -> Result<(StatusCode, Json<SecretResponse>)> {
    let Json(input) = payload?;
    let issued = state.credentials.create(input, &actor)?;
    Ok((StatusCode::CREATED, Json(issued.into())))
}

/// `GET /keys`
#[instrument(skip_all)]
pub async fn list_keys(State(state): State<AppState>) -> Json<Vec<ApiKey>> {
    Json(state.credentials.list())
}

/// `GET /keys/:id`
#[instrument(skip_all)]
pub async fn get_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KeyResponse>> {
    let key = state.credentials.get(parse_id("api key", &id)?)?;
    Ok(Json(KeyResponse {
        scopes: key.scopes.clone(),
        api_key: key,
    }))
}

/// `PATCH /keys/:id`
#[instrument(skip_all)]
pub async fn update_key(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<UpdateApiKey>, JsonRejection>,
) -> Result<Json<ApiKey>> {
    let Json(input) = payload?;
    let key = state
        .credentials
        .update(parse_id("api key", &id)?, input, &actor)?;
    Ok(Json(key))
}

/// `DELETE /keys/:id`: revoke. Idempotent.
#[instrument(skip_all)]
pub async fn revoke_key(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<ApiKey>> {
    let revocation = state
        .credentials
        .revoke(parse_id("api key", &id)?, &actor)?;
    Ok(Json(revocation.key))
}

/// `POST /keys/:id/rotate`
#[instrument(skip_all)]
pub async fn rotate_key(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SecretResponse>)> {
    let issued = state
        .credentials
        .rotate(parse_id("api key", &id)?, &actor)?;
    Ok((StatusCode::CREATED, Json(issued.into())))
}
