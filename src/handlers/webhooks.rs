//! `/webhooks` handlers

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::handlers::{parse_id, AppState};
use crate::models::{Actor, Webhook, WebhookStatus};
use crate::transport::DeliveryOutcome;
use crate::webhooks::{RegisterWebhook, UpdateWebhook};

/// `GET /webhooks` query
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// `active`, `paused` or `deleted`
    pub status: Option<String>,
}

/// `PATCH /webhooks/:id` body: field updates and/or a status change
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchWebhook {
    /// Field updates
    #[serde(flatten)]
    pub fields: UpdateWebhook,
    /// `active` resumes, `paused` pauses, `deleted` soft-deletes
    pub status: Option<String>,
}

/// `POST /webhooks`
#[instrument(skip_all)]
pub async fn register_webhook(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: std::result::Result<Json<RegisterWebhook>, JsonRejection>,
) -> Result<(StatusCode, Json<Webhook>)> {
    let Json(input) = payload?;
    let webhook = state.webhooks.register(input, &actor)?;
    Ok((StatusCode::CREATED, Json(webhook)))
}

/// `GET /webhooks?status=`
#[instrument(skip_all)]
pub async fn list_webhooks(
    State(state): State<AppState>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<Webhook>>> {
    let Query(query) = query?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<WebhookStatus>)
        .transpose()?;
    Ok(Json(state.webhooks.list(status)))
}

/// `GET /webhooks/:id`
#[instrument(skip_all)]
pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Webhook>> {
    Ok(Json(state.webhooks.get(parse_id("webhook", &id)?)?))
}

/// `PATCH /webhooks/:id`
#[instrument(skip_all)]
pub async fn update_webhook(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<PatchWebhook>, JsonRejection>,
) -> Result<Json<Webhook>> {
    let id = parse_id("webhook", &id)?;
    let Json(patch) = payload?;
    let status = patch
        .status
        .as_deref()
        .map(str::parse::<WebhookStatus>)
        .transpose()?;

    let has_fields = !patch.fields.is_empty();
    if !has_fields && status.is_none() {
        return Err(Error::validation("no fields to update"));
    }

    let mut webhook = if has_fields {
        state.webhooks.update(id, patch.fields, &actor)?
    } else {
        state.webhooks.get(id)?
    };

    webhook = match status {
        Some(WebhookStatus::Active) => state.webhooks.resume(id, &actor)?,
        Some(WebhookStatus::Paused) => state.webhooks.pause(id, &actor)?,
        Some(WebhookStatus::Deleted) => state.webhooks.soft_delete(id, &actor)?,
        None => webhook,
    };

    Ok(Json(webhook))
}

/// `DELETE /webhooks/:id`: soft delete
#[instrument(skip_all)]
pub async fn delete_webhook(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<Webhook>> {
    let webhook = state
        .webhooks
        .soft_delete(parse_id("webhook", &id)?, &actor)?;
    Ok(Json(webhook))
}

/// `POST /webhooks/:id/pause`
#[instrument(skip_all)]
pub async fn pause_webhook(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<Webhook>> {
    Ok(Json(state.webhooks.pause(parse_id("webhook", &id)?, &actor)?))
}

/// `POST /webhooks/:id/resume`
#[instrument(skip_all)]
pub async fn resume_webhook(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<Webhook>> {
    Ok(Json(state.webhooks.resume(parse_id("webhook", &id)?, &actor)?))
}

/// `POST /webhooks/:id/test` → `{success, statusCode, durationMs}`
#[instrument(skip_all)]
pub async fn test_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeliveryOutcome>> {
    let outcome = state.webhooks.test(parse_id("webhook", &id)?).await?;
    Ok(Json(outcome))
}
