//! `/events` and `/deliveries` handlers

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::dispatcher::{AttemptReport, EmitEvent, Emission};
use crate::error::Result;
use crate::handlers::{parse_id, AppState};
use crate::models::{Actor, DeliveryStatus, WebhookDelivery, WebhookEvent};
use crate::store::DeliveryFilter;

/// `GET /deliveries` query
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryQuery {
    /// `queued`, `retrying`, `success` or `dead`
    pub status: Option<String>,
    /// Only deliveries for this webhook
    pub webhook_id: Option<String>,
}

/// `POST /events`
///
/// Fresh deliveries are attempted in a background task when
/// `dispatch_immediately` is configured; otherwise the scheduler picks them up.
#[instrument(skip_all)]
pub async fn emit_event(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: std::result::Result<Json<EmitEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<Emission>)> {
    let Json(input) = payload?;
    let emission = state.dispatcher.emit(input, &actor)?;

    if state.config.dispatch_immediately && !emission.deliveries.is_empty() {
        let ids: Vec<Uuid> = emission.deliveries.iter().map(|d| d.id).collect();
        let dispatcher = state.dispatcher.clone();
        let event_id = emission.event.id;
        tokio::spawn(async move {
            let report = dispatcher.dispatch(&ids).await;
            info!(
                event_id = %event_id,
                succeeded = report.succeeded,
                retrying = report.retrying,
                dead = report.dead,
                "immediate dispatch finished"
            );
        });
    }

    Ok((StatusCode::CREATED, Json(emission)))
}

/// `GET /events/:id`
#[instrument(skip_all)]
pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WebhookEvent>> {
    Ok(Json(state.dispatcher.get_event(parse_id("event", &id)?)?))
}

/// `GET /deliveries?status=&webhookId=`
#[instrument(skip_all)]
pub async fn list_deliveries(
    State(state): State<AppState>,
    query: std::result::Result<Query<DeliveryQuery>, QueryRejection>,
) -> Result<Json<Vec<WebhookDelivery>>> {
    let Query(query) = query?;
    let filter = DeliveryFilter {
        status: query
            .status
            .as_deref()
            .map(str::parse::<DeliveryStatus>)
            .transpose()?,
        webhook_id: query
            .webhook_id
            .as_deref()
            .map(|raw| parse_id("webhook", raw))
            .transpose()?,
    };
    Ok(Json(state.dispatcher.list_deliveries(&filter)))
}

/// `GET /deliveries/:id`
#[instrument(skip_all)]
pub async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WebhookDelivery>> {
    Ok(Json(
        state.dispatcher.get_delivery(parse_id("delivery", &id)?)?,
    ))
}

/// `POST /deliveries/:id/retry` → delivery plus `{success, statusCode, durationMs}`
///
/// A failed transport call still answers 200: the outcome is in the body.
#[instrument(skip_all)]
pub async fn retry_delivery(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<AttemptReport>> {
    let report = state
        .dispatcher
        .attempt(parse_id("delivery", &id)?, &actor)
        .await?;
    Ok(Json(report))
}
