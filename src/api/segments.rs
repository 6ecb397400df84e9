use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{AppState, CurrentUser};
use crate::db::segments::{
    self, OfferingInput, OfferingUpdate, SegmentDetail, SegmentFilter, SegmentInput,
    SegmentUpdate,
};
use crate::db::{audit, ListPage, Paging};
use crate::dedup::detect_company_duplicates_tx;
use crate::error::Result;
use crate::model::{EntityRef, Offering, OfferingStatus, Role, Segment, SegmentStats};

const MANAGE_SEGMENTS: &str = "manage_segments";

#[derive(Debug, Default, Deserialize)]
pub struct OfferingFilter {
    pub status: Option<OfferingStatus>,
}

#[derive(Debug, Serialize)]
pub struct DetectionResult {
    pub duplicates_marked: usize,
}

async fn create_segment(
    State(state): State<AppState>,
    actor: CurrentUser,
    Json(input): Json<SegmentInput>,
) -> Result<(StatusCode, Json<Segment>)> {
    actor.require_permission(&state.pool, MANAGE_SEGMENTS).await?;
    let mut tx = state.pool.begin().await?;
    let segment = segments::create_tx(&mut tx, &input, actor.id()).await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "segment.create",
        EntityRef::Segment(segment.id),
        json!({ "name": segment.name, "offering_ids": input.offering_ids }),
    )
    .await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(segment)))
}

async fn list_segments(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(filter): Query<SegmentFilter>,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<Segment>>> {
    Ok(Json(segments::list(&state.pool, &filter, paging).await?))
}

async fn get_segment(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<SegmentDetail>> {
    Ok(Json(segments::detail(&state.pool, id).await?))
}

async fn segment_stats(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<SegmentStats>> {
    segments::get(&state.pool, id).await?;
    Ok(Json(segments::stats(&state.pool, id).await?))
}

async fn update_segment(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    Json(update): Json<SegmentUpdate>,
) -> Result<Json<Segment>> {
    actor.require_permission(&state.pool, MANAGE_SEGMENTS).await?;
    let mut tx = state.pool.begin().await?;
    let segment = segments::update_tx(&mut tx, id, &update).await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "segment.update",
        EntityRef::Segment(id),
        json!({
            "name": segment.name,
            "offering_ids": update.offering_ids,
        }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(segment))
}

async fn archive_segment(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Segment>> {
    actor.require_permission(&state.pool, MANAGE_SEGMENTS).await?;
    let mut tx = state.pool.begin().await?;
    let segment = segments::archive_tx(&mut tx, id).await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "segment.archive",
        EntityRef::Segment(id),
        json!({}),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(segment))
}

/// Re-runs company duplicate detection over one segment.
async fn detect_duplicates(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<DetectionResult>> {
    actor.require_any(&[Role::Admin, Role::Approver, Role::SegmentOwner])?;
    let mut tx = state.pool.begin().await?;
    segments::get_tx(&mut tx, id).await?;
    let marked = detect_company_duplicates_tx(&mut tx, id).await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "segment.detect_duplicates",
        EntityRef::Segment(id),
        json!({ "duplicates_marked": marked }),
    )
    .await?;
    tx.commit().await?;
    info!(segment_id = %id, marked, "company duplicate detection finished");
    Ok(Json(DetectionResult {
        duplicates_marked: marked,
    }))
}

async fn create_offering(
    State(state): State<AppState>,
    actor: CurrentUser,
    Json(input): Json<OfferingInput>,
) -> Result<(StatusCode, Json<Offering>)> {
    actor.require_permission(&state.pool, MANAGE_SEGMENTS).await?;
    let mut tx = state.pool.begin().await?;
    let offering = segments::create_offering_tx(&mut tx, &input).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(offering)))
}

async fn list_offerings(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(filter): Query<OfferingFilter>,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<Offering>>> {
    Ok(Json(
        segments::list_offerings(&state.pool, filter.status, paging).await?,
    ))
}

async fn get_offering(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Offering>> {
    Ok(Json(segments::get_offering(&state.pool, id).await?))
}

async fn update_offering(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    Json(update): Json<OfferingUpdate>,
) -> Result<Json<Offering>> {
    actor.require_permission(&state.pool, MANAGE_SEGMENTS).await?;
    let mut tx = state.pool.begin().await?;
    let offering = segments::update_offering_tx(&mut tx, id, &update).await?;
    tx.commit().await?;
    Ok(Json(offering))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/segments", post(create_segment).get(list_segments))
        .route("/segments/:id", get(get_segment).patch(update_segment))
        .route("/segments/:id/archive", post(archive_segment))
        .route("/segments/:id/stats", get(segment_stats))
        .route("/segments/:id/detect-duplicates", post(detect_duplicates))
        .route("/offerings", post(create_offering).get(list_offerings))
        .route("/offerings/:id", get(get_offering).patch(update_offering))
}
