use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::{AppState, CurrentUser};
use crate::db::companies::{self, CompanyDetail, CompanyFilter};
use crate::db::{ListPage, Paging};
use crate::error::Result;
use crate::model::{Company, CompanyProfile, Role};
use crate::pipeline::{CompanyDecision, CompanyDecisionRequest};
use crate::validate::CompanyPatch;

const DECIDERS: &[Role] = &[Role::Approver, Role::Admin];

#[derive(Debug, Deserialize)]
pub struct CreateCompany {
    pub segment_id: Uuid,
    #[serde(flatten)]
    pub profile: CompanyProfile,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueFilter {
    pub segment_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct DuplicateFlag {
    pub is_duplicate: bool,
}

async fn create_company(
    State(state): State<AppState>,
    actor: CurrentUser,
    Json(req): Json<CreateCompany>,
) -> Result<(StatusCode, Json<Company>)> {
    actor.require_any(&[Role::Researcher, Role::Admin])?;
    let mut tx = state.pool.begin().await?;
    let company = companies::create_tx(&mut tx, req.profile, req.segment_id, actor.id()).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(company)))
}

async fn list_companies(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(filter): Query<CompanyFilter>,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<Company>>> {
    Ok(Json(companies::list(&state.pool, &filter, paging).await?))
}

/// Pending companies, oldest first.
async fn pending_companies(
    State(state): State<AppState>,
    actor: CurrentUser,
    Query(filter): Query<QueueFilter>,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<Company>>> {
    actor.require_any(DECIDERS)?;
    Ok(Json(
        companies::pending_queue(&state.pool, filter.segment_id, paging).await?,
    ))
}

async fn get_company(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<CompanyDetail>> {
    Ok(Json(companies::detail(&state.pool, id).await?))
}

async fn update_company(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    Json(patch): Json<CompanyPatch>,
) -> Result<Json<Company>> {
    let mut tx = state.pool.begin().await?;
    let company = companies::update_profile_tx(&mut tx, id, patch, actor.id()).await?;
    tx.commit().await?;
    Ok(Json(company))
}

/// Approves or rejects a pending company. The body is validated before the
/// store is touched.
async fn decide_company(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<CompanyDecisionRequest>,
) -> Result<Json<Company>> {
    actor.require_any(DECIDERS)?;
    let decision = CompanyDecision::try_from(req)?;
    let mut tx = state.pool.begin().await?;
    let company = companies::decide_tx(&mut tx, id, &decision, actor.id()).await?;
    tx.commit().await?;
    Ok(Json(company))
}

async fn flag_duplicate(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    Json(flag): Json<DuplicateFlag>,
) -> Result<Json<Company>> {
    actor.require_any(&[Role::Admin, Role::Approver, Role::Researcher])?;
    let mut tx = state.pool.begin().await?;
    let company = companies::set_duplicate_tx(&mut tx, id, flag.is_duplicate, actor.id()).await?;
    tx.commit().await?;
    Ok(Json(company))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/companies", post(create_company).get(list_companies))
        .route("/companies/pending", get(pending_companies))
        .route("/companies/:id", get(get_company).patch(update_company))
        .route("/companies/:id/approve", post(decide_company))
        .route("/companies/:id/duplicate", post(flag_duplicate))
}
