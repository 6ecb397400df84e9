use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{AppState, CurrentUser};
use crate::db::contacts::{self, ContactFilter};
use crate::db::{audit, companies, ListPage, Paging};
use crate::dedup::detect_contact_duplicates_tx;
use crate::error::{AppError, Result};
use crate::model::{Contact, ContactProfile, ContactStatus, EntityRef, Role};
use crate::pipeline::ContactTransition;
use crate::validate::ContactPatch;

const APPROVERS: &[Role] = &[Role::Approver, Role::Admin];

#[derive(Debug, Deserialize)]
pub struct CreateContact {
    pub company_id: Uuid,
    #[serde(flatten)]
    pub profile: ContactProfile,
}

/// Optional approval body; only `approved` is accepted.
#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub assigned_sdr_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct BulkAssignRequest {
    pub contact_ids: Vec<Uuid>,
    pub assigned_sdr_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BulkAssignResult {
    pub assigned: usize,
    pub contacts: Vec<Contact>,
}

#[derive(Debug, Deserialize)]
pub struct DuplicateFlag {
    pub is_duplicate: bool,
}

#[derive(Debug, Serialize)]
pub struct DetectionResult {
    pub duplicates_marked: usize,
}

async fn create_contact(
    State(state): State<AppState>,
    actor: CurrentUser,
    Json(req): Json<CreateContact>,
) -> Result<(StatusCode, Json<Contact>)> {
    actor.require_any(&[Role::Researcher, Role::Approver, Role::Admin])?;
    let mut tx = state.pool.begin().await?;
    let contact = contacts::create_tx(&mut tx, req.profile, req.company_id, actor.id()).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(contact)))
}

async fn list_contacts(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(filter): Query<ContactFilter>,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<Contact>>> {
    Ok(Json(contacts::list(&state.pool, &filter, paging).await?))
}

async fn get_contact(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Contact>> {
    Ok(Json(contacts::get(&state.pool, id).await?))
}

async fn update_contact(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    Json(patch): Json<ContactPatch>,
) -> Result<Json<Contact>> {
    let mut tx = state.pool.begin().await?;
    let contact = contacts::update_profile_tx(&mut tx, id, patch, actor.id()).await?;
    tx.commit().await?;
    Ok(Json(contact))
}

async fn run_transition(
    state: &AppState,
    actor: &CurrentUser,
    id: Uuid,
    transition: ContactTransition,
) -> Result<Json<Contact>> {
    let mut tx = state.pool.begin().await?;
    let contact = contacts::transition_tx(&mut tx, id, transition, actor.id()).await?;
    tx.commit().await?;
    Ok(Json(contact))
}

async fn approve_contact(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    body: Option<Json<ApproveRequest>>,
) -> Result<Json<Contact>> {
    actor.require_any(APPROVERS)?;
    if let Some(status) = body.and_then(|Json(b)| b.status) {
        if ContactStatus::parse(status.trim()) != Some(ContactStatus::Approved) {
            return Err(AppError::invalid("status must be 'approved'"));
        }
    }
    run_transition(&state, &actor, id, ContactTransition::Approve).await
}

async fn assign_contact(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<Contact>> {
    actor.require_any(APPROVERS)?;
    let transition = ContactTransition::assign(req.assigned_sdr_id)?;
    run_transition(&state, &actor, id, transition).await
}

/// Assigns every listed contact to one SDR, or none of them.
async fn bulk_assign(
    State(state): State<AppState>,
    actor: CurrentUser,
    Json(req): Json<BulkAssignRequest>,
) -> Result<Json<BulkAssignResult>> {
    actor.require_any(APPROVERS)?;
    let sdr_id = req
        .assigned_sdr_id
        .ok_or_else(|| AppError::invalid("assigned_sdr_id is required"))?;
    let mut tx = state.pool.begin().await?;
    let assigned = contacts::bulk_assign_tx(&mut tx, &req.contact_ids, sdr_id, actor.id()).await?;
    tx.commit().await?;
    info!(count = assigned.len(), sdr_id = %sdr_id, "contacts bulk assigned");
    Ok(Json(BulkAssignResult {
        assigned: assigned.len(),
        contacts: assigned,
    }))
}

async fn meeting_scheduled(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Contact>> {
    actor.require_any(&[Role::Sdr, Role::Approver, Role::Admin])?;
    run_transition(&state, &actor, id, ContactTransition::ScheduleMeeting).await
}

async fn flag_duplicate(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    Json(flag): Json<DuplicateFlag>,
) -> Result<Json<Contact>> {
    actor.require_any(&[Role::Admin, Role::Approver, Role::Researcher])?;
    let mut tx = state.pool.begin().await?;
    let contact = contacts::set_duplicate_tx(&mut tx, id, flag.is_duplicate, actor.id()).await?;
    tx.commit().await?;
    Ok(Json(contact))
}

/// Re-runs contact duplicate detection within one company.
async fn detect_duplicates(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(company_id): Path<Uuid>,
) -> Result<Json<DetectionResult>> {
    actor.require_any(&[Role::Admin, Role::Approver, Role::SegmentOwner])?;
    let mut tx = state.pool.begin().await?;
    companies::get_tx(&mut tx, company_id).await?;
    let marked = detect_contact_duplicates_tx(&mut tx, company_id).await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "company.detect_contact_duplicates",
        EntityRef::Company(company_id),
        json!({ "duplicates_marked": marked }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(DetectionResult {
        duplicates_marked: marked,
    }))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/contacts", post(create_contact).get(list_contacts))
        .route("/contacts/bulk-assign", post(bulk_assign))
        .route("/contacts/:id", get(get_contact).patch(update_contact))
        .route("/contacts/:id/approve", post(approve_contact))
        .route("/contacts/:id/assign", post(assign_contact))
        .route("/contacts/:id/meeting-scheduled", post(meeting_scheduled))
        .route("/contacts/:id/duplicate", post(flag_duplicate))
        .route("/companies/:id/detect-duplicates", post(detect_duplicates))
}
