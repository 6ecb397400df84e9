use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::{AppState, CurrentUser};
use crate::db::assignments::{self, AssignmentFilter};
use crate::db::{ListPage, Paging};
use crate::error::{AppError, Result};
use crate::model::{Assignment, EntityKind, EntityRef};

const MANAGE_ASSIGNMENTS: &str = "manage_assignments";

#[derive(Debug, Deserialize)]
pub struct CreateAssignment {
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub assigned_to: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct BulkCreateAssignments {
    pub entity_type: EntityKind,
    pub entity_ids: Vec<Uuid>,
    pub assigned_to: Uuid,
}

async fn create_assignment(
    State(state): State<AppState>,
    actor: CurrentUser,
    Json(req): Json<CreateAssignment>,
) -> Result<(StatusCode, Json<Assignment>)> {
    actor.require_permission(&state.pool, MANAGE_ASSIGNMENTS).await?;
    let entity = EntityRef::new(req.entity_type, req.entity_id);
    let mut tx = state.pool.begin().await?;
    let assignment = assignments::create_tx(&mut tx, entity, req.assigned_to, actor.id()).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

/// Creates one assignment per entity; any failure rolls back the whole set.
async fn bulk_create(
    State(state): State<AppState>,
    actor: CurrentUser,
    Json(req): Json<BulkCreateAssignments>,
) -> Result<(StatusCode, Json<Vec<Assignment>>)> {
    actor.require_permission(&state.pool, MANAGE_ASSIGNMENTS).await?;
    if req.entity_ids.is_empty() {
        return Err(AppError::invalid("entity_ids must not be empty"));
    }
    let mut tx = state.pool.begin().await?;
    let mut created = Vec::with_capacity(req.entity_ids.len());
    for id in &req.entity_ids {
        let entity = EntityRef::new(req.entity_type, *id);
        created.push(assignments::create_tx(&mut tx, entity, req.assigned_to, actor.id()).await?);
    }
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_assignments(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(filter): Query<AssignmentFilter>,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<Assignment>>> {
    Ok(Json(assignments::list(&state.pool, &filter, paging).await?))
}

async fn my_assignments(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<Assignment>>> {
    let filter = AssignmentFilter {
        assigned_to: Some(user.id()),
        ..Default::default()
    };
    Ok(Json(assignments::list(&state.pool, &filter, paging).await?))
}

async fn delete_assignment(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    actor.require_permission(&state.pool, MANAGE_ASSIGNMENTS).await?;
    let mut tx = state.pool.begin().await?;
    assignments::delete_tx(&mut tx, id, actor.id()).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/assignments", post(create_assignment).get(list_assignments))
        .route("/assignments/bulk", post(bulk_create))
        .route("/assignments/me", get(my_assignments))
        .route("/assignments/:id", delete(delete_assignment))
}
