use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AppState, CurrentUser};
use crate::db::{notifications, ListPage, Paging};
use crate::error::Result;
use crate::model::Notification;

#[derive(Debug, Default, Deserialize)]
pub struct NotificationFilter {
    #[serde(default)]
    pub unread_only: bool,
}

#[derive(Debug, Serialize)]
pub struct UnreadCount {
    pub unread: i64,
}

#[derive(Debug, Serialize)]
pub struct MarkedRead {
    pub updated: u64,
}

async fn list_notifications(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(filter): Query<NotificationFilter>,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<Notification>>> {
    Ok(Json(
        notifications::list_for_user(&state.pool, user.id(), filter.unread_only, paging).await?,
    ))
}

async fn unread_count(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<UnreadCount>> {
    let unread = notifications::unread_count(&state.pool, user.id()).await?;
    Ok(Json(UnreadCount { unread }))
}

async fn mark_read(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>> {
    Ok(Json(notifications::mark_read(&state.pool, user.id(), id).await?))
}

async fn mark_all_read(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<MarkedRead>> {
    let updated = notifications::mark_all_read(&state.pool, user.id()).await?;
    Ok(Json(MarkedRead { updated }))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/read-all", post(mark_all_read))
        .route("/notifications/:id/read", post(mark_read))
}
