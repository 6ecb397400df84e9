use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};

use super::{AppState, CurrentUser};
use crate::db::audit::{self, AuditFilter};
use crate::db::{ListPage, Paging};
use crate::error::Result;
use crate::model::AuditLog;

/// GET /audit-logs, newest first.
async fn list_audit_logs(
    State(state): State<AppState>,
    actor: CurrentUser,
    Query(filter): Query<AuditFilter>,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<AuditLog>>> {
    actor.require_permission(&state.pool, "view_audit_log").await?;
    Ok(Json(audit::list(&state.pool, &filter, paging).await?))
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/audit-logs", get(list_audit_logs))
}
