use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use tracing::info;

use super::{AppState, CurrentUser};
use crate::db::companies::{self, CompanyFilter};
use crate::db::contacts::{self, ContactFilter};
use crate::db::segments::{self, SegmentFilter};
use crate::error::Result;
use crate::export::{attachment, stream_csv};
use crate::model::{Company, Contact, Segment};

const EXPORT_DATA: &str = "export_data";
const NEWEST_FIRST: &str = " ORDER BY created_at DESC, rowid DESC";

fn file_name(kind: &str) -> String {
    format!("{kind}_{}.csv", Utc::now().format("%Y%m%d_%H%M%S"))
}

async fn export_companies(
    State(state): State<AppState>,
    actor: CurrentUser,
    Query(filter): Query<CompanyFilter>,
) -> Result<Response> {
    actor.require_permission(&state.pool, EXPORT_DATA).await?;
    info!(user_id = %actor.id(), "exporting companies");
    let body = stream_csv::<Company, _>(state.pool.clone(), "SELECT * FROM companies", move |qb| {
        companies::push_filters(qb, &filter);
        qb.push(NEWEST_FIRST);
    });
    Ok(attachment(&file_name("companies"), body))
}

async fn export_contacts(
    State(state): State<AppState>,
    actor: CurrentUser,
    Query(filter): Query<ContactFilter>,
) -> Result<Response> {
    actor.require_permission(&state.pool, EXPORT_DATA).await?;
    info!(user_id = %actor.id(), "exporting contacts");
    let body = stream_csv::<Contact, _>(state.pool.clone(), "SELECT * FROM contacts", move |qb| {
        contacts::push_filters(qb, &filter);
        qb.push(NEWEST_FIRST);
    });
    Ok(attachment(&file_name("contacts"), body))
}

async fn export_segments(
    State(state): State<AppState>,
    actor: CurrentUser,
    Query(filter): Query<SegmentFilter>,
) -> Result<Response> {
    actor.require_permission(&state.pool, EXPORT_DATA).await?;
    let body = stream_csv::<Segment, _>(state.pool.clone(), "SELECT * FROM segments", move |qb| {
        segments::push_filters(qb, &filter);
        qb.push(NEWEST_FIRST);
    });
    Ok(attachment(&file_name("segments"), body))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/exports/companies", get(export_companies))
        .route("/exports/contacts", get(export_contacts))
        .route("/exports/segments", get(export_segments))
}
