use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::{AppState, CurrentUser};
use crate::db::batches::{self, BatchFilter};
use crate::db::{ListPage, Paging};
use crate::error::{AppError, Result};
use crate::ingest::{self, ContactScope, IngestOutcome, Upload};
use crate::model::{Role, RowError, UploadBatch};

const UPLOADERS: &[Role] = &[Role::Researcher, Role::Admin];

/// Fields of an upload form.
#[derive(Debug, Default)]
struct UploadForm {
    file_name: Option<String>,
    file: Option<Bytes>,
    segment_id: Option<Uuid>,
    company_id: Option<Uuid>,
}

impl UploadForm {
    /// The file part after name, emptiness and size checks.
    fn checked_file(&self, max_bytes: usize) -> Result<(&str, &[u8])> {
        let (name, bytes) = match (&self.file_name, &self.file) {
            (Some(name), Some(bytes)) => (name.as_str(), bytes.as_ref()),
            _ => return Err(AppError::invalid("file is required")),
        };
        if !name.to_ascii_lowercase().ends_with(".csv") {
            return Err(AppError::invalid("only .csv files are accepted"));
        }
        if bytes.is_empty() {
            return Err(AppError::invalid("uploaded file is empty"));
        }
        if bytes.len() > max_bytes {
            return Err(AppError::invalid(format!(
                "file exceeds the maximum size of {max_bytes} bytes"
            )));
        }
        Ok((name, bytes))
    }
}

fn multipart_error(e: MultipartError) -> AppError {
    warn!(err = %e, "rejecting malformed upload");
    AppError::invalid(format!("invalid multipart body: {}", e.body_text()))
}

fn parse_id(field: &str, value: &str) -> Result<Option<Uuid>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    Uuid::parse_str(value)
        .map(Some)
        .map_err(|_| AppError::invalid(format!("{field}: not a valid id")))
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                form.file_name = Some(field.file_name().unwrap_or_default().to_string());
                form.file = Some(field.bytes().await.map_err(multipart_error)?);
            }
            "segment_id" => {
                let text = field.text().await.map_err(multipart_error)?;
                form.segment_id = parse_id("segment_id", &text)?;
            }
            "company_id" => {
                let text = field.text().await.map_err(multipart_error)?;
                form.company_id = parse_id("company_id", &text)?;
            }
            _ => {}
        }
    }
    Ok(form)
}

async fn upload_companies(
    State(state): State<AppState>,
    actor: CurrentUser,
    multipart: Multipart,
) -> Result<(StatusCode, Json<IngestOutcome>)> {
    actor.require_any(UPLOADERS)?;
    let form = read_form(multipart).await?;
    let segment_id = form
        .segment_id
        .ok_or_else(|| AppError::invalid("segment_id is required"))?;
    let (file_name, bytes) = form.checked_file(state.config.upload.max_file_bytes)?;
    let outcome = ingest::process_company_csv(
        &state.pool,
        Upload {
            file_name,
            bytes,
            uploaded_by: actor.id(),
            report_prefix: state.api_prefix(),
        },
        segment_id,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn upload_contacts(
    State(state): State<AppState>,
    actor: CurrentUser,
    multipart: Multipart,
) -> Result<(StatusCode, Json<IngestOutcome>)> {
    actor.require_any(UPLOADERS)?;
    let form = read_form(multipart).await?;
    let scope = ContactScope::from_ids(form.company_id, form.segment_id)?;
    let (file_name, bytes) = form.checked_file(state.config.upload.max_file_bytes)?;
    let outcome = ingest::process_contact_csv(
        &state.pool,
        Upload {
            file_name,
            bytes,
            uploaded_by: actor.id(),
            report_prefix: state.api_prefix(),
        },
        scope,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn list_batches(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(filter): Query<BatchFilter>,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<UploadBatch>>> {
    Ok(Json(batches::list(&state.pool, &filter, paging).await?))
}

async fn get_batch(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<UploadBatch>> {
    Ok(Json(batches::get(&state.pool, id).await?))
}

#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub batch_id: Uuid,
    pub errors: Vec<RowError>,
}

async fn batch_errors(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ErrorReport>> {
    batches::get(&state.pool, id).await?;
    let errors = batches::errors_for(&state.pool, id).await?;
    Ok(Json(ErrorReport {
        batch_id: id,
        errors,
    }))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/uploads", get(list_batches))
        .route("/uploads/companies", post(upload_companies))
        .route("/uploads/contacts", post(upload_contacts))
        .route("/uploads/:id", get(get_batch))
        .route("/uploads/:id/errors", get(batch_errors))
}
