use chrono::Utc;
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::{ListPage, Paging, Pool};
use crate::error::{AppError, Result};
use crate::model::{BatchStatus, RowError, UploadBatch, UploadType};

#[instrument(skip_all, fields(upload_type = %upload_type))]
pub async fn create_tx(
    tx: &mut Transaction<'_, Sqlite>,
    upload_type: UploadType,
    file_name: &str,
    file_size_bytes: i64,
    uploaded_by: Uuid,
) -> Result<UploadBatch> {
    let batch = sqlx::query_as::<_, UploadBatch>(
        "INSERT INTO upload_batches \
         (id, upload_type, file_name, file_size_bytes, total_rows, valid_rows, invalid_rows, status, uploaded_by, created_at) \
         VALUES (?, ?, ?, ?, 0, 0, 0, ?, ?, ?) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(upload_type)
    .bind(file_name)
    .bind(file_size_bytes)
    .bind(BatchStatus::Processing)
    .bind(uploaded_by)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(batch)
}

/// Persists final counters; status follows `invalid_rows`.
pub async fn finish_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    valid_rows: i64,
    invalid_rows: i64,
    error_report_url: Option<&str>,
) -> Result<UploadBatch> {
    let batch = sqlx::query_as::<_, UploadBatch>(
        "UPDATE upload_batches SET total_rows = ?, valid_rows = ?, invalid_rows = ?, status = ?, \
         error_report_url = ? WHERE id = ? RETURNING *",
    )
    .bind(valid_rows + invalid_rows)
    .bind(valid_rows)
    .bind(invalid_rows)
    .bind(BatchStatus::from_counts(invalid_rows))
    .bind(error_report_url)
    .bind(id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(batch)
}

pub async fn insert_errors_tx(
    tx: &mut Transaction<'_, Sqlite>,
    batch_id: Uuid,
    errors: &[RowError],
) -> Result<()> {
    for e in errors {
        sqlx::query("INSERT INTO upload_errors (batch_id, row_number, field, message) VALUES (?, ?, ?, ?)")
            .bind(batch_id)
            .bind(e.row_number)
            .bind(&e.field)
            .bind(&e.message)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

pub async fn get(pool: &Pool, id: Uuid) -> Result<UploadBatch> {
    sqlx::query_as::<_, UploadBatch>("SELECT * FROM upload_batches WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("upload batch"))
}

/// Row errors in input order.
pub async fn errors_for(pool: &Pool, batch_id: Uuid) -> Result<Vec<RowError>> {
    let rows = sqlx::query_as::<_, RowError>(
        "SELECT row_number, field, message FROM upload_errors WHERE batch_id = ? ORDER BY id",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchFilter {
    pub upload_type: Option<UploadType>,
    pub status: Option<BatchStatus>,
    pub uploaded_by: Option<Uuid>,
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, f: &BatchFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(t) = f.upload_type {
        qb.push(" AND upload_type = ").push_bind(t);
    }
    if let Some(s) = f.status {
        qb.push(" AND status = ").push_bind(s);
    }
    if let Some(u) = f.uploaded_by {
        qb.push(" AND uploaded_by = ").push_bind(u);
    }
}

pub async fn list(pool: &Pool, filter: &BatchFilter, paging: Paging) -> Result<ListPage<UploadBatch>> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM upload_batches");
    push_filters(&mut count, filter);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM upload_batches");
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(paging.limit())
        .push(" OFFSET ")
        .push_bind(paging.skip());
    let items = qb.build_query_as::<UploadBatch>().fetch_all(pool).await?;
    Ok(ListPage::new(items, total, paging))
}
