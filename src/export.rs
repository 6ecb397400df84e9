//! Streamed CSV exports.
//!
//! The query runs in a spawned task that encodes rows in small chunks and
//! pushes them through a bounded channel into the response body.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::channel::mpsc;
use futures::{SinkExt, TryStreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::io;
use tracing::{debug, error};

use crate::db::Pool;
use crate::model::{Company, Contact, Segment};

const ROWS_PER_CHUNK: usize = 200;

/// A row that can be written as one CSV record.
pub trait CsvRecord {
    fn header() -> &'static [&'static str];
    fn record(&self) -> Vec<String>;
}

fn opt<T: ToString>(v: &Option<T>) -> String {
    v.as_ref().map(ToString::to_string).unwrap_or_default()
}

impl CsvRecord for Company {
    fn header() -> &'static [&'static str] {
        &[
            "id",
            "company_name",
            "company_website",
            "company_phone",
            "company_description",
            "company_linkedin_url",
            "company_industry",
            "company_sub_industry",
            "street",
            "city",
            "state_province",
            "country_region",
            "zip_postal_code",
            "founded_year",
            "revenue_range",
            "employee_size_range",
            "segment_id",
            "status",
            "rejection_reason",
            "is_duplicate",
            "batch_id",
            "created_at",
        ]
    }

    fn record(&self) -> Vec<String> {
        let p = &self.profile;
        vec![
            self.id.to_string(),
            p.company_name.clone(),
            opt(&p.company_website),
            opt(&p.company_phone),
            opt(&p.company_description),
            opt(&p.company_linkedin_url),
            opt(&p.company_industry),
            opt(&p.company_sub_industry),
            opt(&p.street),
            opt(&p.city),
            opt(&p.state_province),
            opt(&p.country_region),
            opt(&p.zip_postal_code),
            opt(&p.founded_year),
            opt(&p.revenue_range),
            opt(&p.employee_size_range),
            self.segment_id.to_string(),
            self.status.to_string(),
            opt(&self.rejection_reason),
            self.is_duplicate.to_string(),
            opt(&self.batch_id),
            self.created_at.to_rfc3339(),
        ]
    }
}

impl CsvRecord for Contact {
    fn header() -> &'static [&'static str] {
        &[
            "id",
            "first_name",
            "last_name",
            "email",
            "mobile_phone",
            "job_title",
            "direct_phone_number",
            "email_address_2",
            "email_active_status",
            "lead_source_global",
            "management_level",
            "street",
            "city",
            "state_province",
            "country_region",
            "zip_postal_code",
            "primary_time_zone",
            "contact_linkedin_url",
            "linkedin_summary",
            "data_requester_details",
            "company_id",
            "segment_id",
            "status",
            "assigned_sdr_id",
            "is_duplicate",
            "created_at",
        ]
    }

    fn record(&self) -> Vec<String> {
        let p = &self.profile;
        vec![
            self.id.to_string(),
            p.first_name.clone(),
            p.last_name.clone(),
            p.email.clone(),
            opt(&p.mobile_phone),
            opt(&p.job_title),
            opt(&p.direct_phone_number),
            opt(&p.email_address_2),
            opt(&p.email_active_status),
            opt(&p.lead_source_global),
            opt(&p.management_level),
            opt(&p.street),
            opt(&p.city),
            opt(&p.state_province),
            opt(&p.country_region),
            opt(&p.zip_postal_code),
            opt(&p.primary_time_zone),
            opt(&p.contact_linkedin_url),
            opt(&p.linkedin_summary),
            opt(&p.data_requester_details),
            self.company_id.to_string(),
            self.segment_id.to_string(),
            self.status.to_string(),
            opt(&self.assigned_sdr_id),
            self.is_duplicate.to_string(),
            self.created_at.to_rfc3339(),
        ]
    }
}

impl CsvRecord for Segment {
    fn header() -> &'static [&'static str] {
        &[
            "id",
            "name",
            "description",
            "research_filter_requirements",
            "status",
            "created_by",
            "created_at",
        ]
    }

    fn record(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.name.clone(),
            opt(&self.description),
            self.research_filter_requirements.clone(),
            self.status.to_string(),
            self.created_by.to_string(),
            self.created_at.to_rfc3339(),
        ]
    }
}

/// Encodes records as CSV text, optionally preceded by the header row.
pub fn encode<T: CsvRecord>(rows: &[T], with_header: bool) -> io::Result<Vec<u8>> {
    let mut w = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if with_header {
        w.write_record(T::header())?;
    }
    for row in rows {
        w.write_record(row.record())?;
    }
    w.into_inner().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

type Chunk = Result<Vec<u8>, io::Error>;

/// Runs `SELECT * FROM <table>` plus whatever `filter` appends and streams
/// the rows as a CSV body.
pub fn stream_csv<T, F>(pool: Pool, base_sql: &'static str, filter: F) -> Body
where
    T: CsvRecord + for<'r> FromRow<'r, SqliteRow> + Send + Unpin + 'static,
    F: FnOnce(&mut QueryBuilder<'static, Sqlite>) + Send + 'static,
{
    let (mut tx, rx) = mpsc::channel::<Chunk>(8);
    tokio::spawn(async move {
        let mut qb = QueryBuilder::<Sqlite>::new(base_sql);
        filter(&mut qb);
        let mut rows = qb.build_query_as::<T>().fetch(&pool);
        let mut chunk: Vec<T> = Vec::with_capacity(ROWS_PER_CHUNK);
        let mut header_pending = true;
        let mut sent = 0usize;
        loop {
            let next = match rows.try_next().await {
                Ok(next) => next,
                Err(e) => {
                    error!(err = %e, "export query failed");
                    let _ = tx.send(Err(io::Error::new(io::ErrorKind::Other, "export failed"))).await;
                    return;
                }
            };
            let done = next.is_none();
            if let Some(row) = next {
                chunk.push(row);
            }
            if chunk.len() >= ROWS_PER_CHUNK || (done && (header_pending || !chunk.is_empty())) {
                let bytes = encode(&chunk, header_pending);
                header_pending = false;
                sent += chunk.len();
                chunk.clear();
                if tx.send(bytes).await.is_err() {
                    debug!("export client went away");
                    return;
                }
            }
            if done {
                break;
            }
        }
        debug!(rows = sent, "export finished");
    });
    Body::from_stream(rx)
}

/// Wraps a CSV body as a `text/csv` attachment.
pub fn attachment(file_name: &str, body: Body) -> Response {
    let disposition = format!("attachment; filename=\"{file_name}\"");
    let mut resp = (StatusCode::OK, body).into_response();
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/csv; charset=utf-8"),
    );
    if let Ok(v) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, v);
    }
    resp
}
