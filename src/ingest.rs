//! CSV batch ingestion.
//!
//! One upload runs in one transaction: the batch row, every staged record,
//! the row errors, the final counters and the duplicate scan commit together.
//! Each valid row is inserted under its own savepoint so a failing insert
//! becomes a row error instead of aborting the batch.

use serde::Serialize;
use serde_json::json;
use sqlx::{Connection, Sqlite, Transaction};
use std::collections::HashMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{audit, batches, companies, contacts, segments, Pool};
use crate::dedup::{detect_company_duplicates_tx, detect_contact_duplicates_tx};
use crate::error::{AppError, Result};
use crate::model::{
    CompanyProfile, ContactProfile, EntityRef, RowError, SegmentStatus, UploadBatch, UploadType,
};
use crate::validate::{company_from_row, contact_from_row, CsvRow, FieldError};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Where uploaded contacts are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactScope {
    /// Every row goes to this company.
    Company(Uuid),
    /// Each row names its company; it must exist in this segment.
    Segment(Uuid),
}

impl ContactScope {
    /// An explicit company id takes precedence over a segment id.
    pub fn from_ids(company_id: Option<Uuid>, segment_id: Option<Uuid>) -> Result<Self> {
        match (company_id, segment_id) {
            (Some(c), _) => Ok(ContactScope::Company(c)),
            (None, Some(s)) => Ok(ContactScope::Segment(s)),
            (None, None) => Err(AppError::invalid("company_id or segment_id is required")),
        }
    }
}

/// A raw upload handed to the orchestrator.
pub struct Upload<'a> {
    pub file_name: &'a str,
    pub bytes: &'a [u8],
    pub uploaded_by: Uuid,
    /// Prefix for the persisted error report link, e.g. `/api/v1`.
    pub report_prefix: &'a str,
}

#[derive(Debug, Serialize)]
pub struct IngestOutcome {
    #[serde(flatten)]
    pub batch: UploadBatch,
    pub errors: Vec<RowError>,
    pub duplicates_marked: usize,
}

/// Rejects empty and non-UTF-8 payloads; strips a leading BOM.
pub fn decode_csv(bytes: &[u8]) -> Result<&str> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(AppError::invalid("uploaded file is empty"));
    }
    std::str::from_utf8(bytes).map_err(|_| AppError::invalid("file must be UTF-8 encoded CSV"))
}

fn reader(text: &str) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes())
}

fn headers(rdr: &mut csv::Reader<&[u8]>) -> Result<csv::StringRecord> {
    let headers = rdr
        .headers()
        .map_err(|e| AppError::invalid(format!("unreadable CSV header: {e}")))?
        .clone();
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(AppError::invalid("CSV header row is missing"));
    }
    Ok(headers)
}

/// Per-row bookkeeping shared by both upload kinds.
#[derive(Default)]
struct Tally {
    valid: i64,
    invalid: i64,
    errors: Vec<RowError>,
}

impl Tally {
    fn reject(&mut self, row_number: i64, fields: Vec<FieldError>) {
        self.invalid += 1;
        self.errors.extend(fields.into_iter().map(|f| RowError {
            row_number,
            field: f.field,
            message: f.message,
        }));
    }

    fn reject_one(&mut self, row_number: i64, field: &str, message: impl Into<String>) {
        self.reject(
            row_number,
            vec![FieldError {
                field: field.to_string(),
                message: message.into(),
            }],
        );
    }
}

async fn finish_tx(
    tx: &mut Transaction<'_, Sqlite>,
    batch: &UploadBatch,
    tally: &Tally,
    report_prefix: &str,
) -> Result<UploadBatch> {
    batches::insert_errors_tx(tx, batch.id, &tally.errors).await?;
    let report_url = (tally.invalid > 0)
        .then(|| format!("{}/uploads/{}/errors", report_prefix.trim_end_matches('/'), batch.id));
    batches::finish_tx(tx, batch.id, tally.valid, tally.invalid, report_url.as_deref()).await
}

async fn require_active_segment_tx(
    tx: &mut Transaction<'_, Sqlite>,
    segment_id: Uuid,
) -> Result<()> {
    let segment = segments::get_tx(tx, segment_id).await?;
    if segment.status != SegmentStatus::Active {
        return Err(AppError::invalid("segment is archived"));
    }
    Ok(())
}

/// Ingests a company CSV into `segment_id`.
#[instrument(skip_all, fields(segment_id = %segment_id, file = upload.file_name))]
pub async fn process_company_csv(
    pool: &Pool,
    upload: Upload<'_>,
    segment_id: Uuid,
) -> Result<IngestOutcome> {
    let text = decode_csv(upload.bytes)?;
    let mut tx = pool.begin().await?;

    require_active_segment_tx(&mut tx, segment_id).await?;
    let batch = batches::create_tx(
        &mut tx,
        UploadType::Company,
        upload.file_name,
        upload.bytes.len() as i64,
        upload.uploaded_by,
    )
    .await?;

    let mut rdr = reader(text);
    let headers = headers(&mut rdr)?;
    let mut tally = Tally::default();

    for (idx, record) in rdr.records().enumerate() {
        let row_number = idx as i64 + 1;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                tally.reject_one(row_number, "row", format!("malformed CSV row: {e}"));
                continue;
            }
        };
        let row = CsvRow::project(&headers, &record, CompanyProfile::COLUMNS);
        let profile = match company_from_row(&row) {
            Ok(p) => p,
            Err(fields) => {
                tally.reject(row_number, fields);
                continue;
            }
        };

        let mut sp = (&mut *tx).begin().await?;
        match companies::insert_tx(&mut sp, &profile, segment_id, Some(batch.id), upload.uploaded_by)
            .await
        {
            Ok(_) => {
                sp.commit().await?;
                tally.valid += 1;
            }
            Err(e) => {
                sp.rollback().await?;
                warn!(row_number, err = %e, "company row insert failed");
                tally.reject_one(row_number, "row", "record could not be saved");
            }
        }
    }

    let batch = finish_tx(&mut tx, &batch, &tally, upload.report_prefix).await?;
    let duplicates_marked = if tally.valid > 0 {
        detect_company_duplicates_tx(&mut tx, segment_id).await?
    } else {
        0
    };
    audit::record_tx(
        &mut tx,
        Some(upload.uploaded_by),
        "upload.companies",
        EntityRef::Segment(segment_id),
        json!({
            "batch_id": batch.id,
            "total_rows": batch.total_rows,
            "valid_rows": batch.valid_rows,
            "invalid_rows": batch.invalid_rows,
            "duplicates_marked": duplicates_marked,
        }),
    )
    .await?;
    tx.commit().await?;

    info!(
        batch_id = %batch.id,
        total = batch.total_rows,
        valid = batch.valid_rows,
        invalid = batch.invalid_rows,
        duplicates_marked,
        "company upload processed"
    );
    Ok(IngestOutcome {
        batch,
        errors: tally.errors,
        duplicates_marked,
    })
}

/// Resolves the company for one contact row.
enum CompanyResolver {
    Fixed { company_id: Uuid, segment_id: Uuid },
    ByName { index: HashMap<String, Uuid>, segment_id: Uuid },
}

impl CompanyResolver {
    async fn load(tx: &mut Transaction<'_, Sqlite>, scope: ContactScope) -> Result<Self> {
        match scope {
            ContactScope::Company(company_id) => {
                let company = companies::get_tx(tx, company_id).await?;
                require_active_segment_tx(tx, company.segment_id).await?;
                Ok(CompanyResolver::Fixed {
                    company_id,
                    segment_id: company.segment_id,
                })
            }
            ContactScope::Segment(segment_id) => {
                require_active_segment_tx(tx, segment_id).await?;
                let mut index = HashMap::new();
                for (id, name) in companies::names_in_segment_tx(tx, segment_id).await? {
                    index.entry(name.trim().to_lowercase()).or_insert(id);
                }
                Ok(CompanyResolver::ByName { index, segment_id })
            }
        }
    }

    fn resolve(&self, company_name: Option<&str>) -> std::result::Result<(Uuid, Uuid), FieldError> {
        match self {
            CompanyResolver::Fixed {
                company_id,
                segment_id,
            } => Ok((*company_id, *segment_id)),
            CompanyResolver::ByName { index, segment_id } => {
                let Some(name) = company_name else {
                    return Err(FieldError {
                        field: "company_name".into(),
                        message: "company_name is required when no company_id is given".into(),
                    });
                };
                index
                    .get(&name.to_lowercase())
                    .map(|id| (*id, *segment_id))
                    .ok_or_else(|| FieldError {
                        field: "company_name".into(),
                        message: format!("no company named '{name}' in this segment"),
                    })
            }
        }
    }

    fn audit_entity(&self) -> EntityRef {
        match self {
            CompanyResolver::Fixed { company_id, .. } => EntityRef::Company(*company_id),
            CompanyResolver::ByName { segment_id, .. } => EntityRef::Segment(*segment_id),
        }
    }
}

/// Ingests a contact CSV for a company, or for a segment with per-row
/// company lookup by name.
#[instrument(skip_all, fields(scope = ?scope, file = upload.file_name))]
pub async fn process_contact_csv(
    pool: &Pool,
    upload: Upload<'_>,
    scope: ContactScope,
) -> Result<IngestOutcome> {
    let text = decode_csv(upload.bytes)?;
    let mut tx = pool.begin().await?;

    let resolver = CompanyResolver::load(&mut tx, scope).await?;
    let batch = batches::create_tx(
        &mut tx,
        UploadType::Contact,
        upload.file_name,
        upload.bytes.len() as i64,
        upload.uploaded_by,
    )
    .await?;

    let mut rdr = reader(text);
    let headers = headers(&mut rdr)?;
    let mut tally = Tally::default();
    let mut touched: Vec<Uuid> = Vec::new();

    for (idx, record) in rdr.records().enumerate() {
        let row_number = idx as i64 + 1;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                tally.reject_one(row_number, "row", format!("malformed CSV row: {e}"));
                continue;
            }
        };
        let lookup = CsvRow::project(&headers, &record, &["company_name"]);
        let row = CsvRow::project(&headers, &record, ContactProfile::COLUMNS);

        let mut fields = Vec::new();
        let target = match resolver.resolve(lookup.get("company_name")) {
            Ok(t) => Some(t),
            Err(f) => {
                fields.push(f);
                None
            }
        };
        let profile = match contact_from_row(&row) {
            Ok(p) => Some(p),
            Err(mut more) => {
                fields.append(&mut more);
                None
            }
        };
        let (Some((company_id, segment_id)), Some(profile)) = (target, profile) else {
            tally.reject(row_number, fields);
            continue;
        };

        let mut sp = (&mut *tx).begin().await?;
        match contacts::insert_tx(
            &mut sp,
            &profile,
            company_id,
            segment_id,
            Some(batch.id),
            upload.uploaded_by,
        )
        .await
        {
            Ok(_) => {
                sp.commit().await?;
                tally.valid += 1;
                if !touched.contains(&company_id) {
                    touched.push(company_id);
                }
            }
            Err(e) => {
                sp.rollback().await?;
                warn!(row_number, err = %e, "contact row insert failed");
                tally.reject_one(row_number, "row", "record could not be saved");
            }
        }
    }

    let batch = finish_tx(&mut tx, &batch, &tally, upload.report_prefix).await?;
    let mut duplicates_marked = 0;
    for company_id in &touched {
        duplicates_marked += detect_contact_duplicates_tx(&mut tx, *company_id).await?;
    }
    audit::record_tx(
        &mut tx,
        Some(upload.uploaded_by),
        "upload.contacts",
        resolver.audit_entity(),
        json!({
            "batch_id": batch.id,
            "total_rows": batch.total_rows,
            "valid_rows": batch.valid_rows,
            "invalid_rows": batch.invalid_rows,
            "companies": touched,
            "duplicates_marked": duplicates_marked,
        }),
    )
    .await?;
    tx.commit().await?;

    info!(
        batch_id = %batch.id,
        total = batch.total_rows,
        valid = batch.valid_rows,
        invalid = batch.invalid_rows,
        duplicates_marked,
        "contact upload processed"
    );
    Ok(IngestOutcome {
        batch,
        errors: tally.errors,
        duplicates_marked,
    })
}
