use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use super::notifications::{notify_tx, NewNotification};
use super::{audit, like_pattern, segments, ListPage, Paging, Pool};
use crate::error::{AppError, Result};
use crate::model::{
    Company, CompanyProfile, CompanyStatus, EntityRef, NotificationKind, SegmentStatus,
};
use crate::pipeline::{check_company_transition, CompanyDecision};
use crate::validate::{into_app_error, normalize_company, validate_company, CompanyPatch};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompanyFilter {
    pub segment_id: Option<Uuid>,
    pub status: Option<CompanyStatus>,
    pub search: Option<String>,
    pub is_duplicate: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct CompanyDetail {
    #[serde(flatten)]
    pub company: Company,
    pub contact_count: i64,
}

/// Inserts a pending company without uniqueness checks.
pub async fn insert_tx(
    tx: &mut Transaction<'_, Sqlite>,
    profile: &CompanyProfile,
    segment_id: Uuid,
    batch_id: Option<Uuid>,
    created_by: Uuid,
) -> Result<Company> {
    let now = Utc::now();
    let company = sqlx::query_as::<_, Company>(
        "INSERT INTO companies (id, company_name, company_website, company_phone, company_description, \
         company_linkedin_url, company_industry, company_sub_industry, street, city, state_province, \
         country_region, zip_postal_code, founded_year, revenue_range, employee_size_range, \
         segment_id, status, is_duplicate, batch_id, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(&profile.company_name)
    .bind(&profile.company_website)
    .bind(&profile.company_phone)
    .bind(&profile.company_description)
    .bind(&profile.company_linkedin_url)
    .bind(&profile.company_industry)
    .bind(&profile.company_sub_industry)
    .bind(&profile.street)
    .bind(&profile.city)
    .bind(&profile.state_province)
    .bind(&profile.country_region)
    .bind(&profile.zip_postal_code)
    .bind(profile.founded_year)
    .bind(&profile.revenue_range)
    .bind(&profile.employee_size_range)
    .bind(segment_id)
    .bind(CompanyStatus::Pending)
    .bind(batch_id)
    .bind(created_by)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(company)
}

/// Whether another company in the segment already has this (name, website).
pub async fn natural_key_taken_tx(
    tx: &mut Transaction<'_, Sqlite>,
    segment_id: Uuid,
    profile: &CompanyProfile,
    exclude: Option<Uuid>,
) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM companies WHERE segment_id = ? \
         AND lower(trim(company_name)) = lower(trim(?)) \
         AND lower(trim(COALESCE(company_website, ''))) = lower(trim(?)) \
         AND (? IS NULL OR id <> ?) LIMIT 1",
    )
    .bind(segment_id)
    .bind(&profile.company_name)
    .bind(profile.company_website.as_deref().unwrap_or(""))
    .bind(exclude)
    .bind(exclude)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(found.is_some())
}

#[instrument(skip_all, fields(segment_id = %segment_id))]
pub async fn create_tx(
    tx: &mut Transaction<'_, Sqlite>,
    mut profile: CompanyProfile,
    segment_id: Uuid,
    actor: Uuid,
) -> Result<Company> {
    normalize_company(&mut profile);
    validate_company(&profile).map_err(into_app_error)?;
    let segment = segments::get_tx(tx, segment_id).await?;
    if segment.status != SegmentStatus::Active {
        return Err(AppError::invalid("segment is archived"));
    }
    if natural_key_taken_tx(tx, segment_id, &profile, None).await? {
        return Err(AppError::Conflict(
            "a company with this name and website already exists in the segment".into(),
        ));
    }
    let company = insert_tx(tx, &profile, segment_id, None, actor).await?;
    audit::record_tx(
        tx,
        Some(actor),
        "company.create",
        EntityRef::Company(company.id),
        json!({ "company_name": company.profile.company_name, "segment_id": segment_id }),
    )
    .await?;
    info!(company_id = %company.id, "company created");
    Ok(company)
}

pub async fn get(pool: &Pool, id: Uuid) -> Result<Company> {
    sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("company"))
}

pub async fn get_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<Company> {
    sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::NotFound("company"))
}

pub async fn detail(pool: &Pool, id: Uuid) -> Result<CompanyDetail> {
    let company = get(pool, id).await?;
    let contact_count = sqlx::query_scalar("SELECT COUNT(*) FROM contacts WHERE company_id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(CompanyDetail {
        company,
        contact_count,
    })
}

pub(crate) fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, f: &CompanyFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(segment_id) = f.segment_id {
        qb.push(" AND segment_id = ").push_bind(segment_id);
    }
    if let Some(status) = f.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(dup) = f.is_duplicate {
        qb.push(" AND is_duplicate = ").push_bind(dup);
    }
    if let Some(term) = f.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = like_pattern(term);
        qb.push(" AND (company_name LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR company_website LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
}

pub async fn list(pool: &Pool, filter: &CompanyFilter, paging: Paging) -> Result<ListPage<Company>> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM companies");
    push_filters(&mut count, filter);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM companies");
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(paging.limit())
        .push(" OFFSET ")
        .push_bind(paging.skip());
    let items = qb.build_query_as::<Company>().fetch_all(pool).await?;
    Ok(ListPage::new(items, total, paging))
}

/// Pending companies, oldest first.
pub async fn pending_queue(
    pool: &Pool,
    segment_id: Option<Uuid>,
    paging: Paging,
) -> Result<ListPage<Company>> {
    let filter = CompanyFilter {
        segment_id,
        status: Some(CompanyStatus::Pending),
        ..Default::default()
    };
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM companies");
    push_filters(&mut count, &filter);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM companies");
    push_filters(&mut qb, &filter);
    qb.push(" ORDER BY created_at ASC, rowid ASC LIMIT ")
        .push_bind(paging.limit())
        .push(" OFFSET ")
        .push_bind(paging.skip());
    let items = qb.build_query_as::<Company>().fetch_all(pool).await?;
    Ok(ListPage::new(items, total, paging))
}

#[instrument(skip_all, fields(company_id = %id))]
pub async fn update_profile_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    patch: CompanyPatch,
    actor: Uuid,
) -> Result<Company> {
    let current = get_tx(tx, id).await?;
    let mut profile = current.profile.clone();
    patch.apply(&mut profile);
    normalize_company(&mut profile);
    validate_company(&profile).map_err(into_app_error)?;
    if natural_key_taken_tx(tx, current.segment_id, &profile, Some(id)).await? {
        return Err(AppError::Conflict(
            "a company with this name and website already exists in the segment".into(),
        ));
    }
    let company = sqlx::query_as::<_, Company>(
        "UPDATE companies SET company_name = ?, company_website = ?, company_phone = ?, \
         company_description = ?, company_linkedin_url = ?, company_industry = ?, \
         company_sub_industry = ?, street = ?, city = ?, state_province = ?, country_region = ?, \
         zip_postal_code = ?, founded_year = ?, revenue_range = ?, employee_size_range = ?, \
         updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(&profile.company_name)
    .bind(&profile.company_website)
    .bind(&profile.company_phone)
    .bind(&profile.company_description)
    .bind(&profile.company_linkedin_url)
    .bind(&profile.company_industry)
    .bind(&profile.company_sub_industry)
    .bind(&profile.street)
    .bind(&profile.city)
    .bind(&profile.state_province)
    .bind(&profile.country_region)
    .bind(&profile.zip_postal_code)
    .bind(profile.founded_year)
    .bind(&profile.revenue_range)
    .bind(&profile.employee_size_range)
    .bind(Utc::now())
    .bind(id)
    .fetch_one(&mut **tx)
    .await?;
    audit::record_tx(
        tx,
        Some(actor),
        "company.update",
        EntityRef::Company(id),
        serde_json::to_value(&company.profile).unwrap_or_default(),
    )
    .await?;
    Ok(company)
}

/// Applies an approval decision to a pending company.
///
/// The status check and the write are one conditional `UPDATE`, so of two
/// concurrent decisions only one can match `status = 'pending'`.
#[instrument(skip_all, fields(company_id = %id))]
pub async fn decide_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    decision: &CompanyDecision,
    actor: Uuid,
) -> Result<Company> {
    let now = Utc::now();
    let updated = sqlx::query_as::<_, Company>(
        "UPDATE companies SET status = ?, rejection_reason = ?, approved_by = ?, approved_at = ?, \
         updated_at = ? WHERE id = ? AND status = ? RETURNING *",
    )
    .bind(decision.target())
    .bind(decision.rejection_reason())
    .bind(actor)
    .bind(now)
    .bind(now)
    .bind(id)
    .bind(CompanyStatus::Pending)
    .fetch_optional(&mut **tx)
    .await?;

    let company = match updated {
        Some(c) => c,
        None => {
            let current = get_tx(tx, id).await?;
            check_company_transition(current.status, decision)?;
            return Err(AppError::Internal(anyhow::anyhow!(
                "company {id} matched no row while pending"
            )));
        }
    };

    audit::record_tx(
        tx,
        Some(actor),
        "company.decide",
        EntityRef::Company(id),
        json!({ "status": company.status, "rejection_reason": company.rejection_reason }),
    )
    .await?;
    let message = match decision {
        CompanyDecision::Approve => format!("{} was approved", company.profile.company_name),
        CompanyDecision::Reject { reason } => {
            format!("{} was rejected: {reason}", company.profile.company_name)
        }
    };
    notify_tx(
        tx,
        NewNotification {
            user_id: company.created_by,
            actor_id: Some(actor),
            kind: NotificationKind::CompanyDecided,
            title: "Company reviewed",
            message,
            entity: Some(EntityRef::Company(id)),
        },
    )
    .await?;
    info!(status = %company.status, "company decided");
    Ok(company)
}

pub async fn set_duplicate_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    is_duplicate: bool,
    actor: Uuid,
) -> Result<Company> {
    let company = sqlx::query_as::<_, Company>(
        "UPDATE companies SET is_duplicate = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(is_duplicate)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(AppError::NotFound("company"))?;
    audit::record_tx(
        tx,
        Some(actor),
        "company.mark_duplicate",
        EntityRef::Company(id),
        json!({ "is_duplicate": is_duplicate }),
    )
    .await?;
    Ok(company)
}

/// `(id, company_name)` pairs of a segment, oldest first.
pub async fn names_in_segment_tx(
    tx: &mut Transaction<'_, Sqlite>,
    segment_id: Uuid,
) -> Result<Vec<(Uuid, String)>> {
    let rows = sqlx::query_as(
        "SELECT id, company_name FROM companies WHERE segment_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(segment_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}
