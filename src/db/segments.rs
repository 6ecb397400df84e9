use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use super::{like_pattern, ListPage, Paging, Pool};
use crate::error::{AppError, Result};
use crate::model::{Offering, OfferingStatus, Segment, SegmentStats, SegmentStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub research_filter_requirements: String,
    #[serde(default)]
    pub offering_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SegmentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub research_filter_requirements: Option<String>,
    pub offering_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SegmentFilter {
    pub status: Option<SegmentStatus>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SegmentDetail {
    #[serde(flatten)]
    pub segment: Segment,
    pub offerings: Vec<Offering>,
    pub stats: SegmentStats,
}

fn conflict_on_name(e: sqlx::Error) -> AppError {
    match AppError::from(e) {
        AppError::Conflict(_) => AppError::Conflict("segment name already exists".into()),
        other => other,
    }
}

async fn link_offerings_tx(
    tx: &mut Transaction<'_, Sqlite>,
    segment_id: Uuid,
    offering_ids: &[Uuid],
) -> Result<()> {
    sqlx::query("DELETE FROM segment_offerings WHERE segment_id = ?")
        .bind(segment_id)
        .execute(&mut **tx)
        .await?;
    let now = Utc::now();
    for offering_id in offering_ids {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM offerings WHERE id = ?")
            .bind(offering_id)
            .fetch_optional(&mut **tx)
            .await?;
        if found.is_none() {
            return Err(AppError::NotFound("offering"));
        }
        sqlx::query(
            "INSERT OR IGNORE INTO segment_offerings (segment_id, offering_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(segment_id)
        .bind(offering_id)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn create_tx(
    tx: &mut Transaction<'_, Sqlite>,
    input: &SegmentInput,
    created_by: Uuid,
) -> Result<Segment> {
    let name = input.name.trim();
    if name.is_empty() || name.chars().count() > 255 {
        return Err(AppError::invalid("name must be 1 to 255 characters"));
    }
    let now = Utc::now();
    let segment = sqlx::query_as::<_, Segment>(
        "INSERT INTO segments (id, name, description, research_filter_requirements, status, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(input.description.as_deref().map(str::trim).filter(|d| !d.is_empty()))
    .bind(input.research_filter_requirements.trim())
    .bind(SegmentStatus::Active)
    .bind(created_by)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
    .map_err(conflict_on_name)?;
    link_offerings_tx(tx, segment.id, &input.offering_ids).await?;
    info!(segment_id = %segment.id, "segment created");
    Ok(segment)
}

pub async fn get_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<Segment> {
    sqlx::query_as::<_, Segment>("SELECT * FROM segments WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::NotFound("segment"))
}

pub async fn get(pool: &Pool, id: Uuid) -> Result<Segment> {
    sqlx::query_as::<_, Segment>("SELECT * FROM segments WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("segment"))
}

pub async fn stats(pool: &Pool, id: Uuid) -> Result<SegmentStats> {
    let stats = sqlx::query_as::<_, SegmentStats>(
        "SELECT \
           (SELECT COUNT(*) FROM companies WHERE segment_id = ?1) AS company_count, \
           (SELECT COUNT(*) FROM companies WHERE segment_id = ?1 AND status = 'pending') AS pending_company_count, \
           (SELECT COUNT(*) FROM contacts WHERE segment_id = ?1) AS contact_count",
    )
    .bind(id)
    .fetch_one(pool)
    .await?;
    Ok(stats)
}

pub async fn offerings_for(pool: &Pool, segment_id: Uuid) -> Result<Vec<Offering>> {
    let rows = sqlx::query_as::<_, Offering>(
        "SELECT o.* FROM offerings o JOIN segment_offerings so ON so.offering_id = o.id \
         WHERE so.segment_id = ? ORDER BY o.name",
    )
    .bind(segment_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn detail(pool: &Pool, id: Uuid) -> Result<SegmentDetail> {
    let segment = get(pool, id).await?;
    let offerings = offerings_for(pool, id).await?;
    let stats = stats(pool, id).await?;
    Ok(SegmentDetail {
        segment,
        offerings,
        stats,
    })
}

pub(crate) fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, f: &SegmentFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(status) = f.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(term) = f.search.as_deref().filter(|s| !s.trim().is_empty()) {
        qb.push(" AND name LIKE ")
            .push_bind(like_pattern(term))
            .push(" ESCAPE '\\'");
    }
}

pub async fn list(pool: &Pool, filter: &SegmentFilter, paging: Paging) -> Result<ListPage<Segment>> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM segments");
    push_filters(&mut count, filter);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM segments");
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(paging.limit())
        .push(" OFFSET ")
        .push_bind(paging.skip());
    let items = qb.build_query_as::<Segment>().fetch_all(pool).await?;
    Ok(ListPage::new(items, total, paging))
}

#[instrument(skip_all, fields(segment_id = %id))]
pub async fn update_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    update: &SegmentUpdate,
) -> Result<Segment> {
    let current = get_tx(tx, id).await?;
    let name = match &update.name {
        Some(n) => {
            let n = n.trim();
            if n.is_empty() || n.chars().count() > 255 {
                return Err(AppError::invalid("name must be 1 to 255 characters"));
            }
            n.to_string()
        }
        None => current.name,
    };
    let description = match &update.description {
        Some(d) => Some(d.trim().to_string()).filter(|d| !d.is_empty()),
        None => current.description,
    };
    let requirements = update
        .research_filter_requirements
        .as_deref()
        .map(|r| r.trim().to_string())
        .unwrap_or(current.research_filter_requirements);
    let segment = sqlx::query_as::<_, Segment>(
        "UPDATE segments SET name = ?, description = ?, research_filter_requirements = ?, updated_at = ? \
         WHERE id = ? RETURNING *",
    )
    .bind(name)
    .bind(description)
    .bind(requirements)
    .bind(Utc::now())
    .bind(id)
    .fetch_one(&mut **tx)
    .await
    .map_err(conflict_on_name)?;
    if let Some(ids) = &update.offering_ids {
        link_offerings_tx(tx, id, ids).await?;
    }
    Ok(segment)
}

pub async fn archive_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<Segment> {
    sqlx::query_as::<_, Segment>(
        "UPDATE segments SET status = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(SegmentStatus::Archived)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(AppError::NotFound("segment"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct OfferingInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OfferingUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<OfferingStatus>,
}

fn conflict_on_offering(e: sqlx::Error) -> AppError {
    match AppError::from(e) {
        AppError::Conflict(_) => AppError::Conflict("offering name already exists".into()),
        other => other,
    }
}

pub async fn create_offering_tx(
    tx: &mut Transaction<'_, Sqlite>,
    input: &OfferingInput,
) -> Result<Offering> {
    let name = input.name.trim();
    if name.is_empty() || name.chars().count() > 255 {
        return Err(AppError::invalid("name must be 1 to 255 characters"));
    }
    let now = Utc::now();
    sqlx::query_as::<_, Offering>(
        "INSERT INTO offerings (id, name, description, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(input.description.as_deref().map(str::trim).filter(|d| !d.is_empty()))
    .bind(OfferingStatus::Active)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
    .map_err(conflict_on_offering)
}

pub async fn get_offering(pool: &Pool, id: Uuid) -> Result<Offering> {
    sqlx::query_as::<_, Offering>("SELECT * FROM offerings WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("offering"))
}

pub async fn list_offerings(
    pool: &Pool,
    status: Option<OfferingStatus>,
    paging: Paging,
) -> Result<ListPage<Offering>> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM offerings");
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM offerings");
    if let Some(status) = status {
        count.push(" WHERE status = ").push_bind(status);
        qb.push(" WHERE status = ").push_bind(status);
    }
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;
    qb.push(" ORDER BY name LIMIT ")
        .push_bind(paging.limit())
        .push(" OFFSET ")
        .push_bind(paging.skip());
    let items = qb.build_query_as::<Offering>().fetch_all(pool).await?;
    Ok(ListPage::new(items, total, paging))
}

pub async fn update_offering_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    update: &OfferingUpdate,
) -> Result<Offering> {
    if let Some(n) = &update.name {
        let n = n.trim();
        if n.is_empty() || n.chars().count() > 255 {
            return Err(AppError::invalid("name must be 1 to 255 characters"));
        }
    }
    sqlx::query_as::<_, Offering>(
        "UPDATE offerings SET name = COALESCE(?, name), description = COALESCE(?, description), \
         status = COALESCE(?, status), updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(update.name.as_deref().map(str::trim))
    .bind(update.description.as_deref().map(str::trim))
    .bind(update.status)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(conflict_on_offering)?
    .ok_or(AppError::NotFound("offering"))
}
