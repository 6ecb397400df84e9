use chrono::Utc;
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use super::assignments::entity_exists_tx;
use super::{like_pattern, ListPage, Paging, Pool};
use crate::error::{AppError, Result};
use crate::model::{CollateralScope, EntityRef, MarketingCollateral};

const MAX_TITLE: usize = 255;
const MAX_URL: usize = 2048;
const MAX_DESCRIPTION: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct CollateralInput {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    pub scope_type: CollateralScope,
    pub scope_id: Uuid,
    #[serde(default)]
    pub segment_id: Option<Uuid>,
    #[serde(default)]
    pub offering_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollateralUpdate {
    pub title: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub scope_type: Option<CollateralScope>,
    pub scope_id: Option<Uuid>,
    pub segment_id: Option<Uuid>,
    pub offering_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CollateralFilter {
    pub scope_type: Option<CollateralScope>,
    pub scope_id: Option<Uuid>,
    pub segment_id: Option<Uuid>,
    pub offering_id: Option<Uuid>,
    pub search: Option<String>,
}

fn bounded(field: &str, value: &str, max: usize) -> Result<String> {
    let value = value.trim();
    if value.is_empty() || value.chars().count() > max {
        return Err(AppError::invalid(format!(
            "{field} must be 1 to {max} characters"
        )));
    }
    Ok(value.to_string())
}

fn description(value: Option<&str>) -> Result<Option<String>> {
    let value = value.map(str::trim).filter(|d| !d.is_empty());
    if value.is_some_and(|d| d.chars().count() > MAX_DESCRIPTION) {
        return Err(AppError::invalid(format!(
            "description must be at most {MAX_DESCRIPTION} characters"
        )));
    }
    Ok(value.map(str::to_string))
}

/// Checks every row the collateral points at before it is written.
async fn check_references_tx(
    tx: &mut Transaction<'_, Sqlite>,
    scope: EntityRef,
    scope_type: CollateralScope,
    segment_id: Option<Uuid>,
    offering_id: Option<Uuid>,
) -> Result<()> {
    if !entity_exists_tx(tx, scope).await? {
        return Err(AppError::NotFound(scope_type.as_str()));
    }
    if let Some(id) = segment_id {
        if !entity_exists_tx(tx, EntityRef::Segment(id)).await? {
            return Err(AppError::NotFound("segment"));
        }
    }
    if let Some(id) = offering_id {
        if !entity_exists_tx(tx, EntityRef::Offering(id)).await? {
            return Err(AppError::NotFound("offering"));
        }
    }
    Ok(())
}

#[instrument(skip_all, fields(scope_type = %input.scope_type, scope_id = %input.scope_id))]
pub async fn create_tx(
    tx: &mut Transaction<'_, Sqlite>,
    input: &CollateralInput,
    actor: Uuid,
) -> Result<MarketingCollateral> {
    let title = bounded("title", &input.title, MAX_TITLE)?;
    let url = bounded("url", &input.url, MAX_URL)?;
    let description = description(input.description.as_deref())?;
    check_references_tx(
        tx,
        input.scope_type.entity(input.scope_id),
        input.scope_type,
        input.segment_id,
        input.offering_id,
    )
    .await?;

    let now = Utc::now();
    let collateral = sqlx::query_as::<_, MarketingCollateral>(
        "INSERT INTO marketing_collateral (id, title, url, description, scope_type, scope_id, \
         segment_id, offering_id, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(title)
    .bind(url)
    .bind(description)
    .bind(input.scope_type)
    .bind(input.scope_id)
    .bind(input.segment_id)
    .bind(input.offering_id)
    .bind(actor)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    info!(collateral_id = %collateral.id, "marketing collateral created");
    Ok(collateral)
}

pub async fn get(pool: &Pool, id: Uuid) -> Result<MarketingCollateral> {
    sqlx::query_as::<_, MarketingCollateral>("SELECT * FROM marketing_collateral WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("marketing collateral"))
}

async fn get_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<MarketingCollateral> {
    sqlx::query_as::<_, MarketingCollateral>("SELECT * FROM marketing_collateral WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::NotFound("marketing collateral"))
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, f: &CollateralFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(scope_type) = f.scope_type {
        qb.push(" AND scope_type = ").push_bind(scope_type);
    }
    if let Some(scope_id) = f.scope_id {
        qb.push(" AND scope_id = ").push_bind(scope_id);
    }
    if let Some(segment_id) = f.segment_id {
        qb.push(" AND segment_id = ").push_bind(segment_id);
    }
    if let Some(offering_id) = f.offering_id {
        qb.push(" AND offering_id = ").push_bind(offering_id);
    }
    if let Some(term) = f.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = like_pattern(term);
        qb.push(" AND (title LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR description LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
}

pub async fn list(
    pool: &Pool,
    filter: &CollateralFilter,
    paging: Paging,
) -> Result<ListPage<MarketingCollateral>> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM marketing_collateral");
    push_filters(&mut count, filter);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM marketing_collateral");
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(paging.limit())
        .push(" OFFSET ")
        .push_bind(paging.skip());
    let items = qb
        .build_query_as::<MarketingCollateral>()
        .fetch_all(pool)
        .await?;
    Ok(ListPage::new(items, total, paging))
}

#[instrument(skip_all, fields(collateral_id = %id))]
pub async fn update_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    update: &CollateralUpdate,
) -> Result<MarketingCollateral> {
    let current = get_tx(tx, id).await?;
    let title = match &update.title {
        Some(t) => bounded("title", t, MAX_TITLE)?,
        None => current.title,
    };
    let url = match &update.url {
        Some(u) => bounded("url", u, MAX_URL)?,
        None => current.url,
    };
    let description = match &update.description {
        Some(d) => description(Some(d))?,
        None => current.description,
    };
    let scope_type = update.scope_type.unwrap_or(current.scope_type);
    let scope_id = update.scope_id.unwrap_or(current.scope_id);
    let segment_id = update.segment_id.or(current.segment_id);
    let offering_id = update.offering_id.or(current.offering_id);
    check_references_tx(
        tx,
        scope_type.entity(scope_id),
        scope_type,
        update.segment_id,
        update.offering_id,
    )
    .await?;

    let collateral = sqlx::query_as::<_, MarketingCollateral>(
        "UPDATE marketing_collateral SET title = ?, url = ?, description = ?, scope_type = ?, \
         scope_id = ?, segment_id = ?, offering_id = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(title)
    .bind(url)
    .bind(description)
    .bind(scope_type)
    .bind(scope_id)
    .bind(segment_id)
    .bind(offering_id)
    .bind(Utc::now())
    .bind(id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(collateral)
}

pub async fn delete_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<MarketingCollateral> {
    sqlx::query_as::<_, MarketingCollateral>(
        "DELETE FROM marketing_collateral WHERE id = ? RETURNING *",
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(AppError::NotFound("marketing collateral"))
}
