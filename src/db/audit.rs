use chrono::Utc;
use serde::Deserialize;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::{ListPage, Paging, Pool};
use crate::error::Result;
use crate::model::{AuditLog, EntityKind, EntityRef};

#[instrument(skip_all, fields(action = action, entity = %entity))]
pub async fn record_tx(
    tx: &mut Transaction<'_, Sqlite>,
    actor_id: Option<Uuid>,
    action: &str,
    entity: EntityRef,
    details: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO audit_logs (id, actor_id, action, entity_type, entity_id, details, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(actor_id)
    .bind(action)
    .bind(entity.kind())
    .bind(entity.id())
    .bind(Json(details))
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditFilter {
    pub actor_id: Option<Uuid>,
    pub action: Option<String>,
    pub entity_type: Option<EntityKind>,
    pub entity_id: Option<Uuid>,
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, f: &AuditFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(actor) = f.actor_id {
        qb.push(" AND actor_id = ").push_bind(actor);
    }
    if let Some(action) = &f.action {
        qb.push(" AND action = ").push_bind(action.clone());
    }
    if let Some(kind) = f.entity_type {
        qb.push(" AND entity_type = ").push_bind(kind);
    }
    if let Some(id) = f.entity_id {
        qb.push(" AND entity_id = ").push_bind(id);
    }
}

#[instrument(skip_all)]
pub async fn list(pool: &Pool, filter: &AuditFilter, paging: Paging) -> Result<ListPage<AuditLog>> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_logs");
    push_filters(&mut count, filter);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM audit_logs");
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(paging.limit())
        .push(" OFFSET ")
        .push_bind(paging.skip());
    let items = qb.build_query_as::<AuditLog>().fetch_all(pool).await?;
    Ok(ListPage::new(items, total, paging))
}
