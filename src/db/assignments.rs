use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::notifications::{notify_tx, NewNotification};
use super::{audit, ListPage, Paging, Pool};
use crate::error::{AppError, Result};
use crate::model::{Assignment, EntityKind, EntityRef, NotificationKind};

fn entity_table(entity: EntityRef) -> &'static str {
    match entity {
        EntityRef::Segment(_) => "segments",
        EntityRef::Offering(_) => "offerings",
        EntityRef::Company(_) => "companies",
        EntityRef::Contact(_) => "contacts",
        EntityRef::User(_) => "users",
    }
}

/// Whether the referenced row exists in its table.
pub async fn entity_exists_tx(tx: &mut Transaction<'_, Sqlite>, entity: EntityRef) -> Result<bool> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT 1 FROM ");
    qb.push(entity_table(entity)).push(" WHERE id = ").push_bind(entity.id());
    let found: Option<i64> = qb.build_query_scalar().fetch_optional(&mut **tx).await?;
    Ok(found.is_some())
}

#[instrument(skip_all, fields(entity = %entity, assigned_to = %assigned_to))]
pub async fn create_tx(
    tx: &mut Transaction<'_, Sqlite>,
    entity: EntityRef,
    assigned_to: Uuid,
    actor: Uuid,
) -> Result<Assignment> {
    let missing = match entity.kind() {
        EntityKind::Segment => "segment",
        EntityKind::Company => "company",
        EntityKind::Contact => "contact",
        EntityKind::Offering | EntityKind::User => {
            return Err(AppError::invalid(
                "entity_type must be one of: segment, company, contact",
            ))
        }
    };
    // The insert is the first statement so the transaction takes the write
    // lock before it reads; existence is checked in its predicate.
    let mut qb = QueryBuilder::<Sqlite>::new(
        "INSERT INTO assignments (id, entity_type, entity_id, assigned_to, assigned_by, created_at) \
         SELECT ",
    );
    qb.push_bind(Uuid::new_v4())
        .push(", ")
        .push_bind(entity.kind())
        .push(", ")
        .push_bind(entity.id())
        .push(", ")
        .push_bind(assigned_to)
        .push(", ")
        .push_bind(actor)
        .push(", ")
        .push_bind(Utc::now())
        .push(" WHERE EXISTS (SELECT 1 FROM ")
        .push(entity_table(entity))
        .push(" WHERE id = ")
        .push_bind(entity.id())
        .push(") AND EXISTS (SELECT 1 FROM users WHERE id = ")
        .push_bind(assigned_to)
        .push(") RETURNING *");
    let inserted = qb
        .build_query_as::<Assignment>()
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => {
                AppError::Conflict("user is already assigned to this entity".into())
            }
            other => other,
        })?;
    let assignment = match inserted {
        Some(a) => a,
        None if !entity_exists_tx(tx, entity).await? => return Err(AppError::NotFound(missing)),
        None => return Err(AppError::NotFound("user")),
    };
    audit::record_tx(
        tx,
        Some(actor),
        "assignment.create",
        entity,
        json!({ "assignment_id": assignment.id, "assigned_to": assigned_to }),
    )
    .await?;
    notify_tx(
        tx,
        NewNotification {
            user_id: assigned_to,
            actor_id: Some(actor),
            kind: NotificationKind::AssignmentCreated,
            title: "New assignment",
            message: format!("You were assigned to {} {}", entity.kind(), entity.id()),
            entity: Some(entity),
        },
    )
    .await?;
    Ok(assignment)
}

#[derive(Debug, Default, Deserialize)]
pub struct AssignmentFilter {
    pub entity_type: Option<EntityKind>,
    pub entity_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, f: &AssignmentFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(kind) = f.entity_type {
        qb.push(" AND entity_type = ").push_bind(kind);
    }
    if let Some(id) = f.entity_id {
        qb.push(" AND entity_id = ").push_bind(id);
    }
    if let Some(user) = f.assigned_to {
        qb.push(" AND assigned_to = ").push_bind(user);
    }
}

pub async fn list(
    pool: &Pool,
    filter: &AssignmentFilter,
    paging: Paging,
) -> Result<ListPage<Assignment>> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM assignments");
    push_filters(&mut count, filter);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM assignments");
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(paging.limit())
        .push(" OFFSET ")
        .push_bind(paging.skip());
    let items = qb.build_query_as::<Assignment>().fetch_all(pool).await?;
    Ok(ListPage::new(items, total, paging))
}

pub async fn delete_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid, actor: Uuid) -> Result<()> {
    let removed = sqlx::query_as::<_, Assignment>("DELETE FROM assignments WHERE id = ? RETURNING *")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::NotFound("assignment"))?;
    audit::record_tx(
        tx,
        Some(actor),
        "assignment.delete",
        removed.entity(),
        json!({ "assignment_id": id, "assigned_to": removed.assigned_to }),
    )
    .await?;
    Ok(())
}
