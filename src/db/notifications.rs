use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::{ListPage, Paging, Pool};
use crate::error::{AppError, Result};
use crate::model::{EntityRef, Notification, NotificationKind};

pub struct NewNotification<'a> {
    pub user_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub title: &'a str,
    pub message: String,
    pub entity: Option<EntityRef>,
}

#[instrument(skip_all, fields(user_id = %n.user_id, kind = %n.kind))]
pub async fn notify_tx(tx: &mut Transaction<'_, Sqlite>, n: NewNotification<'_>) -> Result<()> {
    sqlx::query(
        "INSERT INTO notifications \
         (id, user_id, actor_id, kind, title, message, entity_type, entity_id, is_read, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(n.user_id)
    .bind(n.actor_id)
    .bind(n.kind)
    .bind(n.title)
    .bind(n.message)
    .bind(n.entity.map(|e| e.kind()))
    .bind(n.entity.map(|e| e.id()))
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn list_for_user(
    pool: &Pool,
    user_id: Uuid,
    unread_only: bool,
    paging: Paging,
) -> Result<ListPage<Notification>> {
    fn push_where(qb: &mut QueryBuilder<'_, Sqlite>, user_id: Uuid, unread_only: bool) {
        qb.push(" WHERE user_id = ").push_bind(user_id);
        if unread_only {
            qb.push(" AND is_read = 0");
        }
    }
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM notifications");
    push_where(&mut count, user_id, unread_only);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM notifications");
    push_where(&mut qb, user_id, unread_only);
    qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(paging.limit())
        .push(" OFFSET ")
        .push_bind(paging.skip());
    let items = qb.build_query_as::<Notification>().fetch_all(pool).await?;
    Ok(ListPage::new(items, total, paging))
}

pub async fn unread_count(pool: &Pool, user_id: Uuid) -> Result<i64> {
    let n = sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_read = 0")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// Marks one of the user's notifications read. Other users' ids are not found.
pub async fn mark_read(pool: &Pool, user_id: Uuid, id: Uuid) -> Result<Notification> {
    sqlx::query_as::<_, Notification>(
        "UPDATE notifications SET is_read = 1 WHERE id = ? AND user_id = ? RETURNING *",
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound("notification"))
}

pub async fn mark_all_read(pool: &Pool, user_id: Uuid) -> Result<u64> {
    let res = sqlx::query("UPDATE notifications SET is_read = 1 WHERE user_id = ? AND is_read = 0")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}
