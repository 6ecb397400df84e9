use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use super::{ListPage, Paging, Pool};
use crate::error::{AppError, Result};
use crate::model::{Role, User, UserStatus, UserWithRoles};

pub struct NewUser<'a> {
    pub email: &'a str,
    pub name: &'a str,
    pub password_hash: &'a str,
    pub roles: &'a [Role],
}

#[instrument(skip_all)]
pub async fn create_user_tx(
    tx: &mut Transaction<'_, Sqlite>,
    new: NewUser<'_>,
) -> Result<UserWithRoles> {
    let now = Utc::now();
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (id, email, name, password_hash, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.email.trim())
    .bind(new.name.trim())
    .bind(new.password_hash)
    .bind(UserStatus::Active)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| match AppError::from(e) {
        AppError::Conflict(_) => AppError::Conflict("email already registered".into()),
        other => other,
    })?;
    let roles = replace_roles_tx(tx, user.id, new.roles).await?;
    info!(user_id = %user.id, "user created");
    Ok(UserWithRoles { user, roles })
}

/// Replaces the user's role set. Returns the stored roles, deduplicated.
pub async fn replace_roles_tx(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: Uuid,
    roles: &[Role],
) -> Result<Vec<Role>> {
    sqlx::query("DELETE FROM user_roles WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
    let now = Utc::now();
    let mut stored: Vec<Role> = Vec::with_capacity(roles.len());
    for role in roles {
        if stored.contains(role) {
            continue;
        }
        sqlx::query("INSERT INTO user_roles (user_id, role, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(role)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        stored.push(*role);
    }
    Ok(stored)
}

pub async fn roles_for(pool: &Pool, user_id: Uuid) -> Result<Vec<Role>> {
    let roles = sqlx::query_scalar("SELECT role FROM user_roles WHERE user_id = ? ORDER BY role")
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    Ok(roles)
}

pub async fn find_by_id(pool: &Pool, id: Uuid) -> Result<Option<UserWithRoles>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    match user {
        Some(user) => {
            let roles = roles_for(pool, user.id).await?;
            Ok(Some(UserWithRoles { user, roles }))
        }
        None => Ok(None),
    }
}

pub async fn get(pool: &Pool, id: Uuid) -> Result<UserWithRoles> {
    find_by_id(pool, id).await?.ok_or(AppError::NotFound("user"))
}

pub async fn find_by_email(pool: &Pool, email: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
        .bind(email.trim())
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

pub async fn count(pool: &Pool) -> Result<i64> {
    let n = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

pub async fn list(
    pool: &Pool,
    status: Option<UserStatus>,
    paging: Paging,
) -> Result<ListPage<UserWithRoles>> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM users");
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM users");
    if let Some(status) = status {
        count.push(" WHERE status = ").push_bind(status);
        qb.push(" WHERE status = ").push_bind(status);
    }
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;
    qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(paging.limit())
        .push(" OFFSET ")
        .push_bind(paging.skip());
    let users = qb.build_query_as::<User>().fetch_all(pool).await?;
    let mut items = Vec::with_capacity(users.len());
    for user in users {
        let roles = roles_for(pool, user.id).await?;
        items.push(UserWithRoles { user, roles });
    }
    Ok(ListPage::new(items, total, paging))
}

pub async fn update_profile_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    name: Option<&str>,
    email: Option<&str>,
) -> Result<User> {
    sqlx::query_as::<_, User>(
        "UPDATE users SET name = COALESCE(?, name), email = COALESCE(?, email), updated_at = ? \
         WHERE id = ? RETURNING *",
    )
    .bind(name.map(str::trim))
    .bind(email.map(str::trim))
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| match AppError::from(e) {
        AppError::Conflict(_) => AppError::Conflict("email already registered".into()),
        other => other,
    })?
    .ok_or(AppError::NotFound("user"))
}

pub async fn set_status_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    status: UserStatus,
) -> Result<User> {
    sqlx::query_as::<_, User>("UPDATE users SET status = ?, updated_at = ? WHERE id = ? RETURNING *")
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::NotFound("user"))
}

/// True when the user exists, is active and holds the `sdr` role.
pub async fn is_active_sdr_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM users u JOIN user_roles r ON r.user_id = u.id \
         WHERE u.id = ? AND u.status = 'active' AND r.role = 'sdr'",
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(found.is_some())
}

pub async fn exists_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(found.is_some())
}

/// Actions granted to any of `roles` through the grant table.
pub async fn permissions_for(pool: &Pool, roles: &[Role]) -> Result<Vec<String>> {
    if roles.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT DISTINCT action FROM role_grants WHERE granted = 1 AND role IN (",
    );
    let mut sep = qb.separated(", ");
    for role in roles {
        sep.push_bind(*role);
    }
    qb.push(") ORDER BY action");
    let actions = qb.build_query_scalar::<String>().fetch_all(pool).await?;
    Ok(actions)
}

pub async fn has_permission(pool: &Pool, roles: &[Role], action: &str) -> Result<bool> {
    Ok(permissions_for(pool, roles).await?.iter().any(|a| a == action))
}
