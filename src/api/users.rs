use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{AppState, CurrentUser};
use crate::auth::hash_password;
use crate::db::{audit, users, ListPage, Paging};
use crate::error::{AppError, Result};
use crate::model::{EntityRef, Role, User, UserStatus, UserWithRoles};
use crate::validate::is_valid_email;

const MANAGE_USERS: &str = "manage_users";

#[derive(Debug, Deserialize)]
pub struct CreateUser {
    pub email: String,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub roles: Vec<Role>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUser {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReplaceRoles {
    pub roles: Vec<Role>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserFilter {
    pub status: Option<UserStatus>,
}

fn check_email(email: &str) -> Result<()> {
    if is_valid_email(email.trim()) {
        Ok(())
    } else {
        Err(AppError::invalid("email: value is not a valid email address"))
    }
}

fn check_name(name: &str) -> Result<()> {
    let n = name.trim().chars().count();
    if (1..=255).contains(&n) {
        Ok(())
    } else {
        Err(AppError::invalid("name must be 1 to 255 characters"))
    }
}

async fn create_user(
    State(state): State<AppState>,
    actor: CurrentUser,
    Json(req): Json<CreateUser>,
) -> Result<(StatusCode, Json<UserWithRoles>)> {
    actor.require_permission(&state.pool, MANAGE_USERS).await?;
    check_email(&req.email)?;
    check_name(&req.name)?;
    if req.password.len() < 8 {
        return Err(AppError::invalid("password must be at least 8 characters"));
    }
    let password_hash = hash_password(&req.password)?;

    let mut tx = state.pool.begin().await?;
    let created = users::create_user_tx(
        &mut tx,
        users::NewUser {
            email: &req.email,
            name: &req.name,
            password_hash: &password_hash,
            roles: &req.roles,
        },
    )
    .await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "user.create",
        EntityRef::User(created.user.id),
        json!({ "email": created.user.email, "roles": created.roles }),
    )
    .await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_users(
    State(state): State<AppState>,
    actor: CurrentUser,
    Query(filter): Query<UserFilter>,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<UserWithRoles>>> {
    actor.require_permission(&state.pool, MANAGE_USERS).await?;
    Ok(Json(users::list(&state.pool, filter.status, paging).await?))
}

async fn get_user(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<UserWithRoles>> {
    if actor.id() != id {
        actor.require_permission(&state.pool, MANAGE_USERS).await?;
    }
    Ok(Json(users::get(&state.pool, id).await?))
}

async fn update_user(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateUser>,
) -> Result<Json<User>> {
    actor.require_permission(&state.pool, MANAGE_USERS).await?;
    if let Some(email) = &req.email {
        check_email(email)?;
    }
    if let Some(name) = &req.name {
        check_name(name)?;
    }
    let mut tx = state.pool.begin().await?;
    let user =
        users::update_profile_tx(&mut tx, id, req.name.as_deref(), req.email.as_deref()).await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "user.update",
        EntityRef::User(id),
        json!({ "name": user.name, "email": user.email }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(user))
}

async fn replace_roles(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<ReplaceRoles>,
) -> Result<Json<UserWithRoles>> {
    actor.require_permission(&state.pool, MANAGE_USERS).await?;
    if actor.id() == id && !req.roles.contains(&Role::Admin) && actor.has_role(Role::Admin) {
        return Err(AppError::invalid("cannot remove your own admin role"));
    }
    let mut tx = state.pool.begin().await?;
    if !users::exists_tx(&mut tx, id).await? {
        return Err(AppError::NotFound("user"));
    }
    let roles = users::replace_roles_tx(&mut tx, id, &req.roles).await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "user.roles",
        EntityRef::User(id),
        json!({ "roles": roles }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(users::get(&state.pool, id).await?))
}

async fn set_status(
    state: &AppState,
    actor: &CurrentUser,
    id: Uuid,
    status: UserStatus,
) -> Result<Json<User>> {
    actor.require_permission(&state.pool, MANAGE_USERS).await?;
    if actor.id() == id && status == UserStatus::Deactivated {
        return Err(AppError::invalid("cannot deactivate yourself"));
    }
    let mut tx = state.pool.begin().await?;
    let user = users::set_status_tx(&mut tx, id, status).await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "user.status",
        EntityRef::User(id),
        json!({ "status": status }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(user))
}

async fn deactivate(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<User>> {
    set_status(&state, &actor, id, UserStatus::Deactivated).await
}

async fn activate(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<User>> {
    set_status(&state, &actor, id, UserStatus::Active).await
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(create_user).get(list_users))
        .route("/users/:id", get(get_user).patch(update_user))
        .route("/users/:id/roles", put(replace_roles))
        .route("/users/:id/deactivate", post(deactivate))
        .route("/users/:id/activate", post(activate))
}
