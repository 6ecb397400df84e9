use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{AppState, CurrentUser};
use crate::auth::{verify_password, TokenPair, TokenType};
use crate::db::users;
use crate::error::{AppError, Result};
use crate::model::{UserStatus, UserWithRoles};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Me {
    #[serde(flatten)]
    pub user: UserWithRoles,
    pub permissions: Vec<String>,
}

const BAD_CREDENTIALS: &str = "incorrect email or password";

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenPair>> {
    let user = users::find_by_email(&state.pool, &req.email)
        .await?
        .filter(|u| verify_password(&req.password, &u.password_hash))
        .ok_or(AppError::Unauthorized(BAD_CREDENTIALS))?;
    if user.status != UserStatus::Active {
        warn!(user_id = %user.id, "login attempt by deactivated user");
        return Err(AppError::Unauthorized(BAD_CREDENTIALS));
    }
    let pair = state
        .tokens
        .issue_pair(user.id)
        .map_err(|e| AppError::Internal(e.into()))?;
    info!(user_id = %user.id, "user logged in");
    Ok(Json(pair))
}

async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<AccessToken>> {
    let claims = state
        .tokens
        .verify(&req.refresh_token, TokenType::Refresh)
        .map_err(|_| AppError::Unauthorized("invalid refresh token"))?;
    let user = users::find_by_id(&state.pool, claims.sub)
        .await?
        .filter(UserWithRoles::is_active)
        .ok_or(AppError::Unauthorized("invalid refresh token"))?;
    let access_token = state
        .tokens
        .issue_access(user.user.id)
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok(Json(AccessToken {
        access_token,
        token_type: "bearer",
    }))
}

async fn me(State(state): State<AppState>, user: CurrentUser) -> Result<Json<Me>> {
    let permissions = users::permissions_for(&state.pool, &user.0.roles).await?;
    Ok(Json(Me {
        user: user.0,
        permissions,
    }))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/me", get(me))
}
