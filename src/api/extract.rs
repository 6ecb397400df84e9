use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use uuid::Uuid;

use super::AppState;
use crate::auth::TokenType;
use crate::db::{users, Pool};
use crate::error::{AppError, Result};
use crate::model::{Role, UserWithRoles};

/// The authenticated, active caller with its current roles.
///
/// Roles are read from the database on every request, so role changes and
/// deactivation take effect without waiting for tokens to expire.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserWithRoles);

impl CurrentUser {
    pub fn id(&self) -> Uuid {
        self.0.user.id
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.0.has_role(role)
    }

    pub fn require_any(&self, roles: &[Role]) -> Result<()> {
        if roles.iter().any(|r| self.has_role(*r)) {
            Ok(())
        } else {
            let names: Vec<&str> = roles.iter().map(Role::as_str).collect();
            Err(AppError::PermissionDenied(format!(
                "requires one of roles: {}",
                names.join(", ")
            )))
        }
    }

    pub async fn require_permission(&self, pool: &Pool, action: &str) -> Result<()> {
        if users::has_permission(pool, &self.0.roles, action).await? {
            Ok(())
        } else {
            Err(AppError::PermissionDenied(format!(
                "missing permission: {action}"
            )))
        }
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer_token(parts).ok_or(AppError::Unauthorized("not authenticated"))?;
        let claims = state
            .tokens
            .verify(token, TokenType::Access)
            .map_err(|_| AppError::Unauthorized("could not validate credentials"))?;
        let user = users::find_by_id(&state.pool, claims.sub)
            .await?
            .ok_or(AppError::Unauthorized("could not validate credentials"))?;
        if !user.is_active() {
            return Err(AppError::PermissionDenied("inactive user".into()));
        }
        Ok(CurrentUser(user))
    }
}
