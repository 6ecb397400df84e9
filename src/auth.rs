//! Password hashing and bearer tokens.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::{Auth, BootstrapAdmin};
use crate::db::{users, Pool};
use crate::model::Role;

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?;
    Ok(hash.to_string())
}

/// False on mismatch and on unparseable stored hashes.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Creates the configured admin when no user exists yet. Returns the new id.
pub async fn seed_bootstrap_admin(
    pool: &Pool,
    admin: &BootstrapAdmin,
) -> anyhow::Result<Option<Uuid>> {
    if users::count(pool).await? > 0 {
        return Ok(None);
    }
    let password_hash = hash_password(&admin.password)?;
    let mut tx = pool.begin().await?;
    let created = users::create_user_tx(
        &mut tx,
        users::NewUser {
            email: &admin.email,
            name: &admin.name,
            password_hash: &password_hash,
            roles: &[Role::Admin],
        },
    )
    .await?;
    tx.commit().await?;
    info!(user_id = %created.user.id, email = %created.user.email, "bootstrap admin created");
    Ok(Some(created.user.id))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("token is not a {0} token")]
    WrongType(TokenType),
    #[error("token is invalid")]
    Invalid,
    #[error("token could not be signed")]
    Signing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: i64,
    pub iat: i64,
    pub jti: Uuid,
    #[serde(rename = "type")]
    pub token_type: TokenType,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

/// HS256 keys and lifetimes, built once from config.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenKeys {
    pub fn from_config(auth: &Auth) -> Self {
        Self {
            encoding: EncodingKey::from_secret(auth.secret_key.as_bytes()),
            decoding: DecodingKey::from_secret(auth.secret_key.as_bytes()),
            access_ttl: Duration::minutes(auth.access_token_expire_minutes as i64),
            refresh_ttl: Duration::days(auth.refresh_token_expire_days as i64),
        }
    }

    fn issue(&self, user_id: Uuid, token_type: TokenType) -> Result<String, TokenError> {
        let now = Utc::now();
        let ttl = match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: user_id,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            jti: Uuid::new_v4(),
            token_type,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| TokenError::Signing)
    }

    pub fn issue_access(&self, user_id: Uuid) -> Result<String, TokenError> {
        self.issue(user_id, TokenType::Access)
    }

    pub fn issue_pair(&self, user_id: Uuid) -> Result<TokenPair, TokenError> {
        Ok(TokenPair {
            access_token: self.issue(user_id, TokenType::Access)?,
            refresh_token: self.issue(user_id, TokenType::Refresh)?,
            token_type: "bearer",
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    /// Decodes and checks signature, expiry and token type.
    pub fn verify(&self, token: &str, expected: TokenType) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            }
        })?;
        if data.claims.token_type != expected {
            return Err(TokenError::WrongType(expected));
        }
        Ok(data.claims)
    }
}
