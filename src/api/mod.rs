//! HTTP API: router assembly and shared state.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::TokenKeys;
use crate::config::Config;
use crate::db::Pool;

mod assignments;
mod audit;
mod auth;
mod companies;
mod contacts;
mod exports;
pub mod extract;
mod health;
mod marketing;
mod notifications;
mod segments;
mod uploads;
mod users;

pub use extract::CurrentUser;

/// Multipart framing overhead allowed on top of the file cap.
const MULTIPART_SLACK_BYTES: usize = 64 * 1024;

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub tokens: Arc<TokenKeys>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(pool: Pool, config: Config) -> Self {
        let tokens = Arc::new(TokenKeys::from_config(&config.auth));
        Self {
            pool,
            tokens,
            config: Arc::new(config),
        }
    }

    pub fn api_prefix(&self) -> &str {
        self.config.server.api_prefix.trim()
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

/// Build the application router.
///
/// `/health` is served both at the root and under the API prefix; every other
/// route lives under the prefix and authenticates through [`CurrentUser`].
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .merge(health::routes())
        .merge(auth::routes())
        .merge(users::routes())
        .merge(segments::routes())
        .merge(companies::routes())
        .merge(contacts::routes())
        .merge(uploads::routes())
        .merge(assignments::routes())
        .merge(audit::routes())
        .merge(marketing::routes())
        .merge(notifications::routes())
        .merge(exports::routes());

    let prefix = state.api_prefix().to_string();
    let body_limit = state.config.upload.max_file_bytes + MULTIPART_SLACK_BYTES;
    let cors = cors_layer(&state.config.server.cors_origins);

    let router = if prefix.is_empty() {
        api
    } else {
        Router::new().merge(health::routes()).nest(&prefix, api)
    };

    router
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
