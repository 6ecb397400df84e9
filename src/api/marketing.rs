use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use super::{AppState, CurrentUser};
use crate::db::collateral::{self, CollateralFilter, CollateralInput, CollateralUpdate};
use crate::db::{audit, ListPage, Paging};
use crate::error::Result;
use crate::model::{MarketingCollateral, Role};

const EDITORS: &[Role] = &[Role::Admin, Role::Marketing];

async fn create_collateral(
    State(state): State<AppState>,
    actor: CurrentUser,
    Json(input): Json<CollateralInput>,
) -> Result<(StatusCode, Json<MarketingCollateral>)> {
    actor.require_any(EDITORS)?;
    let mut tx = state.pool.begin().await?;
    let item = collateral::create_tx(&mut tx, &input, actor.id()).await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "collateral.create",
        item.scope(),
        json!({ "collateral_id": item.id, "title": item.title, "url": item.url }),
    )
    .await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn list_collateral(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(filter): Query<CollateralFilter>,
    Query(paging): Query<Paging>,
) -> Result<Json<ListPage<MarketingCollateral>>> {
    Ok(Json(collateral::list(&state.pool, &filter, paging).await?))
}

async fn get_collateral(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MarketingCollateral>> {
    Ok(Json(collateral::get(&state.pool, id).await?))
}

async fn update_collateral(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
    Json(update): Json<CollateralUpdate>,
) -> Result<Json<MarketingCollateral>> {
    actor.require_any(EDITORS)?;
    let mut tx = state.pool.begin().await?;
    let item = collateral::update_tx(&mut tx, id, &update).await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "collateral.update",
        item.scope(),
        json!({ "collateral_id": id, "title": item.title, "url": item.url }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(item))
}

async fn delete_collateral(
    State(state): State<AppState>,
    actor: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    actor.require_any(EDITORS)?;
    let mut tx = state.pool.begin().await?;
    let removed = collateral::delete_tx(&mut tx, id).await?;
    audit::record_tx(
        &mut tx,
        Some(actor.id()),
        "collateral.delete",
        removed.scope(),
        json!({ "collateral_id": id }),
    )
    .await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/marketing", post(create_collateral).get(list_collateral))
        .route(
            "/marketing/:id",
            get(get_collateral)
                .patch(update_collateral)
                .delete(delete_collateral),
        )
}
