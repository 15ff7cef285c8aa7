//! Storage block and block purchase routes

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Extension, Json,
};
use reelhub_billing::{BlockPurchase, BlockSummary, PriceQuote, PurchaseCheckout};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, routes::json_body, state::AppState};

/// GET /api/creator-blocks/{creator_id}
pub async fn get_blocks(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
) -> ApiResult<Json<BlockSummary>> {
    auth_user.authorize_creator(creator_id)?;
    Ok(Json(state.billing.blocks.summary(creator_id).await?))
}

/// GET /api/creator-blocks/pricing/{blocks}
pub async fn quote(
    State(state): State<AppState>,
    Path(blocks): Path<i64>,
) -> ApiResult<Json<PriceQuote>> {
    Ok(Json(state.billing.purchases.quote(blocks)?))
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub blocks: i64,
}

/// POST /api/creator-blocks/{creator_id}/purchase
pub async fn initiate_purchase(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
    payload: Result<Json<PurchaseRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<PurchaseCheckout>)> {
    auth_user.authorize_creator(creator_id)?;
    let request = json_body(payload)?;

    let checkout = state
        .billing
        .purchases
        .initiate_purchase(creator_id, request.blocks)
        .await?;
    Ok((StatusCode::CREATED, Json(checkout)))
}

/// GET /api/creator-blocks/{creator_id}/purchases
pub async fn list_purchases(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
) -> ApiResult<Json<Vec<BlockPurchase>>> {
    auth_user.authorize_creator(creator_id)?;
    Ok(Json(state.billing.purchases.list_purchases(creator_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct FreeBlocksRequest {
    pub blocks: i64,
    pub valid_for_days: i64,
}

/// POST /api/creator-blocks/{creator_id}/free-blocks
pub async fn grant_free_blocks(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
    payload: Result<Json<FreeBlocksRequest>, JsonRejection>,
) -> ApiResult<Json<BlockSummary>> {
    auth_user.require_admin()?;
    let request = json_body(payload)?;

    let blocks = state
        .billing
        .blocks
        .grant_free_blocks(creator_id, request.blocks, request.valid_for_days)
        .await?;
    Ok(Json(blocks.summary(OffsetDateTime::now_utc())))
}
