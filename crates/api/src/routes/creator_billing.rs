//! Creator enrollment, grace period and commission routes

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Extension, Json,
};
use reelhub_billing::{BillingOverview, BlockSummary, RevenueSplit, StatusAction};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, routes::json_body, state::AppState};

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct EnrollResponse {
    pub billing: BillingOverview,
    pub blocks: BlockSummary,
}

/// POST /api/creators/{creator_id}/enroll
pub async fn enroll(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
    payload: Result<Json<EnrollRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<EnrollResponse>)> {
    auth_user.authorize_creator(creator_id)?;
    let request = json_body(payload)?;

    let (billing, blocks) = state
        .billing
        .enroll_creator(creator_id, &request.email)
        .await?;

    let now = OffsetDateTime::now_utc();
    Ok((
        StatusCode::CREATED,
        Json(EnrollResponse {
            billing: state.billing.creator_billing.overview_of(billing, now),
            blocks: blocks.summary(now),
        }),
    ))
}

/// GET /api/creator-billing/{creator_id}
pub async fn get_billing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
) -> ApiResult<Json<BillingOverview>> {
    auth_user.authorize_creator(creator_id)?;
    let overview = state.billing.creator_billing.overview(creator_id).await?;
    Ok(Json(overview))
}

#[derive(Debug, Deserialize)]
pub struct StatusChangeRequest {
    pub action: StatusAction,
}

/// POST /api/creator-billing/{creator_id}/status
///
/// Suspension and reinstatement are admin actions; a creator may cancel
/// their own billing.
pub async fn change_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
    payload: Result<Json<StatusChangeRequest>, JsonRejection>,
) -> ApiResult<Json<BillingOverview>> {
    let request = json_body(payload)?;
    match request.action {
        StatusAction::Suspend | StatusAction::Reinstate => auth_user.require_admin()?,
        StatusAction::Cancel => auth_user.authorize_creator(creator_id)?,
    }

    let billing = state
        .billing
        .creator_billing
        .change_status(creator_id, request.action)
        .await?;

    tracing::info!(
        creator_id = %creator_id,
        actor = %auth_user.user_id,
        action = request.action.as_str(),
        "Billing status change requested"
    );
    Ok(Json(
        state
            .billing
            .creator_billing
            .overview_of(billing, OffsetDateTime::now_utc()),
    ))
}

#[derive(Debug, Deserialize)]
pub struct CommissionRequest {
    pub commission_percentage: i32,
}

/// PUT /api/creator-billing/{creator_id}/commission
pub async fn set_commission(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
    payload: Result<Json<CommissionRequest>, JsonRejection>,
) -> ApiResult<Json<BillingOverview>> {
    auth_user.require_admin()?;
    let request = json_body(payload)?;

    let billing = state
        .billing
        .creator_billing
        .set_commission_percentage(creator_id, request.commission_percentage)
        .await?;
    Ok(Json(
        state
            .billing
            .creator_billing
            .overview_of(billing, OffsetDateTime::now_utc()),
    ))
}

#[derive(Debug, Deserialize)]
pub struct EarningRequest {
    pub gross_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct EarningResponse {
    pub billing: BillingOverview,
    pub split: RevenueSplit,
}

/// POST /api/creator-billing/{creator_id}/earnings
pub async fn record_earning(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
    payload: Result<Json<EarningRequest>, JsonRejection>,
) -> ApiResult<Json<EarningResponse>> {
    auth_user.require_admin()?;
    let request = json_body(payload)?;

    let (billing, split) = state
        .billing
        .creator_billing
        .record_earning(creator_id, request.gross_cents)
        .await?;
    Ok(Json(EarningResponse {
        billing: state
            .billing
            .creator_billing
            .overview_of(billing, OffsetDateTime::now_utc()),
        split,
    }))
}

/// POST /api/creator-billing/{creator_id}/referrals
pub async fn record_referral(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
) -> ApiResult<Json<BillingOverview>> {
    auth_user.require_admin()?;
    let billing = state
        .billing
        .creator_billing
        .record_referral(creator_id)
        .await?;
    Ok(Json(
        state
            .billing
            .creator_billing
            .overview_of(billing, OffsetDateTime::now_utc()),
    ))
}
