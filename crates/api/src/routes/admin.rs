//! Operator routes: purchase reconciliation and invariant checks

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Extension, Json,
};
use reelhub_billing::{
    BlockPurchase, ConfirmOutcome, InvariantCheckSummary, InvariantChecker, InvariantViolation,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::json_body,
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    /// "credited", "already_credited" or "dismissed"
    pub result: &'static str,
    pub purchase: BlockPurchase,
}

/// GET /api/admin/purchases/flagged
pub async fn list_flagged_purchases(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<BlockPurchase>>> {
    auth_user.require_admin()?;
    Ok(Json(state.billing.purchases.list_flagged().await?))
}

/// GET /api/admin/purchases/{purchase_id}
pub async fn get_purchase(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(purchase_id): Path<Uuid>,
) -> ApiResult<Json<BlockPurchase>> {
    auth_user.require_admin()?;
    Ok(Json(state.billing.purchases.get_purchase(purchase_id).await?))
}

/// POST /api/admin/purchases/{purchase_id}/reconcile
pub async fn reconcile_purchase(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(purchase_id): Path<Uuid>,
) -> ApiResult<Json<ReconcileResponse>> {
    auth_user.require_admin()?;

    let outcome = state
        .billing
        .purchases
        .retry_reconciliation(purchase_id)
        .await?;

    tracing::info!(
        purchase_id = %purchase_id,
        actor = %auth_user.user_id,
        "Admin reconciliation run"
    );

    let response = match outcome {
        ConfirmOutcome::Confirmed { purchase, .. } => ReconcileResponse {
            result: "credited",
            purchase,
        },
        ConfirmOutcome::AlreadyConfirmed { purchase } => ReconcileResponse {
            result: "already_credited",
            purchase,
        },
        ConfirmOutcome::Dismissed { purchase } => ReconcileResponse {
            result: "dismissed",
            purchase,
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct DismissRequest {
    pub reason: String,
}

/// POST /api/admin/purchases/{purchase_id}/dismiss
///
/// Close a flagged payment without crediting it, e.g. after a refund.
pub async fn dismiss_purchase(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(purchase_id): Path<Uuid>,
    body: Result<Json<DismissRequest>, JsonRejection>,
) -> ApiResult<Json<BlockPurchase>> {
    auth_user.require_admin()?;
    let request = json_body(body)?;

    let purchase = state
        .billing
        .purchases
        .dismiss_reconciliation(purchase_id, &request.reason)
        .await?;

    tracing::info!(
        purchase_id = %purchase_id,
        actor = %auth_user.user_id,
        "Admin dismissed flagged purchase"
    );
    Ok(Json(purchase))
}

/// GET /api/admin/invariants
pub async fn run_invariants(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    auth_user.require_admin()?;
    Ok(Json(state.billing.invariants.run_all_checks().await?))
}

/// GET /api/admin/invariants/{check}
pub async fn run_invariant_check(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(check): Path<String>,
) -> ApiResult<Json<Vec<InvariantViolation>>> {
    auth_user.require_admin()?;
    if !InvariantChecker::available_checks().contains(&check.as_str()) {
        return Err(ApiError::BadRequest(format!("unknown invariant check: {}", check)));
    }
    Ok(Json(state.billing.invariants.run_check(&check).await?))
}
