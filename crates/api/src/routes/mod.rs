//! HTTP routes

pub mod admin;
pub mod blocks;
pub mod creator_billing;
pub mod videos;
pub mod webhooks;


use axum::{
    extract::rejection::JsonRejection,
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::require_auth,
    error::{ApiError, ApiResult},
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/creator-blocks/pricing/{blocks}", get(blocks::quote))
        .route("/api/webhooks/payments", post(webhooks::payment_webhook));

    let protected = Router::new()
        // Enrollment
        .route(
            "/api/creators/{creator_id}/enroll",
            post(creator_billing::enroll),
        )
        .route("/api/creators/{creator_id}/videos", get(videos::list_videos))
        // Creator billing
        .route(
            "/api/creator-billing/{creator_id}",
            get(creator_billing::get_billing),
        )
        .route(
            "/api/creator-billing/{creator_id}/status",
            post(creator_billing::change_status),
        )
        .route(
            "/api/creator-billing/{creator_id}/commission",
            put(creator_billing::set_commission),
        )
        .route(
            "/api/creator-billing/{creator_id}/earnings",
            post(creator_billing::record_earning),
        )
        .route(
            "/api/creator-billing/{creator_id}/referrals",
            post(creator_billing::record_referral),
        )
        // Blocks and purchases
        .route("/api/creator-blocks/{creator_id}", get(blocks::get_blocks))
        .route(
            "/api/creator-blocks/{creator_id}/purchase",
            post(blocks::initiate_purchase),
        )
        .route(
            "/api/creator-blocks/{creator_id}/purchases",
            get(blocks::list_purchases),
        )
        .route(
            "/api/creator-blocks/{creator_id}/free-blocks",
            post(blocks::grant_free_blocks),
        )
        // Videos
        .route("/api/videos", post(videos::register_upload))
        .route(
            "/api/videos/{video_id}",
            get(videos::get_video).delete(videos::delete_video),
        )
        .route(
            "/api/videos/{video_id}/processed",
            post(videos::mark_processed),
        )
        .route("/api/videos/{video_id}/approve", post(videos::approve_video))
        .route("/api/videos/{video_id}/reject", post(videos::reject_video))
        // Admin
        .route(
            "/api/admin/purchases/flagged",
            get(admin::list_flagged_purchases),
        )
        .route(
            "/api/admin/purchases/{purchase_id}",
            get(admin::get_purchase),
        )
        .route(
            "/api/admin/purchases/{purchase_id}/reconcile",
            post(admin::reconcile_purchase),
        )
        .route(
            "/api/admin/purchases/{purchase_id}/dismiss",
            post(admin::dismiss_purchase),
        )
        .route("/api/admin/invariants", get(admin::run_invariants))
        .route(
            "/api/admin/invariants/{check}",
            get(admin::run_invariant_check),
        )
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_auth,
        ));

    public.merge(protected).with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Unwrap a JSON body, reporting malformed input in the API error shape
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}
