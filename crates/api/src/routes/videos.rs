//! Video lifecycle routes
//!
//! Uploads are registered by their creator. Processing and moderation
//! (approve/reject) are admin operations; approval is what reserves blocks.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Extension, Json,
};
use reelhub_billing::VideoAsset;
use serde::Deserialize;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, routes::json_body, state::AppState};

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub creator_id: Uuid,
    pub title: String,
    pub size_gb: f64,
}

/// POST /api/videos
pub async fn register_upload(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    payload: Result<Json<UploadRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<VideoAsset>)> {
    let request = json_body(payload)?;
    auth_user.authorize_creator(request.creator_id)?;

    let video = state
        .billing
        .videos
        .register_upload(request.creator_id, &request.title, request.size_gb)
        .await?;
    Ok((StatusCode::CREATED, Json(video)))
}

/// GET /api/creators/{creator_id}/videos
pub async fn list_videos(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
) -> ApiResult<Json<Vec<VideoAsset>>> {
    auth_user.authorize_creator(creator_id)?;
    Ok(Json(state.billing.videos.list(creator_id).await?))
}

/// GET /api/videos/{video_id}
pub async fn get_video(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(video_id): Path<Uuid>,
) -> ApiResult<Json<VideoAsset>> {
    let video = state.billing.videos.get(video_id).await?;
    auth_user.authorize_creator(video.creator_id)?;
    Ok(Json(video))
}

/// POST /api/videos/{video_id}/processed
pub async fn mark_processed(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(video_id): Path<Uuid>,
) -> ApiResult<Json<VideoAsset>> {
    auth_user.require_admin()?;
    Ok(Json(state.billing.videos.mark_processed(video_id).await?))
}

/// POST /api/videos/{video_id}/approve
pub async fn approve_video(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(video_id): Path<Uuid>,
) -> ApiResult<Json<VideoAsset>> {
    auth_user.require_admin()?;
    Ok(Json(state.billing.videos.approve_video(video_id).await?))
}

/// POST /api/videos/{video_id}/reject
pub async fn reject_video(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(video_id): Path<Uuid>,
) -> ApiResult<Json<VideoAsset>> {
    auth_user.require_admin()?;
    Ok(Json(state.billing.videos.reject_video(video_id).await?))
}

/// DELETE /api/videos/{video_id}
pub async fn delete_video(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(video_id): Path<Uuid>,
) -> ApiResult<Json<VideoAsset>> {
    let video = state.billing.videos.get(video_id).await?;
    auth_user.authorize_creator(video.creator_id)?;
    Ok(Json(state.billing.videos.delete_video(video_id).await?))
}
