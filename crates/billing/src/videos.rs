//! Video asset lifecycle and its block consumption
//!
//! Blocks are consumed when a video is approved, not when it is uploaded.
//! Upload only runs the advisory `can_upload` check; the authoritative
//! capacity check is the store's conditional reservation at approval.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::blocks::{can_upload, compute_blocks_needed, BlockService};
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Processing,
    PendingApproval,
    Approved,
    Rejected,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Processing => "processing",
            VideoStatus::PendingApproval => "pending_approval",
            VideoStatus::Approved => "approved",
            VideoStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(VideoStatus::Processing),
            "pending_approval" => Ok(VideoStatus::PendingApproval),
            "approved" => Ok(VideoStatus::Approved),
            "rejected" => Ok(VideoStatus::Rejected),
            other => Err(BillingError::Database(format!(
                "unknown video status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoAsset {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub title: String,
    pub size_gb: f64,
    pub blocks_consumed: i64,
    pub status: VideoStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct VideoService {
    store: Arc<dyn BillingStore>,
    blocks: BlockService,
}

impl VideoService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self {
            blocks: BlockService::new(store.clone()),
            store,
        }
    }

    pub async fn get(&self, video_id: Uuid) -> BillingResult<VideoAsset> {
        self.store
            .get_video(video_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("video {}", video_id)))
    }

    pub async fn list(&self, creator_id: Uuid) -> BillingResult<Vec<VideoAsset>> {
        self.store.list_videos(creator_id).await
    }

    /// Record a new upload as `processing`.
    ///
    /// Refuses up front when the creator clearly lacks room, but holds no
    /// blocks; capacity may still run out before approval.
    pub async fn register_upload(
        &self,
        creator_id: Uuid,
        title: &str,
        size_gb: f64,
    ) -> BillingResult<VideoAsset> {
        let title = title.trim();
        if title.is_empty() {
            return Err(BillingError::InvalidInput("video title is required".into()));
        }
        let blocks_needed = compute_blocks_needed(size_gb)?;

        let now = OffsetDateTime::now_utc();
        let allotment = self.blocks.get(creator_id).await?;
        if !can_upload(&allotment, blocks_needed, now) {
            return Err(BillingError::InsufficientBlocks {
                requested: blocks_needed,
                available: allotment.available_blocks(now),
            });
        }

        let video = VideoAsset {
            id: Uuid::new_v4(),
            creator_id,
            title: title.to_string(),
            size_gb,
            blocks_consumed: blocks_needed,
            status: VideoStatus::Processing,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_video(&video).await?;

        tracing::info!(
            video_id = %video.id,
            creator_id = %creator_id,
            size_gb = size_gb,
            blocks = blocks_needed,
            "Video upload registered"
        );
        Ok(video)
    }

    pub async fn mark_processed(&self, video_id: Uuid) -> BillingResult<VideoAsset> {
        self.transition(video_id, VideoStatus::Processing, VideoStatus::PendingApproval)
            .await
    }

    /// Reserve the video's blocks and publish it
    pub async fn approve_video(&self, video_id: Uuid) -> BillingResult<VideoAsset> {
        let video = self.get(video_id).await?;
        if video.status != VideoStatus::PendingApproval {
            return Err(BillingError::InvalidTransition(format!(
                "video {} is {}, only pending_approval videos can be approved",
                video_id, video.status
            )));
        }

        self.blocks
            .reserve_blocks(video.creator_id, video.blocks_consumed)
            .await?;

        let flip = self
            .store
            .transition_video(video_id, VideoStatus::PendingApproval, VideoStatus::Approved)
            .await;
        let failure = match flip {
            Ok(true) => None,
            Ok(false) => Some(BillingError::InvalidTransition(format!(
                "video {} changed status during approval",
                video_id
            ))),
            Err(e) => Some(e),
        };
        if let Some(failure) = failure {
            // The video was not published; give the reservation back
            if let Err(release_err) = self
                .blocks
                .release_blocks(video.creator_id, video.blocks_consumed)
                .await
            {
                tracing::error!(
                    video_id = %video_id,
                    creator_id = %video.creator_id,
                    blocks = video.blocks_consumed,
                    error = %release_err,
                    "CRITICAL: Failed to release blocks after aborted approval"
                );
            }
            return Err(failure);
        }

        tracing::info!(
            video_id = %video_id,
            creator_id = %video.creator_id,
            blocks = video.blocks_consumed,
            "Video approved"
        );
        self.get(video_id).await
    }

    /// Unpublish a video. Blocks held by an approved video are released by
    /// the store together with the status change.
    pub async fn reject_video(&self, video_id: Uuid) -> BillingResult<VideoAsset> {
        let video = self.get(video_id).await?;
        match video.status {
            VideoStatus::PendingApproval | VideoStatus::Approved => {}
            VideoStatus::Processing | VideoStatus::Rejected => {
                return Err(BillingError::InvalidTransition(format!(
                    "video {} is {} and cannot be rejected",
                    video_id, video.status
                )))
            }
        }

        let previous = self.store.reject_video(video_id).await?.ok_or_else(|| {
            BillingError::InvalidTransition(format!(
                "video {} changed status during rejection",
                video_id
            ))
        })?;

        tracing::info!(
            video_id = %video_id,
            creator_id = %previous.creator_id,
            previous = %previous.status,
            released = previous.status == VideoStatus::Approved,
            "Video rejected"
        );
        self.get(video_id).await
    }

    pub async fn delete_video(&self, video_id: Uuid) -> BillingResult<VideoAsset> {
        let video = self
            .store
            .delete_video(video_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("video {}", video_id)))?;

        tracing::info!(
            video_id = %video_id,
            creator_id = %video.creator_id,
            released = video.status == VideoStatus::Approved,
            "Video deleted"
        );
        Ok(video)
    }

    async fn transition(
        &self,
        video_id: Uuid,
        from: VideoStatus,
        to: VideoStatus,
    ) -> BillingResult<VideoAsset> {
        let video = self.get(video_id).await?;
        if video.status != from
            || !self.store.transition_video(video_id, from, to).await?
        {
            return Err(BillingError::InvalidTransition(format!(
                "video {} is {}, expected {}",
                video_id, video.status, from
            )));
        }
        self.get(video_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    async fn setup(purchased: i64) -> (Arc<InMemoryStore>, VideoService, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let creator_id = Uuid::new_v4();
        BlockService::new(store.clone())
            .open_account(creator_id, 0, 0)
            .await
            .unwrap();
        store.seed_purchased_blocks(creator_id, purchased).await;
        (store.clone(), VideoService::new(store), creator_id)
    }

    async fn used(store: &InMemoryStore, creator_id: Uuid) -> i64 {
        store
            .get_creator_blocks(creator_id)
            .await
            .unwrap()
            .unwrap()
            .used_blocks
    }

    #[tokio::test]
    async fn test_upload_computes_blocks_and_holds_nothing() {
        let (store, service, creator_id) = setup(3).await;
        let video = service
            .register_upload(creator_id, "Trailer", 10.0)
            .await
            .unwrap();
        assert_eq!(video.blocks_consumed, 2);
        assert_eq!(video.status, VideoStatus::Processing);
        assert_eq!(used(&store, creator_id).await, 0);
    }

    #[tokio::test]
    async fn test_upload_refused_without_room() {
        let (_, service, creator_id) = setup(1).await;
        let err = service
            .register_upload(creator_id, "Feature", 20.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientBlocks {
                requested: 3,
                available: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_size() {
        let (_, service, creator_id) = setup(1).await;
        assert!(matches!(
            service.register_upload(creator_id, "Empty", 0.0).await,
            Err(BillingError::InvalidSize(_))
        ));
    }

    #[tokio::test]
    async fn test_full_lifecycle_consumes_and_releases() {
        let (store, service, creator_id) = setup(2).await;
        let video = service
            .register_upload(creator_id, "Episode 1", 7.3)
            .await
            .unwrap();

        // Approval is only possible once processed
        assert!(matches!(
            service.approve_video(video.id).await,
            Err(BillingError::InvalidTransition(_))
        ));

        service.mark_processed(video.id).await.unwrap();
        let approved = service.approve_video(video.id).await.unwrap();
        assert_eq!(approved.status, VideoStatus::Approved);
        assert_eq!(used(&store, creator_id).await, 1);

        let rejected = service.reject_video(video.id).await.unwrap();
        assert_eq!(rejected.status, VideoStatus::Rejected);
        assert_eq!(used(&store, creator_id).await, 0);
    }

    #[tokio::test]
    async fn test_approval_fails_when_capacity_ran_out() {
        let (store, service, creator_id) = setup(1).await;
        let first = service.register_upload(creator_id, "A", 5.0).await.unwrap();
        let second = service.register_upload(creator_id, "B", 5.0).await.unwrap();
        service.mark_processed(first.id).await.unwrap();
        service.mark_processed(second.id).await.unwrap();

        service.approve_video(first.id).await.unwrap();
        let err = service.approve_video(second.id).await.unwrap_err();
        assert!(matches!(err, BillingError::InsufficientBlocks { .. }));

        let second = service.get(second.id).await.unwrap();
        assert_eq!(second.status, VideoStatus::PendingApproval);
        assert_eq!(used(&store, creator_id).await, 1);
    }

    #[tokio::test]
    async fn test_failed_approval_flip_returns_reservation() {
        let (store, service, creator_id) = setup(2).await;
        let video = service.register_upload(creator_id, "Pilot", 7.0).await.unwrap();
        service.mark_processed(video.id).await.unwrap();

        store.fail_next_video_transitions(1);
        let err = service.approve_video(video.id).await.unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));
        assert_eq!(used(&store, creator_id).await, 0);
        assert_eq!(
            service.get(video.id).await.unwrap().status,
            VideoStatus::PendingApproval
        );

        // A second attempt goes through cleanly
        service.approve_video(video.id).await.unwrap();
        assert_eq!(used(&store, creator_id).await, 1);
    }

    #[tokio::test]
    async fn test_reject_pending_video_keeps_usage() {
        let (store, service, creator_id) = setup(2).await;
        let held = service.register_upload(creator_id, "Held", 7.0).await.unwrap();
        service.mark_processed(held.id).await.unwrap();
        service.approve_video(held.id).await.unwrap();

        let pending = service.register_upload(creator_id, "Pending", 7.0).await.unwrap();
        service.mark_processed(pending.id).await.unwrap();
        service.reject_video(pending.id).await.unwrap();
        assert_eq!(used(&store, creator_id).await, 1);

        assert!(matches!(
            service.reject_video(pending.id).await,
            Err(BillingError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_approved_video_releases_blocks() {
        let (store, service, creator_id) = setup(2).await;
        let video = service.register_upload(creator_id, "Clip", 8.0).await.unwrap();
        service.mark_processed(video.id).await.unwrap();
        service.approve_video(video.id).await.unwrap();
        assert_eq!(used(&store, creator_id).await, 2);

        let deleted = service.delete_video(video.id).await.unwrap();
        assert_eq!(deleted.id, video.id);
        assert_eq!(used(&store, creator_id).await, 0);
        assert!(matches!(
            service.get(video.id).await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_unapproved_video_keeps_usage() {
        let (store, service, creator_id) = setup(2).await;
        let video = service.register_upload(creator_id, "Draft", 1.0).await.unwrap();
        service.delete_video(video.id).await.unwrap();
        assert_eq!(used(&store, creator_id).await, 0);
    }
}
