//! Persistence seam for billing state
//!
//! Every method that changes counters or statuses is a single conditional
//! update: the guard (capacity, expected status, `credited_at IS NULL`) is
//! evaluated together with the write. Callers never read-then-write.

mod memory;
mod postgres;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::blocks::CreatorBlocks;
use crate::error::BillingResult;
use crate::grace::{BillingStatus, CreatorBilling};
use crate::purchase::{BlockPurchase, CreditOutcome};
use crate::videos::{VideoAsset, VideoStatus};

pub use self::memory::InMemoryStore;
pub use self::postgres::PgBillingStore;

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Creator billing

    /// Insert unless a record exists; returns whichever record is stored
    async fn insert_creator_billing(&self, billing: &CreatorBilling)
        -> BillingResult<CreatorBilling>;

    async fn get_creator_billing(&self, creator_id: Uuid) -> BillingResult<Option<CreatorBilling>>;

    async fn list_creator_billing(&self) -> BillingResult<Vec<CreatorBilling>>;

    /// Compare-and-set on status; false when the stored status is not `from`
    async fn update_billing_status(
        &self,
        creator_id: Uuid,
        from: BillingStatus,
        to: BillingStatus,
    ) -> BillingResult<bool>;

    async fn set_commission_percentage(&self, creator_id: Uuid, percentage: i32)
        -> BillingResult<bool>;

    async fn add_earnings(&self, creator_id: Uuid, cents: i64)
        -> BillingResult<Option<CreatorBilling>>;

    async fn increment_referrals(&self, creator_id: Uuid) -> BillingResult<Option<CreatorBilling>>;

    // Blocks

    /// Insert unless a row exists; returns whichever row is stored
    async fn insert_creator_blocks(&self, blocks: &CreatorBlocks) -> BillingResult<CreatorBlocks>;

    async fn get_creator_blocks(&self, creator_id: Uuid) -> BillingResult<Option<CreatorBlocks>>;

    async fn list_creator_blocks(&self) -> BillingResult<Vec<CreatorBlocks>>;

    /// Increment `used_blocks` only if the result fits the total at `now`.
    /// `None` when the creator is unknown or capacity is insufficient.
    async fn reserve_blocks(
        &self,
        creator_id: Uuid,
        blocks: i64,
        now: OffsetDateTime,
    ) -> BillingResult<Option<CreatorBlocks>>;

    /// Decrement `used_blocks`, floored at zero
    async fn release_blocks(&self, creator_id: Uuid, blocks: i64)
        -> BillingResult<Option<CreatorBlocks>>;

    async fn grant_free_blocks(
        &self,
        creator_id: Uuid,
        blocks: i64,
        expiry: Option<OffsetDateTime>,
    ) -> BillingResult<Option<CreatorBlocks>>;

    // Purchases

    async fn insert_purchase(&self, purchase: &BlockPurchase) -> BillingResult<()>;

    async fn get_purchase(&self, purchase_id: Uuid) -> BillingResult<Option<BlockPurchase>>;

    async fn get_purchase_by_transaction(&self, transaction_id: &str)
        -> BillingResult<Option<BlockPurchase>>;

    /// Newest first
    async fn list_purchases(&self, creator_id: Uuid) -> BillingResult<Vec<BlockPurchase>>;

    async fn list_all_purchases(&self) -> BillingResult<Vec<BlockPurchase>>;

    async fn list_flagged_purchases(&self) -> BillingResult<Vec<BlockPurchase>>;

    /// Unflagged pending purchases created before `older_than`
    async fn list_stale_pending(&self, older_than: OffsetDateTime)
        -> BillingResult<Vec<BlockPurchase>>;

    /// Set transaction id and checkout url on a pending purchase
    async fn attach_checkout(
        &self,
        purchase_id: Uuid,
        transaction_id: &str,
        checkout_url: &str,
    ) -> BillingResult<bool>;

    /// `pending -> approved`; false if the purchase was not pending
    async fn approve_purchase(&self, purchase_id: Uuid) -> BillingResult<bool>;

    /// Atomically stamp `credited_at` and add the purchase's blocks to the
    /// creator's `purchased_blocks`. Clears any reconciliation flag.
    async fn credit_purchase(&self, purchase_id: Uuid, now: OffsetDateTime)
        -> BillingResult<CreditOutcome>;

    async fn flag_reconciliation(&self, purchase_id: Uuid, reason: &str) -> BillingResult<bool>;

    /// `pending -> rejected`; false if the purchase was not pending
    async fn reject_purchase(&self, purchase_id: Uuid, reason: &str) -> BillingResult<bool>;

    /// `pending | rejected -> approved` for a flagged, uncredited purchase,
    /// stamping `reconciliation_resolved_at`. The flag itself is cleared by
    /// the credit.
    async fn approve_flagged_purchase(&self, purchase_id: Uuid, now: OffsetDateTime)
        -> BillingResult<bool>;

    /// `pending | rejected -> rejected` for a flagged, uncredited purchase,
    /// clearing the flag and stamping `reconciliation_resolved_at`
    async fn dismiss_flagged_purchase(
        &self,
        purchase_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    // Videos

    async fn insert_video(&self, video: &VideoAsset) -> BillingResult<()>;

    async fn get_video(&self, video_id: Uuid) -> BillingResult<Option<VideoAsset>>;

    async fn list_videos(&self, creator_id: Uuid) -> BillingResult<Vec<VideoAsset>>;

    /// Compare-and-set on status
    async fn transition_video(
        &self,
        video_id: Uuid,
        from: VideoStatus,
        to: VideoStatus,
    ) -> BillingResult<bool>;

    /// `pending_approval | approved -> rejected`. An approved video's blocks
    /// are released in the same write. Returns the asset as it was, or
    /// `None` when it is missing or in another status.
    async fn reject_video(&self, video_id: Uuid) -> BillingResult<Option<VideoAsset>>;

    /// Remove and return the asset as it was. An approved video's blocks
    /// are released in the same write.
    async fn delete_video(&self, video_id: Uuid) -> BillingResult<Option<VideoAsset>>;

    // Webhook deliveries

    /// Claim exclusive processing of a gateway event. Succeeds for a new
    /// event, an event whose last attempt errored, or one stuck in
    /// `processing` since before `stale_before`.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        provider: &str,
        event_type: &str,
        stale_before: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: WebhookResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn webhook_event_result(&self, event_id: &str) -> BillingResult<Option<WebhookResult>>;
}

/// Processing state of a claimed webhook delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookResult {
    Processing,
    Success,
    Error,
}

impl WebhookResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookResult::Processing => "processing",
            WebhookResult::Success => "success",
            WebhookResult::Error => "error",
        }
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw {
            "processing" => Some(WebhookResult::Processing),
            "success" => Some(WebhookResult::Success),
            "error" => Some(WebhookResult::Error),
            _ => None,
        }
    }
}
