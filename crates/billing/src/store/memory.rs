//! In-memory store for tests and local runs without Postgres
//!
//! All tables live behind one `RwLock`, so each conditional update is
//! evaluated and applied under the same write guard.

use std::collections::HashMap;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BillingStore, WebhookResult};
use crate::blocks::CreatorBlocks;
use crate::error::BillingResult;
use crate::grace::{BillingStatus, CreatorBilling};
use crate::purchase::{BlockPurchase, CreditOutcome, PurchaseStatus};
use crate::videos::{VideoAsset, VideoStatus};

#[derive(Default)]
struct Tables {
    billing: HashMap<Uuid, CreatorBilling>,
    blocks: HashMap<Uuid, CreatorBlocks>,
    purchases: HashMap<Uuid, BlockPurchase>,
    videos: HashMap<Uuid, VideoAsset>,
    webhook_events: HashMap<String, (WebhookResult, OffsetDateTime)>,
}

impl Tables {
    fn release_video_blocks(&mut self, video: &VideoAsset) {
        if video.status != VideoStatus::Approved {
            return;
        }
        if let Some(row) = self.blocks.get_mut(&video.creator_id) {
            row.used_blocks = (row.used_blocks - video.blocks_consumed).max(0);
            row.updated_at = OffsetDateTime::now_utc();
        }
    }
}

fn flagged_uncredited(p: &BlockPurchase) -> bool {
    p.reconciliation_required
        && p.credited_at.is_none()
        && matches!(p.status, PurchaseStatus::Pending | PurchaseStatus::Rejected)
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    #[cfg(test)]
    credit_failures: AtomicUsize,
    #[cfg(test)]
    transition_failures: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn take_injected_credit_failure(&self) -> bool {
        take_one(&self.credit_failures)
    }

    #[cfg(not(test))]
    fn take_injected_credit_failure(&self) -> bool {
        false
    }

    #[cfg(test)]
    fn take_injected_transition_failure(&self) -> bool {
        take_one(&self.transition_failures)
    }

    #[cfg(not(test))]
    fn take_injected_transition_failure(&self) -> bool {
        false
    }
}

#[cfg(test)]
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Hooks for arranging state the services would never produce on their own
#[cfg(test)]
impl InMemoryStore {
    /// Add purchased blocks directly, bypassing the purchase ledger
    pub async fn seed_purchased_blocks(&self, creator_id: Uuid, blocks: i64) {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.blocks.get_mut(&creator_id) {
            row.purchased_blocks += blocks;
            row.updated_at = OffsetDateTime::now_utc();
        }
    }

    /// Make the next `n` block credits fail with a database error
    pub fn fail_next_credits(&self, n: usize) {
        self.credit_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` video status changes fail with a database error
    pub fn fail_next_video_transitions(&self, n: usize) {
        self.transition_failures.store(n, Ordering::SeqCst);
    }

    /// Overwrite a billing record as-is, e.g. to backdate its grace period
    pub async fn put_creator_billing(&self, billing: CreatorBilling) {
        self.tables
            .write()
            .await
            .billing
            .insert(billing.creator_id, billing);
    }

    /// Overwrite a blocks row as-is
    pub async fn put_creator_blocks(&self, blocks: CreatorBlocks) {
        self.tables
            .write()
            .await
            .blocks
            .insert(blocks.creator_id, blocks);
    }

    /// Overwrite a purchase as-is
    pub async fn put_purchase(&self, purchase: BlockPurchase) {
        self.tables
            .write()
            .await
            .purchases
            .insert(purchase.id, purchase);
    }
}

fn sorted_newest_first(mut purchases: Vec<BlockPurchase>) -> Vec<BlockPurchase> {
    purchases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    purchases
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn insert_creator_billing(
        &self,
        billing: &CreatorBilling,
    ) -> BillingResult<CreatorBilling> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .billing
            .entry(billing.creator_id)
            .or_insert_with(|| billing.clone());
        Ok(stored.clone())
    }

    async fn get_creator_billing(&self, creator_id: Uuid) -> BillingResult<Option<CreatorBilling>> {
        Ok(self.tables.read().await.billing.get(&creator_id).cloned())
    }

    async fn list_creator_billing(&self) -> BillingResult<Vec<CreatorBilling>> {
        Ok(self.tables.read().await.billing.values().cloned().collect())
    }

    async fn update_billing_status(
        &self,
        creator_id: Uuid,
        from: BillingStatus,
        to: BillingStatus,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.billing.get_mut(&creator_id) {
            Some(row) if row.status == from => {
                row.status = to;
                row.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_commission_percentage(
        &self,
        creator_id: Uuid,
        percentage: i32,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.billing.get_mut(&creator_id) {
            Some(row) => {
                row.commission_percentage = percentage;
                row.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_earnings(
        &self,
        creator_id: Uuid,
        cents: i64,
    ) -> BillingResult<Option<CreatorBilling>> {
        let mut tables = self.tables.write().await;
        Ok(tables.billing.get_mut(&creator_id).map(|row| {
            row.total_earned_cents = row.total_earned_cents.saturating_add(cents);
            row.updated_at = OffsetDateTime::now_utc();
            row.clone()
        }))
    }

    async fn increment_referrals(&self, creator_id: Uuid) -> BillingResult<Option<CreatorBilling>> {
        let mut tables = self.tables.write().await;
        Ok(tables.billing.get_mut(&creator_id).map(|row| {
            row.subscribers_referred += 1;
            row.updated_at = OffsetDateTime::now_utc();
            row.clone()
        }))
    }

    async fn insert_creator_blocks(&self, blocks: &CreatorBlocks) -> BillingResult<CreatorBlocks> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .blocks
            .entry(blocks.creator_id)
            .or_insert_with(|| blocks.clone());
        Ok(stored.clone())
    }

    async fn get_creator_blocks(&self, creator_id: Uuid) -> BillingResult<Option<CreatorBlocks>> {
        Ok(self.tables.read().await.blocks.get(&creator_id).cloned())
    }

    async fn list_creator_blocks(&self) -> BillingResult<Vec<CreatorBlocks>> {
        Ok(self.tables.read().await.blocks.values().cloned().collect())
    }

    async fn reserve_blocks(
        &self,
        creator_id: Uuid,
        blocks: i64,
        now: OffsetDateTime,
    ) -> BillingResult<Option<CreatorBlocks>> {
        let mut tables = self.tables.write().await;
        let Some(row) = tables.blocks.get_mut(&creator_id) else {
            return Ok(None);
        };
        if row.used_blocks + blocks > row.total_blocks(now) {
            return Ok(None);
        }
        row.used_blocks += blocks;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn release_blocks(
        &self,
        creator_id: Uuid,
        blocks: i64,
    ) -> BillingResult<Option<CreatorBlocks>> {
        let mut tables = self.tables.write().await;
        Ok(tables.blocks.get_mut(&creator_id).map(|row| {
            row.used_blocks = (row.used_blocks - blocks).max(0);
            row.updated_at = OffsetDateTime::now_utc();
            row.clone()
        }))
    }

    async fn grant_free_blocks(
        &self,
        creator_id: Uuid,
        blocks: i64,
        expiry: Option<OffsetDateTime>,
    ) -> BillingResult<Option<CreatorBlocks>> {
        let mut tables = self.tables.write().await;
        Ok(tables.blocks.get_mut(&creator_id).map(|row| {
            row.free_blocks = blocks;
            row.free_block_active = blocks > 0;
            row.free_block_expiry = expiry;
            row.updated_at = OffsetDateTime::now_utc();
            row.clone()
        }))
    }

    async fn insert_purchase(&self, purchase: &BlockPurchase) -> BillingResult<()> {
        self.tables
            .write()
            .await
            .purchases
            .insert(purchase.id, purchase.clone());
        Ok(())
    }

    async fn get_purchase(&self, purchase_id: Uuid) -> BillingResult<Option<BlockPurchase>> {
        Ok(self.tables.read().await.purchases.get(&purchase_id).cloned())
    }

    async fn get_purchase_by_transaction(
        &self,
        transaction_id: &str,
    ) -> BillingResult<Option<BlockPurchase>> {
        Ok(self
            .tables
            .read()
            .await
            .purchases
            .values()
            .find(|p| p.transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }

    async fn list_purchases(&self, creator_id: Uuid) -> BillingResult<Vec<BlockPurchase>> {
        let tables = self.tables.read().await;
        Ok(sorted_newest_first(
            tables
                .purchases
                .values()
                .filter(|p| p.creator_id == creator_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_all_purchases(&self) -> BillingResult<Vec<BlockPurchase>> {
        let tables = self.tables.read().await;
        Ok(sorted_newest_first(
            tables.purchases.values().cloned().collect(),
        ))
    }

    async fn list_flagged_purchases(&self) -> BillingResult<Vec<BlockPurchase>> {
        let tables = self.tables.read().await;
        Ok(sorted_newest_first(
            tables
                .purchases
                .values()
                .filter(|p| p.reconciliation_required)
                .cloned()
                .collect(),
        ))
    }

    async fn list_stale_pending(
        &self,
        older_than: OffsetDateTime,
    ) -> BillingResult<Vec<BlockPurchase>> {
        let tables = self.tables.read().await;
        Ok(tables
            .purchases
            .values()
            .filter(|p| {
                p.status == PurchaseStatus::Pending
                    && !p.reconciliation_required
                    && p.created_at < older_than
            })
            .cloned()
            .collect())
    }

    async fn attach_checkout(
        &self,
        purchase_id: Uuid,
        transaction_id: &str,
        checkout_url: &str,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.purchases.get_mut(&purchase_id) {
            Some(p) if p.status == PurchaseStatus::Pending => {
                p.transaction_id = Some(transaction_id.to_string());
                p.checkout_url = Some(checkout_url.to_string());
                p.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn approve_purchase(&self, purchase_id: Uuid) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.purchases.get_mut(&purchase_id) {
            Some(p) if p.status == PurchaseStatus::Pending => {
                p.status = PurchaseStatus::Approved;
                p.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn credit_purchase(
        &self,
        purchase_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<CreditOutcome> {
        if self.take_injected_credit_failure() {
            return Err(crate::error::BillingError::Database(
                "injected credit failure".into(),
            ));
        }

        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        let Some(purchase) = tables.purchases.get_mut(&purchase_id) else {
            return Ok(CreditOutcome::NotApproved);
        };
        if purchase.status != PurchaseStatus::Approved {
            return Ok(CreditOutcome::NotApproved);
        }
        if purchase.credited_at.is_some() {
            return Ok(CreditOutcome::AlreadyCredited);
        }
        let Some(blocks) = tables.blocks.get_mut(&purchase.creator_id) else {
            return Err(crate::error::BillingError::NotFound(format!(
                "blocks for creator {}",
                purchase.creator_id
            )));
        };

        blocks.purchased_blocks += purchase.blocks_requested;
        blocks.updated_at = now;
        purchase.credited_at = Some(now);
        purchase.reconciliation_required = false;
        purchase.updated_at = now;
        Ok(CreditOutcome::Credited(blocks.clone()))
    }

    async fn flag_reconciliation(&self, purchase_id: Uuid, reason: &str) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.purchases.get_mut(&purchase_id) {
            Some(p) => {
                p.reconciliation_required = true;
                p.failure_reason = Some(reason.to_string());
                p.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reject_purchase(&self, purchase_id: Uuid, reason: &str) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.purchases.get_mut(&purchase_id) {
            Some(p) if p.status == PurchaseStatus::Pending => {
                p.status = PurchaseStatus::Rejected;
                p.failure_reason = Some(reason.to_string());
                p.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn approve_flagged_purchase(
        &self,
        purchase_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.purchases.get_mut(&purchase_id) {
            Some(p) if flagged_uncredited(p) => {
                p.status = PurchaseStatus::Approved;
                p.reconciliation_resolved_at = Some(now);
                p.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn dismiss_flagged_purchase(
        &self,
        purchase_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.purchases.get_mut(&purchase_id) {
            Some(p) if flagged_uncredited(p) => {
                p.status = PurchaseStatus::Rejected;
                p.reconciliation_required = false;
                p.failure_reason = Some(reason.to_string());
                p.reconciliation_resolved_at = Some(now);
                p.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_video(&self, video: &VideoAsset) -> BillingResult<()> {
        self.tables
            .write()
            .await
            .videos
            .insert(video.id, video.clone());
        Ok(())
    }

    async fn get_video(&self, video_id: Uuid) -> BillingResult<Option<VideoAsset>> {
        Ok(self.tables.read().await.videos.get(&video_id).cloned())
    }

    async fn list_videos(&self, creator_id: Uuid) -> BillingResult<Vec<VideoAsset>> {
        let tables = self.tables.read().await;
        let mut videos: Vec<VideoAsset> = tables
            .videos
            .values()
            .filter(|v| v.creator_id == creator_id)
            .cloned()
            .collect();
        videos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(videos)
    }

    async fn transition_video(
        &self,
        video_id: Uuid,
        from: VideoStatus,
        to: VideoStatus,
    ) -> BillingResult<bool> {
        if self.take_injected_transition_failure() {
            return Err(crate::error::BillingError::Database(
                "injected transition failure".into(),
            ));
        }
        let mut tables = self.tables.write().await;
        match tables.videos.get_mut(&video_id) {
            Some(v) if v.status == from => {
                v.status = to;
                v.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reject_video(&self, video_id: Uuid) -> BillingResult<Option<VideoAsset>> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let Some(video) = tables.videos.get_mut(&video_id) else {
            return Ok(None);
        };
        if !matches!(
            video.status,
            VideoStatus::PendingApproval | VideoStatus::Approved
        ) {
            return Ok(None);
        }

        let previous = video.clone();
        video.status = VideoStatus::Rejected;
        video.updated_at = OffsetDateTime::now_utc();
        tables.release_video_blocks(&previous);
        Ok(Some(previous))
    }

    async fn delete_video(&self, video_id: Uuid) -> BillingResult<Option<VideoAsset>> {
        let mut tables = self.tables.write().await;
        let removed = tables.videos.remove(&video_id);
        if let Some(video) = &removed {
            tables.release_video_blocks(video);
        }
        Ok(removed)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        _provider: &str,
        _event_type: &str,
        stale_before: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        let now = OffsetDateTime::now_utc();
        match tables.webhook_events.get_mut(event_id) {
            None => {
                tables
                    .webhook_events
                    .insert(event_id.to_string(), (WebhookResult::Processing, now));
                Ok(true)
            }
            Some((result, started_at)) => {
                let reclaim = match result {
                    WebhookResult::Error => true,
                    WebhookResult::Processing => *started_at < stale_before,
                    WebhookResult::Success => false,
                };
                if reclaim {
                    *result = WebhookResult::Processing;
                    *started_at = now;
                }
                Ok(reclaim)
            }
        }
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: WebhookResult,
        _error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.webhook_events.get_mut(event_id) {
            entry.0 = result;
        }
        Ok(())
    }

    async fn webhook_event_result(&self, event_id: &str) -> BillingResult<Option<WebhookResult>> {
        Ok(self
            .tables
            .read()
            .await
            .webhook_events
            .get(event_id)
            .map(|(result, _)| *result))
    }
}
