//! Storage block accounting
//!
//! A block is the billing unit of storage: 7.3 GB sold at a flat price.
//! Creators hold free (promotional, time-bounded) and purchased blocks;
//! approved videos consume blocks. Free-block expiry is evaluated on every
//! read, never by a scheduled job.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Size of one storage block in GB
pub const BLOCK_SIZE_GB: f64 = 7.3;

/// Number of blocks a video of `size_gb` consumes.
///
/// Partial blocks are billed as whole blocks, so this always rounds up and
/// never returns 0 for a positive size.
pub fn compute_blocks_needed(size_gb: f64) -> BillingResult<i64> {
    if !size_gb.is_finite() || size_gb <= 0.0 {
        return Err(BillingError::InvalidSize(size_gb));
    }

    let blocks = (size_gb / BLOCK_SIZE_GB).ceil();
    if blocks > i64::MAX as f64 {
        return Err(BillingError::InvalidSize(size_gb));
    }
    Ok((blocks as i64).max(1))
}

/// Whether `blocks_needed` more blocks fit in the creator's current allotment
pub fn can_upload(blocks: &CreatorBlocks, blocks_needed: i64, now: OffsetDateTime) -> bool {
    blocks_needed <= blocks.available_blocks(now)
}

/// Per-creator block allotment as stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatorBlocks {
    pub creator_id: Uuid,
    pub free_blocks: i64,
    pub purchased_blocks: i64,
    pub used_blocks: i64,
    pub free_block_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub free_block_expiry: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl CreatorBlocks {
    /// Empty allotment with an optional promotional grant
    pub fn new(
        creator_id: Uuid,
        free_blocks: i64,
        free_block_expiry: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            creator_id,
            free_blocks,
            purchased_blocks: 0,
            used_blocks: 0,
            free_block_active: free_blocks > 0,
            free_block_expiry,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn free_blocks_valid(&self, now: OffsetDateTime) -> bool {
        self.free_block_active && self.free_block_expiry.map_or(true, |expiry| now <= expiry)
    }

    /// Free blocks that still count toward the total
    pub fn effective_free_blocks(&self, now: OffsetDateTime) -> i64 {
        if self.free_blocks_valid(now) {
            self.free_blocks
        } else {
            0
        }
    }

    pub fn total_blocks(&self, now: OffsetDateTime) -> i64 {
        self.effective_free_blocks(now) + self.purchased_blocks
    }

    /// Blocks left for new uploads, never negative
    pub fn available_blocks(&self, now: OffsetDateTime) -> i64 {
        (self.total_blocks(now) - self.used_blocks).max(0)
    }

    /// True when a free grant lapsed under already-approved content
    pub fn is_over_quota(&self, now: OffsetDateTime) -> bool {
        self.used_blocks > self.total_blocks(now)
    }

    pub fn total_storage_gb(&self, now: OffsetDateTime) -> f64 {
        self.total_blocks(now) as f64 * BLOCK_SIZE_GB
    }

    pub fn used_storage_gb(&self) -> f64 {
        self.used_blocks as f64 * BLOCK_SIZE_GB
    }

    pub fn summary(&self, now: OffsetDateTime) -> BlockSummary {
        BlockSummary {
            creator_id: self.creator_id,
            total_blocks: self.total_blocks(now),
            free_blocks: self.effective_free_blocks(now),
            purchased_blocks: self.purchased_blocks,
            used_blocks: self.used_blocks,
            available_blocks: self.available_blocks(now),
            free_block_active: self.free_blocks_valid(now),
            free_block_expiry: self.free_block_expiry,
            total_storage_gb: round_gb(self.total_storage_gb(now)),
            used_storage_gb: round_gb(self.used_storage_gb()),
            available_storage_gb: round_gb(self.available_blocks(now) as f64 * BLOCK_SIZE_GB),
            over_quota: self.is_over_quota(now),
            block_size_gb: BLOCK_SIZE_GB,
        }
    }
}

fn round_gb(gb: f64) -> f64 {
    (gb * 100.0).round() / 100.0
}

/// Block/storage snapshot returned to creators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockSummary {
    pub creator_id: Uuid,
    pub total_blocks: i64,
    pub free_blocks: i64,
    pub purchased_blocks: i64,
    pub used_blocks: i64,
    pub available_blocks: i64,
    pub free_block_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub free_block_expiry: Option<OffsetDateTime>,
    pub total_storage_gb: f64,
    pub used_storage_gb: f64,
    pub available_storage_gb: f64,
    pub over_quota: bool,
    pub block_size_gb: f64,
}

/// Block accounting operations backed by the store's conditional updates
#[derive(Clone)]
pub struct BlockService {
    store: Arc<dyn BillingStore>,
}

impl BlockService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Create the creator's allotment with a promotional grant. Idempotent:
    /// an existing allotment is returned untouched.
    pub async fn open_account(
        &self,
        creator_id: Uuid,
        free_blocks: i64,
        free_block_days: i64,
    ) -> BillingResult<CreatorBlocks> {
        let now = OffsetDateTime::now_utc();
        let expiry = (free_blocks > 0).then(|| now + Duration::days(free_block_days));
        let blocks = CreatorBlocks::new(creator_id, free_blocks, expiry, now);
        self.store.insert_creator_blocks(&blocks).await
    }

    pub async fn get(&self, creator_id: Uuid) -> BillingResult<CreatorBlocks> {
        self.store
            .get_creator_blocks(creator_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("blocks for creator {}", creator_id)))
    }

    pub async fn summary(&self, creator_id: Uuid) -> BillingResult<BlockSummary> {
        let blocks = self.get(creator_id).await?;
        Ok(blocks.summary(OffsetDateTime::now_utc()))
    }

    /// Atomically consume `blocks_needed` blocks.
    ///
    /// The capacity check is evaluated by the store in the same statement
    /// that increments `used_blocks`; concurrent reservations can never
    /// overshoot the allotment.
    pub async fn reserve_blocks(
        &self,
        creator_id: Uuid,
        blocks_needed: i64,
    ) -> BillingResult<CreatorBlocks> {
        if blocks_needed < 1 {
            return Err(BillingError::InvalidInput(format!(
                "blocks to reserve must be at least 1, got {}",
                blocks_needed
            )));
        }

        let now = OffsetDateTime::now_utc();
        match self
            .store
            .reserve_blocks(creator_id, blocks_needed, now)
            .await?
        {
            Some(blocks) => {
                tracing::info!(
                    creator_id = %creator_id,
                    reserved = blocks_needed,
                    used_blocks = blocks.used_blocks,
                    available_blocks = blocks.available_blocks(now),
                    "Reserved storage blocks"
                );
                Ok(blocks)
            }
            None => {
                let current = self.get(creator_id).await?;
                let available = current.available_blocks(now);
                tracing::info!(
                    creator_id = %creator_id,
                    requested = blocks_needed,
                    available = available,
                    "Block reservation refused"
                );
                Err(BillingError::InsufficientBlocks {
                    requested: blocks_needed,
                    available,
                })
            }
        }
    }

    /// Give back blocks from a rejected or deleted video, floored at zero
    pub async fn release_blocks(
        &self,
        creator_id: Uuid,
        blocks_to_release: i64,
    ) -> BillingResult<CreatorBlocks> {
        if blocks_to_release < 1 {
            return Err(BillingError::InvalidInput(format!(
                "blocks to release must be at least 1, got {}",
                blocks_to_release
            )));
        }

        let blocks = self
            .store
            .release_blocks(creator_id, blocks_to_release)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("blocks for creator {}", creator_id)))?;

        tracing::info!(
            creator_id = %creator_id,
            released = blocks_to_release,
            used_blocks = blocks.used_blocks,
            "Released storage blocks"
        );
        Ok(blocks)
    }

    /// Replace the promotional grant with `blocks` valid for `valid_for_days`
    pub async fn grant_free_blocks(
        &self,
        creator_id: Uuid,
        blocks: i64,
        valid_for_days: i64,
    ) -> BillingResult<CreatorBlocks> {
        if blocks < 0 || valid_for_days < 1 {
            return Err(BillingError::InvalidInput(
                "free block grant needs blocks >= 0 and at least one day".into(),
            ));
        }

        let expiry = OffsetDateTime::now_utc() + Duration::days(valid_for_days);
        let updated = self
            .store
            .grant_free_blocks(creator_id, blocks, Some(expiry))
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("blocks for creator {}", creator_id)))?;

        tracing::info!(
            creator_id = %creator_id,
            free_blocks = blocks,
            expires_at = %expiry,
            "Granted free blocks"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn blocks_with(free: i64, purchased: i64, used: i64) -> CreatorBlocks {
        let now = OffsetDateTime::now_utc();
        CreatorBlocks {
            creator_id: Uuid::new_v4(),
            free_blocks: free,
            purchased_blocks: purchased,
            used_blocks: used,
            free_block_active: free > 0,
            free_block_expiry: Some(now + Duration::days(30)),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_blocks_needed_rounds_up() {
        assert_eq!(compute_blocks_needed(7.3).unwrap(), 1);
        assert_eq!(compute_blocks_needed(7.31).unwrap(), 2);
        assert_eq!(compute_blocks_needed(0.001).unwrap(), 1);
        assert_eq!(compute_blocks_needed(14.6).unwrap(), 2);
        assert_eq!(compute_blocks_needed(21.9).unwrap(), 3);
    }

    #[test]
    fn test_blocks_needed_matches_ceil_for_many_sizes() {
        let mut size = 0.05;
        while size < 200.0 {
            let expected = (size / BLOCK_SIZE_GB).ceil() as i64;
            assert_eq!(compute_blocks_needed(size).unwrap(), expected, "size {}", size);
            assert!(expected >= 1);
            size += 0.37;
        }
    }

    #[test]
    fn test_blocks_needed_rejects_invalid_sizes() {
        assert!(matches!(compute_blocks_needed(0.0), Err(BillingError::InvalidSize(_))));
        assert!(matches!(compute_blocks_needed(-1.0), Err(BillingError::InvalidSize(_))));
        assert!(compute_blocks_needed(f64::NAN).is_err());
        assert!(compute_blocks_needed(f64::INFINITY).is_err());
    }

    #[test]
    fn test_can_upload_scenario() {
        let now = OffsetDateTime::now_utc();
        let blocks = blocks_with(0, 5, 3);
        assert!(!can_upload(&blocks, 3, now));
        assert!(can_upload(&blocks, 2, now));
    }

    #[test]
    fn test_expired_free_blocks_excluded() {
        let now = OffsetDateTime::now_utc();
        let mut blocks = blocks_with(2, 3, 0);
        assert_eq!(blocks.total_blocks(now), 5);

        blocks.free_block_expiry = Some(now - Duration::seconds(1));
        assert_eq!(blocks.total_blocks(now), 3);
        assert_eq!(blocks.effective_free_blocks(now), 0);
    }

    #[test]
    fn test_inactive_free_blocks_excluded() {
        let now = OffsetDateTime::now_utc();
        let mut blocks = blocks_with(2, 1, 0);
        blocks.free_block_active = false;
        assert_eq!(blocks.total_blocks(now), 1);
    }

    #[test]
    fn test_available_never_negative_after_expiry() {
        let now = OffsetDateTime::now_utc();
        let mut blocks = blocks_with(2, 1, 3);
        blocks.free_block_expiry = Some(now - Duration::days(1));
        assert_eq!(blocks.available_blocks(now), 0);
        assert!(blocks.is_over_quota(now));
        assert!(!can_upload(&blocks, 1, now));
    }

    #[test]
    fn test_summary_storage_figures() {
        let now = OffsetDateTime::now_utc();
        let summary = blocks_with(1, 2, 1).summary(now);
        assert_eq!(summary.total_blocks, 3);
        assert_eq!(summary.available_blocks, 2);
        assert_eq!(summary.total_storage_gb, 21.9);
        assert_eq!(summary.used_storage_gb, 7.3);
        assert_eq!(summary.available_storage_gb, 14.6);
        assert!(!summary.over_quota);
    }

    #[tokio::test]
    async fn test_reserve_scenario_fills_exactly() {
        let store = Arc::new(InMemoryStore::new());
        let service = BlockService::new(store.clone());
        let creator_id = Uuid::new_v4();
        service.open_account(creator_id, 0, 0).await.unwrap();
        store.seed_purchased_blocks(creator_id, 5).await;

        service.reserve_blocks(creator_id, 3).await.unwrap();
        let err = service.reserve_blocks(creator_id, 3).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientBlocks {
                requested: 3,
                available: 2
            }
        ));

        let blocks = service.reserve_blocks(creator_id, 2).await.unwrap();
        let now = OffsetDateTime::now_utc();
        assert_eq!(blocks.used_blocks, 5);
        assert_eq!(blocks.available_blocks(now), 0);
    }

    #[tokio::test]
    async fn test_release_restores_availability_and_floors() {
        let store = Arc::new(InMemoryStore::new());
        let service = BlockService::new(store.clone());
        let creator_id = Uuid::new_v4();
        service.open_account(creator_id, 0, 0).await.unwrap();
        store.seed_purchased_blocks(creator_id, 4).await;

        service.reserve_blocks(creator_id, 3).await.unwrap();
        let after = service.release_blocks(creator_id, 2).await.unwrap();
        assert_eq!(after.used_blocks, 1);
        assert_eq!(after.available_blocks(OffsetDateTime::now_utc()), 3);

        let floored = service.release_blocks(creator_id, 10).await.unwrap();
        assert_eq!(floored.used_blocks, 0);
    }

    #[tokio::test]
    async fn test_reserve_rejects_non_positive() {
        let service = BlockService::new(Arc::new(InMemoryStore::new()));
        let err = service.reserve_blocks(Uuid::new_v4(), 0).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_reserve_unknown_creator_is_not_found() {
        let service = BlockService::new(Arc::new(InMemoryStore::new()));
        let err = service.reserve_blocks(Uuid::new_v4(), 1).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_open_account_is_idempotent() {
        let service = BlockService::new(Arc::new(InMemoryStore::new()));
        let creator_id = Uuid::new_v4();
        let first = service.open_account(creator_id, 1, 90).await.unwrap();
        service.reserve_blocks(creator_id, 1).await.unwrap();

        let second = service.open_account(creator_id, 5, 90).await.unwrap();
        assert_eq!(second.free_blocks, first.free_blocks);
        assert_eq!(second.used_blocks, 1);
    }

    #[tokio::test]
    async fn test_grant_free_blocks_extends_capacity() {
        let service = BlockService::new(Arc::new(InMemoryStore::new()));
        let creator_id = Uuid::new_v4();
        service.open_account(creator_id, 0, 0).await.unwrap();
        assert!(service.reserve_blocks(creator_id, 1).await.is_err());

        service.grant_free_blocks(creator_id, 2, 30).await.unwrap();
        let summary = service.summary(creator_id).await.unwrap();
        assert_eq!(summary.total_blocks, 2);
        assert!(summary.free_block_active);
        service.reserve_blocks(creator_id, 2).await.unwrap();
    }
}
