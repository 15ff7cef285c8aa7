//! Postgres store (sqlx)
//!
//! Status columns are TEXT with CHECK constraints; rows are read into
//! plain structs and parsed into domain enums.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BillingStore, WebhookResult};
use crate::blocks::CreatorBlocks;
use crate::error::{BillingError, BillingResult};
use crate::grace::{BillingStatus, CreatorBilling};
use crate::purchase::{BlockPurchase, CreditOutcome, PurchaseStatus};
use crate::videos::{VideoAsset, VideoStatus};

const BILLING_COLUMNS: &str = "creator_id, creator_email, start_date, grace_period_end, \
     monthly_fee_cents, status, commission_percentage, total_earned_cents, \
     subscribers_referred, referral_code, created_at, updated_at";

const BLOCKS_COLUMNS: &str = "creator_id, free_blocks, purchased_blocks, used_blocks, \
     free_block_active, free_block_expiry, created_at, updated_at";

const PURCHASE_COLUMNS: &str = "id, creator_id, blocks_requested, amount_cents, currency, \
     status, transaction_id, checkout_url, credited_at, reconciliation_required, \
     failure_reason, reconciliation_resolved_at, created_at, updated_at";

const VIDEO_COLUMNS: &str =
    "id, creator_id, title, size_gb, blocks_consumed, status, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct CreatorBillingRow {
    creator_id: Uuid,
    creator_email: String,
    start_date: OffsetDateTime,
    grace_period_end: OffsetDateTime,
    monthly_fee_cents: i64,
    status: String,
    commission_percentage: i32,
    total_earned_cents: i64,
    subscribers_referred: i64,
    referral_code: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CreatorBillingRow> for CreatorBilling {
    type Error = BillingError;

    fn try_from(row: CreatorBillingRow) -> Result<Self, Self::Error> {
        Ok(CreatorBilling {
            creator_id: row.creator_id,
            creator_email: row.creator_email,
            start_date: row.start_date,
            grace_period_end: row.grace_period_end,
            monthly_fee_cents: row.monthly_fee_cents,
            status: row.status.parse()?,
            commission_percentage: row.commission_percentage,
            total_earned_cents: row.total_earned_cents,
            subscribers_referred: row.subscribers_referred,
            referral_code: row.referral_code,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CreatorBlocksRow {
    creator_id: Uuid,
    free_blocks: i64,
    purchased_blocks: i64,
    used_blocks: i64,
    free_block_active: bool,
    free_block_expiry: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<CreatorBlocksRow> for CreatorBlocks {
    fn from(row: CreatorBlocksRow) -> Self {
        CreatorBlocks {
            creator_id: row.creator_id,
            free_blocks: row.free_blocks,
            purchased_blocks: row.purchased_blocks,
            used_blocks: row.used_blocks,
            free_block_active: row.free_block_active,
            free_block_expiry: row.free_block_expiry,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PurchaseRow {
    id: Uuid,
    creator_id: Uuid,
    blocks_requested: i64,
    amount_cents: i64,
    currency: String,
    status: String,
    transaction_id: Option<String>,
    checkout_url: Option<String>,
    credited_at: Option<OffsetDateTime>,
    reconciliation_required: bool,
    failure_reason: Option<String>,
    reconciliation_resolved_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PurchaseRow> for BlockPurchase {
    type Error = BillingError;

    fn try_from(row: PurchaseRow) -> Result<Self, Self::Error> {
        Ok(BlockPurchase {
            id: row.id,
            creator_id: row.creator_id,
            blocks_requested: row.blocks_requested,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: row.status.parse()?,
            transaction_id: row.transaction_id,
            checkout_url: row.checkout_url,
            credited_at: row.credited_at,
            reconciliation_required: row.reconciliation_required,
            failure_reason: row.failure_reason,
            reconciliation_resolved_at: row.reconciliation_resolved_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VideoRow {
    id: Uuid,
    creator_id: Uuid,
    title: String,
    size_gb: f64,
    blocks_consumed: i64,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<VideoRow> for VideoAsset {
    type Error = BillingError;

    fn try_from(row: VideoRow) -> Result<Self, Self::Error> {
        Ok(VideoAsset {
            id: row.id,
            creator_id: row.creator_id,
            title: row.title,
            size_gb: row.size_gb,
            blocks_consumed: row.blocks_consumed,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Give back an approved video's blocks inside the caller's transaction
async fn release_video_blocks(
    tx: &mut Transaction<'_, Postgres>,
    video: &VideoAsset,
) -> BillingResult<()> {
    if video.status != VideoStatus::Approved {
        return Ok(());
    }
    sqlx::query(
        "UPDATE creator_blocks SET used_blocks = GREATEST(used_blocks - $2, 0), \
         updated_at = NOW() WHERE creator_id = $1",
    )
    .bind(video.creator_id)
    .bind(video.blocks_consumed)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn billing_row(&self, creator_id: Uuid) -> BillingResult<Option<CreatorBilling>> {
        let row: Option<CreatorBillingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM creator_billing WHERE creator_id = $1",
            BILLING_COLUMNS
        ))
        .bind(creator_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CreatorBilling::try_from).transpose()
    }

    async fn blocks_row(&self, creator_id: Uuid) -> BillingResult<Option<CreatorBlocks>> {
        let row: Option<CreatorBlocksRow> = sqlx::query_as(&format!(
            "SELECT {} FROM creator_blocks WHERE creator_id = $1",
            BLOCKS_COLUMNS
        ))
        .bind(creator_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CreatorBlocks::from))
    }

    async fn purchases_where(&self, clause: &str) -> BillingResult<Vec<BlockPurchase>> {
        let rows: Vec<PurchaseRow> = sqlx::query_as(&format!(
            "SELECT {} FROM block_purchases {} ORDER BY created_at DESC",
            PURCHASE_COLUMNS, clause
        ))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn insert_creator_billing(
        &self,
        billing: &CreatorBilling,
    ) -> BillingResult<CreatorBilling> {
        sqlx::query(
            r#"
            INSERT INTO creator_billing
                (creator_id, creator_email, start_date, grace_period_end, monthly_fee_cents,
                 status, commission_percentage, total_earned_cents, subscribers_referred,
                 referral_code, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (creator_id) DO NOTHING
            "#,
        )
        .bind(billing.creator_id)
        .bind(&billing.creator_email)
        .bind(billing.start_date)
        .bind(billing.grace_period_end)
        .bind(billing.monthly_fee_cents)
        .bind(billing.status.as_str())
        .bind(billing.commission_percentage)
        .bind(billing.total_earned_cents)
        .bind(billing.subscribers_referred)
        .bind(&billing.referral_code)
        .bind(billing.created_at)
        .bind(billing.updated_at)
        .execute(&self.pool)
        .await?;

        self.billing_row(billing.creator_id).await?.ok_or_else(|| {
            BillingError::Database(format!(
                "billing row for creator {} missing after insert",
                billing.creator_id
            ))
        })
    }

    async fn get_creator_billing(&self, creator_id: Uuid) -> BillingResult<Option<CreatorBilling>> {
        self.billing_row(creator_id).await
    }

    async fn list_creator_billing(&self) -> BillingResult<Vec<CreatorBilling>> {
        let rows: Vec<CreatorBillingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM creator_billing ORDER BY created_at",
            BILLING_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn update_billing_status(
        &self,
        creator_id: Uuid,
        from: BillingStatus,
        to: BillingStatus,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE creator_billing SET status = $3, updated_at = NOW() \
             WHERE creator_id = $1 AND status = $2",
        )
        .bind(creator_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_commission_percentage(
        &self,
        creator_id: Uuid,
        percentage: i32,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE creator_billing SET commission_percentage = $2, updated_at = NOW() \
             WHERE creator_id = $1",
        )
        .bind(creator_id)
        .bind(percentage)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn add_earnings(
        &self,
        creator_id: Uuid,
        cents: i64,
    ) -> BillingResult<Option<CreatorBilling>> {
        let row: Option<CreatorBillingRow> = sqlx::query_as(&format!(
            "UPDATE creator_billing SET total_earned_cents = total_earned_cents + $2, \
             updated_at = NOW() WHERE creator_id = $1 RETURNING {}",
            BILLING_COLUMNS
        ))
        .bind(creator_id)
        .bind(cents)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CreatorBilling::try_from).transpose()
    }

    async fn increment_referrals(&self, creator_id: Uuid) -> BillingResult<Option<CreatorBilling>> {
        let row: Option<CreatorBillingRow> = sqlx::query_as(&format!(
            "UPDATE creator_billing SET subscribers_referred = subscribers_referred + 1, \
             updated_at = NOW() WHERE creator_id = $1 RETURNING {}",
            BILLING_COLUMNS
        ))
        .bind(creator_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CreatorBilling::try_from).transpose()
    }

    async fn insert_creator_blocks(&self, blocks: &CreatorBlocks) -> BillingResult<CreatorBlocks> {
        sqlx::query(
            r#"
            INSERT INTO creator_blocks
                (creator_id, free_blocks, purchased_blocks, used_blocks,
                 free_block_active, free_block_expiry, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (creator_id) DO NOTHING
            "#,
        )
        .bind(blocks.creator_id)
        .bind(blocks.free_blocks)
        .bind(blocks.purchased_blocks)
        .bind(blocks.used_blocks)
        .bind(blocks.free_block_active)
        .bind(blocks.free_block_expiry)
        .bind(blocks.created_at)
        .bind(blocks.updated_at)
        .execute(&self.pool)
        .await?;

        self.blocks_row(blocks.creator_id).await?.ok_or_else(|| {
            BillingError::Database(format!(
                "blocks row for creator {} missing after insert",
                blocks.creator_id
            ))
        })
    }

    async fn get_creator_blocks(&self, creator_id: Uuid) -> BillingResult<Option<CreatorBlocks>> {
        self.blocks_row(creator_id).await
    }

    async fn list_creator_blocks(&self) -> BillingResult<Vec<CreatorBlocks>> {
        let rows: Vec<CreatorBlocksRow> = sqlx::query_as(&format!(
            "SELECT {} FROM creator_blocks ORDER BY created_at",
            BLOCKS_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CreatorBlocks::from).collect())
    }

    async fn reserve_blocks(
        &self,
        creator_id: Uuid,
        blocks: i64,
        now: OffsetDateTime,
    ) -> BillingResult<Option<CreatorBlocks>> {
        // Capacity check and increment in one statement
        let row: Option<CreatorBlocksRow> = sqlx::query_as(&format!(
            r#"
            UPDATE creator_blocks
            SET used_blocks = used_blocks + $2, updated_at = $3
            WHERE creator_id = $1
              AND used_blocks + $2 <= purchased_blocks
                  + CASE
                      WHEN free_block_active
                           AND (free_block_expiry IS NULL OR free_block_expiry >= $3)
                      THEN free_blocks
                      ELSE 0
                    END
            RETURNING {}
            "#,
            BLOCKS_COLUMNS
        ))
        .bind(creator_id)
        .bind(blocks)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CreatorBlocks::from))
    }

    async fn release_blocks(
        &self,
        creator_id: Uuid,
        blocks: i64,
    ) -> BillingResult<Option<CreatorBlocks>> {
        let row: Option<CreatorBlocksRow> = sqlx::query_as(&format!(
            "UPDATE creator_blocks SET used_blocks = GREATEST(used_blocks - $2, 0), \
             updated_at = NOW() WHERE creator_id = $1 RETURNING {}",
            BLOCKS_COLUMNS
        ))
        .bind(creator_id)
        .bind(blocks)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CreatorBlocks::from))
    }

    async fn grant_free_blocks(
        &self,
        creator_id: Uuid,
        blocks: i64,
        expiry: Option<OffsetDateTime>,
    ) -> BillingResult<Option<CreatorBlocks>> {
        let row: Option<CreatorBlocksRow> = sqlx::query_as(&format!(
            "UPDATE creator_blocks SET free_blocks = $2, free_block_active = $2 > 0, \
             free_block_expiry = $3, updated_at = NOW() WHERE creator_id = $1 RETURNING {}",
            BLOCKS_COLUMNS
        ))
        .bind(creator_id)
        .bind(blocks)
        .bind(expiry)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CreatorBlocks::from))
    }

    async fn insert_purchase(&self, purchase: &BlockPurchase) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO block_purchases
                (id, creator_id, blocks_requested, amount_cents, currency, status,
                 transaction_id, checkout_url, credited_at, reconciliation_required,
                 failure_reason, reconciliation_resolved_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(purchase.id)
        .bind(purchase.creator_id)
        .bind(purchase.blocks_requested)
        .bind(purchase.amount_cents)
        .bind(&purchase.currency)
        .bind(purchase.status.as_str())
        .bind(&purchase.transaction_id)
        .bind(&purchase.checkout_url)
        .bind(purchase.credited_at)
        .bind(purchase.reconciliation_required)
        .bind(&purchase.failure_reason)
        .bind(purchase.reconciliation_resolved_at)
        .bind(purchase.created_at)
        .bind(purchase.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_purchase(&self, purchase_id: Uuid) -> BillingResult<Option<BlockPurchase>> {
        let row: Option<PurchaseRow> = sqlx::query_as(&format!(
            "SELECT {} FROM block_purchases WHERE id = $1",
            PURCHASE_COLUMNS
        ))
        .bind(purchase_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BlockPurchase::try_from).transpose()
    }

    async fn get_purchase_by_transaction(
        &self,
        transaction_id: &str,
    ) -> BillingResult<Option<BlockPurchase>> {
        let row: Option<PurchaseRow> = sqlx::query_as(&format!(
            "SELECT {} FROM block_purchases WHERE transaction_id = $1",
            PURCHASE_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BlockPurchase::try_from).transpose()
    }

    async fn list_purchases(&self, creator_id: Uuid) -> BillingResult<Vec<BlockPurchase>> {
        let rows: Vec<PurchaseRow> = sqlx::query_as(&format!(
            "SELECT {} FROM block_purchases WHERE creator_id = $1 ORDER BY created_at DESC",
            PURCHASE_COLUMNS
        ))
        .bind(creator_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_all_purchases(&self) -> BillingResult<Vec<BlockPurchase>> {
        self.purchases_where("").await
    }

    async fn list_flagged_purchases(&self) -> BillingResult<Vec<BlockPurchase>> {
        self.purchases_where("WHERE reconciliation_required").await
    }

    async fn list_stale_pending(
        &self,
        older_than: OffsetDateTime,
    ) -> BillingResult<Vec<BlockPurchase>> {
        let rows: Vec<PurchaseRow> = sqlx::query_as(&format!(
            "SELECT {} FROM block_purchases WHERE status = 'pending' \
             AND NOT reconciliation_required AND created_at < $1",
            PURCHASE_COLUMNS
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn attach_checkout(
        &self,
        purchase_id: Uuid,
        transaction_id: &str,
        checkout_url: &str,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE block_purchases SET transaction_id = $2, checkout_url = $3, \
             updated_at = NOW() WHERE id = $1 AND status = 'pending'",
        )
        .bind(purchase_id)
        .bind(transaction_id)
        .bind(checkout_url)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn approve_purchase(&self, purchase_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE block_purchases SET status = 'approved', updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(purchase_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn credit_purchase(
        &self,
        purchase_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<CreditOutcome> {
        let mut tx = self.pool.begin().await?;

        // Stamping credited_at is the exactly-once guard for the increment
        let claimed: Option<(Uuid, i64)> = sqlx::query_as(
            r#"
            UPDATE block_purchases
            SET credited_at = $2, reconciliation_required = FALSE, updated_at = $2
            WHERE id = $1 AND status = 'approved' AND credited_at IS NULL
            RETURNING creator_id, blocks_requested
            "#,
        )
        .bind(purchase_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((creator_id, blocks)) = claimed else {
            tx.rollback().await?;
            let status: Option<(String, Option<OffsetDateTime>)> = sqlx::query_as(
                "SELECT status, credited_at FROM block_purchases WHERE id = $1",
            )
            .bind(purchase_id)
            .fetch_optional(&self.pool)
            .await?;
            return Ok(match status {
                Some((status, Some(_))) if status == PurchaseStatus::Approved.as_str() => {
                    CreditOutcome::AlreadyCredited
                }
                _ => CreditOutcome::NotApproved,
            });
        };

        let row: Option<CreatorBlocksRow> = sqlx::query_as(&format!(
            "UPDATE creator_blocks SET purchased_blocks = purchased_blocks + $2, \
             updated_at = $3 WHERE creator_id = $1 RETURNING {}",
            BLOCKS_COLUMNS
        ))
        .bind(creator_id)
        .bind(blocks)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(BillingError::NotFound(format!(
                "blocks for creator {}",
                creator_id
            )));
        };

        tx.commit().await?;
        Ok(CreditOutcome::Credited(row.into()))
    }

    async fn flag_reconciliation(&self, purchase_id: Uuid, reason: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE block_purchases SET reconciliation_required = TRUE, failure_reason = $2, \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(purchase_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reject_purchase(&self, purchase_id: Uuid, reason: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE block_purchases SET status = 'rejected', failure_reason = $2, \
             updated_at = NOW() WHERE id = $1 AND status = 'pending'",
        )
        .bind(purchase_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn approve_flagged_purchase(
        &self,
        purchase_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE block_purchases
            SET status = 'approved', reconciliation_resolved_at = $2, updated_at = $2
            WHERE id = $1
              AND reconciliation_required
              AND credited_at IS NULL
              AND status IN ('pending', 'rejected')
            "#,
        )
        .bind(purchase_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn dismiss_flagged_purchase(
        &self,
        purchase_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE block_purchases
            SET status = 'rejected', reconciliation_required = FALSE, failure_reason = $2,
                reconciliation_resolved_at = $3, updated_at = $3
            WHERE id = $1
              AND reconciliation_required
              AND credited_at IS NULL
              AND status IN ('pending', 'rejected')
            "#,
        )
        .bind(purchase_id)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_video(&self, video: &VideoAsset) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO video_assets
                (id, creator_id, title, size_gb, blocks_consumed, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(video.id)
        .bind(video.creator_id)
        .bind(&video.title)
        .bind(video.size_gb)
        .bind(video.blocks_consumed)
        .bind(video.status.as_str())
        .bind(video.created_at)
        .bind(video.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_video(&self, video_id: Uuid) -> BillingResult<Option<VideoAsset>> {
        let row: Option<VideoRow> = sqlx::query_as(&format!(
            "SELECT {} FROM video_assets WHERE id = $1",
            VIDEO_COLUMNS
        ))
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(VideoAsset::try_from).transpose()
    }

    async fn list_videos(&self, creator_id: Uuid) -> BillingResult<Vec<VideoAsset>> {
        let rows: Vec<VideoRow> = sqlx::query_as(&format!(
            "SELECT {} FROM video_assets WHERE creator_id = $1 ORDER BY created_at DESC",
            VIDEO_COLUMNS
        ))
        .bind(creator_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn transition_video(
        &self,
        video_id: Uuid,
        from: VideoStatus,
        to: VideoStatus,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE video_assets SET status = $3, updated_at = NOW() \
             WHERE id = $1 AND status = $2",
        )
        .bind(video_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reject_video(&self, video_id: Uuid) -> BillingResult<Option<VideoAsset>> {
        let mut tx = self.pool.begin().await?;

        // Row lock so the status read here is the one the update replaces
        let row: Option<VideoRow> = sqlx::query_as(&format!(
            "SELECT {} FROM video_assets WHERE id = $1 \
             AND status IN ('pending_approval', 'approved') FOR UPDATE",
            VIDEO_COLUMNS
        ))
        .bind(video_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let previous = VideoAsset::try_from(row)?;

        sqlx::query(
            "UPDATE video_assets SET status = 'rejected', updated_at = NOW() WHERE id = $1",
        )
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        release_video_blocks(&mut tx, &previous).await?;

        tx.commit().await?;
        Ok(Some(previous))
    }

    async fn delete_video(&self, video_id: Uuid) -> BillingResult<Option<VideoAsset>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<VideoRow> = sqlx::query_as(&format!(
            "DELETE FROM video_assets WHERE id = $1 RETURNING {}",
            VIDEO_COLUMNS
        ))
        .bind(video_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let video = VideoAsset::try_from(row)?;
        release_video_blocks(&mut tx, &video).await?;

        tx.commit().await?;
        Ok(Some(video))
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        provider: &str,
        event_type: &str,
        stale_before: OffsetDateTime,
    ) -> BillingResult<bool> {
        // INSERT .. ON CONFLICT .. RETURNING hands the claim to exactly one caller
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO payment_webhook_events
                (event_id, provider, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE payment_webhook_events.processing_result = 'error'
               OR (payment_webhook_events.processing_result = 'processing'
                   AND payment_webhook_events.processing_started_at < $4)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(provider)
        .bind(event_type)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: WebhookResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE payment_webhook_events SET processing_result = $2, error_message = $3 \
             WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(result.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn webhook_event_result(&self, event_id: &str) -> BillingResult<Option<WebhookResult>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM payment_webhook_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(raw,)| WebhookResult::parse(&raw)))
    }
}

/// Run against a disposable database: `DATABASE_URL=postgres://... cargo test -- --ignored`
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::Duration;
    use tokio::sync::Barrier;

    use super::*;
    use crate::config::BillingConfig;

    async fn open_account(store: &PgBillingStore, purchased: i64) -> Uuid {
        let creator_id = Uuid::new_v4();
        store
            .insert_creator_blocks(&CreatorBlocks::new(
                creator_id,
                0,
                None,
                OffsetDateTime::now_utc(),
            ))
            .await
            .unwrap();
        sqlx::query("UPDATE creator_blocks SET purchased_blocks = $2 WHERE creator_id = $1")
            .bind(creator_id)
            .bind(purchased)
            .execute(store.pool())
            .await
            .unwrap();
        creator_id
    }

    async fn pending_purchase(store: &PgBillingStore, creator_id: Uuid, blocks: i64) -> BlockPurchase {
        let quote = BillingConfig::default().price_table.quote(blocks).unwrap();
        let purchase = BlockPurchase::pending(creator_id, &quote, "usd", OffsetDateTime::now_utc());
        store.insert_purchase(&purchase).await.unwrap();
        purchase
    }

    async fn used(store: &PgBillingStore, creator_id: Uuid) -> i64 {
        store
            .get_creator_blocks(creator_id)
            .await
            .unwrap()
            .unwrap()
            .used_blocks
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires a Postgres DATABASE_URL"]
    async fn test_concurrent_reservations_never_overshoot(pool: PgPool) {
        let store = Arc::new(PgBillingStore::new(pool));
        let creator_id = open_account(&store, 3).await;

        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store
                    .reserve_blocks(creator_id, 1, OffsetDateTime::now_utc())
                    .await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(used(&store, creator_id).await, 3);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires a Postgres DATABASE_URL"]
    async fn test_reservation_ignores_expired_free_blocks(pool: PgPool) {
        let store = PgBillingStore::new(pool);
        let creator_id = open_account(&store, 0).await;
        let now = OffsetDateTime::now_utc();
        store
            .grant_free_blocks(creator_id, 2, Some(now - Duration::days(1)))
            .await
            .unwrap();

        assert!(store.reserve_blocks(creator_id, 1, now).await.unwrap().is_none());
        store
            .grant_free_blocks(creator_id, 2, Some(now + Duration::days(1)))
            .await
            .unwrap();
        assert!(store.reserve_blocks(creator_id, 2, now).await.unwrap().is_some());
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires a Postgres DATABASE_URL"]
    async fn test_concurrent_credits_apply_once(pool: PgPool) {
        let store = Arc::new(PgBillingStore::new(pool));
        let creator_id = open_account(&store, 0).await;
        let purchase = pending_purchase(&store, creator_id, 4).await;

        // Not approved yet
        assert_eq!(
            store
                .credit_purchase(purchase.id, OffsetDateTime::now_utc())
                .await
                .unwrap(),
            CreditOutcome::NotApproved
        );
        assert!(store.approve_purchase(purchase.id).await.unwrap());
        assert!(!store.approve_purchase(purchase.id).await.unwrap());

        let barrier = Arc::new(Barrier::new(5));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let store = store.clone();
            let barrier = barrier.clone();
            let purchase_id = purchase.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store
                    .credit_purchase(purchase_id, OffsetDateTime::now_utc())
                    .await
            }));
        }

        let mut credited = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                CreditOutcome::Credited(_) => credited += 1,
                CreditOutcome::AlreadyCredited => {}
                CreditOutcome::NotApproved => panic!("approved purchase reported as not approved"),
            }
        }
        assert_eq!(credited, 1);

        let blocks = store.get_creator_blocks(creator_id).await.unwrap().unwrap();
        assert_eq!(blocks.purchased_blocks, 4);
        let stored = store.get_purchase(purchase.id).await.unwrap().unwrap();
        assert!(stored.credited_at.is_some());
        assert!(!stored.reconciliation_required);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires a Postgres DATABASE_URL"]
    async fn test_webhook_claim_is_exclusive(pool: PgPool) {
        let store = Arc::new(PgBillingStore::new(pool));
        let stale_before = OffsetDateTime::now_utc() - Duration::minutes(30);

        let barrier = Arc::new(Barrier::new(6));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let store = store.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store
                    .claim_webhook_event("evt_pg_1", "stripe", "checkout.completed", stale_before)
                    .await
            }));
        }
        let mut claims = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                claims += 1;
            }
        }
        assert_eq!(claims, 1);

        // An errored attempt can be taken over, a successful one cannot
        store
            .finish_webhook_event("evt_pg_1", WebhookResult::Error, Some("boom"))
            .await
            .unwrap();
        assert!(store
            .claim_webhook_event("evt_pg_1", "stripe", "checkout.completed", stale_before)
            .await
            .unwrap());
        store
            .finish_webhook_event("evt_pg_1", WebhookResult::Success, None)
            .await
            .unwrap();
        assert!(!store
            .claim_webhook_event("evt_pg_1", "stripe", "checkout.completed", stale_before)
            .await
            .unwrap());
        assert_eq!(
            store.webhook_event_result("evt_pg_1").await.unwrap(),
            Some(WebhookResult::Success)
        );
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires a Postgres DATABASE_URL"]
    async fn test_flagged_purchase_resolution(pool: PgPool) {
        let store = PgBillingStore::new(pool);
        let creator_id = open_account(&store, 0).await;
        let now = OffsetDateTime::now_utc();

        let unflagged = pending_purchase(&store, creator_id, 1).await;
        assert!(!store.approve_flagged_purchase(unflagged.id, now).await.unwrap());

        let late = pending_purchase(&store, creator_id, 1).await;
        store.reject_purchase(late.id, "checkout_abandoned").await.unwrap();
        store.flag_reconciliation(late.id, "paid after rejection").await.unwrap();
        assert!(store.approve_flagged_purchase(late.id, now).await.unwrap());
        let approved = store.get_purchase(late.id).await.unwrap().unwrap();
        assert_eq!(approved.status, PurchaseStatus::Approved);
        assert!(approved.reconciliation_resolved_at.is_some());

        let short = pending_purchase(&store, creator_id, 1).await;
        store.flag_reconciliation(short.id, "amount mismatch").await.unwrap();
        let stale = store
            .list_stale_pending(now + Duration::minutes(1))
            .await
            .unwrap();
        assert!(stale.iter().all(|p| p.id != short.id));
        assert!(stale.iter().any(|p| p.id == unflagged.id));

        assert!(store
            .dismiss_flagged_purchase(short.id, "refunded", now)
            .await
            .unwrap());
        let dismissed = store.get_purchase(short.id).await.unwrap().unwrap();
        assert_eq!(dismissed.status, PurchaseStatus::Rejected);
        assert!(!dismissed.reconciliation_required);
        assert!(!store
            .dismiss_flagged_purchase(short.id, "refunded", now)
            .await
            .unwrap());
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires a Postgres DATABASE_URL"]
    async fn test_video_removal_releases_blocks_in_one_transaction(pool: PgPool) {
        let store = PgBillingStore::new(pool);
        let creator_id = open_account(&store, 4).await;
        let now = OffsetDateTime::now_utc();

        let mut ids = Vec::new();
        for title in ["rejected", "deleted"] {
            let video = VideoAsset {
                id: Uuid::new_v4(),
                creator_id,
                title: title.into(),
                size_gb: 14.0,
                blocks_consumed: 2,
                status: VideoStatus::Approved,
                created_at: now,
                updated_at: now,
            };
            store.insert_video(&video).await.unwrap();
            store.reserve_blocks(creator_id, 2, now).await.unwrap().unwrap();
            ids.push(video.id);
        }
        assert_eq!(used(&store, creator_id).await, 4);

        let previous = store.reject_video(ids[0]).await.unwrap().unwrap();
        assert_eq!(previous.status, VideoStatus::Approved);
        assert_eq!(used(&store, creator_id).await, 2);
        assert!(store.reject_video(ids[0]).await.unwrap().is_none());
        assert_eq!(used(&store, creator_id).await, 2);

        store.delete_video(ids[1]).await.unwrap().unwrap();
        assert_eq!(used(&store, creator_id).await, 0);
        assert!(store.delete_video(ids[1]).await.unwrap().is_none());
    }
}
