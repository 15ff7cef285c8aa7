//! Block purchase orchestration
//!
//! Purchases are an append-only ledger. A purchase is created `pending`
//! before the gateway is called, moves to `approved` only on a confirmed
//! gateway callback, and credits `purchased_blocks` exactly once (guarded
//! by `credited_at` inside the store). If crediting keeps failing the
//! purchase is flagged for reconciliation; a redelivered webhook or an
//! operator retry re-runs the credit.
//!
//! A payment that cannot be credited automatically (wrong amount, or paid
//! after the purchase was rejected) is flagged too. An operator resolves it
//! by approving and crediting it, or by dismissing it; either way
//! `reconciliation_resolved_at` is stamped so redeliveries of the same
//! payment do not reopen the case.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::blocks::CreatorBlocks;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CheckoutEvent, CheckoutRequest, PaymentGateway};
use crate::pricing::PriceQuote;
use crate::store::BillingStore;

/// Attempts at crediting blocks before the purchase is flagged
const CREDIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Approved,
    Rejected,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Approved => "approved",
            PurchaseStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PurchaseStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PurchaseStatus::Pending),
            "approved" => Ok(PurchaseStatus::Approved),
            "rejected" => Ok(PurchaseStatus::Rejected),
            other => Err(BillingError::Database(format!(
                "unknown purchase status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockPurchase {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub blocks_requested: i64,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PurchaseStatus,
    /// Gateway session/preference id, set once checkout is created
    pub transaction_id: Option<String>,
    pub checkout_url: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub credited_at: Option<OffsetDateTime>,
    pub reconciliation_required: bool,
    pub failure_reason: Option<String>,
    /// Set when an operator approved or dismissed a flagged purchase
    #[serde(with = "time::serde::rfc3339::option")]
    pub reconciliation_resolved_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl BlockPurchase {
    pub fn pending(creator_id: Uuid, quote: &PriceQuote, currency: &str, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            creator_id,
            blocks_requested: quote.blocks,
            amount_cents: quote.amount_cents,
            currency: currency.to_string(),
            status: PurchaseStatus::Pending,
            transaction_id: None,
            checkout_url: None,
            credited_at: None,
            reconciliation_required: false,
            failure_reason: None,
            reconciliation_resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of crediting an approved purchase
#[derive(Debug, Clone, PartialEq)]
pub enum CreditOutcome {
    Credited(CreatorBlocks),
    AlreadyCredited,
    NotApproved,
}

/// Result of a (possibly replayed) confirmation
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    /// This call approved and/or credited the purchase
    Confirmed {
        purchase: BlockPurchase,
        blocks: CreatorBlocks,
    },
    /// Duplicate delivery; nothing changed
    AlreadyConfirmed { purchase: BlockPurchase },
    /// Payment for a purchase an operator dismissed; nothing changed
    Dismissed { purchase: BlockPurchase },
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseCheckout {
    pub purchase_id: Uuid,
    pub checkout_url: String,
    pub amount_cents: i64,
    pub currency: String,
    pub quote: PriceQuote,
}

#[derive(Clone)]
pub struct PurchaseService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    config: Arc<BillingConfig>,
}

impl PurchaseService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    pub fn quote(&self, blocks: i64) -> BillingResult<PriceQuote> {
        if blocks > self.config.max_blocks_per_purchase {
            return Err(BillingError::InvalidInput(format!(
                "at most {} blocks can be bought at once",
                self.config.max_blocks_per_purchase
            )));
        }
        self.config.price_table.quote(blocks)
    }

    /// Price the request, record a pending purchase and open a checkout.
    ///
    /// If the gateway fails the purchase is closed as `rejected` so no
    /// pending record without a checkout is left behind.
    pub async fn initiate_purchase(
        &self,
        creator_id: Uuid,
        blocks_requested: i64,
    ) -> BillingResult<PurchaseCheckout> {
        let quote = self.quote(blocks_requested)?;

        if self.store.get_creator_blocks(creator_id).await?.is_none() {
            return Err(BillingError::NotFound(format!(
                "blocks for creator {}",
                creator_id
            )));
        }

        let purchase = BlockPurchase::pending(
            creator_id,
            &quote,
            &self.config.currency,
            OffsetDateTime::now_utc(),
        );
        self.store.insert_purchase(&purchase).await?;

        let request = CheckoutRequest {
            purchase_id: purchase.id,
            creator_id,
            blocks: quote.blocks,
            amount_cents: quote.amount_cents,
            currency: self.config.currency.clone(),
            description: format!(
                "{} x {} GB storage block ({}% volume discount)",
                quote.blocks,
                crate::blocks::BLOCK_SIZE_GB,
                quote.discount_percent
            ),
            success_url: self.config.checkout_success_url.clone(),
            cancel_url: self.config.checkout_cancel_url.clone(),
        };

        let session = match self.gateway.create_checkout_session(&request).await {
            Ok(session) => session,
            Err(e) => {
                let reason = format!("gateway_error: {}", e);
                if let Err(close_err) = self.store.reject_purchase(purchase.id, &reason).await {
                    tracing::error!(
                        purchase_id = %purchase.id,
                        error = %close_err,
                        "Failed to close purchase after gateway error"
                    );
                }
                tracing::error!(
                    purchase_id = %purchase.id,
                    creator_id = %creator_id,
                    provider = self.gateway.provider(),
                    error = %e,
                    "Checkout session creation failed"
                );
                return Err(match e {
                    BillingError::PaymentGateway(msg) => BillingError::PaymentGateway(msg),
                    other => BillingError::PaymentGateway(other.to_string()),
                });
            }
        };

        let attached = self
            .store
            .attach_checkout(purchase.id, &session.session_id, &session.url)
            .await?;
        if !attached {
            tracing::warn!(
                purchase_id = %purchase.id,
                session_id = %session.session_id,
                "Purchase changed before checkout could be attached"
            );
        }

        tracing::info!(
            purchase_id = %purchase.id,
            creator_id = %creator_id,
            blocks = quote.blocks,
            amount_cents = quote.amount_cents,
            provider = self.gateway.provider(),
            "Block purchase checkout created"
        );

        Ok(PurchaseCheckout {
            purchase_id: purchase.id,
            checkout_url: session.url,
            amount_cents: quote.amount_cents,
            currency: self.config.currency.clone(),
            quote,
        })
    }

    pub async fn get_purchase(&self, purchase_id: Uuid) -> BillingResult<BlockPurchase> {
        self.store
            .get_purchase(purchase_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("purchase {}", purchase_id)))
    }

    pub async fn list_purchases(&self, creator_id: Uuid) -> BillingResult<Vec<BlockPurchase>> {
        self.store.list_purchases(creator_id).await
    }

    /// Confirm a paid checkout by its gateway transaction id. Safe to call
    /// any number of times.
    pub async fn confirm_purchase(&self, transaction_id: &str) -> BillingResult<ConfirmOutcome> {
        let purchase = self
            .store
            .get_purchase_by_transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("purchase for transaction {}", transaction_id))
            })?;
        self.confirm(purchase).await
    }

    async fn confirm(&self, purchase: BlockPurchase) -> BillingResult<ConfirmOutcome> {
        match purchase.status {
            PurchaseStatus::Rejected if purchase.reconciliation_resolved_at.is_some() => {
                tracing::info!(
                    purchase_id = %purchase.id,
                    "Payment for dismissed purchase ignored"
                );
                return Ok(ConfirmOutcome::Dismissed { purchase });
            }
            PurchaseStatus::Rejected => {
                // The customer paid for a purchase we already closed
                let reason = match (&purchase.failure_reason, purchase.reconciliation_required) {
                    (Some(existing), true) => existing.clone(),
                    (previous, _) => {
                        let reason = format!(
                            "paid after rejection ({})",
                            previous.as_deref().unwrap_or("no reason recorded")
                        );
                        self.flag(purchase.id, &reason).await;
                        reason
                    }
                };
                return Err(BillingError::ReconciliationRequired {
                    purchase_id: purchase.id,
                    reason,
                });
            }
            PurchaseStatus::Approved if purchase.credited_at.is_some() => {
                tracing::info!(
                    purchase_id = %purchase.id,
                    "Duplicate purchase confirmation ignored"
                );
                return Ok(ConfirmOutcome::AlreadyConfirmed { purchase });
            }
            PurchaseStatus::Pending => {
                let approved = self.store.approve_purchase(purchase.id).await?;
                if approved {
                    tracing::info!(purchase_id = %purchase.id, "Block purchase approved");
                }
            }
            PurchaseStatus::Approved => {
                tracing::warn!(
                    purchase_id = %purchase.id,
                    "Approved purchase was never credited, retrying credit"
                );
            }
        }

        self.credit(purchase.id).await
    }

    /// Credit an approved purchase with bounded retries, flagging it for an
    /// operator when the credit keeps failing.
    async fn credit(&self, purchase_id: Uuid) -> BillingResult<ConfirmOutcome> {
        let strategy = ExponentialBackoff::from_millis(20)
            .max_delay(std::time::Duration::from_millis(500))
            .map(jitter)
            .take(CREDIT_ATTEMPTS - 1);

        let store = self.store.clone();
        let result = Retry::spawn(strategy, || {
            let store = store.clone();
            async move {
                store
                    .credit_purchase(purchase_id, OffsetDateTime::now_utc())
                    .await
            }
        })
        .await;

        match result {
            Ok(CreditOutcome::Credited(blocks)) => {
                let purchase = self.get_purchase(purchase_id).await?;
                tracing::info!(
                    purchase_id = %purchase_id,
                    creator_id = %purchase.creator_id,
                    blocks = purchase.blocks_requested,
                    purchased_blocks = blocks.purchased_blocks,
                    "Credited purchased blocks"
                );
                Ok(ConfirmOutcome::Confirmed { purchase, blocks })
            }
            Ok(CreditOutcome::AlreadyCredited) => {
                let purchase = self.get_purchase(purchase_id).await?;
                Ok(ConfirmOutcome::AlreadyConfirmed { purchase })
            }
            Ok(CreditOutcome::NotApproved) => {
                let purchase = self.get_purchase(purchase_id).await?;
                Err(BillingError::InvalidTransition(format!(
                    "purchase {} is {} and cannot be credited",
                    purchase_id, purchase.status
                )))
            }
            Err(e) => {
                let reason = format!("block credit failed: {}", e);
                self.flag(purchase_id, &reason).await;
                Err(BillingError::ReconciliationRequired {
                    purchase_id,
                    reason,
                })
            }
        }
    }

    async fn flag(&self, purchase_id: Uuid, reason: &str) {
        tracing::error!(
            purchase_id = %purchase_id,
            reason = %reason,
            "CRITICAL: Purchase requires reconciliation"
        );
        if let Err(e) = self.store.flag_reconciliation(purchase_id, reason).await {
            tracing::error!(
                purchase_id = %purchase_id,
                error = %e,
                "CRITICAL: Failed to flag purchase for reconciliation. \
                 Manual intervention required."
            );
        }
    }

    /// Resolve and confirm a gateway completion event.
    ///
    /// The purchase is found by transaction id, falling back to the
    /// purchase id echoed in gateway metadata. A paid amount that differs
    /// from the ledger is never credited automatically.
    pub async fn confirm_checkout(&self, event: &CheckoutEvent) -> BillingResult<ConfirmOutcome> {
        let CheckoutEvent::Completed {
            event_id,
            transaction_id,
            purchase_id,
            amount_cents,
        } = event
        else {
            return Err(BillingError::InvalidInput(
                "only completed checkouts can be confirmed".into(),
            ));
        };

        let purchase = self
            .resolve(transaction_id.as_deref(), *purchase_id)
            .await?;

        if let Some(paid) = amount_cents {
            if *paid != purchase.amount_cents
                && purchase.credited_at.is_none()
                && purchase.reconciliation_resolved_at.is_none()
            {
                let reason = format!(
                    "paid amount {} does not match purchase amount {}",
                    paid, purchase.amount_cents
                );
                tracing::error!(
                    event_id = %event_id,
                    purchase_id = %purchase.id,
                    "Checkout amount mismatch"
                );
                self.flag(purchase.id, &reason).await;
                return Err(BillingError::ReconciliationRequired {
                    purchase_id: purchase.id,
                    reason,
                });
            }
        }

        self.confirm(purchase).await
    }

    /// Close a pending purchase whose checkout expired or failed
    pub async fn cancel_checkout(&self, event: &CheckoutEvent) -> BillingResult<bool> {
        let CheckoutEvent::Failed {
            transaction_id,
            purchase_id,
            reason,
            ..
        } = event
        else {
            return Err(BillingError::InvalidInput(
                "only failed checkouts can be cancelled".into(),
            ));
        };

        let purchase = self
            .resolve(transaction_id.as_deref(), *purchase_id)
            .await?;
        let rejected = self.store.reject_purchase(purchase.id, reason).await?;
        if rejected {
            tracing::info!(
                purchase_id = %purchase.id,
                reason = %reason,
                "Block purchase rejected"
            );
        }
        Ok(rejected)
    }

    async fn resolve(
        &self,
        transaction_id: Option<&str>,
        purchase_id: Option<Uuid>,
    ) -> BillingResult<BlockPurchase> {
        if let Some(transaction_id) = transaction_id {
            if let Some(purchase) = self.store.get_purchase_by_transaction(transaction_id).await? {
                return Ok(purchase);
            }
        }

        if let Some(purchase_id) = purchase_id {
            if let Some(purchase) = self.store.get_purchase(purchase_id).await? {
                return Ok(purchase);
            }
        }

        Err(BillingError::NotFound(format!(
            "purchase for transaction {:?} / id {:?}",
            transaction_id, purchase_id
        )))
    }

    /// Operator resolution of a flagged purchase by crediting it.
    ///
    /// An approved purchase whose credit failed is simply credited again. A
    /// flagged pending or rejected purchase (wrong amount, paid after
    /// rejection) is approved first, on the operator's word that the
    /// payment is good.
    pub async fn retry_reconciliation(&self, purchase_id: Uuid) -> BillingResult<ConfirmOutcome> {
        let purchase = self.get_purchase(purchase_id).await?;
        match purchase.status {
            PurchaseStatus::Approved => self.confirm(purchase).await,
            PurchaseStatus::Pending | PurchaseStatus::Rejected
                if purchase.reconciliation_required =>
            {
                let approved = self
                    .store
                    .approve_flagged_purchase(purchase_id, OffsetDateTime::now_utc())
                    .await?;
                if approved {
                    tracing::warn!(
                        purchase_id = %purchase_id,
                        previous = %purchase.status,
                        reason = purchase.failure_reason.as_deref().unwrap_or("unknown"),
                        "Flagged purchase approved by operator"
                    );
                }
                self.credit(purchase_id).await
            }
            PurchaseStatus::Pending | PurchaseStatus::Rejected => {
                Err(BillingError::InvalidTransition(format!(
                    "purchase {} is {} and not flagged for reconciliation",
                    purchase_id, purchase.status
                )))
            }
        }
    }

    /// Operator resolution of a flagged, uncredited purchase by closing it
    /// as rejected. Later deliveries of the same payment are ignored.
    pub async fn dismiss_reconciliation(
        &self,
        purchase_id: Uuid,
        reason: &str,
    ) -> BillingResult<BlockPurchase> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(BillingError::InvalidInput(
                "a reason is required to dismiss a flagged purchase".into(),
            ));
        }

        let dismissed = self
            .store
            .dismiss_flagged_purchase(purchase_id, reason, OffsetDateTime::now_utc())
            .await?;
        let purchase = self.get_purchase(purchase_id).await?;
        if !dismissed {
            return Err(BillingError::InvalidTransition(format!(
                "purchase {} is {} and cannot be dismissed; only flagged pending or \
                 rejected purchases can",
                purchase_id, purchase.status
            )));
        }

        tracing::warn!(
            purchase_id = %purchase_id,
            creator_id = %purchase.creator_id,
            reason = %reason,
            "Flagged purchase dismissed by operator"
        );
        Ok(purchase)
    }

    pub async fn list_flagged(&self) -> BillingResult<Vec<BlockPurchase>> {
        self.store.list_flagged_purchases().await
    }

    /// Reject checkouts that stayed pending since before `older_than`.
    /// Flagged purchases are left for an operator.
    pub async fn expire_stale_purchases(&self, older_than: OffsetDateTime) -> BillingResult<usize> {
        let stale = self.store.list_stale_pending(older_than).await?;
        let mut expired = 0;
        for purchase in stale {
            if self
                .store
                .reject_purchase(purchase.id, "checkout_abandoned")
                .await?
            {
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(expired = expired, "Expired stale pending purchases");
        }
        Ok(expired)
    }
}
