// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries purchase context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ReelHub Creator Billing
//!
//! Storage blocks, the creator grace period and commission terms, and the
//! block purchase flow through Stripe or Mercado Pago.
//!
//! ## Features
//!
//! - **Block Accounting**: 7.3 GB blocks, free (expiring) and purchased, reserved by approved videos
//! - **Grace Period**: three commission-free months, then an admin-set platform commission
//! - **Purchases**: priced checkout sessions, credited exactly once from the gateway webhook
//! - **Reconciliation**: failed credits are flagged for operators and healed on redelivery
//! - **Invariants**: read-only consistency checks over the store

pub mod blocks;
pub mod config;
pub mod error;
pub mod gateway;
pub mod grace;
pub mod invariants;
pub mod pricing;
pub mod purchase;
pub mod store;
pub mod videos;
pub mod webhooks;


// Blocks
pub use blocks::{can_upload, compute_blocks_needed, BlockService, BlockSummary, CreatorBlocks, BLOCK_SIZE_GB};

// Config
pub use config::BillingConfig;

// Error
pub use error::{BillingError, BillingResult};

// Gateways
pub use gateway::{
    gateway_from_env, CheckoutEvent, CheckoutRequest, CheckoutSession, MercadoPagoConfig,
    MercadoPagoGateway, PaymentGateway, PaymentProvider, StripeGateway, StripeGatewayConfig,
};

// Grace period
pub use grace::{
    BillingOverview, BillingStatus, CreatorBilling, CreatorBillingService, RevenueSplit,
    StatusAction, COMMISSION_DEFAULT, COMMISSION_MAX, COMMISSION_MIN, GRACE_PERIOD_MONTHS,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Pricing
pub use pricing::{DiscountTier, PriceQuote, PriceTable};

// Purchases
pub use purchase::{
    BlockPurchase, ConfirmOutcome, CreditOutcome, PurchaseCheckout, PurchaseService,
    PurchaseStatus,
};

// Store
pub use store::{BillingStore, InMemoryStore, PgBillingStore, WebhookResult};

// Videos
pub use videos::{VideoAsset, VideoService, VideoStatus};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use uuid::Uuid;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub blocks: BlockService,
    pub creator_billing: CreatorBillingService,
    pub purchases: PurchaseService,
    pub videos: VideoService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
    pub config: Arc<BillingConfig>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(store: Arc<dyn BillingStore>, provider: PaymentProvider) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let gateway = gateway_from_env(provider)?;
        Ok(Self::new(store, gateway, config))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: BillingConfig,
    ) -> Self {
        let config = Arc::new(config);
        let purchases = PurchaseService::new(store.clone(), gateway.clone(), config.clone());

        Self {
            blocks: BlockService::new(store.clone()),
            creator_billing: CreatorBillingService::new(store.clone(), config.clone()),
            videos: VideoService::new(store.clone()),
            webhooks: WebhookHandler::new(store.clone(), gateway, purchases.clone()),
            invariants: InvariantChecker::new(store),
            purchases,
            config,
        }
    }

    /// Enroll a creator: billing record with a fresh grace period plus the
    /// block allotment with the sign-up grant. Safe to repeat.
    pub async fn enroll_creator(
        &self,
        creator_id: Uuid,
        email: &str,
    ) -> BillingResult<(CreatorBilling, CreatorBlocks)> {
        let billing = self.creator_billing.enroll(creator_id, email).await?;
        let blocks = self
            .blocks
            .open_account(
                creator_id,
                self.config.signup_free_blocks,
                self.config.signup_free_block_days,
            )
            .await?;
        Ok((billing, blocks))
    }
}
