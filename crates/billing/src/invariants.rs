//! Billing Invariants Module
//!
//! Runnable consistency checks for block accounting and the purchase
//! ledger. They can be run after any mutation, webhook replay or manual
//! repair to confirm the system is in a valid state.
//!
//! Checks only read; they never repair what they find.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::grace::{COMMISSION_MAX, COMMISSION_MIN};
use crate::purchase::PurchaseStatus;
use crate::store::BillingStore;
use crate::videos::VideoStatus;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Creator(s) affected
    pub creator_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// Creator paid for blocks they do not have, or has blocks nobody paid for
    Critical,
    /// Data inconsistency that needs an operator
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const CHECKS: [&str; 6] = [
    "used_blocks_within_capacity",
    "approved_purchases_credited",
    "purchased_blocks_match_ledger",
    "no_flagged_reconciliations",
    "used_blocks_match_approved_videos",
    "commission_within_bounds",
];

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: used blocks never exceed the allotment
    ///
    /// A lapsed free grant under approved content is expected and reported
    /// as Medium; anything else means a reservation overshot.
    async fn check_used_blocks_within_capacity(&self) -> BillingResult<Vec<InvariantViolation>> {
        let now = OffsetDateTime::now_utc();
        let rows = self.store.list_creator_blocks().await?;

        Ok(rows
            .into_iter()
            .filter(|row| row.is_over_quota(now))
            .map(|row| {
                let lapsed_grant = row.used_blocks <= row.purchased_blocks + row.free_blocks;
                InvariantViolation {
                    invariant: "used_blocks_within_capacity".to_string(),
                    creator_ids: vec![row.creator_id],
                    description: format!(
                        "Creator uses {} blocks but holds {}",
                        row.used_blocks,
                        row.total_blocks(now)
                    ),
                    context: serde_json::json!({
                        "used_blocks": row.used_blocks,
                        "purchased_blocks": row.purchased_blocks,
                        "free_blocks": row.free_blocks,
                        "free_block_expiry": row.free_block_expiry.map(|t| t.unix_timestamp()),
                        "lapsed_free_grant": lapsed_grant,
                    }),
                    severity: if lapsed_grant {
                        ViolationSeverity::Medium
                    } else {
                        ViolationSeverity::Critical
                    },
                }
            })
            .collect())
    }

    /// Invariant 2: every approved purchase has been credited
    async fn check_approved_purchases_credited(&self) -> BillingResult<Vec<InvariantViolation>> {
        let purchases = self.store.list_all_purchases().await?;

        Ok(purchases
            .into_iter()
            .filter(|p| {
                (p.status == PurchaseStatus::Approved) != p.credited_at.is_some()
            })
            .map(|p| InvariantViolation {
                invariant: "approved_purchases_credited".to_string(),
                creator_ids: vec![p.creator_id],
                description: if p.status == PurchaseStatus::Approved {
                    format!("Approved purchase {} was never credited", p.id)
                } else {
                    format!("Purchase {} is {} but was credited", p.id, p.status)
                },
                context: serde_json::json!({
                    "purchase_id": p.id,
                    "status": p.status.as_str(),
                    "blocks_requested": p.blocks_requested,
                    "reconciliation_required": p.reconciliation_required,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: purchased_blocks equals the sum of credited purchases
    async fn check_purchased_blocks_match_ledger(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let mut credited: HashMap<Uuid, i64> = HashMap::new();
        for p in self.store.list_all_purchases().await? {
            if p.credited_at.is_some() {
                *credited.entry(p.creator_id).or_default() += p.blocks_requested;
            }
        }

        let rows = self.store.list_creator_blocks().await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let ledger = credited.get(&row.creator_id).copied().unwrap_or(0);
                (ledger != row.purchased_blocks).then(|| InvariantViolation {
                    invariant: "purchased_blocks_match_ledger".to_string(),
                    creator_ids: vec![row.creator_id],
                    description: format!(
                        "Creator has {} purchased blocks but the ledger credits {}",
                        row.purchased_blocks, ledger
                    ),
                    context: serde_json::json!({
                        "purchased_blocks": row.purchased_blocks,
                        "credited_blocks": ledger,
                    }),
                    severity: ViolationSeverity::Critical,
                })
            })
            .collect())
    }

    /// Invariant 4: nothing is waiting on an operator
    async fn check_no_flagged_reconciliations(&self) -> BillingResult<Vec<InvariantViolation>> {
        let flagged = self.store.list_flagged_purchases().await?;

        Ok(flagged
            .into_iter()
            .map(|p| InvariantViolation {
                invariant: "no_flagged_reconciliations".to_string(),
                creator_ids: vec![p.creator_id],
                description: format!("Purchase {} requires reconciliation", p.id),
                context: serde_json::json!({
                    "purchase_id": p.id,
                    "status": p.status.as_str(),
                    "failure_reason": p.failure_reason,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: used_blocks equals the blocks held by approved videos
    async fn check_used_blocks_match_approved_videos(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for row in self.store.list_creator_blocks().await? {
            let held: i64 = self
                .store
                .list_videos(row.creator_id)
                .await?
                .iter()
                .filter(|v| v.status == VideoStatus::Approved)
                .map(|v| v.blocks_consumed)
                .sum();

            if held != row.used_blocks {
                violations.push(InvariantViolation {
                    invariant: "used_blocks_match_approved_videos".to_string(),
                    creator_ids: vec![row.creator_id],
                    description: format!(
                        "Creator has {} used blocks but approved videos hold {}",
                        row.used_blocks, held
                    ),
                    context: serde_json::json!({
                        "used_blocks": row.used_blocks,
                        "approved_video_blocks": held,
                    }),
                    severity: ViolationSeverity::High,
                });
            }
        }
        Ok(violations)
    }

    /// Invariant 6: commission stays within the admin bounds
    async fn check_commission_within_bounds(&self) -> BillingResult<Vec<InvariantViolation>> {
        let records = self.store.list_creator_billing().await?;

        Ok(records
            .into_iter()
            .filter(|b| !(COMMISSION_MIN..=COMMISSION_MAX).contains(&b.commission_percentage))
            .map(|b| InvariantViolation {
                invariant: "commission_within_bounds".to_string(),
                creator_ids: vec![b.creator_id],
                description: format!(
                    "Commission {}% is outside {}-{}%",
                    b.commission_percentage, COMMISSION_MIN, COMMISSION_MAX
                ),
                context: serde_json::json!({
                    "commission_percentage": b.commission_percentage,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "used_blocks_within_capacity" => self.check_used_blocks_within_capacity().await,
            "approved_purchases_credited" => self.check_approved_purchases_credited().await,
            "purchased_blocks_match_ledger" => self.check_purchased_blocks_match_ledger().await,
            "no_flagged_reconciliations" => self.check_no_flagged_reconciliations().await,
            "used_blocks_match_approved_videos" => {
                self.check_used_blocks_match_approved_videos().await
            }
            "commission_within_bounds" => self.check_commission_within_bounds().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }
}
