//! Grace period and commission terms
//!
//! Every creator starts with a three month grace period in which the
//! platform takes no commission. Afterwards the platform keeps
//! `commission_percentage` of creator revenue (admin-configurable within
//! [`COMMISSION_MIN`, `COMMISSION_MAX`]).
//!
//! `grace_period` vs `billing_active` is never trusted from storage: it is
//! recomputed from `grace_period_end` on every read and the stored value is
//! reconciled lazily.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

pub const GRACE_PERIOD_MONTHS: u8 = 3;
pub const COMMISSION_MIN: i32 = 50;
pub const COMMISSION_MAX: i32 = 70;
pub const COMMISSION_DEFAULT: i32 = 60;

const DAYS_PER_GRACE_MONTH: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    GracePeriod,
    BillingActive,
    Suspended,
    Cancelled,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::GracePeriod => "grace_period",
            BillingStatus::BillingActive => "billing_active",
            BillingStatus::Suspended => "suspended",
            BillingStatus::Cancelled => "cancelled",
        }
    }

    /// Apply an explicit admin/creator action to the effective status
    pub fn apply(self, action: StatusAction, in_grace: bool) -> BillingResult<BillingStatus> {
        match (self, action) {
            (BillingStatus::Cancelled, _) => Err(BillingError::InvalidTransition(
                "cancelled billing is terminal".into(),
            )),
            (_, StatusAction::Cancel) => Ok(BillingStatus::Cancelled),
            (BillingStatus::BillingActive, StatusAction::Suspend) => Ok(BillingStatus::Suspended),
            (BillingStatus::Suspended, StatusAction::Reinstate) => Ok(if in_grace {
                BillingStatus::GracePeriod
            } else {
                BillingStatus::BillingActive
            }),
            (from, action) => Err(BillingError::InvalidTransition(format!(
                "cannot {} from {}",
                action.as_str(),
                from
            ))),
        }
    }
}

impl fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grace_period" => Ok(BillingStatus::GracePeriod),
            "billing_active" => Ok(BillingStatus::BillingActive),
            "suspended" => Ok(BillingStatus::Suspended),
            "cancelled" => Ok(BillingStatus::Cancelled),
            other => Err(BillingError::Database(format!(
                "unknown billing status: {}",
                other
            ))),
        }
    }
}

/// Explicit status changes; the grace -> active move is date-driven only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusAction {
    Suspend,
    Reinstate,
    Cancel,
}

impl StatusAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusAction::Suspend => "suspend",
            StatusAction::Reinstate => "reinstate",
            StatusAction::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatorBilling {
    pub creator_id: Uuid,
    pub creator_email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub grace_period_end: OffsetDateTime,
    pub monthly_fee_cents: i64,
    pub status: BillingStatus,
    /// Platform share of creator revenue once the grace period is over
    pub commission_percentage: i32,
    pub total_earned_cents: i64,
    pub subscribers_referred: i64,
    pub referral_code: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl CreatorBilling {
    pub fn new(
        creator_id: Uuid,
        creator_email: String,
        monthly_fee_cents: i64,
        now: OffsetDateTime,
    ) -> BillingResult<Self> {
        Ok(Self {
            creator_id,
            creator_email,
            start_date: now,
            grace_period_end: add_months(now, GRACE_PERIOD_MONTHS)?,
            monthly_fee_cents,
            status: BillingStatus::GracePeriod,
            commission_percentage: COMMISSION_DEFAULT,
            total_earned_cents: 0,
            subscribers_referred: 0,
            referral_code: generate_referral_code(),
            created_at: now,
            updated_at: now,
        })
    }
}

/// Add calendar months, clamping the day to the target month's length
/// (Nov 30 + 3 months = Feb 28/29).
pub fn add_months(at: OffsetDateTime, months: u8) -> BillingResult<OffsetDateTime> {
    let date = at.date();
    let month_index = u8::from(date.month()) - 1 + months;
    let year = date.year() + i32::from(month_index / 12);
    let month = date.month().nth_next(months);
    let day = date.day().min(time::util::days_in_year_month(year, month));

    let target = Date::from_calendar_date(year, month, day)
        .map_err(|e| BillingError::InvalidInput(format!("date out of range: {}", e)))?;
    Ok(at.replace_date(target))
}

fn generate_referral_code() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    raw[..12].to_uppercase()
}

pub fn is_in_grace_period(billing: &CreatorBilling, now: OffsetDateTime) -> bool {
    now <= billing.grace_period_end
}

/// Platform commission currently applied: zero during grace
pub fn current_commission_rate(billing: &CreatorBilling, now: OffsetDateTime) -> i32 {
    if is_in_grace_period(billing, now) {
        0
    } else {
        billing.commission_percentage
    }
}

/// Whole 30-day periods (rounded up) left in the grace window
pub fn grace_months_left(billing: &CreatorBilling, now: OffsetDateTime) -> i64 {
    let remaining = billing.grace_period_end - now;
    if remaining <= Duration::ZERO {
        return 0;
    }
    let period = Duration::days(DAYS_PER_GRACE_MONTH).whole_seconds();
    let secs = remaining.whole_seconds();
    (secs + period - 1) / period
}

/// Status the record should have right now
pub fn effective_status(billing: &CreatorBilling, now: OffsetDateTime) -> BillingStatus {
    match billing.status {
        BillingStatus::Suspended | BillingStatus::Cancelled => billing.status,
        BillingStatus::GracePeriod | BillingStatus::BillingActive => {
            if is_in_grace_period(billing, now) {
                BillingStatus::GracePeriod
            } else {
                BillingStatus::BillingActive
            }
        }
    }
}

pub fn validate_commission(percentage: i32) -> BillingResult<()> {
    if !(COMMISSION_MIN..=COMMISSION_MAX).contains(&percentage) {
        return Err(BillingError::InvalidInput(format!(
            "commission percentage must be between {} and {}, got {}",
            COMMISSION_MIN, COMMISSION_MAX, percentage
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RevenueSplit {
    pub gross_cents: i64,
    pub creator_cents: i64,
    pub platform_cents: i64,
    pub commission_percentage: i32,
}

/// Split `gross_cents` between creator and platform. The platform share is
/// rounded down.
pub fn revenue_split(billing: &CreatorBilling, gross_cents: i64, now: OffsetDateTime) -> RevenueSplit {
    let commission = current_commission_rate(billing, now);
    // Widened so any i64 amount times a percentage cannot overflow; the
    // quotient never exceeds `gross_cents`.
    let platform_cents =
        i64::try_from(i128::from(gross_cents) * i128::from(commission) / 100).unwrap_or(gross_cents);
    RevenueSplit {
        gross_cents,
        creator_cents: gross_cents - platform_cents,
        platform_cents,
        commission_percentage: commission,
    }
}

/// Billing record plus the terms derived from it at read time
#[derive(Debug, Clone, Serialize)]
pub struct BillingOverview {
    #[serde(flatten)]
    pub billing: CreatorBilling,
    pub in_grace_period: bool,
    pub grace_months_left: i64,
    pub current_commission_rate: i32,
    pub creator_share_percentage: i32,
    pub referral_link: String,
}

#[derive(Clone)]
pub struct CreatorBillingService {
    store: Arc<dyn BillingStore>,
    config: Arc<BillingConfig>,
}

impl CreatorBillingService {
    pub fn new(store: Arc<dyn BillingStore>, config: Arc<BillingConfig>) -> Self {
        Self { store, config }
    }

    /// Create the billing record; returns the existing record when the
    /// creator is already enrolled (the referral code never changes).
    pub async fn enroll(&self, creator_id: Uuid, email: &str) -> BillingResult<CreatorBilling> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(BillingError::InvalidInput(format!(
                "invalid creator email: {}",
                email
            )));
        }

        let billing = CreatorBilling::new(
            creator_id,
            email.to_string(),
            self.config.monthly_fee_cents,
            OffsetDateTime::now_utc(),
        )?;
        let stored = self.store.insert_creator_billing(&billing).await?;

        if stored.referral_code == billing.referral_code {
            tracing::info!(
                creator_id = %creator_id,
                grace_period_end = %stored.grace_period_end,
                "Creator enrolled in billing"
            );
        }
        Ok(stored)
    }

    /// Load the record, reconciling the date-driven status if it drifted
    pub async fn get(&self, creator_id: Uuid) -> BillingResult<CreatorBilling> {
        let mut billing = self
            .store
            .get_creator_billing(creator_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("billing for creator {}", creator_id)))?;

        let now = OffsetDateTime::now_utc();
        let effective = effective_status(&billing, now);
        if effective != billing.status {
            let persisted = self
                .store
                .update_billing_status(creator_id, billing.status, effective)
                .await?;
            tracing::info!(
                creator_id = %creator_id,
                from = %billing.status,
                to = %effective,
                persisted = persisted,
                "Reconciled billing status on read"
            );
            billing.status = effective;
        }
        Ok(billing)
    }

    pub async fn overview(&self, creator_id: Uuid) -> BillingResult<BillingOverview> {
        let billing = self.get(creator_id).await?;
        Ok(self.overview_of(billing, OffsetDateTime::now_utc()))
    }

    pub fn overview_of(&self, billing: CreatorBilling, now: OffsetDateTime) -> BillingOverview {
        let commission = current_commission_rate(&billing, now);
        BillingOverview {
            in_grace_period: is_in_grace_period(&billing, now),
            grace_months_left: grace_months_left(&billing, now),
            current_commission_rate: commission,
            creator_share_percentage: 100 - commission,
            referral_link: self.referral_link(&billing),
            billing,
        }
    }

    pub fn referral_link(&self, billing: &CreatorBilling) -> String {
        format!(
            "{}/{}",
            self.config.referral_base_url.trim_end_matches('/'),
            billing.referral_code
        )
    }

    pub async fn change_status(
        &self,
        creator_id: Uuid,
        action: StatusAction,
    ) -> BillingResult<CreatorBilling> {
        let billing = self.get(creator_id).await?;
        let now = OffsetDateTime::now_utc();
        let next = billing
            .status
            .apply(action, is_in_grace_period(&billing, now))?;

        let applied = self
            .store
            .update_billing_status(creator_id, billing.status, next)
            .await?;
        if !applied {
            return Err(BillingError::InvalidTransition(format!(
                "billing status for creator {} changed concurrently",
                creator_id
            )));
        }

        tracing::info!(
            creator_id = %creator_id,
            action = action.as_str(),
            from = %billing.status,
            to = %next,
            "Billing status changed"
        );
        self.get(creator_id).await
    }

    pub async fn set_commission_percentage(
        &self,
        creator_id: Uuid,
        percentage: i32,
    ) -> BillingResult<CreatorBilling> {
        validate_commission(percentage)?;
        let updated = self
            .store
            .set_commission_percentage(creator_id, percentage)
            .await?;
        if !updated {
            return Err(BillingError::NotFound(format!(
                "billing for creator {}",
                creator_id
            )));
        }

        tracing::info!(
            creator_id = %creator_id,
            commission_percentage = percentage,
            "Commission percentage updated"
        );
        self.get(creator_id).await
    }

    /// Credit the creator's share of a payment to `total_earned_cents`
    pub async fn record_earning(
        &self,
        creator_id: Uuid,
        gross_cents: i64,
    ) -> BillingResult<(CreatorBilling, RevenueSplit)> {
        if gross_cents <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "earning must be positive, got {}",
                gross_cents
            )));
        }

        let billing = self.get(creator_id).await?;
        if billing.status == BillingStatus::Cancelled {
            return Err(BillingError::InvalidTransition(
                "cannot record earnings for cancelled billing".into(),
            ));
        }

        let split = revenue_split(&billing, gross_cents, OffsetDateTime::now_utc());
        let updated = self
            .store
            .add_earnings(creator_id, split.creator_cents)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("billing for creator {}", creator_id)))?;

        tracing::debug!(
            creator_id = %creator_id,
            gross_cents = gross_cents,
            creator_cents = split.creator_cents,
            platform_cents = split.platform_cents,
            "Recorded creator earning"
        );
        Ok((updated, split))
    }

    pub async fn record_referral(&self, creator_id: Uuid) -> BillingResult<CreatorBilling> {
        self.store
            .increment_referrals(creator_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("billing for creator {}", creator_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use time::macros::datetime;

    fn billing_started(start: OffsetDateTime) -> CreatorBilling {
        CreatorBilling::new(Uuid::new_v4(), "creator@example.com".into(), 4_990, start).unwrap()
    }

    fn service() -> (Arc<InMemoryStore>, CreatorBillingService) {
        let store = Arc::new(InMemoryStore::new());
        let service =
            CreatorBillingService::new(store.clone(), Arc::new(BillingConfig::default()));
        (store, service)
    }

    #[test]
    fn test_grace_end_is_three_calendar_months() {
        let billing = billing_started(datetime!(2026-01-15 10:00 UTC));
        assert_eq!(billing.grace_period_end, datetime!(2026-04-15 10:00 UTC));
    }

    #[test]
    fn test_add_months_clamps_day_and_rolls_year() {
        assert_eq!(
            add_months(datetime!(2025-11-30 00:00 UTC), 3).unwrap(),
            datetime!(2026-02-28 00:00 UTC)
        );
        assert_eq!(
            add_months(datetime!(2027-11-30 00:00 UTC), 3).unwrap(),
            datetime!(2028-02-29 00:00 UTC)
        );
        assert_eq!(
            add_months(datetime!(2026-10-31 12:30 UTC), 3).unwrap(),
            datetime!(2027-01-31 12:30 UTC)
        );
    }

    #[test]
    fn test_grace_period_boundary() {
        let billing = billing_started(datetime!(2026-01-15 10:00 UTC));
        assert!(is_in_grace_period(&billing, billing.start_date));
        assert!(is_in_grace_period(&billing, billing.grace_period_end));
        assert!(!is_in_grace_period(
            &billing,
            billing.grace_period_end + Duration::seconds(1)
        ));
    }

    #[test]
    fn test_commission_zero_during_grace() {
        let billing = billing_started(datetime!(2026-01-15 10:00 UTC));
        assert_eq!(current_commission_rate(&billing, billing.start_date), 0);
        let after = billing.grace_period_end + Duration::days(1);
        assert_eq!(current_commission_rate(&billing, after), COMMISSION_DEFAULT);
    }

    #[test]
    fn test_grace_months_left() {
        let billing = billing_started(datetime!(2026-01-15 10:00 UTC));
        // 90 days remain at start
        assert_eq!(grace_months_left(&billing, billing.start_date), 3);
        assert_eq!(
            grace_months_left(&billing, billing.grace_period_end - Duration::days(31)),
            2
        );
        assert_eq!(
            grace_months_left(&billing, billing.grace_period_end - Duration::hours(1)),
            1
        );
        assert_eq!(grace_months_left(&billing, billing.grace_period_end), 0);
        assert_eq!(
            grace_months_left(&billing, billing.grace_period_end + Duration::days(40)),
            0
        );
    }

    #[test]
    fn test_effective_status_recomputes_date_driven_states() {
        let mut billing = billing_started(datetime!(2026-01-15 10:00 UTC));
        let after = billing.grace_period_end + Duration::minutes(1);
        assert_eq!(effective_status(&billing, after), BillingStatus::BillingActive);

        billing.status = BillingStatus::BillingActive;
        assert_eq!(
            effective_status(&billing, billing.start_date),
            BillingStatus::GracePeriod
        );

        billing.status = BillingStatus::Suspended;
        assert_eq!(effective_status(&billing, after), BillingStatus::Suspended);
    }

    #[test]
    fn test_status_machine() {
        use BillingStatus::*;
        use StatusAction::*;

        assert_eq!(BillingActive.apply(Suspend, false).unwrap(), Suspended);
        assert_eq!(Suspended.apply(Reinstate, false).unwrap(), BillingActive);
        assert_eq!(Suspended.apply(Reinstate, true).unwrap(), GracePeriod);
        assert_eq!(GracePeriod.apply(Cancel, true).unwrap(), Cancelled);
        assert_eq!(Suspended.apply(Cancel, false).unwrap(), Cancelled);

        assert!(GracePeriod.apply(Suspend, true).is_err());
        assert!(BillingActive.apply(Reinstate, false).is_err());
        assert!(Cancelled.apply(Reinstate, false).is_err());
        assert!(Cancelled.apply(Cancel, false).is_err());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            BillingStatus::GracePeriod,
            BillingStatus::BillingActive,
            BillingStatus::Suspended,
            BillingStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<BillingStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_revenue_split_rounds_platform_down() {
        let billing = billing_started(datetime!(2026-01-15 10:00 UTC));
        let after = billing.grace_period_end + Duration::days(1);

        let split = revenue_split(&billing, 999, after);
        assert_eq!(split.platform_cents, 599);
        assert_eq!(split.creator_cents, 400);

        let grace = revenue_split(&billing, 999, billing.start_date);
        assert_eq!(grace.platform_cents, 0);
        assert_eq!(grace.creator_cents, 999);
    }

    #[test]
    fn test_commission_bounds() {
        assert!(validate_commission(50).is_ok());
        assert!(validate_commission(70).is_ok());
        assert!(validate_commission(49).is_err());
        assert!(validate_commission(71).is_err());
    }

    #[tokio::test]
    async fn test_enroll_is_idempotent_and_keeps_referral_code() {
        let (_, service) = service();
        let creator_id = Uuid::new_v4();
        let first = service.enroll(creator_id, "a@example.com").await.unwrap();
        let second = service.enroll(creator_id, "a@example.com").await.unwrap();
        assert_eq!(first.referral_code, second.referral_code);
        assert_eq!(first.status, BillingStatus::GracePeriod);
        assert_eq!(first.commission_percentage, COMMISSION_DEFAULT);
    }

    #[tokio::test]
    async fn test_enroll_rejects_bad_email() {
        let (_, service) = service();
        assert!(service.enroll(Uuid::new_v4(), "   ").await.is_err());
        assert!(service.enroll(Uuid::new_v4(), "nobody").await.is_err());
    }

    #[tokio::test]
    async fn test_get_reconciles_expired_grace() {
        let (store, service) = service();
        let start = OffsetDateTime::now_utc() - Duration::days(120);
        let billing = billing_started(start);
        let creator_id = billing.creator_id;
        store.insert_creator_billing(&billing).await.unwrap();

        let loaded = service.get(creator_id).await.unwrap();
        assert_eq!(loaded.status, BillingStatus::BillingActive);

        let stored = store.get_creator_billing(creator_id).await.unwrap().unwrap();
        assert_eq!(stored.status, BillingStatus::BillingActive);
    }

    #[tokio::test]
    async fn test_suspend_and_reinstate_after_grace() {
        let (store, service) = service();
        let billing = billing_started(OffsetDateTime::now_utc() - Duration::days(200));
        let creator_id = billing.creator_id;
        store.insert_creator_billing(&billing).await.unwrap();

        let suspended = service
            .change_status(creator_id, StatusAction::Suspend)
            .await
            .unwrap();
        assert_eq!(suspended.status, BillingStatus::Suspended);

        let reinstated = service
            .change_status(creator_id, StatusAction::Reinstate)
            .await
            .unwrap();
        assert_eq!(reinstated.status, BillingStatus::BillingActive);

        let cancelled = service
            .change_status(creator_id, StatusAction::Cancel)
            .await
            .unwrap();
        assert_eq!(cancelled.status, BillingStatus::Cancelled);

        let err = service
            .change_status(creator_id, StatusAction::Reinstate)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_set_commission_validates_and_persists() {
        let (_, service) = service();
        let creator_id = Uuid::new_v4();
        service.enroll(creator_id, "c@example.com").await.unwrap();

        assert!(service.set_commission_percentage(creator_id, 80).await.is_err());
        let updated = service
            .set_commission_percentage(creator_id, 55)
            .await
            .unwrap();
        assert_eq!(updated.commission_percentage, 55);

        let missing = service
            .set_commission_percentage(Uuid::new_v4(), 55)
            .await
            .unwrap_err();
        assert!(matches!(missing, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_record_earning_accumulates_creator_share() {
        let (store, service) = service();
        let billing = billing_started(OffsetDateTime::now_utc() - Duration::days(200));
        let creator_id = billing.creator_id;
        store.insert_creator_billing(&billing).await.unwrap();

        let (after_first, split) = service.record_earning(creator_id, 10_000).await.unwrap();
        assert_eq!(split.creator_cents, 4_000);
        assert_eq!(after_first.total_earned_cents, 4_000);

        let (after_second, _) = service.record_earning(creator_id, 10_000).await.unwrap();
        assert_eq!(after_second.total_earned_cents, 8_000);

        assert!(service.record_earning(creator_id, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_record_earning_handles_amounts_near_i64_max() {
        let (store, service) = service();
        let billing = billing_started(OffsetDateTime::now_utc() - Duration::days(200));
        let creator_id = billing.creator_id;
        store.insert_creator_billing(&billing).await.unwrap();

        let gross = i64::MAX / 10;
        let (_, split) = service.record_earning(creator_id, gross).await.unwrap();
        assert_eq!(split.platform_cents, gross / 100 * 60 + (gross % 100) * 60 / 100);
        assert_eq!(split.creator_cents + split.platform_cents, gross);
    }

    #[tokio::test]
    async fn test_record_referral_increments() {
        let (_, service) = service();
        let creator_id = Uuid::new_v4();
        service.enroll(creator_id, "r@example.com").await.unwrap();
        service.record_referral(creator_id).await.unwrap();
        let billing = service.record_referral(creator_id).await.unwrap();
        assert_eq!(billing.subscribers_referred, 2);
    }

    #[tokio::test]
    async fn test_overview_during_grace() {
        let (_, service) = service();
        let creator_id = Uuid::new_v4();
        service.enroll(creator_id, "o@example.com").await.unwrap();
        let overview = service.overview(creator_id).await.unwrap();
        assert!(overview.in_grace_period);
        assert_eq!(overview.current_commission_rate, 0);
        assert_eq!(overview.creator_share_percentage, 100);
        assert!(overview
            .referral_link
            .ends_with(&overview.billing.referral_code));
    }
}
