//! Billing policy configuration

use crate::error::{BillingError, BillingResult};
use crate::pricing::{PriceTable, DEFAULT_BLOCK_PRICE_CENTS};

/// Policy knobs for creator billing, loaded from the environment
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub price_table: PriceTable,
    /// ISO currency code in lowercase (e.g. "brl")
    pub currency: String,
    pub monthly_fee_cents: i64,
    /// Free blocks granted when a creator enrolls
    pub signup_free_blocks: i64,
    pub signup_free_block_days: i64,
    pub max_blocks_per_purchase: i64,
    pub referral_base_url: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            price_table: PriceTable::default(),
            currency: "brl".to_string(),
            monthly_fee_cents: 4_990,
            signup_free_blocks: 1,
            signup_free_block_days: 90,
            max_blocks_per_purchase: 100,
            referral_base_url: "http://localhost:3000/r".to_string(),
            checkout_success_url: "http://localhost:3000/creator/storage?checkout=success"
                .to_string(),
            checkout_cancel_url: "http://localhost:3000/creator/storage?checkout=cancelled"
                .to_string(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

impl BillingConfig {
    /// Load from environment, falling back to defaults for unset keys
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let config = Self {
            price_table: PriceTable::with_base_price(env_or(
                "BLOCK_PRICE_CENTS",
                DEFAULT_BLOCK_PRICE_CENTS,
            )?),
            currency: env_or("BILLING_CURRENCY", defaults.currency)?.to_lowercase(),
            monthly_fee_cents: env_or("CREATOR_MONTHLY_FEE_CENTS", defaults.monthly_fee_cents)?,
            signup_free_blocks: env_or("SIGNUP_FREE_BLOCKS", defaults.signup_free_blocks)?,
            signup_free_block_days: env_or(
                "SIGNUP_FREE_BLOCK_DAYS",
                defaults.signup_free_block_days,
            )?,
            max_blocks_per_purchase: env_or(
                "MAX_BLOCKS_PER_PURCHASE",
                defaults.max_blocks_per_purchase,
            )?,
            referral_base_url: env_or("REFERRAL_BASE_URL", defaults.referral_base_url)?,
            checkout_success_url: env_or("CHECKOUT_SUCCESS_URL", defaults.checkout_success_url)?,
            checkout_cancel_url: env_or("CHECKOUT_CANCEL_URL", defaults.checkout_cancel_url)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.price_table.base_price_cents() <= 0 {
            return Err(BillingError::Config(
                "BLOCK_PRICE_CENTS must be positive".into(),
            ));
        }
        if self.max_blocks_per_purchase < 1 {
            return Err(BillingError::Config(
                "MAX_BLOCKS_PER_PURCHASE must be at least 1".into(),
            ));
        }
        if self.signup_free_blocks < 0 || self.signup_free_block_days < 0 {
            return Err(BillingError::Config(
                "sign-up free block grant cannot be negative".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BillingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_price_is_rejected() {
        let config = BillingConfig {
            price_table: PriceTable::with_base_price(0),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BillingError::Config(_))));
    }
}
