//! Block pricing
//!
//! Blocks are sold at a flat per-block price with a volume discount looked
//! up from a fixed table (not a formula):
//!
//! | Blocks | Discount |
//! |--------|----------|
//! | 1-4    | 0%       |
//! | 5-9    | 5%       |
//! | 10+    | 10%      |

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Default price per block: 1000 currency units
pub const DEFAULT_BLOCK_PRICE_CENTS: i64 = 100_000;

/// A volume discount tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountTier {
    pub min_blocks: i64,
    pub discount_percent: i64,
}

/// Default discount schedule, highest threshold first
pub const DEFAULT_DISCOUNT_TIERS: [DiscountTier; 2] = [
    DiscountTier {
        min_blocks: 10,
        discount_percent: 10,
    },
    DiscountTier {
        min_blocks: 5,
        discount_percent: 5,
    },
];

/// Price breakdown for a block purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    pub blocks: i64,
    pub unit_price_cents: i64,
    pub discount_percent: i64,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTable {
    base_price_cents: i64,
    /// Sorted by `min_blocks` descending
    tiers: Vec<DiscountTier>,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_PRICE_CENTS, DEFAULT_DISCOUNT_TIERS.to_vec())
    }
}

impl PriceTable {
    pub fn new(base_price_cents: i64, mut tiers: Vec<DiscountTier>) -> Self {
        tiers.sort_by(|a, b| b.min_blocks.cmp(&a.min_blocks));
        Self {
            base_price_cents,
            tiers,
        }
    }

    pub fn with_base_price(base_price_cents: i64) -> Self {
        Self::new(base_price_cents, DEFAULT_DISCOUNT_TIERS.to_vec())
    }

    pub fn base_price_cents(&self) -> i64 {
        self.base_price_cents
    }

    pub fn tiers(&self) -> &[DiscountTier] {
        &self.tiers
    }

    /// Discount percentage that applies to a purchase of `blocks`
    pub fn discount_percent_for(&self, blocks: i64) -> i64 {
        self.tiers
            .iter()
            .find(|tier| blocks >= tier.min_blocks)
            .map(|tier| tier.discount_percent)
            .unwrap_or(0)
    }

    /// Price a purchase of `blocks` blocks
    pub fn quote(&self, blocks: i64) -> BillingResult<PriceQuote> {
        if blocks < 1 {
            return Err(BillingError::InvalidInput(format!(
                "blocks must be at least 1, got {}",
                blocks
            )));
        }

        let subtotal_cents = blocks
            .checked_mul(self.base_price_cents)
            .ok_or_else(|| BillingError::InvalidInput("purchase amount overflows".into()))?;
        let discount_percent = self.discount_percent_for(blocks);
        let amount_cents = subtotal_cents
            .checked_mul(100 - discount_percent)
            .map(|v| v / 100)
            .ok_or_else(|| BillingError::InvalidInput("purchase amount overflows".into()))?;

        Ok(PriceQuote {
            blocks,
            unit_price_cents: self.base_price_cents,
            discount_percent,
            subtotal_cents,
            discount_cents: subtotal_cents - amount_cents,
            amount_cents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_block_has_no_discount() {
        let quote = PriceTable::default().quote(1).unwrap();
        assert_eq!(quote.discount_percent, 0);
        assert_eq!(quote.amount_cents, 100_000);
    }

    #[test]
    fn test_five_blocks_get_five_percent() {
        // 5 * 1000 * 0.95 * 100
        let quote = PriceTable::default().quote(5).unwrap();
        assert_eq!(quote.discount_percent, 5);
        assert_eq!(quote.subtotal_cents, 500_000);
        assert_eq!(quote.amount_cents, 475_000);
        assert_eq!(quote.discount_cents, 25_000);
    }

    #[test]
    fn test_tier_boundaries() {
        let table = PriceTable::default();
        assert_eq!(table.discount_percent_for(4), 0);
        assert_eq!(table.discount_percent_for(5), 5);
        assert_eq!(table.discount_percent_for(9), 5);
        assert_eq!(table.discount_percent_for(10), 10);
        assert_eq!(table.discount_percent_for(250), 10);
    }

    #[test]
    fn test_ten_blocks_get_ten_percent() {
        let quote = PriceTable::default().quote(10).unwrap();
        assert_eq!(quote.amount_cents, 900_000);
    }

    #[test]
    fn test_zero_or_negative_blocks_rejected() {
        let table = PriceTable::default();
        assert!(matches!(table.quote(0), Err(BillingError::InvalidInput(_))));
        assert!(matches!(table.quote(-3), Err(BillingError::InvalidInput(_))));
    }

    #[test]
    fn test_overflow_is_rejected() {
        let table = PriceTable::with_base_price(i64::MAX / 2);
        assert!(table.quote(3).is_err());
    }

    #[test]
    fn test_unsorted_tiers_are_normalised() {
        let table = PriceTable::new(
            1_000,
            vec![
                DiscountTier {
                    min_blocks: 2,
                    discount_percent: 1,
                },
                DiscountTier {
                    min_blocks: 20,
                    discount_percent: 20,
                },
            ],
        );
        assert_eq!(table.discount_percent_for(25), 20);
        assert_eq!(table.discount_percent_for(3), 1);
    }
}
