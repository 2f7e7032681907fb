//! Fee and limit configuration
//!
//! The tier table is configuration, not behavior: swapping the ceilings (or
//! deserializing a different table from an ops config file) must never touch
//! `TransferService`. Defaults below match the platform's launch values.

use crate::types::Tier;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Daily and per-transaction ceilings for one tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Maximum total transfer volume per calendar day (UTC)
    pub daily: Decimal,
    /// Maximum amount for a single transfer
    pub per_transaction: Decimal,
}

/// Transfer fee and tier-limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Transfers strictly below this amount are fee-free
    pub free_threshold: Decimal,
    /// Fee rate applied at or above the threshold
    pub fee_rate: Decimal,
    /// Lower clamp on the computed fee
    pub fee_min: Decimal,
    /// Upper clamp on the computed fee
    pub fee_max: Decimal,
    pub free: TierLimits,
    pub pro: TierLimits,
    pub enterprise: TierLimits,
}

impl LimitConfig {
    /// Limits for a tier
    pub fn for_tier(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        LimitConfig {
            free_threshold: Decimal::from(100),
            // 1%, clamped to [1, 25]
            fee_rate: Decimal::new(1, 2),
            fee_min: Decimal::ONE,
            fee_max: Decimal::from(25),
            free: TierLimits {
                daily: Decimal::from(500),
                per_transaction: Decimal::from(500),
            },
            pro: TierLimits {
                daily: Decimal::from(5_000),
                per_transaction: Decimal::from(2_000),
            },
            enterprise: TierLimits {
                daily: Decimal::from(50_000),
                per_transaction: Decimal::from(10_000),
            },
        }
    }
}
