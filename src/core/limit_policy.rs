//! Fee and limit policy
//!
//! Pure computation, no I/O. The [`LimitPolicy`] trait is the seam that lets
//! `TransferService` stay ignorant of the concrete fee schedule and tier
//! table; [`ConfigLimitPolicy`] is the default implementation backed by
//! [`LimitConfig`].

use crate::config::{LimitConfig, TierLimits};
use crate::types::{LedgerError, Tier};
use rust_decimal::Decimal;

/// Fee computation and tiered limit checks for internal transfers
pub trait LimitPolicy: Send + Sync {
    /// Fee charged on top of `amount`
    fn fee(&self, amount: Decimal) -> Decimal;

    /// Daily and per-transaction ceilings for a tier
    fn tier_limits(&self, tier: Tier) -> TierLimits;

    /// Validate a prospective transfer against both ceilings
    ///
    /// Checks the per-transaction ceiling first, then the daily ceiling
    /// given the volume already used today.
    ///
    /// # Errors
    ///
    /// Returns `PerTransactionLimitExceeded` or `DailyLimitExceeded` with
    /// the limit values and remaining headroom filled in.
    fn check(&self, tier: Tier, used_today: Decimal, amount: Decimal) -> Result<(), LedgerError> {
        let limits = self.tier_limits(tier);
        if amount > limits.per_transaction {
            return Err(LedgerError::PerTransactionLimitExceeded {
                amount,
                limit: limits.per_transaction,
                tier,
            });
        }
        if used_today + amount > limits.daily {
            return Err(LedgerError::daily_limit_exceeded(
                used_today,
                limits.daily,
                tier,
            ));
        }
        Ok(())
    }
}

/// Default policy driven by [`LimitConfig`]
///
/// Fee schedule: free below `free_threshold`, otherwise
/// `clamp(amount * fee_rate, fee_min, fee_max)`.
#[derive(Debug, Clone)]
pub struct ConfigLimitPolicy {
    config: LimitConfig,
}

impl ConfigLimitPolicy {
    pub fn new(config: LimitConfig) -> Self {
        ConfigLimitPolicy { config }
    }
}

impl Default for ConfigLimitPolicy {
    fn default() -> Self {
        Self::new(LimitConfig::default())
    }
}

impl LimitPolicy for ConfigLimitPolicy {
    fn fee(&self, amount: Decimal) -> Decimal {
        if amount < self.config.free_threshold {
            return Decimal::ZERO;
        }
        (amount * self.config.fee_rate).clamp(self.config.fee_min, self.config.fee_max)
    }

    fn tier_limits(&self, tier: Tier) -> TierLimits {
        self.config.for_tier(tier)
    }
}
