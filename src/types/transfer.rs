//! Peer-to-peer transfer types

use super::ids::{TransferId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Subscription tier controlling transfer limits
///
/// The tier only selects a row in the limit configuration; the ceilings
/// themselves live in [`crate::config::LimitConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Free
    }
}

/// A completed internal transfer
///
/// Transfers are synchronous and all-or-nothing, so a stored record is
/// terminal by construction and carries no status field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    /// Amount credited to the recipient
    pub amount: Decimal,
    /// Fee debited from the sender on top of `amount`
    pub fee: Decimal,
    pub note: String,
    pub created_at: DateTime<Utc>,
}
