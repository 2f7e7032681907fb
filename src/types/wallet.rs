//! Wallet types
//!
//! A wallet tracks a user's spendable (`available`) and escrowed (`locked`)
//! funds, plus lifetime earned/spent totals for dashboards. Wallets are
//! created lazily on the first balance-affecting event and never deleted.

use super::ids::UserId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-user balance record
///
/// Invariants (enforced by [`crate::core::WalletStore`]):
/// - `available >= 0` and `locked >= 0` at all times
/// - `available` never includes funds already locked in an escrow
/// - `available + locked` equals the sum of the user's ledger entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    /// Owner of this wallet
    pub user_id: UserId,

    /// Funds spendable right now (withdrawals, transfers, new escrows)
    pub available: Decimal,

    /// Funds committed to open escrows where this user is the payer
    ///
    /// Moved out of `available` when an escrow is created and either
    /// settled to the payee on release or returned to `available` on
    /// refund.
    pub locked: Decimal,

    /// Lifetime earnings credited to this wallet (milestone payments,
    /// incoming transfers)
    pub total_earned: Decimal,

    /// Lifetime spend debited from this wallet (released escrows, outgoing
    /// transfers including fees, subscription charges)
    pub total_spent: Decimal,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Create a zeroed wallet for a user
    pub fn new(user_id: UserId) -> Self {
        Wallet {
            user_id,
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
            total_earned: Decimal::ZERO,
            total_spent: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// Sum of available and locked funds
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

/// Balance snapshot returned by read APIs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// Spendable funds
    pub available: Decimal,
    /// Funds committed to open escrows
    pub locked: Decimal,
}

impl Balance {
    /// Zero balance, used for users without a wallet yet
    pub fn zero() -> Self {
        Balance {
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
        }
    }
}
