//! Ledger transaction types
//!
//! A [`Transaction`] is one immutable row in the append-only audit trail.
//! Rows are never updated or deleted; they are the only objects that can
//! reconstruct wallet state after a crash.

use super::ids::{TxId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Kinds of balance-affecting events recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// External deposit confirmed by a gateway collaborator
    Deposit,

    /// Payout debited from the wallet (the gateway performs the payout)
    Withdrawal,

    /// Funds moved from available to locked for a new escrow
    ///
    /// Balance-neutral: recorded with amount 0 as an audit marker, since
    /// `available + locked` is unchanged by the move.
    EscrowLock,

    /// Payer side of an escrow release; funds leave the payer's wallet
    EscrowRelease,

    /// Sender side of a peer transfer (amount plus fee)
    TransferOut,

    /// Recipient side of a peer transfer
    TransferIn,

    /// Transfer fee credited to the platform account
    Fee,

    /// Payee side of a milestone escrow release
    MilestonePayment,

    /// Subscription charge (debit for the member, credit for the platform)
    SubscriptionPayment,

    /// Escrowed funds returned to the payer (balance-neutral marker)
    Refund,
}

/// Immutable ledger entry
///
/// `amount` is signed: negative values are debits. For every user the sum
/// of all entry amounts equals `available + locked` of the wallet, which is
/// what reconciliation checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Globally unique, monotonically increasing row id
    pub id: TxId,

    /// The wallet this entry applies to
    pub user_id: UserId,

    /// What kind of event produced this entry
    pub kind: TransactionKind,

    /// Signed change to `available + locked` (negative = debit)
    pub amount: Decimal,

    /// The escrow, milestone, or transfer that produced this entry
    pub related_id: Option<u64>,

    /// When the entry was appended
    pub created_at: DateTime<Utc>,
}
