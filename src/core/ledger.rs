//! Append-only transaction ledger
//!
//! Every balance-affecting event is recorded here as an immutable row.
//! Rows are never updated or deleted. Because the ledger is the only object
//! that can reconstruct state after a crash, it is also the source of truth
//! for reconciliation: a wallet whose `available + locked` disagrees with
//! the fold of its ledger entries is corrected toward the ledger.

use crate::core::wallet_store::WalletStore;
use crate::types::{LedgerError, Transaction, TransactionKind, TxId, UserId};
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Result of reconciling one user's wallet against their ledger entries
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub user: UserId,
    /// `available + locked` recomputed from the ledger fold
    pub ledger_total: Decimal,
    /// `available + locked` the wallet reported before correction
    pub wallet_total: Decimal,
    /// `ledger_total - wallet_total`; zero when already consistent
    pub drift: Decimal,
    /// Whether the wallet was rewritten to match the ledger
    pub corrected: bool,
}

/// Append-only audit log of every balance-affecting event
pub struct TransactionLedger {
    /// Per-user entry lists; rows are pushed in ascending id order
    entries: DashMap<UserId, Vec<Transaction>>,
    next_id: AtomicU64,
}

impl TransactionLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        TransactionLedger {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append one entry for a user
    ///
    /// `amount` is the signed change to `available + locked` (negative =
    /// debit); balance-neutral bucket moves are recorded with amount 0.
    /// Never updates or deletes existing rows.
    pub fn record(
        &self,
        user: UserId,
        kind: TransactionKind,
        amount: Decimal,
        related_id: Option<u64>,
    ) -> Transaction {
        let tx = Transaction {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            user_id: user,
            kind,
            amount,
            related_id,
            created_at: Utc::now(),
        };
        self.entries.entry(user).or_default().push(tx.clone());
        tx
    }

    /// Page through a user's history, newest first
    ///
    /// `cursor` is the id of the last row the caller saw; pass `None` to
    /// start from the newest row. The sequence is restartable: re-issuing
    /// the same cursor returns the same page even if newer rows were
    /// appended in between.
    pub fn history(&self, user: UserId, cursor: Option<TxId>, limit: usize) -> Vec<Transaction> {
        match self.entries.get(&user) {
            Some(rows) => rows
                .iter()
                .rev()
                .filter(|tx| cursor.map_or(true, |c| tx.id < c))
                .take(limit)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Number of entries recorded for a user
    pub fn count(&self, user: UserId) -> usize {
        self.entries.get(&user).map_or(0, |rows| rows.len())
    }

    /// Fold a user's entries into their expected `available + locked`
    pub fn balance_from_ledger(&self, user: UserId) -> Decimal {
        self.entries
            .get(&user)
            .map_or(Decimal::ZERO, |rows| rows.iter().map(|tx| tx.amount).sum())
    }

    /// Compare a wallet against its ledger fold and correct drift
    ///
    /// If the wallet disagrees with the ledger, the available balance is
    /// rewritten so that `available + locked` matches the fold (locked funds
    /// are backed by escrow records and are not touched).
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` if the correction would require a
    /// negative available balance; the wallet is left as-is and must be
    /// investigated manually.
    pub fn reconcile(
        &self,
        user: UserId,
        wallets: &WalletStore,
    ) -> Result<ReconcileOutcome, LedgerError> {
        let ledger_total = self.balance_from_ledger(user);
        let balance = wallets.balance(user);
        let wallet_total = balance.available + balance.locked;
        let drift = ledger_total - wallet_total;

        if drift.is_zero() {
            return Ok(ReconcileOutcome {
                user,
                ledger_total,
                wallet_total,
                drift,
                corrected: false,
            });
        }

        warn!(
            user,
            %ledger_total,
            %wallet_total,
            %drift,
            "wallet drifted from ledger, correcting toward ledger"
        );
        let new_available = ledger_total - balance.locked;
        wallets.set_available_for_reconcile(user, new_available)?;

        Ok(ReconcileOutcome {
            user,
            ledger_total,
            wallet_total,
            drift,
            corrected: true,
        })
    }
}

impl Default for TransactionLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_assigns_increasing_ids() {
        let ledger = TransactionLedger::new();
        let a = ledger.record(1, TransactionKind::Deposit, Decimal::from(10), None);
        let b = ledger.record(1, TransactionKind::Deposit, Decimal::from(20), None);
        assert!(b.id > a.id);
        assert_eq!(ledger.count(1), 2);
    }

    #[test]
    fn test_history_is_newest_first() {
        let ledger = TransactionLedger::new();
        ledger.record(1, TransactionKind::Deposit, Decimal::from(10), None);
        ledger.record(1, TransactionKind::Deposit, Decimal::from(20), None);
        ledger.record(1, TransactionKind::Withdrawal, Decimal::from(-5), None);

        let page = ledger.history(1, None, 10);
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].kind, TransactionKind::Withdrawal);
        assert_eq!(page[2].amount, Decimal::from(10));
    }

    #[test]
    fn test_history_cursor_restarts_where_it_left_off() {
        let ledger = TransactionLedger::new();
        for i in 1..=5 {
            ledger.record(1, TransactionKind::Deposit, Decimal::from(i), None);
        }

        let first = ledger.history(1, None, 2);
        assert_eq!(first.len(), 2);

        let cursor = first.last().map(|tx| tx.id);
        let second = ledger.history(1, cursor, 2);
        assert_eq!(second.len(), 2);
        assert!(second[0].id < first[1].id);

        // The same cursor returns the same page even after new appends
        ledger.record(1, TransactionKind::Deposit, Decimal::from(99), None);
        assert_eq!(ledger.history(1, cursor, 2), second);
    }

    #[test]
    fn test_history_for_unknown_user_is_empty() {
        let ledger = TransactionLedger::new();
        assert!(ledger.history(42, None, 10).is_empty());
    }

    #[test]
    fn test_balance_from_ledger_folds_signed_amounts() {
        let ledger = TransactionLedger::new();
        ledger.record(1, TransactionKind::Deposit, Decimal::from(100), None);
        ledger.record(1, TransactionKind::Withdrawal, Decimal::from(-30), None);
        ledger.record(1, TransactionKind::EscrowLock, Decimal::ZERO, Some(7));

        assert_eq!(ledger.balance_from_ledger(1), Decimal::from(70));
    }

    #[test]
    fn test_reconcile_reports_consistent_wallet() {
        let ledger = TransactionLedger::new();
        let wallets = WalletStore::new();

        wallets.credit(1, Decimal::from(100)).unwrap();
        ledger.record(1, TransactionKind::Deposit, Decimal::from(100), None);

        let outcome = ledger.reconcile(1, &wallets).unwrap();
        assert!(!outcome.corrected);
        assert_eq!(outcome.drift, Decimal::ZERO);
    }

    #[test]
    fn test_reconcile_corrects_drifted_wallet() {
        let ledger = TransactionLedger::new();
        let wallets = WalletStore::new();

        // Ledger says 100 arrived, but the wallet write was lost
        ledger.record(1, TransactionKind::Deposit, Decimal::from(100), None);
        wallets.credit(1, Decimal::from(40)).unwrap();

        let outcome = ledger.reconcile(1, &wallets).unwrap();
        assert!(outcome.corrected);
        assert_eq!(outcome.drift, Decimal::from(60));
        assert_eq!(wallets.balance(1).available, Decimal::from(100));
    }

    #[test]
    fn test_reconcile_preserves_locked_funds() {
        let ledger = TransactionLedger::new();
        let wallets = WalletStore::new();

        ledger.record(1, TransactionKind::Deposit, Decimal::from(100), None);
        ledger.record(1, TransactionKind::EscrowLock, Decimal::ZERO, Some(3));
        wallets.credit(1, Decimal::from(100)).unwrap();
        wallets.lock(1, Decimal::from(60)).unwrap();

        let outcome = ledger.reconcile(1, &wallets).unwrap();
        assert!(!outcome.corrected);
        assert_eq!(wallets.balance(1).locked, Decimal::from(60));
        assert_eq!(wallets.balance(1).available, Decimal::from(40));
    }

    #[test]
    fn test_reconcile_refuses_negative_available() {
        let ledger = TransactionLedger::new();
        let wallets = WalletStore::new();

        // Locked exceeds what the ledger can account for
        wallets.credit(1, Decimal::from(100)).unwrap();
        wallets.lock(1, Decimal::from(100)).unwrap();
        ledger.record(1, TransactionKind::Deposit, Decimal::from(50), None);

        let result = ledger.reconcile(1, &wallets);
        assert!(matches!(
            result,
            Err(LedgerError::InvariantViolation { .. })
        ));
    }
}
