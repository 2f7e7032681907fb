//! Durable per-user balance store
//!
//! This module provides the `WalletStore`, which owns every wallet and is
//! the only place wallet balances are mutated. Each mutation is a single
//! atomic read-modify-write under the wallet's own mutex: balances are
//! validated and the new values computed first, then committed together, so
//! a failed operation leaves no partial effect.
//!
//! # Concurrency
//!
//! Wallets live in a `DashMap<UserId, Arc<Mutex<Wallet>>>`. The per-wallet
//! mutex serializes all mutations on the same user; the map's sharding lets
//! different users proceed concurrently. Operations that touch two wallets
//! (transfers, escrow releases) acquire both mutexes in ascending user-id
//! order, which makes deadlock impossible.

use crate::types::{Balance, LedgerError, UserId, Wallet, PLATFORM_ACCOUNT};
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex, MutexGuard};

/// Lock a wallet mutex, recovering the inner value if a writer panicked
fn lock_wallet(cell: &Mutex<Wallet>) -> MutexGuard<'_, Wallet> {
    cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns all wallets; creates them lazily on first use, never deletes them
pub struct WalletStore {
    wallets: DashMap<UserId, Arc<Mutex<Wallet>>>,
}

impl WalletStore {
    /// Create an empty store
    pub fn new() -> Self {
        WalletStore {
            wallets: DashMap::new(),
        }
    }

    /// Get or lazily create the shared cell for a user's wallet
    ///
    /// The map guard is dropped before the caller locks the mutex, so shard
    /// locks are never held across wallet mutations.
    fn cell(&self, user: UserId) -> Arc<Mutex<Wallet>> {
        self.wallets
            .entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(Wallet::new(user))))
            .clone()
    }

    /// Run a closure against one wallet under its mutex
    ///
    /// The wallet is created if it does not exist. `updated_at` is bumped
    /// only when the closure succeeds.
    fn with_wallet<T, F>(&self, user: UserId, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Wallet) -> Result<T, LedgerError>,
    {
        let cell = self.cell(user);
        let mut wallet = lock_wallet(&cell);
        let result = f(&mut wallet);
        if result.is_ok() {
            wallet.updated_at = Utc::now();
        }
        result
    }

    /// Run a closure against two distinct wallets, locks taken in ascending
    /// user-id order
    ///
    /// The closure receives the wallets in the caller's argument order
    /// regardless of which lock was taken first. Closures must validate and
    /// compute every new value before assigning any of them, so an error
    /// return leaves both wallets untouched.
    pub fn with_pair<T, F>(&self, a: UserId, b: UserId, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Wallet, &mut Wallet) -> Result<T, LedgerError>,
    {
        if a == b {
            return Err(LedgerError::invariant(
                "with_pair requires two distinct users",
            ));
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let lo_cell = self.cell(lo);
        let hi_cell = self.cell(hi);
        let mut lo_guard = lock_wallet(&lo_cell);
        let mut hi_guard = lock_wallet(&hi_cell);
        let result = if a < b {
            f(&mut lo_guard, &mut hi_guard)
        } else {
            f(&mut hi_guard, &mut lo_guard)
        };
        if result.is_ok() {
            let now = Utc::now();
            lo_guard.updated_at = now;
            hi_guard.updated_at = now;
        }
        result
    }

    /// Credit funds to a user's available balance
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` if the balance would overflow.
    pub fn credit(&self, user: UserId, amount: Decimal) -> Result<(), LedgerError> {
        self.with_wallet(user, |w| {
            let new_available = w
                .available
                .checked_add(amount)
                .ok_or_else(|| LedgerError::arithmetic_overflow("credit", user))?;
            w.available = new_available;
            Ok(())
        })
    }

    /// Debit funds from a user's available balance
    ///
    /// # Errors
    ///
    /// Returns `InsufficientFunds` if `available < amount`.
    pub fn debit(&self, user: UserId, amount: Decimal) -> Result<(), LedgerError> {
        self.with_wallet(user, |w| {
            if w.available < amount {
                return Err(LedgerError::insufficient_funds(
                    user,
                    w.available,
                    amount,
                    "debit",
                ));
            }
            let new_available = w
                .available
                .checked_sub(amount)
                .ok_or_else(|| LedgerError::arithmetic_underflow("debit", user))?;
            w.available = new_available;
            Ok(())
        })
    }

    /// Debit funds and count them toward the user's lifetime spend
    ///
    /// Used for subscription charges, where the money leaves for the
    /// platform rather than an external payout.
    pub fn debit_spent(&self, user: UserId, amount: Decimal) -> Result<(), LedgerError> {
        self.with_wallet(user, |w| {
            if w.available < amount {
                return Err(LedgerError::insufficient_funds(
                    user,
                    w.available,
                    amount,
                    "debit",
                ));
            }
            let new_available = w
                .available
                .checked_sub(amount)
                .ok_or_else(|| LedgerError::arithmetic_underflow("debit", user))?;
            let new_spent = w
                .total_spent
                .checked_add(amount)
                .ok_or_else(|| LedgerError::arithmetic_overflow("debit", user))?;
            w.available = new_available;
            w.total_spent = new_spent;
            Ok(())
        })
    }

    /// Move funds from available to locked (escrow creation)
    ///
    /// # Errors
    ///
    /// Returns `InsufficientFunds` if `available < amount`.
    pub fn lock(&self, user: UserId, amount: Decimal) -> Result<(), LedgerError> {
        self.with_wallet(user, |w| {
            if w.available < amount {
                return Err(LedgerError::insufficient_funds(
                    user,
                    w.available,
                    amount,
                    "lock",
                ));
            }
            let new_available = w
                .available
                .checked_sub(amount)
                .ok_or_else(|| LedgerError::arithmetic_underflow("lock", user))?;
            let new_locked = w
                .locked
                .checked_add(amount)
                .ok_or_else(|| LedgerError::arithmetic_overflow("lock", user))?;
            w.available = new_available;
            w.locked = new_locked;
            Ok(())
        })
    }

    /// Move funds from locked back to available (escrow refund)
    ///
    /// # Errors
    ///
    /// Returns `InsufficientLockedFunds` if `locked < amount`, which means
    /// escrow bookkeeping and the wallet disagree; callers treat that as
    /// an invariant fault.
    pub fn unlock(&self, user: UserId, amount: Decimal) -> Result<(), LedgerError> {
        self.with_wallet(user, |w| {
            if w.locked < amount {
                return Err(LedgerError::insufficient_locked(
                    user, w.locked, amount, "unlock",
                ));
            }
            let new_locked = w
                .locked
                .checked_sub(amount)
                .ok_or_else(|| LedgerError::arithmetic_underflow("unlock", user))?;
            let new_available = w
                .available
                .checked_add(amount)
                .ok_or_else(|| LedgerError::arithmetic_overflow("unlock", user))?;
            w.locked = new_locked;
            w.available = new_available;
            Ok(())
        })
    }

    /// Settle an escrow release: the payer's locked funds move to the
    /// payee's available balance
    ///
    /// Both wallets are mutated under one pair of locks; lifetime
    /// earned/spent totals are updated on each side.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientLockedFunds` if the payer's locked balance is
    /// short, leaving both wallets untouched.
    pub fn settle_release(
        &self,
        payer: UserId,
        payee: UserId,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        self.with_pair(payer, payee, |p, q| {
            if p.locked < amount {
                return Err(LedgerError::insufficient_locked(
                    payer, p.locked, amount, "release",
                ));
            }
            let p_locked = p
                .locked
                .checked_sub(amount)
                .ok_or_else(|| LedgerError::arithmetic_underflow("release", payer))?;
            let p_spent = p
                .total_spent
                .checked_add(amount)
                .ok_or_else(|| LedgerError::arithmetic_overflow("release", payer))?;
            let q_available = q
                .available
                .checked_add(amount)
                .ok_or_else(|| LedgerError::arithmetic_overflow("release", payee))?;
            let q_earned = q
                .total_earned
                .checked_add(amount)
                .ok_or_else(|| LedgerError::arithmetic_overflow("release", payee))?;
            p.locked = p_locked;
            p.total_spent = p_spent;
            q.available = q_available;
            q.total_earned = q_earned;
            Ok(())
        })
    }

    /// Move a peer transfer: debit the sender `amount + fee`, credit the
    /// recipient `amount`, credit the platform account the fee
    ///
    /// Sender and recipient are mutated under one pair of locks; the fee is
    /// credited to [`PLATFORM_ACCOUNT`] immediately afterwards. A fee-credit
    /// failure after the pair committed is escalated to an invariant fault
    /// rather than silently dropping platform revenue.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientFunds` if the sender cannot cover
    /// `amount + fee`; no balance changes in that case.
    pub fn transfer_funds(
        &self,
        sender: UserId,
        recipient: UserId,
        amount: Decimal,
        fee: Decimal,
    ) -> Result<(), LedgerError> {
        let total = amount
            .checked_add(fee)
            .ok_or_else(|| LedgerError::arithmetic_overflow("transfer", sender))?;
        self.with_pair(sender, recipient, |s, r| {
            if s.available < total {
                return Err(LedgerError::insufficient_funds(
                    sender,
                    s.available,
                    total,
                    "transfer",
                ));
            }
            let s_available = s
                .available
                .checked_sub(total)
                .ok_or_else(|| LedgerError::arithmetic_underflow("transfer", sender))?;
            let s_spent = s
                .total_spent
                .checked_add(total)
                .ok_or_else(|| LedgerError::arithmetic_overflow("transfer", sender))?;
            let r_available = r
                .available
                .checked_add(amount)
                .ok_or_else(|| LedgerError::arithmetic_overflow("transfer", recipient))?;
            let r_earned = r
                .total_earned
                .checked_add(amount)
                .ok_or_else(|| LedgerError::arithmetic_overflow("transfer", recipient))?;
            s.available = s_available;
            s.total_spent = s_spent;
            r.available = r_available;
            r.total_earned = r_earned;
            Ok(())
        })?;
        if fee > Decimal::ZERO {
            self.credit(PLATFORM_ACCOUNT, fee).map_err(|e| {
                tracing::error!(sender, %fee, error = %e, "fee credit failed after transfer committed");
                LedgerError::invariant(format!(
                    "fee credit to platform account failed after transfer from {sender}: {e}"
                ))
            })?;
        }
        Ok(())
    }

    /// Balance snapshot for a user
    ///
    /// Users without a wallet report a zero balance; no wallet is created.
    pub fn balance(&self, user: UserId) -> Balance {
        match self.wallets.get(&user).map(|r| Arc::clone(&r)) {
            Some(cell) => {
                let w = lock_wallet(&cell);
                Balance {
                    available: w.available,
                    locked: w.locked,
                }
            }
            None => Balance::zero(),
        }
    }

    /// Full wallet snapshot, if the user has one
    pub fn snapshot(&self, user: UserId) -> Option<Wallet> {
        self.wallets
            .get(&user)
            .map(|r| Arc::clone(&r))
            .map(|cell| lock_wallet(&cell).clone())
    }

    /// Snapshots of every wallet, in arbitrary order
    pub fn all_wallets(&self) -> Vec<Wallet> {
        let cells: Vec<Arc<Mutex<Wallet>>> = self
            .wallets
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        cells.iter().map(|cell| lock_wallet(cell).clone()).collect()
    }

    /// Total money in the system (sum of every wallet's available + locked)
    ///
    /// Unchanged by transfers and escrow operations; used by the
    /// conservation tests.
    pub fn total_in_system(&self) -> Decimal {
        self.all_wallets().iter().map(|w| w.total()).sum()
    }

    /// Reconciliation hook: overwrite a wallet's available balance
    ///
    /// Only the ledger reconciliation path may call this; it refuses to set
    /// a negative balance.
    pub(crate) fn set_available_for_reconcile(
        &self,
        user: UserId,
        new_available: Decimal,
    ) -> Result<(), LedgerError> {
        self.with_wallet(user, |w| {
            if new_available < Decimal::ZERO {
                return Err(LedgerError::invariant(format!(
                    "reconciliation would set available balance of user {user} to {new_available}"
                )));
            }
            w.available = new_available;
            Ok(())
        })
    }
}

impl Default for WalletStore {
    fn default() -> Self {
        Self::new()
    }
}
