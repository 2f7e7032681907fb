//! Escrow creation, release, and refund
//!
//! An escrow locks funds out of the payer's available balance until they
//! are released to the payee or refunded. This module owns the escrow
//! records and drives the paired wallet/ledger writes; releases are
//! idempotent per `(escrow, milestone)` so webhook-style retries cannot
//! double-pay.

use crate::core::events::EventSink;
use crate::core::ledger::TransactionLedger;
use crate::core::wallet_store::WalletStore;
use crate::types::{
    DomainEvent, Escrow, EscrowId, EscrowStatus, LedgerError, MilestoneId, ProjectId, ProposalId,
    TransactionKind, UserId,
};
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Manages escrow holds tied to projects and milestone plans
pub struct EscrowManager {
    wallets: Arc<WalletStore>,
    ledger: Arc<TransactionLedger>,
    events: Arc<dyn EventSink>,
    escrows: DashMap<EscrowId, Escrow>,
    /// Latest escrow per project, for the dashboard read API
    by_project: DashMap<ProjectId, EscrowId>,
    /// Open escrow per (project, plan); makes `create_escrow` idempotent
    /// under request retries
    open_by_key: DashMap<(ProjectId, Option<ProposalId>), EscrowId>,
    /// Milestones already paid out, keyed per escrow; rejects duplicate
    /// releases even under retries
    released_milestones: DashSet<(EscrowId, MilestoneId)>,
    next_id: AtomicU64,
}

impl EscrowManager {
    pub fn new(
        wallets: Arc<WalletStore>,
        ledger: Arc<TransactionLedger>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        EscrowManager {
            wallets,
            ledger,
            events,
            escrows: DashMap::new(),
            by_project: DashMap::new(),
            open_by_key: DashMap::new(),
            released_milestones: DashSet::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create an escrow by locking `amount` out of the payer's available
    /// balance
    ///
    /// Retried calls for the same `(project, milestone_plan)` return the
    /// already-open escrow instead of locking twice. A shortfall fails with
    /// a structured `InsufficientBalance` (and emits the matching domain
    /// event) so the caller can prompt a top-up.
    ///
    /// # Errors
    ///
    /// - `InvalidAmount` for a non-positive amount
    /// - `InsufficientBalance` when the payer cannot cover `amount`
    pub fn create_escrow(
        &self,
        payer_id: UserId,
        payee_id: UserId,
        project_id: ProjectId,
        amount: Decimal,
        currency: &str,
        milestone_plan_id: Option<ProposalId>,
    ) -> Result<Escrow, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(amount, "create_escrow"));
        }
        if payer_id == payee_id {
            return Err(LedgerError::invariant(
                "escrow payer and payee must be different users",
            ));
        }

        // Idempotent retry: an open escrow for this key already holds the funds
        let key = (project_id, milestone_plan_id);
        if let Some(existing_id) = self.open_by_key.get(&key).map(|r| *r) {
            if let Some(existing) = self.escrows.get(&existing_id) {
                if existing.is_open() {
                    return Ok(existing.clone());
                }
            }
        }

        // The lock itself re-validates under the wallet mutex; mapping the
        // guard error here avoids a check-then-lock race.
        if let Err(err) = self.wallets.lock(payer_id, amount) {
            let err = err.into_balance_error(amount);
            if let LedgerError::InsufficientBalance {
                user,
                required,
                available,
                shortfall,
            } = &err
            {
                self.events.emit(DomainEvent::InsufficientBalance {
                    user_id: *user,
                    required: *required,
                    available: *available,
                    shortfall: *shortfall,
                });
            }
            return Err(err);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let escrow = Escrow {
            id,
            payer_id,
            payee_id,
            project_id,
            milestone_plan_id,
            amount,
            currency: currency.to_string(),
            released_amount: Decimal::ZERO,
            refunded_amount: Decimal::ZERO,
            status: EscrowStatus::Locked,
            created_at: Utc::now(),
        };
        self.escrows.insert(id, escrow.clone());
        self.by_project.insert(project_id, id);
        self.open_by_key.insert(key, id);

        // Balance-neutral audit marker: lock moves funds between buckets
        self.ledger
            .record(payer_id, TransactionKind::EscrowLock, Decimal::ZERO, Some(id));

        info!(escrow = id, payer = payer_id, payee = payee_id, %amount, "escrow created");
        self.events.emit(DomainEvent::EscrowCreated {
            escrow_id: id,
            project_id,
            payer_id,
            amount,
        });

        Ok(escrow)
    }

    /// Release part or all of an escrow to the payee
    ///
    /// Passing the milestone id makes the release idempotent: a second call
    /// for the same milestone fails with `DuplicateRelease` and changes no
    /// balances. The payer's ledger entry is `EscrowRelease -amount` (the
    /// funds leave their wallet), the payee's is `MilestonePayment +amount`
    /// for milestone releases or `EscrowRelease +amount` otherwise.
    ///
    /// # Errors
    ///
    /// - `EscrowNotFound` / `EscrowClosed` for unknown or terminal escrows
    /// - `ReleaseExceedsEscrow` when `released + amount` would exceed the
    ///   escrow amount
    /// - `DuplicateRelease` for an already-paid milestone
    pub fn release(
        &self,
        escrow_id: EscrowId,
        amount: Decimal,
        milestone_id: Option<MilestoneId>,
    ) -> Result<Escrow, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(amount, "release"));
        }

        // Holding the entry serializes releases of the same escrow, which
        // keeps released_amount monotone under concurrent calls.
        let mut entry = self
            .escrows
            .get_mut(&escrow_id)
            .ok_or(LedgerError::EscrowNotFound { escrow: escrow_id })?;

        if !entry.is_open() {
            return Err(LedgerError::EscrowClosed {
                escrow: escrow_id,
                status: entry.status,
            });
        }
        if entry.released_amount + amount > entry.amount
            || amount > entry.remaining()
        {
            return Err(LedgerError::ReleaseExceedsEscrow {
                escrow: escrow_id,
                remaining: entry.remaining(),
                requested: amount,
            });
        }

        if let Some(milestone) = milestone_id {
            // insert returns false when the key is already present
            if !self.released_milestones.insert((escrow_id, milestone)) {
                return Err(LedgerError::DuplicateRelease {
                    escrow: escrow_id,
                    milestone,
                });
            }
        }

        if let Err(err) = self
            .wallets
            .settle_release(entry.payer_id, entry.payee_id, amount)
        {
            // Allow a clean retry after a failed wallet write
            if let Some(milestone) = milestone_id {
                self.released_milestones.remove(&(escrow_id, milestone));
            }
            return Err(err);
        }

        entry.released_amount += amount;
        entry.status = recompute_status(&entry);

        let related = milestone_id.or(Some(escrow_id));
        self.ledger.record(
            entry.payer_id,
            TransactionKind::EscrowRelease,
            -amount,
            related,
        );
        let payee_kind = if milestone_id.is_some() {
            TransactionKind::MilestonePayment
        } else {
            TransactionKind::EscrowRelease
        };
        self.ledger
            .record(entry.payee_id, payee_kind, amount, related);

        info!(
            escrow = escrow_id,
            ?milestone_id,
            %amount,
            status = ?entry.status,
            "escrow released"
        );
        Ok(entry.clone())
    }

    /// Return part or all of the remaining escrow to the payer
    ///
    /// Used when a milestone or plan is cancelled. The move is
    /// balance-neutral for the payer (locked back to available), so the
    /// ledger records a zero-amount `Refund` marker.
    ///
    /// # Errors
    ///
    /// Mirrors [`EscrowManager::release`], with the refund amount checked
    /// against the escrow's remaining funds.
    pub fn refund(&self, escrow_id: EscrowId, amount: Decimal) -> Result<Escrow, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(amount, "refund"));
        }

        let mut entry = self
            .escrows
            .get_mut(&escrow_id)
            .ok_or(LedgerError::EscrowNotFound { escrow: escrow_id })?;

        if !entry.is_open() {
            return Err(LedgerError::EscrowClosed {
                escrow: escrow_id,
                status: entry.status,
            });
        }
        if amount > entry.remaining() {
            return Err(LedgerError::ReleaseExceedsEscrow {
                escrow: escrow_id,
                remaining: entry.remaining(),
                requested: amount,
            });
        }

        self.wallets.unlock(entry.payer_id, amount)?;

        entry.refunded_amount += amount;
        entry.status = recompute_status(&entry);

        self.ledger.record(
            entry.payer_id,
            TransactionKind::Refund,
            Decimal::ZERO,
            Some(escrow_id),
        );

        info!(escrow = escrow_id, %amount, status = ?entry.status, "escrow refunded");
        Ok(entry.clone())
    }

    /// Escrow by id
    pub fn get(&self, escrow_id: EscrowId) -> Option<Escrow> {
        self.escrows.get(&escrow_id).map(|e| e.clone())
    }

    /// Latest escrow for a project
    pub fn for_project(&self, project_id: ProjectId) -> Option<Escrow> {
        self.by_project
            .get(&project_id)
            .and_then(|id| self.escrows.get(&*id).map(|e| e.clone()))
    }
}

/// Derive the status from the release/refund accounting
fn recompute_status(escrow: &Escrow) -> EscrowStatus {
    if escrow.remaining().is_zero() {
        if escrow.refunded_amount > Decimal::ZERO {
            EscrowStatus::Refunded
        } else {
            EscrowStatus::Completed
        }
    } else if escrow.released_amount > Decimal::ZERO || escrow.refunded_amount > Decimal::ZERO {
        EscrowStatus::PartiallyReleased
    } else {
        EscrowStatus::Locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::NullSink;

    fn setup() -> (Arc<WalletStore>, Arc<TransactionLedger>, EscrowManager) {
        let wallets = Arc::new(WalletStore::new());
        let ledger = Arc::new(TransactionLedger::new());
        let manager = EscrowManager::new(
            Arc::clone(&wallets),
            Arc::clone(&ledger),
            Arc::new(NullSink),
        );
        (wallets, ledger, manager)
    }

    #[test]
    fn test_create_escrow_locks_payer_funds() {
        let (wallets, ledger, manager) = setup();
        wallets.credit(1, Decimal::from(500)).unwrap();

        let escrow = manager
            .create_escrow(1, 2, 10, Decimal::from(500), "USD", None)
            .unwrap();

        assert_eq!(escrow.status, EscrowStatus::Locked);
        let balance = wallets.balance(1);
        assert_eq!(balance.available, Decimal::ZERO);
        assert_eq!(balance.locked, Decimal::from(500));

        // Lock marker is balance-neutral
        let rows = ledger.history(1, None, 10);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, TransactionKind::EscrowLock);
        assert_eq!(rows[0].amount, Decimal::ZERO);
    }

    #[test]
    fn test_create_escrow_reports_shortfall() {
        let (wallets, _, manager) = setup();
        wallets.credit(1, Decimal::from(300)).unwrap();

        let result = manager.create_escrow(1, 2, 10, Decimal::from(500), "USD", None);
        match result {
            Err(LedgerError::InsufficientBalance {
                required,
                available,
                shortfall,
                ..
            }) => {
                assert_eq!(required, Decimal::from(500));
                assert_eq!(available, Decimal::from(300));
                assert_eq!(shortfall, Decimal::from(200));
            }
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }
        // Nothing locked on failure
        assert_eq!(wallets.balance(1).locked, Decimal::ZERO);
    }

    #[test]
    fn test_create_escrow_retry_returns_existing_hold() {
        let (wallets, _, manager) = setup();
        wallets.credit(1, Decimal::from(1_000)).unwrap();

        let first = manager
            .create_escrow(1, 2, 10, Decimal::from(400), "USD", Some(77))
            .unwrap();
        let retry = manager
            .create_escrow(1, 2, 10, Decimal::from(400), "USD", Some(77))
            .unwrap();

        assert_eq!(first.id, retry.id);
        // Funds locked once, not twice
        assert_eq!(wallets.balance(1).locked, Decimal::from(400));
    }

    #[test]
    fn test_partial_release_moves_funds_to_payee() {
        let (wallets, _, manager) = setup();
        wallets.credit(1, Decimal::from(500)).unwrap();
        let escrow = manager
            .create_escrow(1, 2, 10, Decimal::from(500), "USD", None)
            .unwrap();

        let updated = manager.release(escrow.id, Decimal::from(200), None).unwrap();

        assert_eq!(updated.status, EscrowStatus::PartiallyReleased);
        assert_eq!(updated.released_amount, Decimal::from(200));
        assert_eq!(wallets.balance(1).locked, Decimal::from(300));
        assert_eq!(wallets.balance(1).available, Decimal::ZERO);
        assert_eq!(wallets.balance(2).available, Decimal::from(200));
    }

    #[test]
    fn test_full_release_completes_escrow() {
        let (wallets, _, manager) = setup();
        wallets.credit(1, Decimal::from(500)).unwrap();
        let escrow = manager
            .create_escrow(1, 2, 10, Decimal::from(500), "USD", None)
            .unwrap();

        manager.release(escrow.id, Decimal::from(200), None).unwrap();
        let updated = manager.release(escrow.id, Decimal::from(300), None).unwrap();

        assert_eq!(updated.status, EscrowStatus::Completed);
        assert_eq!(updated.released_amount, updated.amount);
        assert_eq!(wallets.balance(2).available, Decimal::from(500));
    }

    #[test]
    fn test_release_cannot_exceed_escrow() {
        let (wallets, _, manager) = setup();
        wallets.credit(1, Decimal::from(500)).unwrap();
        let escrow = manager
            .create_escrow(1, 2, 10, Decimal::from(500), "USD", None)
            .unwrap();
        manager.release(escrow.id, Decimal::from(400), None).unwrap();

        let result = manager.release(escrow.id, Decimal::from(200), None);
        assert!(matches!(
            result,
            Err(LedgerError::ReleaseExceedsEscrow { remaining, .. }) if remaining == Decimal::from(100)
        ));
    }

    #[test]
    fn test_duplicate_milestone_release_changes_balances_once() {
        let (wallets, _, manager) = setup();
        wallets.credit(1, Decimal::from(500)).unwrap();
        let escrow = manager
            .create_escrow(1, 2, 10, Decimal::from(500), "USD", Some(77))
            .unwrap();

        manager
            .release(escrow.id, Decimal::from(200), Some(5))
            .unwrap();
        let retry = manager.release(escrow.id, Decimal::from(200), Some(5));

        assert!(matches!(
            retry,
            Err(LedgerError::DuplicateRelease { milestone: 5, .. })
        ));
        assert_eq!(wallets.balance(2).available, Decimal::from(200));
        assert_eq!(wallets.balance(1).locked, Decimal::from(300));
    }

    #[test]
    fn test_refund_returns_funds_to_payer() {
        let (wallets, ledger, manager) = setup();
        wallets.credit(1, Decimal::from(500)).unwrap();
        let escrow = manager
            .create_escrow(1, 2, 10, Decimal::from(500), "USD", None)
            .unwrap();
        manager.release(escrow.id, Decimal::from(200), None).unwrap();

        let updated = manager.refund(escrow.id, Decimal::from(300)).unwrap();

        assert_eq!(updated.status, EscrowStatus::Refunded);
        assert_eq!(wallets.balance(1).available, Decimal::from(300));
        assert_eq!(wallets.balance(1).locked, Decimal::ZERO);

        // Refund marker is balance-neutral; payer ledger folds to 300
        assert_eq!(ledger.balance_from_ledger(1), Decimal::from(300));
    }

    #[test]
    fn test_release_rejected_on_closed_escrow() {
        let (wallets, _, manager) = setup();
        wallets.credit(1, Decimal::from(100)).unwrap();
        let escrow = manager
            .create_escrow(1, 2, 10, Decimal::from(100), "USD", None)
            .unwrap();
        manager.release(escrow.id, Decimal::from(100), None).unwrap();

        let result = manager.release(escrow.id, Decimal::ONE, None);
        assert!(matches!(result, Err(LedgerError::EscrowClosed { .. })));
    }

    #[test]
    fn test_ledger_reconciles_after_release() {
        let (wallets, ledger, manager) = setup();
        wallets.credit(1, Decimal::from(500)).unwrap();
        ledger.record(1, TransactionKind::Deposit, Decimal::from(500), None);

        let escrow = manager
            .create_escrow(1, 2, 10, Decimal::from(500), "USD", None)
            .unwrap();
        manager.release(escrow.id, Decimal::from(200), None).unwrap();

        // available + locked matches the ledger fold for both parties
        assert_eq!(ledger.balance_from_ledger(1), Decimal::from(300));
        assert_eq!(
            wallets.balance(1).available + wallets.balance(1).locked,
            Decimal::from(300)
        );
        assert_eq!(ledger.balance_from_ledger(2), Decimal::from(200));
        assert_eq!(wallets.balance(2).available, Decimal::from(200));
    }
}
