//! Top-level payment engine facade
//!
//! Owns and wires the component services: wallet store, ledger, escrow
//! manager, milestone engine, and transfer service all share the same
//! stores, so a balance observed through any path is the same balance.
//! External money movement (confirmed deposits, withdrawal requests,
//! subscription charges) enters the system here.

use crate::core::escrow_manager::EscrowManager;
use crate::core::events::EventSink;
use crate::core::ledger::{ReconcileOutcome, TransactionLedger};
use crate::core::limit_policy::LimitPolicy;
use crate::core::milestone_engine::MilestonePaymentEngine;
use crate::core::transfer_service::{CredentialStore, TransferService};
use crate::core::wallet_store::WalletStore;
use crate::types::{
    Balance, ConfirmedDeposit, DomainEvent, Escrow, LedgerError, MilestonePlan, ProjectId,
    ProposalId, Tier, Transaction, TransactionKind, Transfer, TransferId, TxId, UserId, Wallet,
    PLATFORM_ACCOUNT,
};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

/// The assembled payment engine
pub struct PaymentEngine {
    wallets: Arc<WalletStore>,
    ledger: Arc<TransactionLedger>,
    escrows: Arc<EscrowManager>,
    milestones: MilestonePaymentEngine,
    transfers: TransferService,
    events: Arc<dyn EventSink>,
    /// Provider references already credited, with the deposit row each one
    /// produced
    seen_deposits: DashMap<String, TxId>,
}

impl PaymentEngine {
    /// Assemble an engine from the pluggable seams
    pub fn new(
        policy: Arc<dyn LimitPolicy>,
        credentials: Arc<dyn CredentialStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let wallets = Arc::new(WalletStore::new());
        let ledger = Arc::new(TransactionLedger::new());
        let escrows = Arc::new(EscrowManager::new(
            Arc::clone(&wallets),
            Arc::clone(&ledger),
            Arc::clone(&events),
        ));
        let milestones = MilestonePaymentEngine::new(Arc::clone(&escrows), Arc::clone(&events));
        let transfers = TransferService::new(
            Arc::clone(&wallets),
            Arc::clone(&ledger),
            policy,
            credentials,
            Arc::clone(&events),
        );
        PaymentEngine {
            wallets,
            ledger,
            escrows,
            milestones,
            transfers,
            events,
            seen_deposits: DashMap::new(),
        }
    }

    /// Credit a deposit the gateway has confirmed
    ///
    /// Gateways deliver at-least-once, so the `provider_ref` is deduped:
    /// a redelivery gets `DuplicateDeposit` and the webhook handler acks it
    /// as already processed.
    ///
    /// # Errors
    ///
    /// - `InvalidAmount` for a non-positive deposit
    /// - `DuplicateDeposit` if this `provider_ref` was already credited
    pub fn apply_deposit(&self, deposit: ConfirmedDeposit) -> Result<Transaction, LedgerError> {
        if deposit.amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(deposit.amount, "deposit"));
        }

        // Reserve the provider ref before crediting so a concurrent
        // redelivery cannot double-credit
        match self.seen_deposits.entry(deposit.provider_ref.clone()) {
            dashmap::Entry::Occupied(_) => {
                return Err(LedgerError::DuplicateDeposit {
                    provider_ref: deposit.provider_ref,
                });
            }
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(0);
            }
        }

        if let Err(err) = self.wallets.credit(deposit.user_id, deposit.amount) {
            self.seen_deposits.remove(&deposit.provider_ref);
            return Err(err);
        }
        let tx = self
            .ledger
            .record(deposit.user_id, TransactionKind::Deposit, deposit.amount, None);
        self.seen_deposits.insert(deposit.provider_ref.clone(), tx.id);

        info!(
            user = deposit.user_id,
            %deposit.amount,
            provider = %deposit.provider,
            provider_ref = %deposit.provider_ref,
            "deposit credited"
        );
        self.events.emit(DomainEvent::DepositConfirmed {
            user_id: deposit.user_id,
            amount: deposit.amount,
            currency: deposit.currency,
            provider: deposit.provider,
        });
        Ok(tx)
    }

    /// Debit a withdrawal; the actual payout is requested from the gateway
    /// by the caller after this returns
    ///
    /// # Errors
    ///
    /// Returns `InsufficientBalance` with the shortfall if the available
    /// balance cannot cover `amount`.
    pub fn withdraw(&self, user: UserId, amount: Decimal) -> Result<Transaction, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(amount, "withdraw"));
        }
        self.wallets
            .debit(user, amount)
            .map_err(|err| self.report_shortfall(err.into_balance_error(amount)))?;
        let tx = self
            .ledger
            .record(user, TransactionKind::Withdrawal, -amount, None);
        info!(user, %amount, "withdrawal debited");
        Ok(tx)
    }

    /// Charge a subscription: the member pays the platform and their
    /// transfer tier is updated
    ///
    /// # Errors
    ///
    /// Returns `InsufficientBalance` with the shortfall if the member cannot
    /// cover the charge; the tier is left unchanged in that case.
    pub fn charge_subscription(
        &self,
        user: UserId,
        amount: Decimal,
        tier: Tier,
    ) -> Result<Transaction, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(amount, "subscription"));
        }
        self.wallets
            .debit_spent(user, amount)
            .map_err(|err| self.report_shortfall(err.into_balance_error(amount)))?;
        self.wallets.credit(PLATFORM_ACCOUNT, amount).map_err(|e| {
            tracing::error!(user, %amount, error = %e, "platform credit failed after subscription debit");
            LedgerError::invariant(format!(
                "platform credit failed after subscription debit from {user}: {e}"
            ))
        })?;

        let tx = self
            .ledger
            .record(user, TransactionKind::SubscriptionPayment, -amount, None);
        self.ledger.record(
            PLATFORM_ACCOUNT,
            TransactionKind::SubscriptionPayment,
            amount,
            None,
        );
        self.transfers.set_tier(user, tier);
        info!(user, %amount, ?tier, "subscription charged");
        Ok(tx)
    }

    /// Run ledger reconciliation for one user and correct any drift
    pub fn reconcile_user(&self, user: UserId) -> Result<ReconcileOutcome, LedgerError> {
        self.ledger.reconcile(user, &self.wallets)
    }

    // Read APIs

    pub fn wallet(&self, user: UserId) -> Option<Wallet> {
        self.wallets.snapshot(user)
    }

    pub fn balance(&self, user: UserId) -> Balance {
        self.wallets.balance(user)
    }

    pub fn transaction_history(
        &self,
        user: UserId,
        cursor: Option<TxId>,
        limit: usize,
    ) -> Vec<Transaction> {
        self.ledger.history(user, cursor, limit)
    }

    pub fn transfer_history(
        &self,
        user: UserId,
        cursor: Option<TransferId>,
        limit: usize,
    ) -> Vec<Transfer> {
        self.transfers.history(user, cursor, limit)
    }

    pub fn milestone_plan(&self, proposal: ProposalId) -> Option<MilestonePlan> {
        self.milestones.plan(proposal)
    }

    pub fn escrow_for_project(&self, project: ProjectId) -> Option<Escrow> {
        self.escrows.for_project(project)
    }

    // Component access for flows the facade does not wrap

    pub fn escrows(&self) -> &EscrowManager {
        &self.escrows
    }

    pub fn milestones(&self) -> &MilestonePaymentEngine {
        &self.milestones
    }

    pub fn transfers(&self) -> &TransferService {
        &self.transfers
    }

    pub fn wallets(&self) -> &WalletStore {
        &self.wallets
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    fn report_shortfall(&self, err: LedgerError) -> LedgerError {
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
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::NullSink;
    use crate::core::limit_policy::ConfigLimitPolicy;
    use crate::core::transfer_service::InMemoryCredentials;

    fn engine() -> PaymentEngine {
        PaymentEngine::new(
            Arc::new(ConfigLimitPolicy::default()),
            Arc::new(InMemoryCredentials::new()),
            Arc::new(NullSink),
        )
    }

    fn deposit(user: UserId, amount: Decimal, provider_ref: &str) -> ConfirmedDeposit {
        ConfirmedDeposit {
            user_id: user,
            amount,
            currency: "USD".to_string(),
            provider: "paypal".to_string(),
            provider_ref: provider_ref.to_string(),
        }
    }

    #[test]
    fn test_deposit_credits_and_records() {
        let engine = engine();
        let tx = engine
            .apply_deposit(deposit(1, Decimal::from(300), "pp-1"))
            .unwrap();

        assert_eq!(tx.kind, TransactionKind::Deposit);
        assert_eq!(tx.amount, Decimal::from(300));
        assert_eq!(engine.balance(1).available, Decimal::from(300));
    }

    #[test]
    fn test_redelivered_deposit_is_credited_once() {
        let engine = engine();
        engine
            .apply_deposit(deposit(1, Decimal::from(300), "pp-1"))
            .unwrap();

        let redelivery = engine.apply_deposit(deposit(1, Decimal::from(300), "pp-1"));
        assert!(matches!(
            redelivery,
            Err(LedgerError::DuplicateDeposit { provider_ref }) if provider_ref == "pp-1"
        ));
        assert_eq!(engine.balance(1).available, Decimal::from(300));
        assert_eq!(engine.ledger().count(1), 1);
    }

    #[test]
    fn test_distinct_provider_refs_both_credit() {
        let engine = engine();
        engine
            .apply_deposit(deposit(1, Decimal::from(100), "pp-1"))
            .unwrap();
        engine
            .apply_deposit(deposit(1, Decimal::from(100), "pp-2"))
            .unwrap();
        assert_eq!(engine.balance(1).available, Decimal::from(200));
    }

    #[test]
    fn test_deposit_withdraw_round_trip_leaves_two_rows() {
        let engine = engine();
        engine
            .apply_deposit(deposit(1, Decimal::from(100), "pp-1"))
            .unwrap();
        engine.withdraw(1, Decimal::from(100)).unwrap();

        assert_eq!(engine.balance(1).available, Decimal::ZERO);
        let rows = engine.transaction_history(1, None, 10);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, TransactionKind::Withdrawal);
        assert_eq!(rows[0].amount, Decimal::from(-100));
        assert_eq!(rows[1].kind, TransactionKind::Deposit);
        assert_eq!(rows[1].amount, Decimal::from(100));
        // The ledger fold agrees with the wallet
        assert_eq!(engine.ledger().balance_from_ledger(1), Decimal::ZERO);
    }

    #[test]
    fn test_withdraw_reports_shortfall() {
        let engine = engine();
        engine
            .apply_deposit(deposit(1, Decimal::from(40), "pp-1"))
            .unwrap();

        match engine.withdraw(1, Decimal::from(100)) {
            Err(LedgerError::InsufficientBalance { shortfall, .. }) => {
                assert_eq!(shortfall, Decimal::from(60));
            }
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }
        // Nothing recorded for the failed attempt
        assert_eq!(engine.ledger().count(1), 1);
    }

    #[test]
    fn test_subscription_pays_platform_and_upgrades_tier() {
        let engine = engine();
        engine
            .apply_deposit(deposit(1, Decimal::from(100), "pp-1"))
            .unwrap();

        engine
            .charge_subscription(1, Decimal::from(30), Tier::Pro)
            .unwrap();

        assert_eq!(engine.balance(1).available, Decimal::from(70));
        assert_eq!(
            engine.balance(PLATFORM_ACCOUNT).available,
            Decimal::from(30)
        );
        assert_eq!(engine.transfers().tier(1), Tier::Pro);
        assert_eq!(engine.wallet(1).unwrap().total_spent, Decimal::from(30));
    }

    #[test]
    fn test_failed_subscription_leaves_tier_unchanged() {
        let engine = engine();
        let result = engine.charge_subscription(1, Decimal::from(30), Tier::Pro);
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(engine.transfers().tier(1), Tier::Free);
    }

    #[test]
    fn test_reconcile_user_corrects_drift() {
        let engine = engine();
        engine
            .apply_deposit(deposit(1, Decimal::from(100), "pp-1"))
            .unwrap();

        // Simulate a lost wallet write: ledger says more than the wallet has
        engine.ledger().record(1, TransactionKind::Deposit, Decimal::from(50), None);
        let outcome = engine.reconcile_user(1).unwrap();

        assert!(outcome.corrected);
        assert_eq!(engine.balance(1).available, Decimal::from(150));
    }
}
