//! Ledger & Escrow Payment Engine
//! # Overview
//!
//! This library is the money-movement core of a freelance marketplace:
//! wallets, an append-only ledger, milestone escrow, and internal transfers
//! with tiered limits.
//!
//! # Architecture
//!
//! The system is organized into several key components:
//!
//! - [`types`] - Core data types (Wallet, Escrow, Milestone, Transfer, etc.)
//! - [`config`] - Fee and limit configuration
//! - [`core`] - Business logic components:
//!   - [`core::wallet_store`] - Wallet state and atomic balance operations
//!   - [`core::ledger`] - Append-only transaction ledger and reconciliation
//!   - [`core::escrow_manager`] - Escrow lock, release, and refund
//!   - [`core::milestone_engine`] - Milestone plan lifecycle and payments
//!   - [`core::transfer_service`] - Internal transfers with fees and limits
//!   - [`core::engine`] - The assembled facade
//!
//! # Money Movement
//!
//! Every operation is synchronous and all-or-nothing:
//!
//! - **Deposit**: Credit a gateway-confirmed payment, deduped by provider
//!   reference
//! - **Withdrawal**: Debit available funds for an external payout
//! - **Escrow**: Lock a client's funds at plan approval, release them per
//!   approved milestone, refund what remains
//! - **Transfer**: Move funds between members with a fee and tiered limits
//! - **Subscription**: Charge the platform fee and upgrade the member's tier
//!
//! # Wallet Buckets
//!
//! Each wallet maintains:
//! - `available`: Funds spendable on transfers, escrow, and withdrawals
//! - `locked`: Funds committed to open escrows
//! - `total_earned` / `total_spent`: Lifetime counters for profile stats
//!
//! The ledger is the source of truth: `available + locked` always equals the
//! fold of the user's ledger entries, and reconciliation corrects any drift
//! toward the ledger.

// Module declarations
pub mod config;
pub mod core;
pub mod types;

pub use crate::core::{
    BroadcastSink, ConfigLimitPolicy, CredentialStore, EscrowManager, EventSink,
    InMemoryCredentials, LimitPolicy, MilestonePaymentEngine, NullSink, PaymentEngine,
    ReconcileOutcome, TransactionLedger, TransferService, WalletStore,
};
pub use config::{LimitConfig, TierLimits};
pub use types::{
    Balance, ConfirmedDeposit, DomainEvent, Escrow, EscrowId, EscrowStatus, LedgerError, Milestone,
    MilestoneId, MilestonePlan, MilestoneStatus, PaymentStatus, PlanStatus, ProjectId, ProposalId,
    Tier, Transaction, TransactionKind, Transfer, TransferId, TxId, UserId, Wallet,
    PLATFORM_ACCOUNT,
};
