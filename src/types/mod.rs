//! Core data types for the ledger & escrow payment engine
//!
//! This module exposes the plain data structures that flow through the
//! system: wallets, escrows, milestones, transfers, ledger transactions,
//! domain events, and the error taxonomy.

pub mod error;
pub mod escrow;
pub mod event;
pub mod ids;
pub mod milestone;
pub mod transaction;
pub mod transfer;
pub mod wallet;

pub use error::LedgerError;
pub use escrow::{Escrow, EscrowStatus};
pub use event::{ConfirmedDeposit, DomainEvent};
pub use ids::{
    EscrowId, MilestoneId, ProjectId, ProposalId, TransferId, TxId, UserId, PLATFORM_ACCOUNT,
};
pub use milestone::{Milestone, MilestonePlan, MilestoneStatus, PaymentStatus, PlanStatus};
pub use transaction::{Transaction, TransactionKind};
pub use transfer::{Tier, Transfer};
pub use wallet::{Balance, Wallet};
