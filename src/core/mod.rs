//! Core business logic module
//!
//! This module contains the financial components of the engine:
//! - `wallet_store` - Wallet balance state and atomic balance operations
//! - `ledger` - Append-only transaction ledger and reconciliation
//! - `escrow_manager` - Escrow creation, release, and refund
//! - `milestone_engine` - Milestone plan lifecycle and payment release
//! - `transfer_service` - Internal transfers with fees and limits
//! - `limit_policy` - Fee schedule and tiered limit checks
//! - `events` - Domain event delivery
//! - `engine` - The assembled facade

pub mod engine;
pub mod escrow_manager;
pub mod events;
pub mod ledger;
pub mod limit_policy;
pub mod milestone_engine;
pub mod transfer_service;
pub mod wallet_store;

pub use engine::PaymentEngine;
pub use escrow_manager::EscrowManager;
pub use events::{BroadcastSink, EventSink, NullSink};
pub use ledger::{ReconcileOutcome, TransactionLedger};
pub use limit_policy::{ConfigLimitPolicy, LimitPolicy};
pub use milestone_engine::MilestonePaymentEngine;
pub use transfer_service::{CredentialStore, InMemoryCredentials, TransferService};
pub use wallet_store::WalletStore;
