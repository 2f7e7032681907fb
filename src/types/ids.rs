//! Identifier aliases used across the engine
//!
//! Identities are resolved by the auth collaborator before they reach this
//! crate; the engine only ever sees numeric ids. Record ids (escrows,
//! transfers, ledger rows, milestones) are allocated by their owning store
//! from an atomic counter starting at 1.

/// User identifier, resolved by the auth collaborator
pub type UserId = u64;

/// Escrow identifier
pub type EscrowId = u64;

/// Milestone identifier
pub type MilestoneId = u64;

/// Proposal identifier (a milestone plan is keyed by its proposal)
pub type ProposalId = u64;

/// Project identifier
pub type ProjectId = u64;

/// Internal transfer identifier
pub type TransferId = u64;

/// Ledger transaction identifier
pub type TxId = u64;

/// Reserved wallet that accumulates platform revenue (transfer fees,
/// subscription charges)
///
/// Keeping platform revenue inside an ordinary wallet means the money
/// conservation invariant covers fees as well: the sum of all wallets is
/// unchanged by a transfer.
pub const PLATFORM_ACCOUNT: UserId = 0;
