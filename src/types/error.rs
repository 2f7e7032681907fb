//! Error types for the ledger & escrow payment engine
//!
//! Every failure carries enough structured context (shortfall amounts,
//! limit values, current usage) for a caller to render an actionable
//! message without guessing.
//!
//! # Error Categories
//!
//! - **Recoverable validation errors**: insufficient balance, limit
//!   violations, invalid PIN, duplicate releases/deposits. Returned to the
//!   caller as structured results; wallet state is unchanged.
//! - **Internal guards**: insufficient funds/locked funds, arithmetic
//!   overflow. These should not surface if preconditions were checked.
//! - **Invariant violations**: ledger/wallet drift. Fatal for the operation;
//!   logged as critical and the operation aborts without partial effect.

use super::escrow::EscrowStatus;
use super::ids::{EscrowId, MilestoneId, ProposalId, UserId};
use super::transfer::Tier;
use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the payment engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// Not enough available funds for a user-initiated operation
    ///
    /// Recoverable: the caller prompts a top-up for `shortfall`.
    #[error("insufficient balance for user {user}: required {required}, available {available} (shortfall {shortfall})")]
    InsufficientBalance {
        user: UserId,
        /// Amount the operation needed in total
        required: Decimal,
        /// Available balance at the time of the check
        available: Decimal,
        /// `required - available`
        shortfall: Decimal,
    },

    /// Internal guard: a debit or lock found less available than expected
    ///
    /// Should not surface if preconditions were checked; callers map it to
    /// [`LedgerError::InsufficientBalance`] at the boundary.
    #[error("insufficient funds in {operation} for user {user}: available {available}, requested {requested}")]
    InsufficientFunds {
        user: UserId,
        available: Decimal,
        requested: Decimal,
        operation: String,
    },

    /// Internal guard: an unlock or release found less locked than expected
    ///
    /// Indicates escrow/wallet drift and is treated like an invariant
    /// violation by callers.
    #[error("insufficient locked funds in {operation} for user {user}: locked {locked}, requested {requested}")]
    InsufficientLockedFunds {
        user: UserId,
        locked: Decimal,
        requested: Decimal,
        operation: String,
    },

    /// Zero or negative amount where a positive amount is required
    #[error("invalid amount {amount} for {operation}")]
    InvalidAmount { amount: Decimal, operation: String },

    /// PIN verification failed
    ///
    /// Deliberately carries no detail: the message must not reveal whether
    /// the account or credential exists.
    #[error("invalid PIN")]
    InvalidPin,

    /// Transfer recipient could not be resolved
    #[error("recipient '{identifier}' not found")]
    RecipientNotFound { identifier: String },

    /// Sender and recipient are the same user
    #[error("user {user} cannot transfer to themselves")]
    SelfTransfer { user: UserId },

    /// Transfer amount exceeds the tier's per-transaction ceiling
    #[error("amount {amount} exceeds the per-transaction limit {limit} for tier {tier:?}")]
    PerTransactionLimitExceeded {
        amount: Decimal,
        limit: Decimal,
        tier: Tier,
    },

    /// Transfer would exceed the tier's daily ceiling
    #[error("daily limit exceeded for tier {tier:?}: used {used} of {limit}, remaining {remaining}")]
    DailyLimitExceeded {
        used: Decimal,
        limit: Decimal,
        /// How much the sender may still transfer today
        remaining: Decimal,
        tier: Tier,
    },

    /// Milestone amounts do not sum to the plan's agreed total
    #[error("milestone amounts for proposal {proposal} sum to {milestones_total}, expected {agreed}")]
    PlanAmountMismatch {
        proposal: ProposalId,
        agreed: Decimal,
        milestones_total: Decimal,
    },

    /// Currency differs from the plan or escrow currency
    #[error("currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    /// Release would exceed the escrow's remaining funds
    #[error("release of {requested} exceeds escrow {escrow}: {remaining} remaining")]
    ReleaseExceedsEscrow {
        escrow: EscrowId,
        remaining: Decimal,
        requested: Decimal,
    },

    /// A release for this milestone was already executed
    ///
    /// Makes release idempotent per `(escrow, milestone)` under retries.
    #[error("escrow {escrow} was already released for milestone {milestone}")]
    DuplicateRelease {
        escrow: EscrowId,
        milestone: MilestoneId,
    },

    /// A deposit with this provider reference was already credited
    #[error("deposit with provider reference '{provider_ref}' was already processed")]
    DuplicateDeposit { provider_ref: String },

    /// Escrow id not found
    #[error("escrow {escrow} not found")]
    EscrowNotFound { escrow: EscrowId },

    /// Escrow is already completed or refunded
    #[error("escrow {escrow} is closed ({status:?})")]
    EscrowClosed {
        escrow: EscrowId,
        status: EscrowStatus,
    },

    /// Milestone payment requires a funded escrow (the plan is not approved)
    #[error("proposal {proposal} has no funded escrow; approve the plan first")]
    EscrowRequired { proposal: ProposalId },

    /// Milestone id not found
    #[error("milestone {milestone} not found")]
    MilestoneNotFound { milestone: MilestoneId },

    /// No plan exists for the proposal
    #[error("no milestone plan for proposal {proposal}")]
    PlanNotFound { proposal: ProposalId },

    /// A plan already exists for the proposal
    #[error("a milestone plan for proposal {proposal} already exists")]
    PlanAlreadyExists { proposal: ProposalId },

    /// The plan is approved and its milestone set is frozen
    #[error("milestone plan for proposal {proposal} is approved and frozen")]
    PlanFrozen { proposal: ProposalId },

    /// State machine rejected a transition
    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// Checked arithmetic would overflow
    #[error("arithmetic overflow in {operation} for user {user}")]
    ArithmeticOverflow { operation: String, user: UserId },

    /// Checked arithmetic would underflow
    #[error("arithmetic underflow in {operation} for user {user}")]
    ArithmeticUnderflow { operation: String, user: UserId },

    /// Ledger and wallet state disagree, or a balance went negative
    ///
    /// Fatal: logged as a critical fault, the operation aborts, and
    /// reconciliation must run before the wallet is trusted again.
    #[error("invariant violation: {detail}")]
    InvariantViolation { detail: String },
}

// Helper constructors for the variants built in more than one place

impl LedgerError {
    /// Create an InsufficientBalance error, computing the shortfall
    pub fn insufficient_balance(user: UserId, required: Decimal, available: Decimal) -> Self {
        LedgerError::InsufficientBalance {
            user,
            required,
            available,
            shortfall: required - available,
        }
    }

    /// Create an InsufficientFunds guard error
    pub fn insufficient_funds(
        user: UserId,
        available: Decimal,
        requested: Decimal,
        operation: &str,
    ) -> Self {
        LedgerError::InsufficientFunds {
            user,
            available,
            requested,
            operation: operation.to_string(),
        }
    }

    /// Create an InsufficientLockedFunds guard error
    pub fn insufficient_locked(
        user: UserId,
        locked: Decimal,
        requested: Decimal,
        operation: &str,
    ) -> Self {
        LedgerError::InsufficientLockedFunds {
            user,
            locked,
            requested,
            operation: operation.to_string(),
        }
    }

    /// Create an InvalidAmount error
    pub fn invalid_amount(amount: Decimal, operation: &str) -> Self {
        LedgerError::InvalidAmount {
            amount,
            operation: operation.to_string(),
        }
    }

    /// Create a DailyLimitExceeded error, computing the remaining headroom
    /// (clamped at zero)
    pub fn daily_limit_exceeded(used: Decimal, limit: Decimal, tier: Tier) -> Self {
        LedgerError::DailyLimitExceeded {
            used,
            limit,
            remaining: (limit - used).max(Decimal::ZERO),
            tier,
        }
    }

    /// Create an InvalidTransition error from the states' debug renderings
    pub fn invalid_transition<F: std::fmt::Debug, T: std::fmt::Debug>(
        entity: &str,
        from: F,
        to: T,
    ) -> Self {
        LedgerError::InvalidTransition {
            entity: entity.to_string(),
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    /// Create an ArithmeticOverflow error
    pub fn arithmetic_overflow(operation: &str, user: UserId) -> Self {
        LedgerError::ArithmeticOverflow {
            operation: operation.to_string(),
            user,
        }
    }

    /// Create an ArithmeticUnderflow error
    pub fn arithmetic_underflow(operation: &str, user: UserId) -> Self {
        LedgerError::ArithmeticUnderflow {
            operation: operation.to_string(),
            user,
        }
    }

    /// Create an InvariantViolation error
    pub fn invariant(detail: impl Into<String>) -> Self {
        LedgerError::InvariantViolation {
            detail: detail.into(),
        }
    }

    /// Map an internal InsufficientFunds guard to the user-facing
    /// InsufficientBalance error for an operation that needed `required`
    ///
    /// Other errors pass through unchanged.
    pub fn into_balance_error(self, required: Decimal) -> Self {
        match self {
            LedgerError::InsufficientFunds {
                user, available, ..
            } => LedgerError::insufficient_balance(user, required, available),
            other => other,
        }
    }
}
