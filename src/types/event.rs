//! Inbound and outbound event types
//!
//! [`ConfirmedDeposit`] is what gateway collaborators hand the engine once
//! an external payment has cleared. [`DomainEvent`] is what the engine emits
//! for the notification collaborator; emission is best-effort and never
//! rolls back a committed financial operation.

use super::ids::{EscrowId, MilestoneId, ProjectId, ProposalId, TransferId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A deposit confirmed by an external payment gateway
///
/// Gateways deliver with at-least-once semantics; `provider_ref` is the
/// dedupe key that makes crediting idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedDeposit {
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: String,
    /// Gateway name ("paypal", "ecpay", ...)
    pub provider: String,
    /// Gateway-side transaction reference, unique per deposit
    pub provider_ref: String,
}

/// Events produced by the engine for notification rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    DepositConfirmed {
        user_id: UserId,
        amount: Decimal,
        currency: String,
        provider: String,
    },
    TransferCompleted {
        transfer_id: TransferId,
        from_user_id: UserId,
        to_user_id: UserId,
        amount: Decimal,
        fee: Decimal,
    },
    MilestonePaid {
        milestone_id: MilestoneId,
        proposal_id: ProposalId,
        payee_id: UserId,
        amount: Decimal,
    },
    EscrowCreated {
        escrow_id: EscrowId,
        project_id: ProjectId,
        payer_id: UserId,
        amount: Decimal,
    },
    /// Emitted when an operation fails for lack of funds, so the UI can
    /// render a top-up prompt with the exact shortfall
    InsufficientBalance {
        user_id: UserId,
        required: Decimal,
        available: Decimal,
        shortfall: Decimal,
    },
}
