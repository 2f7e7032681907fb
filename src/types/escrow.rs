//! Escrow types
//!
//! An escrow holds funds locked from a payer's available balance until they
//! are released to the payee or refunded. Escrows are terminal once
//! `Completed` or `Refunded`.

use super::ids::{EscrowId, ProjectId, ProposalId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle of an escrow hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Funds locked, nothing released yet
    Locked,
    /// Some, but not all, of the funds have been released
    PartiallyReleased,
    /// Fully released to the payee; terminal
    Completed,
    /// Remaining funds returned to the payer; terminal
    Refunded,
}

/// A funded escrow hold tied to a project (and optionally a milestone plan)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: EscrowId,

    /// The client whose funds are locked
    pub payer_id: UserId,

    /// The freelancer the funds are released to
    pub payee_id: UserId,

    pub project_id: ProjectId,

    /// Set when this escrow backs a milestone plan
    pub milestone_plan_id: Option<ProposalId>,

    /// Total amount locked at creation
    pub amount: Decimal,

    pub currency: String,

    /// Monotonically non-decreasing; never exceeds `amount`
    pub released_amount: Decimal,

    /// Amount returned to the payer via refunds
    pub refunded_amount: Decimal,

    pub status: EscrowStatus,

    pub created_at: DateTime<Utc>,
}

impl Escrow {
    /// Funds still held (neither released nor refunded)
    pub fn remaining(&self) -> Decimal {
        self.amount - self.released_amount - self.refunded_amount
    }

    /// Whether further releases or refunds are permitted
    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            EscrowStatus::Locked | EscrowStatus::PartiallyReleased
        )
    }
}
