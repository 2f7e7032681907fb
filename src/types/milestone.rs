//! Milestone and milestone-plan types
//!
//! A milestone plan is an ordered set of milestones belonging to one
//! accepted proposal. The plan's milestone amounts must sum to the agreed
//! total before approval; approval freezes the milestone set and funds the
//! plan's escrow.

use super::ids::{EscrowId, MilestoneId, ProjectId, ProposalId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-milestone work state
///
/// Rejection is not a resting state: rejecting a submitted milestone moves
/// it back to `InProgress` with reviewer feedback attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    /// Created, work not started
    Pending,
    /// Payee is working on it (also the state after a rejection)
    InProgress,
    /// Payee delivered, awaiting client review
    Submitted,
    /// Client accepted the delivery; terminal
    Approved,
}

/// Payment state of a milestone, tracked separately from work state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// No payment attempted
    None,
    /// Approval recorded, escrow release in flight
    Pending,
    /// Escrow release succeeded; terminal
    Released,
    /// Escrow release failed; the approval stands and payment can be retried
    Failed,
}

/// A single milestone within a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub proposal_id: ProposalId,
    pub project_id: ProjectId,
    pub payer_id: UserId,
    pub payee_id: UserId,
    pub title: String,
    pub amount: Decimal,
    pub currency: String,
    /// Sequence within the plan
    pub order: u32,
    pub status: MilestoneStatus,
    pub payment_status: PaymentStatus,
    /// Reviewer feedback from the most recent rejection, if any
    pub feedback: Option<String>,
}

/// Review state of the plan as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Being authored; milestones may be added, edited, and removed
    NotSubmitted,
    /// Sent to the client for review (covers resubmissions)
    Submitted,
    /// Client asked for changes; loops back to `Submitted`
    RevisionRequested,
    /// Accepted and escrow-funded; milestone set is frozen; terminal
    Approved,
}

/// The set of milestones for one proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestonePlan {
    pub proposal_id: ProposalId,
    pub project_id: ProjectId,
    pub payer_id: UserId,
    pub payee_id: UserId,
    pub currency: String,
    /// Total the parties agreed on; the milestone amounts must sum to this
    /// (within a 0.01 tolerance) before the plan can be approved
    pub agreed_amount: Decimal,
    pub status: PlanStatus,
    /// Escrow funding this plan, set on approval
    pub escrow_id: Option<EscrowId>,
    /// Milestones in plan order
    pub milestone_ids: Vec<MilestoneId>,
}

impl MilestonePlan {
    /// Whether the milestone set may still be edited
    pub fn is_editable(&self) -> bool {
        self.status != PlanStatus::Approved
    }
}
