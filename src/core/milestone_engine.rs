//! Milestone plan and payment state machines
//!
//! A plan is authored (milestones added/edited/removed), submitted for
//! review, optionally sent back for revision, and finally approved.
//! Approval validates the milestone amounts against the agreed total,
//! funds the plan's escrow, and freezes the milestone set. Individual
//! milestones then move through their own work state machine; approving a
//! submitted milestone releases its amount from the plan's escrow.
//!
//! Milestone payment is escrow-first: there is no direct-debit fallback,
//! so a milestone can only be paid from a funded escrow.

use crate::core::escrow_manager::EscrowManager;
use crate::core::events::EventSink;
use crate::types::{
    DomainEvent, Escrow, LedgerError, Milestone, MilestoneId, MilestonePlan, MilestoneStatus,
    PaymentStatus, PlanStatus, ProjectId, ProposalId, UserId,
};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

/// Tolerance when comparing the milestone sum against the agreed total
fn amount_tolerance() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn lock_plan(cell: &Mutex<MilestonePlan>) -> MutexGuard<'_, MilestonePlan> {
    cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Coordinates milestone plans, their review lifecycle, and payment release
pub struct MilestonePaymentEngine {
    escrows: Arc<EscrowManager>,
    events: Arc<dyn EventSink>,
    /// The plan mutex is the plan-approval lock: concurrent approvals of
    /// the same plan are serialized on it
    plans: DashMap<ProposalId, Arc<Mutex<MilestonePlan>>>,
    milestones: DashMap<MilestoneId, Milestone>,
    next_milestone_id: AtomicU64,
}

impl MilestonePaymentEngine {
    pub fn new(escrows: Arc<EscrowManager>, events: Arc<dyn EventSink>) -> Self {
        MilestonePaymentEngine {
            escrows,
            events,
            plans: DashMap::new(),
            milestones: DashMap::new(),
            next_milestone_id: AtomicU64::new(1),
        }
    }

    fn plan_cell(&self, proposal: ProposalId) -> Result<Arc<Mutex<MilestonePlan>>, LedgerError> {
        self.plans
            .get(&proposal)
            .map(|r| Arc::clone(&r))
            .ok_or(LedgerError::PlanNotFound { proposal })
    }

    /// Create an empty plan for an accepted proposal
    ///
    /// `agreed_amount` is the total the parties agreed on; milestone
    /// amounts must sum to it before the plan can be approved.
    pub fn create_plan(
        &self,
        proposal_id: ProposalId,
        project_id: ProjectId,
        payer_id: UserId,
        payee_id: UserId,
        currency: &str,
        agreed_amount: Decimal,
    ) -> Result<MilestonePlan, LedgerError> {
        if agreed_amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(agreed_amount, "create_plan"));
        }
        let plan = MilestonePlan {
            proposal_id,
            project_id,
            payer_id,
            payee_id,
            currency: currency.to_string(),
            agreed_amount,
            status: PlanStatus::NotSubmitted,
            escrow_id: None,
            milestone_ids: Vec::new(),
        };
        match self.plans.entry(proposal_id) {
            dashmap::Entry::Occupied(_) => Err(LedgerError::PlanAlreadyExists {
                proposal: proposal_id,
            }),
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(plan.clone())));
                Ok(plan)
            }
        }
    }

    /// Add a milestone while the plan is still editable
    ///
    /// # Errors
    ///
    /// - `PlanFrozen` once the plan is approved
    /// - `CurrencyMismatch` if the milestone currency differs from the plan
    pub fn add_milestone(
        &self,
        proposal_id: ProposalId,
        title: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<Milestone, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(amount, "add_milestone"));
        }
        let cell = self.plan_cell(proposal_id)?;
        let mut plan = lock_plan(&cell);
        if !plan.is_editable() {
            return Err(LedgerError::PlanFrozen {
                proposal: proposal_id,
            });
        }
        if plan.currency != currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: plan.currency.clone(),
                actual: currency.to_string(),
            });
        }

        let id = self.next_milestone_id.fetch_add(1, Ordering::Relaxed);
        let milestone = Milestone {
            id,
            proposal_id,
            project_id: plan.project_id,
            payer_id: plan.payer_id,
            payee_id: plan.payee_id,
            title: title.to_string(),
            amount,
            currency: currency.to_string(),
            order: plan.milestone_ids.len() as u32,
            status: MilestoneStatus::Pending,
            payment_status: PaymentStatus::None,
            feedback: None,
        };
        self.milestones.insert(id, milestone.clone());
        plan.milestone_ids.push(id);
        Ok(milestone)
    }

    /// Change a milestone's title and/or amount while the plan is editable
    pub fn update_milestone(
        &self,
        milestone_id: MilestoneId,
        title: Option<&str>,
        amount: Option<Decimal>,
    ) -> Result<Milestone, LedgerError> {
        let proposal = self
            .milestones
            .get(&milestone_id)
            .map(|m| m.proposal_id)
            .ok_or(LedgerError::MilestoneNotFound {
                milestone: milestone_id,
            })?;
        let cell = self.plan_cell(proposal)?;
        let plan = lock_plan(&cell);
        if !plan.is_editable() {
            return Err(LedgerError::PlanFrozen { proposal });
        }

        let mut milestone =
            self.milestones
                .get_mut(&milestone_id)
                .ok_or(LedgerError::MilestoneNotFound {
                    milestone: milestone_id,
                })?;
        if let Some(amount) = amount {
            if amount <= Decimal::ZERO {
                return Err(LedgerError::invalid_amount(amount, "update_milestone"));
            }
            milestone.amount = amount;
        }
        if let Some(title) = title {
            milestone.title = title.to_string();
        }
        Ok(milestone.clone())
    }

    /// Remove a milestone while the plan is editable
    pub fn remove_milestone(&self, milestone_id: MilestoneId) -> Result<(), LedgerError> {
        let proposal = self
            .milestones
            .get(&milestone_id)
            .map(|m| m.proposal_id)
            .ok_or(LedgerError::MilestoneNotFound {
                milestone: milestone_id,
            })?;
        let cell = self.plan_cell(proposal)?;
        let mut plan = lock_plan(&cell);
        if !plan.is_editable() {
            return Err(LedgerError::PlanFrozen { proposal });
        }
        plan.milestone_ids.retain(|id| *id != milestone_id);
        self.milestones.remove(&milestone_id);
        Ok(())
    }

    /// Send the plan to the client for review
    pub fn submit_plan(&self, proposal_id: ProposalId) -> Result<MilestonePlan, LedgerError> {
        let cell = self.plan_cell(proposal_id)?;
        let mut plan = lock_plan(&cell);
        match plan.status {
            PlanStatus::NotSubmitted | PlanStatus::RevisionRequested => {
                plan.status = PlanStatus::Submitted;
                Ok(plan.clone())
            }
            from => Err(LedgerError::invalid_transition(
                "plan",
                from,
                PlanStatus::Submitted,
            )),
        }
    }

    /// Client asks for changes; the payee may edit and resubmit
    pub fn request_revision(&self, proposal_id: ProposalId) -> Result<MilestonePlan, LedgerError> {
        let cell = self.plan_cell(proposal_id)?;
        let mut plan = lock_plan(&cell);
        match plan.status {
            PlanStatus::Submitted => {
                plan.status = PlanStatus::RevisionRequested;
                Ok(plan.clone())
            }
            from => Err(LedgerError::invalid_transition(
                "plan",
                from,
                PlanStatus::RevisionRequested,
            )),
        }
    }

    /// Approve a submitted plan: validate amounts, fund the escrow, freeze
    /// the milestone set
    ///
    /// Runs entirely under the plan mutex, so concurrent approval attempts
    /// cannot double-create the escrow: the second caller observes
    /// `Approved` and receives the escrow created by the first.
    ///
    /// # Errors
    ///
    /// - `PlanAmountMismatch` if milestone amounts do not sum to the agreed
    ///   total (within 0.01)
    /// - `InsufficientBalance` with the exact shortfall if the payer cannot
    ///   fund the escrow (first-class: drives the top-up prompt)
    pub fn approve_plan(&self, proposal_id: ProposalId) -> Result<Escrow, LedgerError> {
        let cell = self.plan_cell(proposal_id)?;
        let mut plan = lock_plan(&cell);

        // Idempotent under retry/concurrency: already approved means the
        // escrow already exists
        if plan.status == PlanStatus::Approved {
            if let Some(escrow_id) = plan.escrow_id {
                if let Some(escrow) = self.escrows.get(escrow_id) {
                    return Ok(escrow);
                }
            }
            return Err(LedgerError::EscrowRequired {
                proposal: proposal_id,
            });
        }
        if plan.status != PlanStatus::Submitted {
            return Err(LedgerError::invalid_transition(
                "plan",
                plan.status,
                PlanStatus::Approved,
            ));
        }

        let milestones_total: Decimal = plan
            .milestone_ids
            .iter()
            .filter_map(|id| self.milestones.get(id).map(|m| m.amount))
            .sum();
        if (milestones_total - plan.agreed_amount).abs() > amount_tolerance() {
            return Err(LedgerError::PlanAmountMismatch {
                proposal: proposal_id,
                agreed: plan.agreed_amount,
                milestones_total,
            });
        }

        let escrow = self.escrows.create_escrow(
            plan.payer_id,
            plan.payee_id,
            plan.project_id,
            plan.agreed_amount,
            &plan.currency,
            Some(proposal_id),
        )?;

        plan.status = PlanStatus::Approved;
        plan.escrow_id = Some(escrow.id);
        info!(
            proposal = proposal_id,
            escrow = escrow.id,
            %plan.agreed_amount,
            "milestone plan approved and escrow funded"
        );
        Ok(escrow)
    }

    /// Payee starts work on a pending milestone
    pub fn start_milestone(&self, milestone_id: MilestoneId) -> Result<Milestone, LedgerError> {
        self.transition(milestone_id, MilestoneStatus::Pending, MilestoneStatus::InProgress)
    }

    /// Payee delivers the milestone for review
    pub fn submit_milestone(&self, milestone_id: MilestoneId) -> Result<Milestone, LedgerError> {
        self.transition(
            milestone_id,
            MilestoneStatus::InProgress,
            MilestoneStatus::Submitted,
        )
    }

    /// Client rejects the delivery; the milestone goes back to in-progress
    /// with feedback attached (rejection is never terminal)
    pub fn reject_milestone(
        &self,
        milestone_id: MilestoneId,
        feedback: &str,
    ) -> Result<Milestone, LedgerError> {
        let mut milestone =
            self.milestones
                .get_mut(&milestone_id)
                .ok_or(LedgerError::MilestoneNotFound {
                    milestone: milestone_id,
                })?;
        if milestone.status != MilestoneStatus::Submitted {
            return Err(LedgerError::invalid_transition(
                "milestone",
                milestone.status,
                MilestoneStatus::InProgress,
            ));
        }
        milestone.status = MilestoneStatus::InProgress;
        milestone.feedback = Some(feedback.to_string());
        Ok(milestone.clone())
    }

    /// Client approves a submitted milestone and its amount is released
    /// from the plan's escrow
    ///
    /// The release is keyed by milestone id inside the escrow manager, so a
    /// retried approval cannot pay twice. If the release fails the approval
    /// stands with `payment_status: Failed` and the error propagates.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` unless the milestone is `Submitted`
    /// - `EscrowRequired` if the plan was never approved/funded
    /// - any release error from [`EscrowManager::release`]
    pub fn approve_milestone(&self, milestone_id: MilestoneId) -> Result<Milestone, LedgerError> {
        // Resolve the escrow before taking the milestone write guard: the
        // authoring paths lock plan-then-milestone, so this path must not
        // hold a milestone guard while waiting on the plan mutex
        let proposal = self
            .milestones
            .get(&milestone_id)
            .map(|m| m.proposal_id)
            .ok_or(LedgerError::MilestoneNotFound {
                milestone: milestone_id,
            })?;
        let cell = self.plan_cell(proposal)?;
        let escrow_id = {
            let plan = lock_plan(&cell);
            plan.escrow_id
                .ok_or(LedgerError::EscrowRequired { proposal })?
        };

        let mut milestone =
            self.milestones
                .get_mut(&milestone_id)
                .ok_or(LedgerError::MilestoneNotFound {
                    milestone: milestone_id,
                })?;
        if milestone.status != MilestoneStatus::Submitted {
            return Err(LedgerError::invalid_transition(
                "milestone",
                milestone.status,
                MilestoneStatus::Approved,
            ));
        }

        milestone.status = MilestoneStatus::Approved;
        milestone.payment_status = PaymentStatus::Pending;

        match self
            .escrows
            .release(escrow_id, milestone.amount, Some(milestone_id))
        {
            Ok(_) => {
                milestone.payment_status = PaymentStatus::Released;
                info!(
                    milestone = milestone_id,
                    proposal,
                    %milestone.amount,
                    "milestone approved and paid"
                );
                self.events.emit(DomainEvent::MilestonePaid {
                    milestone_id,
                    proposal_id: proposal,
                    payee_id: milestone.payee_id,
                    amount: milestone.amount,
                });
                Ok(milestone.clone())
            }
            Err(err) => {
                milestone.payment_status = PaymentStatus::Failed;
                Err(err)
            }
        }
    }

    /// Retry the escrow release for an approved milestone whose payment
    /// failed
    pub fn retry_milestone_payment(
        &self,
        milestone_id: MilestoneId,
    ) -> Result<Milestone, LedgerError> {
        let proposal = self
            .milestones
            .get(&milestone_id)
            .map(|m| m.proposal_id)
            .ok_or(LedgerError::MilestoneNotFound {
                milestone: milestone_id,
            })?;
        let cell = self.plan_cell(proposal)?;
        let escrow_id = {
            let plan = lock_plan(&cell);
            plan.escrow_id
                .ok_or(LedgerError::EscrowRequired { proposal })?
        };

        let mut milestone =
            self.milestones
                .get_mut(&milestone_id)
                .ok_or(LedgerError::MilestoneNotFound {
                    milestone: milestone_id,
                })?;
        if milestone.status != MilestoneStatus::Approved
            || milestone.payment_status != PaymentStatus::Failed
        {
            return Err(LedgerError::invalid_transition(
                "milestone payment",
                milestone.payment_status,
                PaymentStatus::Released,
            ));
        }
        self.escrows
            .release(escrow_id, milestone.amount, Some(milestone_id))?;
        milestone.payment_status = PaymentStatus::Released;
        self.events.emit(DomainEvent::MilestonePaid {
            milestone_id,
            proposal_id: proposal,
            payee_id: milestone.payee_id,
            amount: milestone.amount,
        });
        Ok(milestone.clone())
    }

    /// Plan snapshot for a proposal
    pub fn plan(&self, proposal_id: ProposalId) -> Option<MilestonePlan> {
        self.plans
            .get(&proposal_id)
            .map(|cell| lock_plan(&cell).clone())
    }

    /// Milestones of a proposal in plan order
    pub fn milestones_for(&self, proposal_id: ProposalId) -> Vec<Milestone> {
        match self.plan(proposal_id) {
            Some(plan) => plan
                .milestone_ids
                .iter()
                .filter_map(|id| self.milestones.get(id).map(|m| m.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Milestone snapshot by id
    pub fn milestone(&self, milestone_id: MilestoneId) -> Option<Milestone> {
        self.milestones.get(&milestone_id).map(|m| m.clone())
    }

    /// Shared simple transition: `from` -> `to` or `InvalidTransition`
    fn transition(
        &self,
        milestone_id: MilestoneId,
        from: MilestoneStatus,
        to: MilestoneStatus,
    ) -> Result<Milestone, LedgerError> {
        let mut milestone =
            self.milestones
                .get_mut(&milestone_id)
                .ok_or(LedgerError::MilestoneNotFound {
                    milestone: milestone_id,
                })?;
        if milestone.status != from {
            return Err(LedgerError::invalid_transition(
                "milestone",
                milestone.status,
                to,
            ));
        }
        milestone.status = to;
        Ok(milestone.clone())
    }
}
