//! Human-in-the-loop approval gate.
//!
//! At most one approval is outstanding per mission. While it is open the
//! runner keeps the backend held; the gate only tracks the request, the
//! phase it interrupted and the deadline for an answer.

use mission_core::{
    Approval, CoreError, CoreResult, Decision, HumanDecision, MissionId, MissionStatus,
};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{ApprovalConfig, ApprovalTimeoutPolicy, ApprovalTrigger};

/// Outstanding approval and what it interrupted
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub approval: Approval,
    pub interrupted: MissionStatus,
    pub deadline: Instant,
}

/// Outcome of a resolved approval
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub approval: Approval,
    pub decision: Decision,
    /// Phase the mission continues in
    pub resume_phase: MissionStatus,
    /// Resolved by the timeout policy rather than an operator
    pub timed_out: bool,
}

impl Resolution {
    pub fn as_decision(&self) -> HumanDecision {
        HumanDecision {
            approval_id: self.approval.id,
            decision: self.decision,
        }
    }
}

#[derive(Debug)]
pub struct ApprovalGate {
    mission_id: MissionId,
    config: ApprovalConfig,
    pending: Option<PendingApproval>,
}

impl ApprovalGate {
    pub fn new(mission_id: MissionId, config: ApprovalConfig) -> Self {
        Self {
            mission_id,
            config,
            pending: None,
        }
    }

    pub fn trigger(&self) -> ApprovalTrigger {
        self.config.trigger
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&PendingApproval> {
        self.pending.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Open an approval interrupting `interrupted`
    pub fn open(&mut self, approval: Approval, interrupted: MissionStatus) -> CoreResult<&Approval> {
        if self.pending.is_some() {
            return Err(CoreError::ApprovalPending(self.mission_id.to_string()));
        }
        if !matches!(interrupted, MissionStatus::EnRoute | MissionStatus::Returning) {
            return Err(CoreError::invalid_transition(
                interrupted,
                MissionStatus::AwaitingApproval,
            ));
        }

        info!(
            mission_id = %self.mission_id,
            approval_id = %approval.id,
            kind = %approval.kind,
            "⏸️ Approval required"
        );

        let pending = self.pending.insert(PendingApproval {
            approval,
            interrupted,
            deadline: Instant::now() + self.config.timeout,
        });
        Ok(&pending.approval)
    }

    /// Consume the outstanding approval with an operator decision
    pub fn resolve(&mut self, decision: &HumanDecision) -> CoreResult<Resolution> {
        let Some(pending) = self.pending.as_ref() else {
            return Err(CoreError::NoPendingApproval(self.mission_id.to_string()));
        };
        if pending.approval.id != decision.approval_id {
            return Err(CoreError::ApprovalNotFound(decision.approval_id.to_string()));
        }

        let pending = self.pending.take().ok_or_else(|| CoreError::internal("approval vanished"))?;
        Ok(Self::resolution(pending, decision.decision, false))
    }

    /// Apply the timeout policy if the deadline has passed
    pub fn expire(&mut self, now: Instant) -> Option<Resolution> {
        if self.pending.as_ref()?.deadline > now {
            return None;
        }
        let pending = self.pending.take()?;
        let decision = match self.config.on_timeout {
            ApprovalTimeoutPolicy::Approve => Decision::Approved,
            ApprovalTimeoutPolicy::Deny => Decision::Denied,
        };

        warn!(
            mission_id = %self.mission_id,
            approval_id = %pending.approval.id,
            %decision,
            "Approval timed out"
        );
        Some(Self::resolution(pending, decision, true))
    }

    /// Drop the outstanding approval without a decision
    pub fn cancel(&mut self) -> Option<Approval> {
        self.pending.take().map(|p| p.approval)
    }

    fn resolution(pending: PendingApproval, decision: Decision, timed_out: bool) -> Resolution {
        let resume_phase = match decision {
            Decision::Approved => pending.interrupted,
            Decision::Denied => MissionStatus::Returning,
        };
        Resolution {
            approval: pending.approval,
            decision,
            resume_phase,
            timed_out,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mission_core::ApprovalKind;
    use std::time::Duration;
    use uuid::Uuid;

    fn gate(on_timeout: ApprovalTimeoutPolicy) -> ApprovalGate {
        ApprovalGate::new(
            MissionId::new("m-1"),
            ApprovalConfig {
                timeout: Duration::from_secs(60),
                on_timeout,
                ..Default::default()
            },
        )
    }

    fn approval() -> Approval {
        Approval::new(MissionId::new("m-1"), ApprovalKind::Anomaly, "vehicle on road")
    }

    #[tokio::test]
    async fn test_single_outstanding_approval() {
        let mut gate = gate(ApprovalTimeoutPolicy::Deny);
        gate.open(approval(), MissionStatus::EnRoute).unwrap();

        let err = gate.open(approval(), MissionStatus::EnRoute).unwrap_err();
        assert!(matches!(err, CoreError::ApprovalPending(_)));
    }

    #[tokio::test]
    async fn test_open_only_while_flying() {
        let mut gate = gate(ApprovalTimeoutPolicy::Deny);
        let err = gate.open(approval(), MissionStatus::Landing).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        assert!(!gate.is_pending());
    }

    #[tokio::test]
    async fn test_approve_resumes_interrupted_phase() {
        let mut gate = gate(ApprovalTimeoutPolicy::Deny);
        let id = gate.open(approval(), MissionStatus::Returning).unwrap().id;

        let resolution = gate.resolve(&HumanDecision::approve(id)).unwrap();
        assert_eq!(resolution.resume_phase, MissionStatus::Returning);
        assert!(!resolution.timed_out);
        assert!(!gate.is_pending());
    }

    #[tokio::test]
    async fn test_deny_returns_home() {
        let mut gate = gate(ApprovalTimeoutPolicy::Deny);
        let id = gate.open(approval(), MissionStatus::EnRoute).unwrap().id;

        let resolution = gate.resolve(&HumanDecision::deny(id)).unwrap();
        assert_eq!(resolution.decision, Decision::Denied);
        assert_eq!(resolution.resume_phase, MissionStatus::Returning);
    }

    #[tokio::test]
    async fn test_resolve_rejects_wrong_id() {
        let mut gate = gate(ApprovalTimeoutPolicy::Deny);
        assert!(matches!(
            gate.resolve(&HumanDecision::approve(Uuid::new_v4())),
            Err(CoreError::NoPendingApproval(_))
        ));

        gate.open(approval(), MissionStatus::EnRoute).unwrap();
        assert!(matches!(
            gate.resolve(&HumanDecision::approve(Uuid::new_v4())),
            Err(CoreError::ApprovalNotFound(_))
        ));
        assert!(gate.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_applies_timeout_policy() {
        let mut gate = gate(ApprovalTimeoutPolicy::Approve);
        gate.open(approval(), MissionStatus::EnRoute).unwrap();

        assert!(gate.expire(Instant::now()).is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        let resolution = gate.expire(Instant::now()).unwrap();
        assert_eq!(resolution.decision, Decision::Approved);
        assert_eq!(resolution.resume_phase, MissionStatus::EnRoute);
        assert!(resolution.timed_out);
        assert!(gate.expire(Instant::now()).is_none());
    }
}
