//! Domain records persisted by the store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::logic::backend::{BackupRef, Verdict};
use crate::logic::conflict::ConflictReport;
use crate::logic::policy::{Origin, PolicyRule, RenderedRule};

// ============================================================================
// PROPOSAL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalState {
    Draft,
    PendingApproval,
    Approved,
    Rejected,
    Superseded,
}

impl ProposalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalState::Draft => "draft",
            ProposalState::PendingApproval => "pending-approval",
            ProposalState::Approved => "approved",
            ProposalState::Rejected => "rejected",
            ProposalState::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ProposalState::Draft),
            "pending-approval" => Some(ProposalState::PendingApproval),
            "approved" => Some(ProposalState::Approved),
            "rejected" => Some(ProposalState::Rejected),
            "superseded" => Some(ProposalState::Superseded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalState::Rejected | ProposalState::Superseded)
    }
}

/// A candidate policy change before and after review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub rule: PolicyRule,
    pub backend: String,
    #[serde(default)]
    pub rendered: Option<RenderedRule>,
    #[serde(default)]
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub conflicts: ConflictReport,
    #[serde(default)]
    pub explanation: Option<String>,
    pub state: ProposalState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    pub fn new(rule: PolicyRule, backend: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            rule,
            backend: backend.into(),
            rendered: None,
            verdict: None,
            conflicts: ConflictReport::default(),
            explanation: None,
            state: ProposalState::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn origin(&self) -> Origin {
        self.rule.origin
    }

    pub fn deployable(&self) -> bool {
        self.state == ProposalState::Approved
            && self.verdict.as_ref().map(|v| v.valid).unwrap_or(false)
    }
}

// ============================================================================
// DEPLOYMENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentState {
    Applying,
    Probation,
    Committed,
    RolledBack,
    Failed,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Applying => "applying",
            DeploymentState::Probation => "probation",
            DeploymentState::Committed => "committed",
            DeploymentState::RolledBack => "rolled-back",
            DeploymentState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applying" => Some(DeploymentState::Applying),
            "probation" => Some(DeploymentState::Probation),
            "committed" => Some(DeploymentState::Committed),
            "rolled-back" => Some(DeploymentState::RolledBack),
            "failed" => Some(DeploymentState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Committed | DeploymentState::RolledBack | DeploymentState::Failed
        )
    }

    pub fn is_live(&self) -> bool {
        matches!(self, DeploymentState::Applying | DeploymentState::Probation)
    }
}

/// The record of applying one approved proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub backend: String,
    pub origin: Origin,
    #[serde(default)]
    pub backup_ref: Option<BackupRef>,
    pub state: DeploymentState,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(proposal: &Proposal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            proposal_id: proposal.id,
            backend: proposal.backend.clone(),
            origin: proposal.origin(),
            backup_ref: None,
            state: DeploymentState::Applying,
            applied_at: None,
            heartbeat_deadline: None,
            last_heartbeat_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// NEVER-BLOCK ROWS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeverBlockRow {
    pub entry: String,
    pub kind: String,
    pub added_by: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::policy::{Action, Direction};

    #[test]
    fn state_strings_round_trip() {
        for state in [
            ProposalState::Draft,
            ProposalState::PendingApproval,
            ProposalState::Approved,
            ProposalState::Rejected,
            ProposalState::Superseded,
        ] {
            assert_eq!(ProposalState::parse(state.as_str()), Some(state));
        }
        for state in [
            DeploymentState::Applying,
            DeploymentState::Probation,
            DeploymentState::Committed,
            DeploymentState::RolledBack,
            DeploymentState::Failed,
        ] {
            assert_eq!(DeploymentState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn proposal_is_deployable_only_approved_and_valid() {
        let rule = PolicyRule::new(Direction::Input, Action::Drop, Origin::User);
        let mut proposal = Proposal::new(rule, "mock");
        assert!(!proposal.deployable());
        proposal.state = ProposalState::Approved;
        assert!(!proposal.deployable());
        proposal.verdict = Some(Verdict::ok());
        assert!(proposal.deployable());
    }
}
