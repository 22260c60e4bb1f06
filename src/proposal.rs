//! Breaking-change proposal state machine
//!
//! ```text
//!                  ┌── withdraw (producer) ──→ [WITHDRAWN]
//!                  ├── reject (admin/policy) ─→ [REJECTED]
//! create ──→ [PENDING]
//!                  ├── publish (producer) ────→ [PUBLISHED]  activates proposed contract
//!                  └── expire (system, now ≥ expires_at) ──→ [EXPIRED]
//! ```
//!
//! Every state but `pending` is terminal. The transition function is pure;
//! single-writer-wins is enforced by the store's conditional update, which
//! only applies a resolution while the proposal is still pending.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::compatibility::CompatibilityOutcome;
use crate::error::RegistryError;
use crate::model::{
    ActorId, Contract, Proposal, ProposalId, ProposalStatus, Registration, TeamId,
};

/// Manual resolution actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Withdraw,
    Reject,
    Publish,
}

impl ResolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionAction::Withdraw => "withdraw",
            ResolutionAction::Reject => "reject",
            ResolutionAction::Publish => "publish",
        }
    }
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "withdraw" => Ok(ResolutionAction::Withdraw),
            "reject" => Ok(ResolutionAction::Reject),
            // The approval step and the publish step are the same transition
            "publish" | "approve" => Ok(ResolutionAction::Publish),
            other => Err(format!("unknown resolution action '{}'", other)),
        }
    }
}

/// Events that drive the proposal state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Resolve(ResolutionAction),
    Expire,
}

/// Calculate the next status. Pure, deterministic.
///
/// Returns the current status as the error when the proposal is already terminal.
pub fn next_status(current: ProposalStatus, transition: Transition) -> Result<ProposalStatus, ProposalStatus> {
    match (current, transition) {
        (ProposalStatus::Pending, Transition::Resolve(ResolutionAction::Withdraw)) => {
            Ok(ProposalStatus::Withdrawn)
        }
        (ProposalStatus::Pending, Transition::Resolve(ResolutionAction::Reject)) => {
            Ok(ProposalStatus::Rejected)
        }
        (ProposalStatus::Pending, Transition::Resolve(ResolutionAction::Publish)) => {
            Ok(ProposalStatus::Published)
        }
        (ProposalStatus::Pending, Transition::Expire) => Ok(ProposalStatus::Expired),
        (terminal, _) => Err(terminal),
    }
}

/// Terminal outcome written by a conditional update
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub status: ProposalStatus,
    pub actor: ActorId,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl Resolution {
    /// Apply to a proposal snapshot that is known to be pending
    pub fn apply_to(&self, proposal: &mut Proposal) {
        proposal.status = self.status;
        proposal.resolved_at = Some(self.at);
        proposal.resolved_by = Some(self.actor.clone());
        proposal.resolution_reason = self.reason.clone();
    }
}

/// Teams notified on every transition of a proposal: distinct consumer teams
/// with a live registration on the active contract, plus the producer.
pub fn affected_parties(registrations: &[Registration], producer_team: Option<&TeamId>) -> BTreeSet<TeamId> {
    let mut teams: BTreeSet<TeamId> = registrations
        .iter()
        .filter(|r| r.is_live())
        .map(|r| r.consumer_team.clone())
        .collect();
    if let Some(team) = producer_team {
        teams.insert(team.clone());
    }
    teams
}

/// Build a fresh pending proposal for a breaking publish attempt
pub fn open_proposal(
    current: &Contract,
    proposed: &Contract,
    outcome: &CompatibilityOutcome,
    registrations: &[Registration],
    now: DateTime<Utc>,
    window: Duration,
) -> crate::error::Result<Proposal> {
    let expires_at = now
        .checked_add_signed(window)
        .ok_or_else(|| RegistryError::Validation(format!("proposal window of {} days is out of range", window.num_days())))?;
    Ok(Proposal {
        id: ProposalId::new(),
        asset_id: proposed.asset_id.clone(),
        current_contract_id: current.id,
        proposed_contract_id: proposed.id,
        proposed_version: proposed.version.clone(),
        compatibility_mode: outcome.mode,
        breaking_changes: outcome.breaking_changes(),
        affected_teams: affected_parties(registrations, proposed.producer_team.as_ref()),
        producer_team: proposed.producer_team.clone(),
        proposed_by: proposed.published_by.clone(),
        status: ProposalStatus::Pending,
        created_at: now,
        expires_at,
        resolved_at: None,
        resolved_by: None,
        resolution_reason: None,
    })
}
