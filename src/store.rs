//! Governance persistence port
//!
//! The active-contract pointer per asset and the one-pending-proposal-per-asset
//! rule are the only points of write contention. Both are resolved inside the
//! store by conditional updates on the persisted records, so correctness holds
//! across several engine instances sharing one store. Implementations must
//! make each mutating method atomic.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};
use crate::model::{
    AssetId, Contract, ContractId, ContractStatus, Objection, Proposal, ProposalId,
    ProposalStatus, Registration, RegistrationId,
};
use crate::proposal::Resolution;

/// Outcome of a conditional proposal update
#[derive(Debug, Clone)]
pub enum ConditionalUpdate {
    /// The proposal was still pending; this write won
    Applied(Proposal),
    /// Someone else already resolved it; carries the current record
    Stale(Proposal),
    Missing,
}

#[async_trait]
pub trait GovernanceStore: Send + Sync {
    async fn contract(&self, id: ContractId) -> Result<Option<Contract>>;

    async fn active_contract(&self, asset_id: &AssetId) -> Result<Option<Contract>>;

    /// All versions of an asset, oldest first
    async fn contracts(&self, asset_id: &AssetId) -> Result<Vec<Contract>>;

    /// Insert `contract` as the asset's active contract and supersede the
    /// previous one, provided the active pointer still equals `expected_active`,
    /// no proposal is pending and the version is newer than every existing one.
    /// Returns the superseded contract id.
    async fn publish_contract(
        &self,
        contract: Contract,
        expected_active: Option<ContractId>,
    ) -> Result<Option<ContractId>>;

    /// Insert a draft contract and its pending proposal together, provided no
    /// other proposal is pending for the asset and the active pointer still
    /// equals `proposal.current_contract_id`.
    async fn open_proposal(&self, draft: Contract, proposal: Proposal) -> Result<()>;

    async fn proposal(&self, id: ProposalId) -> Result<Option<Proposal>>;

    async fn pending_proposal(&self, asset_id: &AssetId) -> Result<Option<Proposal>>;

    /// Apply `resolution` only while the proposal is pending. A `published`
    /// resolution also activates the proposed contract and supersedes the
    /// active one in the same update.
    async fn resolve_proposal(&self, id: ProposalId, resolution: &Resolution) -> Result<ConditionalUpdate>;

    /// Pending proposals whose deadline is at or before `now`
    async fn expired_proposals(&self, now: DateTime<Utc>) -> Result<Vec<Proposal>>;

    /// Append an objection while the proposal is pending
    async fn add_objection(&self, objection: Objection) -> Result<()>;

    async fn objections(&self, proposal_id: ProposalId) -> Result<Vec<Objection>>;

    async fn register_consumer(&self, registration: Registration) -> Result<()>;

    /// Soft-delete a registration
    async fn deregister(&self, id: RegistrationId, at: DateTime<Utc>) -> Result<()>;

    /// Live registrations on one contract
    async fn registrations(&self, contract_id: ContractId) -> Result<Vec<Registration>>;
}

/// Serialisable image of a [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub contracts: Vec<Contract>,
    pub registrations: Vec<Registration>,
    pub proposals: Vec<Proposal>,
    pub objections: Vec<Objection>,
}

#[derive(Debug, Default)]
struct State {
    contracts: HashMap<ContractId, Contract>,
    registrations: HashMap<RegistrationId, Registration>,
    proposals: HashMap<ProposalId, Proposal>,
    objections: Vec<Objection>,
}

impl State {
    fn active(&self, asset_id: &AssetId) -> Option<&Contract> {
        self.contracts
            .values()
            .find(|c| &c.asset_id == asset_id && c.is_active())
    }

    fn pending(&self, asset_id: &AssetId) -> Option<&Proposal> {
        self.proposals
            .values()
            .find(|p| &p.asset_id == asset_id && p.is_pending())
    }

    /// Checks shared by both publishing paths
    fn admit(&self, contract: &Contract, expected_active: Option<ContractId>) -> Result<()> {
        if let Some(pending) = self.pending(&contract.asset_id) {
            return Err(RegistryError::PendingProposalExists {
                asset_id: contract.asset_id.clone(),
                proposal_id: pending.id,
            });
        }
        let newest = self
            .contracts
            .values()
            .filter(|c| c.asset_id == contract.asset_id)
            .map(|c| &c.version)
            .max();
        if newest.is_some_and(|v| *v >= contract.version) {
            return Err(RegistryError::VersionConflict {
                asset_id: contract.asset_id.clone(),
                version: contract.version.to_string(),
            });
        }
        if self.active(&contract.asset_id).map(|c| c.id) != expected_active {
            return Err(RegistryError::ActivationConflict {
                asset_id: contract.asset_id.clone(),
            });
        }
        Ok(())
    }

    /// Make `contract_id` the only active contract of its asset
    fn activate(&mut self, asset_id: &AssetId, contract_id: ContractId) -> Option<ContractId> {
        let previous = self.active(asset_id).map(|c| c.id).filter(|id| *id != contract_id);
        if let Some(prev) = previous {
            if let Some(c) = self.contracts.get_mut(&prev) {
                c.status = ContractStatus::Superseded;
            }
        }
        if let Some(c) = self.contracts.get_mut(&contract_id) {
            c.status = ContractStatus::Active;
        }
        previous
    }
}

/// In-process store; every mutation runs under one write lock
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        let mut snapshot = Snapshot {
            contracts: state.contracts.values().cloned().collect(),
            registrations: state.registrations.values().cloned().collect(),
            proposals: state.proposals.values().cloned().collect(),
            objections: state.objections.clone(),
        };
        snapshot
            .contracts
            .sort_by(|a, b| a.asset_id.cmp(&b.asset_id).then(a.version.cmp(&b.version)));
        snapshot.registrations.sort_by_key(|r| r.registered_at);
        snapshot.proposals.sort_by_key(|p| p.created_at);
        snapshot
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let state = State {
            contracts: snapshot.contracts.into_iter().map(|c| (c.id, c)).collect(),
            registrations: snapshot.registrations.into_iter().map(|r| (r.id, r)).collect(),
            proposals: snapshot.proposals.into_iter().map(|p| (p.id, p)).collect(),
            objections: snapshot.objections,
        };
        Self {
            state: RwLock::new(state),
        }
    }

    /// Persist the current state as pretty JSON
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.snapshot())?;
        // Write then rename so a crash never leaves a torn snapshot
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a snapshot, or start empty when the file does not exist
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        Ok(Self::from_snapshot(snapshot))
    }
}

#[async_trait]
impl GovernanceStore for MemoryStore {
    async fn contract(&self, id: ContractId) -> Result<Option<Contract>> {
        Ok(self.state.read().contracts.get(&id).cloned())
    }

    async fn active_contract(&self, asset_id: &AssetId) -> Result<Option<Contract>> {
        Ok(self.state.read().active(asset_id).cloned())
    }

    async fn contracts(&self, asset_id: &AssetId) -> Result<Vec<Contract>> {
        let mut contracts: Vec<Contract> = self
            .state
            .read()
            .contracts
            .values()
            .filter(|c| &c.asset_id == asset_id)
            .cloned()
            .collect();
        contracts.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(contracts)
    }

    async fn publish_contract(
        &self,
        mut contract: Contract,
        expected_active: Option<ContractId>,
    ) -> Result<Option<ContractId>> {
        let mut state = self.state.write();
        state.admit(&contract, expected_active)?;
        let asset_id = contract.asset_id.clone();
        let id = contract.id;
        contract.status = ContractStatus::Draft;
        state.contracts.insert(id, contract);
        Ok(state.activate(&asset_id, id))
    }

    async fn open_proposal(&self, mut draft: Contract, proposal: Proposal) -> Result<()> {
        let mut state = self.state.write();
        state.admit(&draft, Some(proposal.current_contract_id))?;
        draft.status = ContractStatus::Draft;
        state.contracts.insert(draft.id, draft);
        state.proposals.insert(proposal.id, proposal);
        Ok(())
    }

    async fn proposal(&self, id: ProposalId) -> Result<Option<Proposal>> {
        Ok(self.state.read().proposals.get(&id).cloned())
    }

    async fn pending_proposal(&self, asset_id: &AssetId) -> Result<Option<Proposal>> {
        Ok(self.state.read().pending(asset_id).cloned())
    }

    async fn resolve_proposal(&self, id: ProposalId, resolution: &Resolution) -> Result<ConditionalUpdate> {
        let mut state = self.state.write();
        let Some(current) = state.proposals.get(&id).cloned() else {
            return Ok(ConditionalUpdate::Missing);
        };
        if !current.is_pending() {
            return Ok(ConditionalUpdate::Stale(current));
        }

        let mut updated = current;
        resolution.apply_to(&mut updated);
        if resolution.status == ProposalStatus::Published {
            if !state.contracts.contains_key(&updated.proposed_contract_id) {
                return Err(RegistryError::not_found("contract", updated.proposed_contract_id));
            }
            state.activate(&updated.asset_id, updated.proposed_contract_id);
        }
        state.proposals.insert(id, updated.clone());
        Ok(ConditionalUpdate::Applied(updated))
    }

    async fn expired_proposals(&self, now: DateTime<Utc>) -> Result<Vec<Proposal>> {
        let mut expired: Vec<Proposal> = self
            .state
            .read()
            .proposals
            .values()
            .filter(|p| p.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|p| p.expires_at);
        Ok(expired)
    }

    async fn add_objection(&self, objection: Objection) -> Result<()> {
        let mut state = self.state.write();
        let proposal = state
            .proposals
            .get(&objection.proposal_id)
            .ok_or_else(|| RegistryError::not_found("proposal", objection.proposal_id))?;
        if !proposal.is_pending() {
            return Err(RegistryError::ProposalNotPending {
                proposal_id: proposal.id,
                status: proposal.status,
            });
        }
        state.objections.push(objection);
        Ok(())
    }

    async fn objections(&self, proposal_id: ProposalId) -> Result<Vec<Objection>> {
        Ok(self
            .state
            .read()
            .objections
            .iter()
            .filter(|o| o.proposal_id == proposal_id)
            .cloned()
            .collect())
    }

    async fn register_consumer(&self, registration: Registration) -> Result<()> {
        let mut state = self.state.write();
        if !state.contracts.contains_key(&registration.contract_id) {
            return Err(RegistryError::not_found("contract", registration.contract_id));
        }
        state.registrations.insert(registration.id, registration);
        Ok(())
    }

    async fn deregister(&self, id: RegistrationId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write();
        let registration = state
            .registrations
            .get_mut(&id)
            .ok_or_else(|| RegistryError::not_found("registration", id))?;
        registration.deleted_at.get_or_insert(at);
        Ok(())
    }

    async fn registrations(&self, contract_id: ContractId) -> Result<Vec<Registration>> {
        let mut regs: Vec<Registration> = self
            .state
            .read()
            .registrations
            .values()
            .filter(|r| r.contract_id == contract_id && r.is_live())
            .cloned()
            .collect();
        regs.sort_by_key(|r| r.registered_at);
        Ok(regs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compatibility::CompatibilityMode;
    use crate::model::{ActorId, TeamId};
    use crate::schema::SchemaDocument;
    use crate::version::ContractVersion;
    use serde_json::json;
    use tempfile::tempdir;

    fn contract(asset: &str, version: &str) -> Contract {
        Contract {
            id: ContractId::new(),
            asset_id: AssetId::new(asset),
            version: ContractVersion::parse(version).unwrap(),
            schema: SchemaDocument::new(json!({"type": "object"})),
            compatibility_mode: CompatibilityMode::Backward,
            status: ContractStatus::Draft,
            published_by: ActorId::new("alice"),
            producer_team: Some(TeamId::new("team-a")),
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_supersedes_previous() {
        let store = MemoryStore::new();
        let v1 = contract("orders", "1.0.0");
        let v2 = contract("orders", "1.1.0");
        assert_eq!(store.publish_contract(v1.clone(), None).await.unwrap(), None);
        assert_eq!(
            store.publish_contract(v2.clone(), Some(v1.id)).await.unwrap(),
            Some(v1.id)
        );

        let all = store.contracts(&AssetId::new("orders")).await.unwrap();
        let statuses: Vec<ContractStatus> = all.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![ContractStatus::Superseded, ContractStatus::Active]);
    }

    #[tokio::test]
    async fn test_stale_expected_active_is_a_conflict() {
        let store = MemoryStore::new();
        let v1 = contract("orders", "1.0.0");
        store.publish_contract(v1, None).await.unwrap();
        let err = store
            .publish_contract(contract("orders", "2.0.0"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ActivationConflict { .. }));
    }

    #[tokio::test]
    async fn test_versions_must_increase() {
        let store = MemoryStore::new();
        let v2 = contract("orders", "2.0.0");
        store.publish_contract(v2.clone(), None).await.unwrap();
        let err = store
            .publish_contract(contract("orders", "1.5.0"), Some(v2.id))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/registry.json");

        let store = MemoryStore::new();
        let v1 = contract("orders", "1.0.0");
        store.publish_contract(v1.clone(), None).await.unwrap();
        store
            .register_consumer(Registration::new(v1.id, TeamId::new("team-b"), Utc::now()))
            .await
            .unwrap();
        store.save_snapshot(&path).unwrap();

        let restored = MemoryStore::load_snapshot(&path).unwrap();
        let active = restored.active_contract(&AssetId::new("orders")).await.unwrap();
        assert_eq!(active.map(|c| c.id), Some(v1.id));
        assert_eq!(restored.registrations(v1.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_snapshot_starts_empty() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::load_snapshot(dir.path().join("absent.json")).unwrap();
        assert!(store.snapshot().contracts.is_empty());
    }

    #[tokio::test]
    async fn test_deregistered_consumers_are_hidden() {
        let store = MemoryStore::new();
        let v1 = contract("orders", "1.0.0");
        store.publish_contract(v1.clone(), None).await.unwrap();
        let reg = Registration::new(v1.id, TeamId::new("team-b"), Utc::now());
        store.register_consumer(reg.clone()).await.unwrap();
        store.deregister(reg.id, Utc::now()).await.unwrap();
        assert!(store.registrations(v1.id).await.unwrap().is_empty());
    }
}
