//! Governance engine
//!
//! Entry point for every governance operation. Each committed transition
//! emits exactly one audit event and one notification addressed to the
//! affected parties; both are fire-and-forget and run after the store has
//! committed, so neither can block or undo a transition.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink, TracingAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::compatibility::{
    CompatibilityCache, CompatibilityMode, CompatibilityOutcome, RegisteredSchema, SchemaChange,
};
use crate::config::RegistryConfig;
use crate::delivery::{DeliveryId, DeliveryRecord, Dispatcher};
use crate::error::{RegistryError, Result};
use crate::events::{EventEnvelope, GovernanceEvent, NoopNotifier, Notifier};
use crate::model::{
    Actor, ActorId, AssetId, Contract, ContractId, ContractStatus, Objection, ObjectionId, Proposal,
    ProposalId, ProposalStatus, Registration, RegistrationId, TeamId,
};
use crate::proposal::{self, next_status, Resolution, ResolutionAction, Transition};
use crate::schema::{SchemaDocument, SchemaLimits};
use crate::store::{ConditionalUpdate, GovernanceStore};
use crate::version::ContractVersion;

/// Result of a publish attempt
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    /// Compatible (or first) version, now the active contract
    Activated(Contract),
    /// Breaking version, parked behind a pending proposal
    ProposalCreated(Proposal),
}

impl PublishOutcome {
    pub fn is_activated(&self) -> bool {
        matches!(self, PublishOutcome::Activated(_))
    }
}

/// Engine tuning taken from [`RegistryConfig`]
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub limits: SchemaLimits,
    pub max_asset_name_length: usize,
    pub proposal_window: Duration,
    pub auto_expire_enabled: bool,
    pub cache_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let config = RegistryConfig::default();
        Self {
            limits: config.schema_limits(),
            max_asset_name_length: config.limits.max_fqn_length,
            proposal_window: Duration::days(30),
            auto_expire_enabled: config.proposals.auto_expire_enabled,
            cache_capacity: 1024,
        }
    }
}

impl TryFrom<&RegistryConfig> for EngineSettings {
    type Error = RegistryError;

    fn try_from(config: &RegistryConfig) -> Result<Self> {
        Ok(Self {
            limits: config.schema_limits(),
            max_asset_name_length: config.limits.max_fqn_length,
            proposal_window: config.proposal_window()?,
            auto_expire_enabled: config.proposals.auto_expire_enabled,
            cache_capacity: 1024,
        })
    }
}

pub struct ContractEngine {
    store: Arc<dyn GovernanceStore>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    dispatcher: Option<Dispatcher>,
    cache: CompatibilityCache,
    settings: EngineSettings,
}

impl ContractEngine {
    pub fn new(store: Arc<dyn GovernanceStore>, settings: EngineSettings) -> Self {
        Self {
            store,
            notifier: Arc::new(NoopNotifier),
            audit: Arc::new(TracingAuditSink),
            clock: Arc::new(SystemClock),
            dispatcher: None,
            cache: CompatibilityCache::new(settings.cache_capacity),
            settings,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Route notifications through `dispatcher` and enable dead-letter replay
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.notifier = Arc::new(dispatcher.clone());
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn GovernanceStore> {
        &self.store
    }

    /// Publish a new version of an asset's contract.
    ///
    /// The first version of an asset is activated directly. Later versions are
    /// checked against the active contract: compatible ones supersede it,
    /// breaking ones open a proposal that must be resolved before anything
    /// else can be published for the asset.
    pub async fn publish(
        &self,
        asset_id: &AssetId,
        version: &str,
        schema: SchemaDocument,
        mode: CompatibilityMode,
        actor: &Actor,
    ) -> Result<PublishOutcome> {
        self.validate_asset_name(asset_id)?;
        schema.validate(&self.settings.limits)?;
        let version = ContractVersion::parse(version)?;

        if let Some(pending) = self.store.pending_proposal(asset_id).await? {
            return Err(RegistryError::PendingProposalExists {
                asset_id: asset_id.clone(),
                proposal_id: pending.id,
            });
        }

        let now = self.clock.now();
        let mut contract = Contract {
            id: ContractId::new(),
            asset_id: asset_id.clone(),
            version,
            schema,
            compatibility_mode: mode,
            status: ContractStatus::Draft,
            published_by: actor.id.clone(),
            producer_team: actor.team.clone(),
            published_at: now,
        };

        let Some(current) = self.store.active_contract(asset_id).await? else {
            self.store.publish_contract(contract.clone(), None).await?;
            contract.status = ContractStatus::Active;
            info!(asset_id = %asset_id, version = %contract.version, "first contract activated");
            self.emit_published(&contract, None, Vec::new(), BTreeSet::new());
            return Ok(PublishOutcome::Activated(contract));
        };

        // The asset's policy is the one already in force; `mode` only applies to the new version
        let registrations = self.store.registrations(current.id).await?;
        let outcome = self.check_against(&current, &contract.schema, current.compatibility_mode, &registrations);

        if outcome.is_compatible() {
            let superseded = self.store.publish_contract(contract.clone(), Some(current.id)).await?;
            contract.status = ContractStatus::Active;
            info!(
                asset_id = %asset_id,
                version = %contract.version,
                previous = %current.version,
                changes = outcome.changes.len(),
                "contract activated"
            );
            let recipients = proposal::affected_parties(&registrations, contract.producer_team.as_ref());
            self.emit_published(&contract, superseded, outcome.changes, recipients);
            return Ok(PublishOutcome::Activated(contract));
        }

        let proposal = proposal::open_proposal(
            &current,
            &contract,
            &outcome,
            &registrations,
            now,
            self.settings.proposal_window,
        )?;
        self.store.open_proposal(contract, proposal.clone()).await?;
        info!(
            asset_id = %asset_id,
            proposal_id = %proposal.id,
            version = %proposal.proposed_version,
            breaking = proposal.breaking_changes.len(),
            affected_teams = proposal.affected_teams.len(),
            "breaking change parked behind proposal"
        );
        self.emit(
            GovernanceEvent::ProposalCreated {
                asset_id: proposal.asset_id.clone(),
                proposal_id: proposal.id,
                proposed_version: proposal.proposed_version.clone(),
                breaking_changes: proposal.breaking_changes.clone(),
                expires_at: proposal.expires_at,
            },
            &actor.id,
            proposal.affected_teams.clone(),
        );
        Ok(PublishOutcome::ProposalCreated(proposal))
    }

    /// Dry-run compatibility of `schema` against the asset's active contract
    pub async fn check(
        &self,
        asset_id: &AssetId,
        schema: &SchemaDocument,
        mode: CompatibilityMode,
    ) -> Result<CompatibilityOutcome> {
        schema.validate(&self.settings.limits)?;
        let current = self
            .store
            .active_contract(asset_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("active contract", asset_id))?;
        let registrations = self.store.registrations(current.id).await?;
        Ok(self.check_against(&current, schema, mode, &registrations))
    }

    /// Withdraw, reject or publish a pending proposal. Exactly one concurrent
    /// resolution wins; the others get `ProposalAlreadyResolved`.
    pub async fn resolve_proposal(
        &self,
        proposal_id: ProposalId,
        action: ResolutionAction,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<Proposal> {
        let current = self
            .store
            .proposal(proposal_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("proposal", proposal_id))?;
        let status = next_status(current.status, Transition::Resolve(action))
            .map_err(|status| RegistryError::ProposalAlreadyResolved { proposal_id, status })?;

        let resolution = Resolution {
            status,
            actor: actor.id.clone(),
            at: self.clock.now(),
            reason: reason.map(str::to_string),
        };
        let resolved = match self.store.resolve_proposal(proposal_id, &resolution).await? {
            ConditionalUpdate::Applied(proposal) => proposal,
            ConditionalUpdate::Stale(proposal) => {
                debug!(proposal_id = %proposal_id, status = %proposal.status, action = %action, "lost resolution race");
                return Err(RegistryError::ProposalAlreadyResolved {
                    proposal_id,
                    status: proposal.status,
                });
            }
            ConditionalUpdate::Missing => return Err(RegistryError::not_found("proposal", proposal_id)),
        };

        info!(
            proposal_id = %proposal_id,
            asset_id = %resolved.asset_id,
            status = %resolved.status,
            actor = %actor.id,
            "proposal resolved"
        );
        match resolution_event(&resolved) {
            Some(event) => self.emit(event, &actor.id, resolved.affected_teams.clone()),
            None => warn!(proposal_id = %proposal_id, status = %resolved.status, "no event for resolved status"),
        }
        Ok(resolved)
    }

    /// Record an advisory objection against a pending proposal
    pub async fn file_objection(
        &self,
        proposal_id: ProposalId,
        team: &TeamId,
        actor: &Actor,
        reason: &str,
    ) -> Result<Objection> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(RegistryError::Validation("objection reason must not be empty".into()));
        }
        let proposal = self
            .store
            .proposal(proposal_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("proposal", proposal_id))?;
        if !proposal.is_pending() {
            return Err(RegistryError::ProposalNotPending {
                proposal_id,
                status: proposal.status,
            });
        }

        let objection = Objection {
            id: ObjectionId::new(),
            proposal_id,
            team: team.clone(),
            filed_by: actor.id.clone(),
            reason: reason.to_string(),
            filed_at: self.clock.now(),
        };
        self.store.add_objection(objection.clone()).await?;
        info!(proposal_id = %proposal_id, team = %team, "objection filed");
        self.emit(
            GovernanceEvent::ObjectionFiled {
                asset_id: proposal.asset_id.clone(),
                proposal_id,
                objection_id: objection.id,
                team: team.clone(),
                reason: objection.reason.clone(),
            },
            &actor.id,
            proposal.affected_teams.clone(),
        );
        Ok(objection)
    }

    /// Expire every pending proposal past its deadline. Safe to run repeatedly
    /// and concurrently: each proposal is expired at most once.
    pub async fn sweep_expired(&self) -> Result<usize> {
        if !self.settings.auto_expire_enabled {
            debug!("auto-expiry disabled; sweep skipped");
            return Ok(0);
        }

        let now = self.clock.now();
        let system = Actor::system();
        let mut expired = 0;
        for candidate in self.store.expired_proposals(now).await? {
            let status = match next_status(candidate.status, Transition::Expire) {
                Ok(status) => status,
                Err(_) => continue,
            };
            let resolution = Resolution {
                status,
                actor: system.id.clone(),
                at: now,
                reason: Some("expired".to_string()),
            };
            match self.store.resolve_proposal(candidate.id, &resolution).await? {
                ConditionalUpdate::Applied(proposal) => {
                    expired += 1;
                    info!(proposal_id = %proposal.id, asset_id = %proposal.asset_id, "proposal expired");
                    if let Some(event) = resolution_event(&proposal) {
                        self.emit(event, &system.id, proposal.affected_teams.clone());
                    }
                }
                ConditionalUpdate::Stale(proposal) => {
                    debug!(proposal_id = %proposal.id, status = %proposal.status, "already resolved; not expired");
                }
                ConditionalUpdate::Missing => {
                    warn!(proposal_id = %candidate.id, "proposal vanished during sweep");
                }
            }
        }
        if expired > 0 {
            info!(expired, "expiry sweep finished");
        }
        Ok(expired)
    }

    /// Re-deliver a dead-lettered notification as a new delivery record
    pub async fn replay_dead_letter(&self, record_id: DeliveryId) -> Result<DeliveryRecord> {
        let dispatcher = self.dispatcher.as_ref().ok_or(RegistryError::DispatcherStopped)?;
        dispatcher.replay(record_id).await
    }

    /// Register `team` as a consumer of the asset's active contract
    pub async fn register_consumer(&self, asset_id: &AssetId, team: &TeamId) -> Result<Registration> {
        let contract = self
            .store
            .active_contract(asset_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("active contract", asset_id))?;
        let registration = Registration::new(contract.id, team.clone(), self.clock.now());
        self.store.register_consumer(registration.clone()).await?;
        debug!(asset_id = %asset_id, team = %team, version = %contract.version, "consumer registered");
        Ok(registration)
    }

    pub async fn deregister_consumer(&self, registration_id: RegistrationId) -> Result<()> {
        self.store.deregister(registration_id, self.clock.now()).await
    }

    pub async fn active_contract(&self, asset_id: &AssetId) -> Result<Option<Contract>> {
        self.store.active_contract(asset_id).await
    }

    pub async fn contract_history(&self, asset_id: &AssetId) -> Result<Vec<Contract>> {
        self.store.contracts(asset_id).await
    }

    pub async fn proposal(&self, proposal_id: ProposalId) -> Result<Option<Proposal>> {
        self.store.proposal(proposal_id).await
    }

    pub async fn pending_proposal(&self, asset_id: &AssetId) -> Result<Option<Proposal>> {
        self.store.pending_proposal(asset_id).await
    }

    pub async fn objections(&self, proposal_id: ProposalId) -> Result<Vec<Objection>> {
        self.store.objections(proposal_id).await
    }

    fn validate_asset_name(&self, asset_id: &AssetId) -> Result<()> {
        let name = asset_id.as_str();
        if name.trim().is_empty() {
            return Err(RegistryError::Validation("asset name must not be empty".into()));
        }
        if name.len() > self.settings.max_asset_name_length {
            return Err(RegistryError::Validation(format!(
                "asset name is {} characters; the limit is {}",
                name.len(),
                self.settings.max_asset_name_length
            )));
        }
        Ok(())
    }

    fn check_against(
        &self,
        current: &Contract,
        schema: &SchemaDocument,
        mode: CompatibilityMode,
        registrations: &[Registration],
    ) -> CompatibilityOutcome {
        // Registrations are bound to the active contract, so each one reads its schema
        let registered: Vec<RegisteredSchema<'_>> = registrations
            .iter()
            .filter(|r| r.is_live())
            .map(|r| RegisteredSchema {
                team: &r.consumer_team,
                schema: &current.schema,
            })
            .collect();
        self.cache.check(&current.schema, schema, mode, &registered)
    }

    fn emit_published(
        &self,
        contract: &Contract,
        superseded: Option<ContractId>,
        changes: Vec<SchemaChange>,
        mut recipients: BTreeSet<TeamId>,
    ) {
        if let Some(team) = &contract.producer_team {
            recipients.insert(team.clone());
        }
        self.emit(
            GovernanceEvent::ContractPublished {
                asset_id: contract.asset_id.clone(),
                contract_id: contract.id,
                version: contract.version.clone(),
                compatibility_mode: contract.compatibility_mode,
                superseded_contract_id: superseded,
                changes,
            },
            &contract.published_by,
            recipients,
        );
    }

    fn emit(&self, event: GovernanceEvent, actor: &ActorId, recipients: BTreeSet<TeamId>) {
        let envelope = EventEnvelope::new(event, actor.clone(), self.clock.now(), recipients);
        self.audit.record(AuditEvent::from_envelope(&envelope));
        self.notifier.notify(envelope);
    }
}

/// The notification for a proposal's terminal status; `None` while still pending
fn resolution_event(proposal: &Proposal) -> Option<GovernanceEvent> {
    let asset_id = proposal.asset_id.clone();
    let proposal_id = proposal.id;
    let reason = proposal.resolution_reason.clone();
    let event = match proposal.status {
        ProposalStatus::Pending => return None,
        ProposalStatus::Published => GovernanceEvent::ProposalPublished {
            asset_id,
            proposal_id,
            contract_id: proposal.proposed_contract_id,
            version: proposal.proposed_version.clone(),
        },
        ProposalStatus::Rejected => GovernanceEvent::ProposalRejected {
            asset_id,
            proposal_id,
            reason,
        },
        ProposalStatus::Withdrawn => GovernanceEvent::ProposalWithdrawn {
            asset_id,
            proposal_id,
            reason,
        },
        ProposalStatus::Expired => GovernanceEvent::ProposalExpired {
            asset_id,
            proposal_id,
            expired_at: proposal.resolved_at.unwrap_or(proposal.expires_at),
        },
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;
    use crate::compatibility::ChangeKind;
    use crate::events::{EventKind, RecordingNotifier};
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Harness {
        engine: ContractEngine,
        notifier: Arc<RecordingNotifier>,
        audit: Arc<MemoryAuditSink>,
        clock: Arc<ManualClock>,
    }

    fn harness(settings: EngineSettings) -> Harness {
        let notifier = Arc::new(RecordingNotifier::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(ManualClock::default());
        let engine = ContractEngine::new(Arc::new(MemoryStore::new()), settings)
            .with_notifier(notifier.clone())
            .with_audit(audit.clone())
            .with_clock(clock.clone());
        Harness {
            engine,
            notifier,
            audit,
            clock,
        }
    }

    fn orders_v1() -> SchemaDocument {
        SchemaDocument::new(json!({
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "total": {"type": "number"}
            },
            "required": ["id"]
        }))
    }

    fn orders_without_id() -> SchemaDocument {
        SchemaDocument::new(json!({
            "type": "object",
            "properties": {"total": {"type": "number"}}
        }))
    }

    fn orders_with_note() -> SchemaDocument {
        SchemaDocument::new(json!({
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "total": {"type": "number"},
                "note": {"type": "string"}
            },
            "required": ["id"]
        }))
    }

    fn producer() -> Actor {
        Actor::producer("alice", "team-a")
    }

    async fn seeded(h: &Harness) -> AssetId {
        let orders = AssetId::new("orders");
        h.engine
            .publish(&orders, "1.0.0", orders_v1(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap();
        h.engine.register_consumer(&orders, &TeamId::new("team-b")).await.unwrap();
        orders
    }

    #[tokio::test]
    async fn test_compatible_publish_supersedes() {
        let h = harness(EngineSettings::default());
        let orders = seeded(&h).await;

        let outcome = h
            .engine
            .publish(&orders, "1.1.0", orders_with_note(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap();
        assert!(outcome.is_activated());

        let history = h.engine.contract_history(&orders).await.unwrap();
        let statuses: Vec<ContractStatus> = history.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![ContractStatus::Superseded, ContractStatus::Active]);

        let published = h.notifier.events().pop().unwrap();
        assert_eq!(published.kind(), EventKind::ContractPublished);
        assert!(published.recipients.contains(&TeamId::new("team-b")));
        assert_eq!(h.audit.find("contract.published", None).len(), 2);
    }

    #[tokio::test]
    async fn test_breaking_publish_opens_proposal() {
        let h = harness(EngineSettings::default());
        let orders = seeded(&h).await;

        let outcome = h
            .engine
            .publish(&orders, "2.0.0", orders_without_id(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap();
        let PublishOutcome::ProposalCreated(proposal) = outcome else {
            panic!("expected a proposal");
        };
        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert!(proposal
            .breaking_changes
            .iter()
            .any(|c| c.kind == ChangeKind::FieldRemoved && c.field == "id"));
        assert_eq!(proposal.expires_at - proposal.created_at, Duration::days(30));

        let active = h.engine.active_contract(&orders).await.unwrap().unwrap();
        assert_eq!(active.version.to_string(), "1.0.0");
        assert_eq!(h.notifier.kinds().last(), Some(&EventKind::ProposalCreated));
    }

    #[tokio::test]
    async fn test_each_resolution_has_its_own_event() {
        let h = harness(EngineSettings::default());
        let orders = seeded(&h).await;
        let PublishOutcome::ProposalCreated(mut proposal) = h
            .engine
            .publish(&orders, "2.0.0", orders_without_id(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap()
        else {
            panic!("expected a proposal");
        };
        assert!(resolution_event(&proposal).is_none());

        for (status, kind) in [
            (ProposalStatus::Published, EventKind::ProposalPublished),
            (ProposalStatus::Rejected, EventKind::ProposalRejected),
            (ProposalStatus::Withdrawn, EventKind::ProposalWithdrawn),
            (ProposalStatus::Expired, EventKind::ProposalExpired),
        ] {
            proposal.status = status;
            assert_eq!(resolution_event(&proposal).map(|e| e.kind()), Some(kind), "{}", status);
        }
    }

    #[tokio::test]
    async fn test_publish_while_pending_is_a_conflict() {
        let h = harness(EngineSettings::default());
        let orders = seeded(&h).await;
        h.engine
            .publish(&orders, "2.0.0", orders_without_id(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap();

        let err = h
            .engine
            .publish(&orders, "3.0.0", orders_without_id(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(err, RegistryError::PendingProposalExists { .. }));
    }

    #[tokio::test]
    async fn test_publish_resolution_activates_proposed_contract() {
        let h = harness(EngineSettings::default());
        let orders = seeded(&h).await;
        let PublishOutcome::ProposalCreated(proposal) = h
            .engine
            .publish(&orders, "2.0.0", orders_without_id(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap()
        else {
            panic!("expected a proposal");
        };

        let resolved = h
            .engine
            .resolve_proposal(proposal.id, ResolutionAction::Publish, &producer(), None)
            .await
            .unwrap();
        assert_eq!(resolved.status, ProposalStatus::Published);
        let active = h.engine.active_contract(&orders).await.unwrap().unwrap();
        assert_eq!(active.id, proposal.proposed_contract_id);

        let err = h
            .engine
            .resolve_proposal(proposal.id, ResolutionAction::Withdraw, &producer(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ProposalAlreadyResolved {
                status: ProposalStatus::Published,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_objections_are_advisory() {
        let h = harness(EngineSettings::default());
        let orders = seeded(&h).await;
        let PublishOutcome::ProposalCreated(proposal) = h
            .engine
            .publish(&orders, "2.0.0", orders_without_id(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap()
        else {
            panic!("expected a proposal");
        };

        let team_b = TeamId::new("team-b");
        let bob = Actor::consumer("bob", "team-b");
        h.engine
            .file_objection(proposal.id, &team_b, &bob, "we read id")
            .await
            .unwrap();
        assert!(h.engine.file_objection(proposal.id, &team_b, &bob, "  ").await.unwrap_err().is_validation());

        let still = h.engine.proposal(proposal.id).await.unwrap().unwrap();
        assert_eq!(still.status, ProposalStatus::Pending);
        assert_eq!(h.engine.objections(proposal.id).await.unwrap().len(), 1);
        assert_eq!(
            h.audit.find("proposal.objection_filed", Some(&proposal.id.to_string())).len(),
            1
        );

        h.engine
            .resolve_proposal(proposal.id, ResolutionAction::Reject, &Actor::admin("root"), Some("no"))
            .await
            .unwrap();
        let err = h
            .engine
            .file_objection(proposal.id, &team_b, &bob, "too late")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ProposalNotPending { .. }));
    }

    #[tokio::test]
    async fn test_sweep_expires_once_and_respects_switch() {
        let h = harness(EngineSettings::default());
        let orders = seeded(&h).await;
        h.engine
            .publish(&orders, "2.0.0", orders_without_id(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap();

        assert_eq!(h.engine.sweep_expired().await.unwrap(), 0);
        h.clock.advance(Duration::days(31));
        assert_eq!(h.engine.sweep_expired().await.unwrap(), 1);
        assert_eq!(h.engine.sweep_expired().await.unwrap(), 0);
        assert_eq!(h.audit.find("proposal.expired", None).len(), 1);
        assert!(h.engine.pending_proposal(&orders).await.unwrap().is_none());

        let disabled = harness(EngineSettings {
            auto_expire_enabled: false,
            ..EngineSettings::default()
        });
        let orders = seeded(&disabled).await;
        disabled
            .engine
            .publish(&orders, "2.0.0", orders_without_id(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap();
        disabled.clock.advance(Duration::days(90));
        assert_eq!(disabled.engine.sweep_expired().await.unwrap(), 0);
        assert!(disabled.engine.pending_proposal(&orders).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_input_validation_happens_first() {
        let h = harness(EngineSettings {
            max_asset_name_length: 8,
            ..EngineSettings::default()
        });
        let long = AssetId::new("orders-and-more");
        let err = h
            .engine
            .publish(&long, "1.0.0", orders_v1(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let orders = AssetId::new("orders");
        let err = h
            .engine
            .publish(&orders, "not-a-version", orders_v1(), CompatibilityMode::Backward, &producer())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(h.engine.active_contract(&orders).await.unwrap().is_none());
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_replay_without_dispatcher() {
        let h = harness(EngineSettings::default());
        let err = h.engine.replay_dead_letter(DeliveryId::new()).await.unwrap_err();
        assert!(matches!(err, RegistryError::DispatcherStopped));
    }
}
