//! Governance events and the notification port
//!
//! Every state transition produces one [`GovernanceEvent`], a tagged variant
//! over the action kind, wrapped in a fixed [`EventEnvelope`] (action, entity
//! type and id, actor, payload). The envelope body is what subscribers
//! receive and what the audit log stores.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::compatibility::{CompatibilityMode, SchemaChange};
use crate::model::{ActorId, AssetId, ContractId, ObjectionId, ProposalId, TeamId};
use crate::version::ContractVersion;

/// Action names, stable on the wire and in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "contract.published")]
    ContractPublished,
    #[serde(rename = "proposal.created")]
    ProposalCreated,
    #[serde(rename = "proposal.withdrawn")]
    ProposalWithdrawn,
    #[serde(rename = "proposal.rejected")]
    ProposalRejected,
    #[serde(rename = "proposal.published")]
    ProposalPublished,
    #[serde(rename = "proposal.expired")]
    ProposalExpired,
    #[serde(rename = "proposal.objection_filed")]
    ObjectionFiled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ContractPublished => "contract.published",
            EventKind::ProposalCreated => "proposal.created",
            EventKind::ProposalWithdrawn => "proposal.withdrawn",
            EventKind::ProposalRejected => "proposal.rejected",
            EventKind::ProposalPublished => "proposal.published",
            EventKind::ProposalExpired => "proposal.expired",
            EventKind::ObjectionFiled => "proposal.objection_filed",
        }
    }

    pub fn entity_type(&self) -> &'static str {
        match self {
            EventKind::ContractPublished => "contract",
            _ => "proposal",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-action payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum GovernanceEvent {
    #[serde(rename = "contract.published")]
    ContractPublished {
        asset_id: AssetId,
        contract_id: ContractId,
        version: ContractVersion,
        compatibility_mode: CompatibilityMode,
        #[serde(default)]
        superseded_contract_id: Option<ContractId>,
        changes: Vec<SchemaChange>,
    },
    #[serde(rename = "proposal.created")]
    ProposalCreated {
        asset_id: AssetId,
        proposal_id: ProposalId,
        proposed_version: ContractVersion,
        breaking_changes: Vec<SchemaChange>,
        expires_at: DateTime<Utc>,
    },
    #[serde(rename = "proposal.withdrawn")]
    ProposalWithdrawn {
        asset_id: AssetId,
        proposal_id: ProposalId,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "proposal.rejected")]
    ProposalRejected {
        asset_id: AssetId,
        proposal_id: ProposalId,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "proposal.published")]
    ProposalPublished {
        asset_id: AssetId,
        proposal_id: ProposalId,
        contract_id: ContractId,
        version: ContractVersion,
    },
    #[serde(rename = "proposal.expired")]
    ProposalExpired {
        asset_id: AssetId,
        proposal_id: ProposalId,
        expired_at: DateTime<Utc>,
    },
    #[serde(rename = "proposal.objection_filed")]
    ObjectionFiled {
        asset_id: AssetId,
        proposal_id: ProposalId,
        objection_id: ObjectionId,
        team: TeamId,
        reason: String,
    },
}

impl GovernanceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GovernanceEvent::ContractPublished { .. } => EventKind::ContractPublished,
            GovernanceEvent::ProposalCreated { .. } => EventKind::ProposalCreated,
            GovernanceEvent::ProposalWithdrawn { .. } => EventKind::ProposalWithdrawn,
            GovernanceEvent::ProposalRejected { .. } => EventKind::ProposalRejected,
            GovernanceEvent::ProposalPublished { .. } => EventKind::ProposalPublished,
            GovernanceEvent::ProposalExpired { .. } => EventKind::ProposalExpired,
            GovernanceEvent::ObjectionFiled { .. } => EventKind::ObjectionFiled,
        }
    }

    pub fn asset_id(&self) -> &AssetId {
        match self {
            GovernanceEvent::ContractPublished { asset_id, .. }
            | GovernanceEvent::ProposalCreated { asset_id, .. }
            | GovernanceEvent::ProposalWithdrawn { asset_id, .. }
            | GovernanceEvent::ProposalRejected { asset_id, .. }
            | GovernanceEvent::ProposalPublished { asset_id, .. }
            | GovernanceEvent::ProposalExpired { asset_id, .. }
            | GovernanceEvent::ObjectionFiled { asset_id, .. } => asset_id,
        }
    }

    /// Id of the entity the event is about
    pub fn entity_id(&self) -> String {
        match self {
            GovernanceEvent::ContractPublished { contract_id, .. } => contract_id.to_string(),
            GovernanceEvent::ProposalCreated { proposal_id, .. }
            | GovernanceEvent::ProposalWithdrawn { proposal_id, .. }
            | GovernanceEvent::ProposalRejected { proposal_id, .. }
            | GovernanceEvent::ProposalPublished { proposal_id, .. }
            | GovernanceEvent::ProposalExpired { proposal_id, .. }
            | GovernanceEvent::ObjectionFiled { proposal_id, .. } => proposal_id.to_string(),
        }
    }

    /// The structured payload on its own
    pub fn payload(&self) -> Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("payload").map(Value::take))
            .unwrap_or(Value::Null)
    }
}

/// Fixed envelope around every governance event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub actor_id: ActorId,
    pub occurred_at: DateTime<Utc>,
    /// Teams the event is addressed to
    pub recipients: BTreeSet<TeamId>,
    pub event: GovernanceEvent,
}

impl EventEnvelope {
    pub fn new(
        event: GovernanceEvent,
        actor_id: ActorId,
        occurred_at: DateTime<Utc>,
        recipients: BTreeSet<TeamId>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            actor_id,
            occurred_at,
            recipients,
            event,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    pub fn entity_type(&self) -> &'static str {
        self.kind().entity_type()
    }

    pub fn entity_id(&self) -> String {
        self.event.entity_id()
    }

    /// Body delivered to subscribers
    pub fn body(&self) -> Value {
        json!({
            "event_id": self.event_id,
            "action": self.kind().as_str(),
            "entity_type": self.entity_type(),
            "entity_id": self.entity_id(),
            "actor_id": self.actor_id,
            "occurred_at": self.occurred_at,
            "recipients": self.recipients,
            "payload": self.event.payload(),
        })
    }
}

/// Fire-and-forget sink for governance notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, event: EventEnvelope);
}

/// Drops every notification
#[derive(Debug, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: EventEnvelope) {}
}

/// Keeps notifications in memory, in emission order
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(EventEnvelope::kind).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: EventEnvelope) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_body_shape() {
        let proposal_id = ProposalId::new();
        let event = GovernanceEvent::ProposalWithdrawn {
            asset_id: AssetId::new("orders"),
            proposal_id,
            reason: Some("superseded by a better plan".into()),
        };
        let envelope = EventEnvelope::new(
            event,
            ActorId::new("alice"),
            Utc::now(),
            [TeamId::new("team-a"), TeamId::new("team-b")].into_iter().collect(),
        );
        let body = envelope.body();
        assert_eq!(body["action"], "proposal.withdrawn");
        assert_eq!(body["entity_type"], "proposal");
        assert_eq!(body["entity_id"], proposal_id.to_string());
        assert_eq!(body["actor_id"], "alice");
        assert_eq!(body["payload"]["asset_id"], "orders");
        assert_eq!(body["recipients"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_event_round_trips_through_tag() {
        let event = GovernanceEvent::ProposalExpired {
            asset_id: AssetId::new("orders"),
            proposal_id: ProposalId::new(),
            expired_at: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "proposal.expired");
        let back: GovernanceEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind().entity_type(), "proposal");
    }

    #[test]
    fn test_recording_notifier_keeps_order() {
        let notifier = RecordingNotifier::new();
        for kind in ["a", "b"] {
            notifier.notify(EventEnvelope::new(
                GovernanceEvent::ProposalRejected {
                    asset_id: AssetId::new(kind),
                    proposal_id: ProposalId::new(),
                    reason: None,
                },
                ActorId::new("admin"),
                Utc::now(),
                BTreeSet::new(),
            ));
        }
        let assets: Vec<String> = notifier
            .events()
            .iter()
            .map(|e| e.event.asset_id().to_string())
            .collect();
        assert_eq!(assets, vec!["a", "b"]);
    }
}
