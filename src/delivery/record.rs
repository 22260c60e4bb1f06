//! Delivery records and webhook subscriptions

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{EventEnvelope, EventKind};
use crate::model::TeamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for DeliveryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    DeadLettered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt-tracked delivery of one event to one destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: DeliveryId,
    pub event_id: Uuid,
    pub action: EventKind,
    pub subscription_id: String,
    pub destination: String,
    /// Canonical JSON body; the exact bytes that are signed and sent
    pub body: String,
    /// `sha256=<hex>` over `body`, absent when no secret is configured
    #[serde(default)]
    pub signature: Option<String>,
    pub attempts: u32,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Dead-lettered record this one re-delivers
    #[serde(default)]
    pub replayed_from: Option<DeliveryId>,
}

impl DeliveryRecord {
    pub fn new(
        envelope: &EventEnvelope,
        subscription: &Subscription,
        body: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            event_id: envelope.event_id,
            action: envelope.kind(),
            subscription_id: subscription.id.clone(),
            destination: subscription.url.clone(),
            body,
            signature: None,
            attempts: 0,
            status: DeliveryStatus::Pending,
            created_at,
            last_attempt_at: None,
            next_retry_at: None,
            last_error: None,
            replayed_from: None,
        }
    }

    /// Fresh pending copy of a dead-lettered record
    pub fn replay_of(original: &DeliveryRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryId::new(),
            signature: None,
            attempts: 0,
            status: DeliveryStatus::Pending,
            created_at,
            last_attempt_at: None,
            next_retry_at: None,
            last_error: None,
            replayed_from: Some(original.id),
            ..original.clone()
        }
    }

    pub fn is_final(&self) -> bool {
        self.status != DeliveryStatus::Pending
    }
}

/// A webhook destination and the events it wants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub url: String,
    /// Per-subscription signing secret; falls back to the global one
    #[serde(default)]
    pub secret: Option<String>,
    /// Only events addressed to this team; `None` receives everything
    #[serde(default)]
    pub team: Option<TeamId>,
    /// Empty means every action
    #[serde(default)]
    pub events: BTreeSet<EventKind>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Subscription {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            secret: None,
            team: None,
            events: BTreeSet::new(),
            active: true,
        }
    }

    pub fn for_team(mut self, team: TeamId) -> Self {
        self.team = Some(team);
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = EventKind>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    pub fn wants(&self, envelope: &EventEnvelope) -> bool {
        if !self.active {
            return false;
        }
        if !self.events.is_empty() && !self.events.contains(&envelope.kind()) {
            return false;
        }
        match &self.team {
            Some(team) => envelope.recipients.contains(team),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GovernanceEvent;
    use crate::model::{ActorId, AssetId, ProposalId};

    fn envelope(recipients: &[&str]) -> EventEnvelope {
        EventEnvelope::new(
            GovernanceEvent::ProposalWithdrawn {
                asset_id: AssetId::new("orders"),
                proposal_id: ProposalId::new(),
                reason: None,
            },
            ActorId::new("alice"),
            Utc::now(),
            recipients.iter().map(|t| TeamId::new(*t)).collect(),
        )
    }

    #[test]
    fn test_team_subscription_filters_recipients() {
        let sub = Subscription::new("b", "https://b.example.com/hook").for_team(TeamId::new("team-b"));
        assert!(sub.wants(&envelope(&["team-a", "team-b"])));
        assert!(!sub.wants(&envelope(&["team-a"])));
    }

    #[test]
    fn test_event_filter_and_inactive() {
        let mut sub = Subscription::new("g", "https://g.example.com/hook")
            .with_events([EventKind::ProposalCreated]);
        assert!(!sub.wants(&envelope(&[])));
        sub.events.clear();
        assert!(sub.wants(&envelope(&[])));
        sub.active = false;
        assert!(!sub.wants(&envelope(&[])));
    }

    #[test]
    fn test_replay_copy_links_original() {
        let env = envelope(&["team-b"]);
        let sub = Subscription::new("b", "https://b.example.com/hook");
        let mut original = DeliveryRecord::new(&env, &sub, "{}".into(), Utc::now());
        original.status = DeliveryStatus::DeadLettered;
        original.attempts = 3;
        original.last_error = Some("Circuit open".into());

        let replay = DeliveryRecord::replay_of(&original, Utc::now());
        assert_ne!(replay.id, original.id);
        assert_eq!(replay.replayed_from, Some(original.id));
        assert_eq!(replay.status, DeliveryStatus::Pending);
        assert_eq!(replay.attempts, 0);
        assert_eq!(replay.body, original.body);
        assert_eq!(replay.event_id, original.event_id);
        assert!(replay.last_error.is_none());
    }
}
