//! Domain records: contracts, registrations, proposals, objections

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compatibility::{CompatibilityMode, SchemaChange};
use crate::schema::SchemaDocument;
use crate::version::ContractVersion;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

macro_rules! name_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

name_id!(
    /// Fully-qualified asset name (e.g. `warehouse.sales.orders`)
    AssetId
);
name_id!(TeamId);
name_id!(ActorId);
uuid_id!(ContractId);
uuid_id!(RegistrationId);
uuid_id!(ProposalId);
uuid_id!(ObjectionId);

/// Role the authentication collaborator granted the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Producer,
    Consumer,
    Admin,
    System,
}

/// An already-authorized caller identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub team: Option<TeamId>,
    pub role: ActorRole,
}

impl Actor {
    pub const SYSTEM_ID: &'static str = "system";

    pub fn new(id: impl Into<String>, team: Option<TeamId>, role: ActorRole) -> Self {
        Self {
            id: ActorId::new(id),
            team,
            role,
        }
    }

    pub fn producer(id: impl Into<String>, team: impl Into<String>) -> Self {
        Self::new(id, Some(TeamId::new(team)), ActorRole::Producer)
    }

    pub fn consumer(id: impl Into<String>, team: impl Into<String>) -> Self {
        Self::new(id, Some(TeamId::new(team)), ActorRole::Consumer)
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, None, ActorRole::Admin)
    }

    /// Actor used for scheduled transitions such as auto-expiry
    pub fn system() -> Self {
        Self::new(Self::SYSTEM_ID, None, ActorRole::System)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Superseded,
    Draft,
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContractStatus::Active => "active",
            ContractStatus::Superseded => "superseded",
            ContractStatus::Draft => "draft",
        };
        f.write_str(s)
    }
}

/// A versioned schema published for an asset. Never deleted, only superseded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub asset_id: AssetId,
    pub version: ContractVersion,
    pub schema: SchemaDocument,
    pub compatibility_mode: CompatibilityMode,
    pub status: ContractStatus,
    pub published_by: ActorId,
    pub producer_team: Option<TeamId>,
    pub published_at: DateTime<Utc>,
}

impl Contract {
    pub fn is_active(&self) -> bool {
        self.status == ContractStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Active,
    Cancelled,
}

/// A consumer team's declared dependency on one contract version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub id: RegistrationId,
    pub contract_id: ContractId,
    pub consumer_team: TeamId,
    pub status: RegistrationStatus,
    pub registered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Registration {
    pub fn new(contract_id: ContractId, consumer_team: TeamId, at: DateTime<Utc>) -> Self {
        Self {
            id: RegistrationId::new(),
            contract_id,
            consumer_team,
            status: RegistrationStatus::Active,
            registered_at: at,
            deleted_at: None,
        }
    }

    /// Active and not soft-deleted
    pub fn is_live(&self) -> bool {
        self.status == RegistrationStatus::Active && self.deleted_at.is_none()
    }
}

/// Proposal lifecycle. Every status except `Pending` is terminal.
///
/// The serialized vocabulary is shared with existing storage and consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Published,
    Withdrawn,
    Expired,
    Rejected,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Published => "published",
            ProposalStatus::Withdrawn => "withdrawn",
            ProposalStatus::Expired => "expired",
            ProposalStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending governance decision triggered by a breaking schema change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub asset_id: AssetId,
    /// Contract that was active when the proposal was created
    pub current_contract_id: ContractId,
    /// Draft contract that becomes active if the proposal is published
    pub proposed_contract_id: ContractId,
    pub proposed_version: ContractVersion,
    pub compatibility_mode: CompatibilityMode,
    pub breaking_changes: Vec<SchemaChange>,
    /// Fixed at creation; later deregistrations do not shrink it
    pub affected_teams: BTreeSet<TeamId>,
    pub producer_team: Option<TeamId>,
    pub proposed_by: ActorId,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: Option<ActorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_reason: Option<String>,
}

impl Proposal {
    pub fn is_pending(&self) -> bool {
        self.status == ProposalStatus::Pending
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && now >= self.expires_at
    }
}

/// An advisory objection filed by a consumer team. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objection {
    pub id: ObjectionId,
    pub proposal_id: ProposalId,
    pub team: TeamId,
    pub filed_by: ActorId,
    pub reason: String,
    pub filed_at: DateTime<Utc>,
}
