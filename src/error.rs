//! Error types for the contract registry

use thiserror::Error;

use crate::model::{AssetId, ProposalId, ProposalStatus};

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry errors surfaced to callers of the governance API
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Malformed schema, oversized payload or bad input, rejected before any state change
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Asset {asset_id} already has a pending proposal: {proposal_id}")]
    PendingProposalExists {
        asset_id: AssetId,
        proposal_id: ProposalId,
    },

    #[error("Proposal {proposal_id} was already resolved as {status}")]
    ProposalAlreadyResolved {
        proposal_id: ProposalId,
        status: ProposalStatus,
    },

    #[error("Proposal {proposal_id} is not pending (status: {status})")]
    ProposalNotPending {
        proposal_id: ProposalId,
        status: ProposalStatus,
    },

    #[error("Version {version} already exists or is not newer for asset {asset_id}")]
    VersionConflict { asset_id: AssetId, version: String },

    #[error("Active contract for asset {asset_id} changed concurrently")]
    ActivationConflict { asset_id: AssetId },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Delivery record {record_id} is not dead-lettered (status: {status})")]
    NotDeadLettered { record_id: String, status: String },

    #[error("Dispatcher is not running")]
    DispatcherStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Semver error: {0}")]
    Semver(#[from] semver::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config_crate::ConfigError),
}

impl RegistryError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Concurrent-mutation losses: a second pending proposal, an already
    /// resolved proposal, a lost activation race or a duplicate version.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::PendingProposalExists { .. }
                | Self::ProposalAlreadyResolved { .. }
                | Self::ProposalNotPending { .. }
                | Self::VersionConflict { .. }
                | Self::ActivationConflict { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Semver(_))
    }
}

/// Failures inside the delivery pipeline. Never returned from governance calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Timeout, 5xx, 429 or connection refused; retried with backoff
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// 4xx (other than 429) or an unusable response; not retried
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),

    /// Destination rejected by the allow-list or DNS resolution
    #[error("Destination rejected: {0}")]
    Destination(String),

    #[error("Signature construction failed: {0}")]
    Signing(String),

    /// Breaker refused the attempt; routes the record to the dead-letter sink
    #[error("Circuit open for destination {0}")]
    CircuitOpen(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
