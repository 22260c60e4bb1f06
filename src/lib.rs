//! Contract Registry
//!
//! Governance core for versioned data contracts: compatibility checking of
//! schema changes, a proposal workflow for breaking changes, and signed
//! webhook notifications with per-destination circuit breaking.
//!
//! ## Features
//!
//! - **Compatibility Checking**: backward, forward and full modes over JSON Schema
//!   documents, with a field-level change report
//! - **Proposal Workflow**: breaking changes wait behind a single pending proposal
//!   per asset until withdrawn, rejected, published or expired
//! - **Signed Delivery**: HMAC-SHA256 signed webhooks, retried with backoff and
//!   delivered in order per destination
//! - **Dead Letters**: deliveries refused by an open circuit are parked for replay
//!
//! ## Architecture
//!
//! ```text
//! publish ──► ContractEngine ──► CompatibilityChecker
//!                  │
//!                  ├──► GovernanceStore (conditional updates)
//!                  ├──► AuditSink
//!                  └──► Dispatcher ──► worker per destination ──► Transport
//!                                            │
//!                                            └──► CircuitBreaker ──► DeadLetterSink
//! ```

pub mod audit;
pub mod checksum;
pub mod clock;
pub mod compatibility;
pub mod config;
pub mod dead_letter;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod proposal;
pub mod schema;
pub mod store;
pub mod version;

pub use checksum::Checksum;
pub use compatibility::{ChangeKind, CompatibilityChecker, CompatibilityMode, CompatibilityOutcome, SchemaChange};
pub use config::RegistryConfig;
pub use dead_letter::{DeadLetterSink, FileDeadLetterSink, MemoryDeadLetterSink};
pub use delivery::{DeliveryRecord, DeliveryStatus, Dispatcher, Subscription};
pub use engine::{ContractEngine, EngineSettings, PublishOutcome};
pub use error::{DeliveryError, RegistryError, Result};
pub use model::{Actor, AssetId, Contract, Proposal, ProposalStatus, TeamId};
pub use proposal::ResolutionAction;
pub use schema::SchemaDocument;
pub use store::{GovernanceStore, MemoryStore};
pub use version::ContractVersion;
