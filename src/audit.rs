//! Audit trail emission
//!
//! One audit event per state transition, handed to an external append-only
//! log. Emission is fire-and-forget: a failing sink is logged and never
//! blocks or rolls back a governance transition.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::events::EventEnvelope;
use crate::model::ActorId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor_id: ActorId,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn from_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            action: envelope.kind().as_str().to_string(),
            entity_type: envelope.entity_type().to_string(),
            entity_id: envelope.entity_id(),
            actor_id: envelope.actor_id.clone(),
            payload: envelope.event.payload(),
            occurred_at: envelope.occurred_at,
        }
    }
}

/// Append-only audit log port
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `audit` tracing target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            action = %event.action,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            actor_id = %event.actor_id,
            payload = %event.payload,
            "audit event"
        );
    }
}

/// In-memory audit log
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events for one action, optionally narrowed to one entity
    pub fn find(&self, action: &str, entity_id: Option<&str>) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .filter(|e| entity_id.map_or(true, |id| e.entity_id == id))
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
