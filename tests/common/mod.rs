//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use contract_registry::clock::ManualClock;
use contract_registry::delivery::{
    BreakerPolicy, DispatcherSettings, OutboundRequest, Resolver, RetryPolicy, Transport,
};
use contract_registry::{DeliveryError, SchemaDocument};

/// Transport that plays back scripted responses and records every request.
/// Once the script runs out every request gets a 200.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<u16, DeliveryError>>>,
    sent: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, response: Result<u16, DeliveryError>) {
        self.script.lock().push_back(response);
    }

    pub fn push_many(&self, response: Result<u16, DeliveryError>, times: usize) {
        for _ in 0..times {
            self.push(response.clone());
        }
    }

    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, url: &str) -> Vec<OutboundRequest> {
        self.sent.lock().iter().filter(|r| r.url == url).cloned().collect()
    }

    pub fn bodies_to(&self, url: &str) -> Vec<Value> {
        self.sent_to(url)
            .iter()
            .map(|r| serde_json::from_str(&r.body).expect("request body is JSON"))
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &OutboundRequest, _timeout: Duration) -> Result<u16, DeliveryError> {
        self.sent.lock().push(request.clone());
        self.script.lock().pop_front().unwrap_or(Ok(200))
    }
}

/// Resolves every host to loopback
pub struct LoopbackResolver;

#[async_trait]
impl Resolver for LoopbackResolver {
    async fn resolve(&self, _host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(vec![SocketAddr::from(([127, 0, 0, 1], port))])
    }
}

/// One attempt per delivery, no backoff, breaker at 5 failures / 60s
pub fn fast_settings() -> DispatcherSettings {
    DispatcherSettings {
        retry: RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        breaker: BreakerPolicy {
            failure_threshold: 5,
            cooldown: chrono::Duration::seconds(60),
            trial_timeout: chrono::Duration::seconds(20),
        },
        default_secret: Some("test-secret".into()),
        ..DispatcherSettings::default()
    }
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::default())
}

/// `orders` v1: requires `id`
pub fn orders_v1() -> SchemaDocument {
    SchemaDocument::new(json!({
        "type": "object",
        "properties": {
            "id": {"type": "integer"},
            "total": {"type": "number"},
            "status": {"type": "string", "enum": ["open", "paid"]}
        },
        "required": ["id"]
    }))
}

/// `orders` v2: drops `id`
pub fn orders_without_id() -> SchemaDocument {
    SchemaDocument::new(json!({
        "type": "object",
        "properties": {
            "total": {"type": "number"},
            "status": {"type": "string", "enum": ["open", "paid"]}
        }
    }))
}

/// `orders` v1.1: adds an optional field
pub fn orders_with_currency() -> SchemaDocument {
    SchemaDocument::new(json!({
        "type": "object",
        "properties": {
            "id": {"type": "integer"},
            "total": {"type": "number"},
            "status": {"type": "string", "enum": ["open", "paid"]},
            "currency": {"type": "string"}
        },
        "required": ["id"]
    }))
}
