//! Webhook delivery
//!
//! The [`Dispatcher`] turns governance events into signed HTTP POSTs, one
//! [`DeliveryRecord`] per (event, subscription). Intake is a single queue
//! drained by a router task, which hands records to one worker task per
//! destination. Each worker delivers strictly in order, retrying transient
//! failures with exponential backoff and consulting the destination's
//! circuit breaker before every attempt. Records refused by an open circuit
//! go to the dead-letter sink without touching the network.
//!
//! Delivery never blocks or fails the governance call that emitted the
//! event: [`Dispatcher::dispatch`] only enqueues.

pub mod breaker;
pub mod destination;
pub mod record;
pub mod retry;
pub mod signing;
pub mod store;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::checksum::canonical_json;
use crate::clock::{Clock, SystemClock};
use crate::dead_letter::{DeadLetterSink, MemoryDeadLetterSink};
use crate::error::{DeliveryError, RegistryError, Result};
use crate::events::{EventEnvelope, Notifier};

pub use breaker::{Admission, BreakerPolicy, BreakerRecord, BreakerState, CircuitBreaker};
pub use destination::{DestinationGuard, DnsResolver, Resolver};
pub use record::{DeliveryId, DeliveryRecord, DeliveryStatus, Subscription};
pub use retry::RetryPolicy;
pub use store::{DeliverySnapshot, DeliveryStore, FileDeliveryStore, MemoryDeliveryStore};
pub use transport::{classify_status, HttpTransport, OutboundRequest, Transport};

/// Source of webhook subscriptions
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    async fn subscriptions(&self) -> Result<Vec<Subscription>>;
}

/// Fixed in-process subscription list
#[derive(Debug, Default)]
pub struct StaticSubscriptions {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl StaticSubscriptions {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Self {
            subscriptions: RwLock::new(subscriptions),
        }
    }

    pub fn add(&self, subscription: Subscription) {
        self.subscriptions.write().push(subscription);
    }
}

#[async_trait]
impl SubscriptionDirectory for StaticSubscriptions {
    async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.subscriptions.read().clone())
    }
}

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub retry: RetryPolicy,
    pub breaker: BreakerPolicy,
    pub request_timeout: Duration,
    pub dns_timeout: Duration,
    /// Empty admits every host
    pub allowed_domains: Vec<String>,
    /// Used when a subscription has no secret of its own
    pub default_secret: Option<String>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: BreakerPolicy::default(),
            request_timeout: Duration::from_secs(10),
            dns_timeout: Duration::from_secs(5),
            allowed_domains: Vec::new(),
            default_secret: None,
        }
    }
}

#[derive(Default)]
pub struct DispatcherBuilder {
    settings: DispatcherSettings,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn DeliveryStore>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    subscriptions: Option<Arc<dyn SubscriptionDirectory>>,
    resolver: Option<Arc<dyn Resolver>>,
    clock: Option<Arc<dyn Clock>>,
}

impl DispatcherBuilder {
    pub fn settings(mut self, settings: DispatcherSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn subscriptions(mut self, directory: Arc<dyn SubscriptionDirectory>) -> Self {
        self.subscriptions = Some(directory);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Start the router task. Must be called from within a Tokio runtime.
    pub fn spawn(self) -> Result<Dispatcher> {
        let settings = self.settings;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(settings.request_timeout)
                    .map_err(|e| RegistryError::Validation(e.to_string()))?,
            ),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryDeliveryStore::new()));
        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(MemoryDeadLetterSink::new()));
        let subscriptions = self
            .subscriptions
            .unwrap_or_else(|| Arc::new(StaticSubscriptions::default()));
        let resolver = self.resolver.unwrap_or_else(|| Arc::new(DnsResolver));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let breaker = CircuitBreaker::new(settings.breaker, store.clone(), clock.clone());
        let guard = DestinationGuard::new(&settings.allowed_domains, settings.dns_timeout, resolver);

        let context = Arc::new(Context {
            settings,
            transport,
            store: store.clone(),
            dead_letters: dead_letters.clone(),
            subscriptions,
            guard,
            breaker: breaker.clone(),
            clock,
        });

        let (intake, commands) = mpsc::unbounded_channel();
        tokio::spawn(route(context, commands));

        Ok(Dispatcher {
            intake,
            store,
            dead_letters,
            breaker,
        })
    }
}

/// Handle to the running delivery pipeline. Cheap to clone; the pipeline
/// shuts down after the last handle is dropped and queued work drains.
#[derive(Clone)]
pub struct Dispatcher {
    intake: mpsc::UnboundedSender<Command>,
    store: Arc<dyn DeliveryStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    breaker: CircuitBreaker,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Queue an event for every matching subscription
    pub fn dispatch(&self, envelope: EventEnvelope) {
        let event_id = envelope.event_id;
        if self.intake.send(Command::Dispatch(envelope)).is_err() {
            warn!(%event_id, "dispatcher stopped; event dropped");
        }
    }

    /// Wait until every delivery queued before this call has reached a final state
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.intake
            .send(Command::Flush(done))
            .map_err(|_| RegistryError::DispatcherStopped)?;
        wait.await.map_err(|_| RegistryError::DispatcherStopped)
    }

    /// Re-deliver a dead-lettered record as a new record and wait for its outcome
    pub async fn replay(&self, id: DeliveryId) -> Result<DeliveryRecord> {
        let (reply, wait) = oneshot::channel();
        self.intake
            .send(Command::Replay { id, reply })
            .map_err(|_| RegistryError::DispatcherStopped)?;
        wait.await.map_err(|_| RegistryError::DispatcherStopped)?
    }

    pub async fn dead_letters(&self, destination: Option<&str>) -> Result<Vec<DeliveryRecord>> {
        self.dead_letters.list(destination).await
    }

    pub async fn record(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        self.store.record(id).await
    }

    pub async fn records_for(&self, destination: &str) -> Result<Vec<DeliveryRecord>> {
        self.store.records_for(destination).await
    }

    pub async fn breaker_state(&self, destination: &str) -> Result<BreakerRecord> {
        self.breaker.state(destination).await
    }
}

impl Notifier for Dispatcher {
    fn notify(&self, event: EventEnvelope) {
        self.dispatch(event);
    }
}

type Reply = oneshot::Sender<Result<DeliveryRecord>>;

enum Command {
    Dispatch(EventEnvelope),
    Replay { id: DeliveryId, reply: Reply },
    Flush(oneshot::Sender<()>),
}

enum Job {
    Deliver { record: DeliveryRecord, reply: Option<Reply> },
    Flush(oneshot::Sender<()>),
}

struct Context {
    settings: DispatcherSettings,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DeliveryStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    subscriptions: Arc<dyn SubscriptionDirectory>,
    guard: DestinationGuard,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
}

type Workers = HashMap<String, mpsc::UnboundedSender<Job>>;

async fn route(context: Arc<Context>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut workers = Workers::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Dispatch(envelope) => {
                let subscriptions = match context.subscriptions.subscriptions().await {
                    Ok(subscriptions) => subscriptions,
                    Err(e) => {
                        warn!(event_id = %envelope.event_id, error = %e, "cannot load subscriptions; event not delivered");
                        continue;
                    }
                };
                let body = canonical_json(&envelope.body());
                for subscription in subscriptions.iter().filter(|s| s.wants(&envelope)) {
                    let mut record = DeliveryRecord::new(&envelope, subscription, body.clone(), context.clock.now());
                    context.sign(&mut record, subscription.secret.as_deref());
                    debug!(
                        delivery_id = %record.id,
                        action = %record.action,
                        destination = %record.destination,
                        "delivery queued"
                    );
                    submit(&context, &mut workers, Job::Deliver { record, reply: None });
                }
            }
            Command::Replay { id, reply } => match context.prepare_replay(id).await {
                Ok(record) => submit(&context, &mut workers, Job::Deliver { record, reply: Some(reply) }),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Flush(done) => {
                let mut acks = Vec::new();
                for worker in workers.values() {
                    let (ack, wait) = oneshot::channel();
                    if worker.send(Job::Flush(ack)).is_ok() {
                        acks.push(wait);
                    }
                }
                for wait in acks {
                    let _ = wait.await;
                }
                let _ = done.send(());
            }
        }
    }
    debug!("dispatcher intake closed");
}

fn spawn_worker(context: &Arc<Context>, destination: &str) -> mpsc::UnboundedSender<Job> {
    let (jobs, queue) = mpsc::unbounded_channel();
    tokio::spawn(work(context.clone(), destination.to_string(), queue));
    jobs
}

fn submit(context: &Arc<Context>, workers: &mut Workers, job: Job) {
    let Job::Deliver { record, .. } = &job else {
        return;
    };
    let destination = record.destination.clone();
    let worker = workers
        .entry(destination.clone())
        .or_insert_with(|| spawn_worker(context, &destination));
    let Err(mpsc::error::SendError(job)) = worker.send(job) else {
        return;
    };

    // The worker is gone; start a fresh one for this destination
    let worker = spawn_worker(context, &destination);
    if worker.send(job).is_err() {
        error!(destination = %destination, "delivery worker unavailable");
    }
    workers.insert(destination, worker);
}

async fn work(context: Arc<Context>, destination: String, mut queue: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = queue.recv().await {
        match job {
            Job::Deliver { record, reply } => {
                let id = record.id;
                let outcome = context.deliver(record).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(outcome);
                    }
                    None => {
                        if let Err(e) = outcome {
                            error!(delivery_id = %id, destination = %destination, error = %e, "delivery bookkeeping failed");
                        }
                    }
                }
            }
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

impl Context {
    fn sign(&self, record: &mut DeliveryRecord, secret: Option<&str>) {
        let Some(secret) = secret.or(self.settings.default_secret.as_deref()) else {
            return;
        };
        match signing::sign(record.body.as_bytes(), secret) {
            Ok(signature) => record.signature = Some(signature),
            Err(e) => {
                record.status = DeliveryStatus::Failed;
                record.last_error = Some(e.to_string());
            }
        }
    }

    async fn prepare_replay(&self, id: DeliveryId) -> Result<DeliveryRecord> {
        let original = match self.dead_letters.get(id).await? {
            Some(original) => original,
            None => {
                return match self.store.record(id).await? {
                    Some(record) => Err(RegistryError::NotDeadLettered {
                        record_id: id.to_string(),
                        status: record.status.to_string(),
                    }),
                    None => Err(RegistryError::not_found("delivery record", id)),
                };
            }
        };
        if original.status != DeliveryStatus::DeadLettered {
            return Err(RegistryError::NotDeadLettered {
                record_id: id.to_string(),
                status: original.status.to_string(),
            });
        }

        let secret = self
            .subscriptions
            .subscriptions()
            .await?
            .into_iter()
            .find(|s| s.id == original.subscription_id)
            .and_then(|s| s.secret);
        let mut record = DeliveryRecord::replay_of(&original, self.clock.now());
        self.sign(&mut record, secret.as_deref());
        info!(delivery_id = %record.id, replayed_from = %original.id, destination = %record.destination, "replaying dead letter");
        Ok(record)
    }

    fn request_for(&self, record: &DeliveryRecord) -> OutboundRequest {
        let mut headers = vec![
            (signing::DELIVERY_HEADER.to_string(), record.id.to_string()),
            (signing::EVENT_HEADER.to_string(), record.action.as_str().to_string()),
            (
                signing::TIMESTAMP_HEADER.to_string(),
                record.created_at.timestamp().to_string(),
            ),
        ];
        if let Some(signature) = &record.signature {
            headers.push((signing::SIGNATURE_HEADER.to_string(), signature.clone()));
        }
        OutboundRequest {
            url: record.destination.clone(),
            headers,
            body: record.body.clone(),
        }
    }

    async fn attempt(&self, record: &DeliveryRecord) -> std::result::Result<(), DeliveryError> {
        let request = self.request_for(record);
        let timeout = self.settings.request_timeout;
        let status = tokio::time::timeout(timeout, self.transport.send(&request, timeout))
            .await
            .map_err(|_| DeliveryError::Transient(format!("timed out after {:?}", timeout)))??;
        classify_status(status)
    }

    async fn finish(&self, mut record: DeliveryRecord, status: DeliveryStatus, error: Option<String>) -> Result<DeliveryRecord> {
        record.status = status;
        record.next_retry_at = None;
        if error.is_some() {
            record.last_error = error;
        }
        self.store.save_record(&record).await?;
        Ok(record)
    }

    async fn deliver(&self, mut record: DeliveryRecord) -> Result<DeliveryRecord> {
        self.store.save_record(&record).await?;
        if record.is_final() {
            warn!(delivery_id = %record.id, error = ?record.last_error, "delivery failed before sending");
            return Ok(record);
        }

        if let Err(e) = self.guard.check(&record.destination).await {
            warn!(delivery_id = %record.id, destination = %record.destination, error = %e, "destination rejected");
            return self.finish(record, DeliveryStatus::Failed, Some(e.to_string())).await;
        }

        loop {
            if !self.breaker.admit(&record.destination).await?.is_allowed() {
                let refusal = DeliveryError::CircuitOpen(record.destination.clone());
                warn!(delivery_id = %record.id, destination = %record.destination, "circuit open; dead-lettering delivery");
                let record = self
                    .finish(record, DeliveryStatus::DeadLettered, Some(refusal.to_string()))
                    .await?;
                self.dead_letters.enqueue(record.clone()).await?;
                return Ok(record);
            }

            let now = self.clock.now();
            record.attempts += 1;
            record.last_attempt_at = Some(now);
            record.next_retry_at = None;

            match self.attempt(&record).await {
                Ok(()) => {
                    self.breaker.record_success(&record.destination).await?;
                    record.last_error = None;
                    info!(delivery_id = %record.id, destination = %record.destination, attempts = record.attempts, "delivered");
                    return self.finish(record, DeliveryStatus::Delivered, None).await;
                }
                Err(e) if e.is_retryable() => {
                    self.breaker.record_failure(&record.destination).await?;
                    if !self.settings.retry.should_retry(record.attempts) {
                        warn!(delivery_id = %record.id, destination = %record.destination, attempts = record.attempts, error = %e, "delivery failed; retries exhausted");
                        return self.finish(record, DeliveryStatus::Failed, Some(e.to_string())).await;
                    }
                    let delay = self.settings.retry.delay_after(record.attempts);
                    record.last_error = Some(e.to_string());
                    record.next_retry_at =
                        Some(now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
                    self.store.save_record(&record).await?;
                    debug!(delivery_id = %record.id, attempt = record.attempts, delay_ms = delay.as_millis() as u64, error = %e, "retrying delivery");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // The destination answered, so it counts as reachable
                    self.breaker.record_success(&record.destination).await?;
                    warn!(delivery_id = %record.id, destination = %record.destination, error = %e, "delivery rejected permanently");
                    return self.finish(record, DeliveryStatus::Failed, Some(e.to_string())).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::GovernanceEvent;
    use crate::model::{ActorId, AssetId, ProposalId, TeamId};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<std::result::Result<u16, DeliveryError>>>,
        sent: Mutex<Vec<OutboundRequest>>,
    }

    impl ScriptedTransport {
        fn with(script: Vec<std::result::Result<u16, DeliveryError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                sent: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &OutboundRequest, _timeout: Duration) -> std::result::Result<u16, DeliveryError> {
            self.sent.lock().push(request.clone());
            self.script.lock().pop_front().unwrap_or(Ok(200))
        }
    }

    struct LocalResolver;

    #[async_trait]
    impl Resolver for LocalResolver {
        async fn resolve(&self, _host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
            Ok(vec![SocketAddr::from(([127, 0, 0, 1], port))])
        }
    }

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            default_secret: Some("global-secret".into()),
            ..DispatcherSettings::default()
        }
    }

    fn dispatcher(transport: Arc<ScriptedTransport>, subscriptions: Vec<Subscription>) -> (Dispatcher, Arc<MemoryDeliveryStore>) {
        let store = Arc::new(MemoryDeliveryStore::new());
        let dispatcher = Dispatcher::builder()
            .settings(settings())
            .transport(transport)
            .store(store.clone())
            .subscriptions(Arc::new(StaticSubscriptions::new(subscriptions)))
            .resolver(Arc::new(LocalResolver))
            .clock(Arc::new(ManualClock::default()))
            .spawn()
            .unwrap();
        (dispatcher, store)
    }

    fn envelope(asset: &str) -> EventEnvelope {
        EventEnvelope::new(
            GovernanceEvent::ProposalWithdrawn {
                asset_id: AssetId::new(asset),
                proposal_id: ProposalId::new(),
                reason: None,
            },
            ActorId::new("alice"),
            chrono::Utc::now(),
            [TeamId::new("team-b")].into_iter().collect(),
        )
    }

    #[tokio::test]
    async fn test_delivery_is_signed_and_ordered() {
        let transport = ScriptedTransport::with(vec![]);
        let (dispatcher, store) = dispatcher(
            transport.clone(),
            vec![Subscription::new("b", "https://b.example.com/hook").for_team(TeamId::new("team-b"))],
        );

        for asset in ["first", "second", "third"] {
            dispatcher.dispatch(envelope(asset));
        }
        dispatcher.flush().await.unwrap();

        let sent = transport.sent.lock().clone();
        let assets: Vec<String> = sent
            .iter()
            .map(|r| {
                let body: serde_json::Value = serde_json::from_str(&r.body).unwrap();
                body["payload"]["asset_id"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(assets, vec!["first", "second", "third"]);

        let request = &sent[0];
        let signature = request.header(signing::SIGNATURE_HEADER).unwrap();
        assert!(signing::verify(request.body.as_bytes(), "global-secret", signature));
        assert_eq!(request.header(signing::EVENT_HEADER), Some("proposal.withdrawn"));

        let records = store.all_records();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == DeliveryStatus::Delivered && r.attempts == 1));
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_fail() {
        let transport = ScriptedTransport::with(vec![
            Err(DeliveryError::Transient("connection refused".into())),
            Ok(503),
            Ok(502),
        ]);
        let (dispatcher, store) = dispatcher(transport.clone(), vec![Subscription::new("g", "https://g.example.com")]);

        dispatcher.dispatch(envelope("orders"));
        dispatcher.flush().await.unwrap();

        let record = store.all_records().pop().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(record.last_error.unwrap().contains("502"));
        assert_eq!(transport.sent.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let transport = ScriptedTransport::with(vec![Ok(404)]);
        let (dispatcher, store) = dispatcher(transport.clone(), vec![Subscription::new("g", "https://g.example.com")]);

        dispatcher.dispatch(envelope("orders"));
        dispatcher.flush().await.unwrap();

        let record = store.all_records().pop().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 1);
        let breaker = dispatcher.breaker_state("https://g.example.com").await.unwrap();
        assert_eq!(breaker.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_replay_of_unknown_or_live_record() {
        let transport = ScriptedTransport::with(vec![]);
        let (dispatcher, store) = dispatcher(transport, vec![Subscription::new("g", "https://g.example.com")]);

        let err = dispatcher.replay(DeliveryId::new()).await.unwrap_err();
        assert!(err.is_not_found());

        dispatcher.dispatch(envelope("orders"));
        dispatcher.flush().await.unwrap();
        let delivered = store.all_records().pop().unwrap();
        let err = dispatcher.replay(delivered.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotDeadLettered { .. }));
    }
}
