//! Per-destination circuit breaker
//!
//! ```text
//!                 success
//!         ┌──────────────────────────────────────┐
//!         ▼                                      │
//!   ┌──────────┐  N failures  ┌──────────┐  cooldown  ┌───────────┐
//!   │  CLOSED  │ ───────────► │   OPEN   │ ─────────► │ HALF-OPEN │
//!   │ (normal) │              │ (dead-   │            │ (1 trial) │
//!   └──────────┘              │  letter) │ ◄───────── └───────────┘
//!                             └──────────┘  failure
//! ```
//!
//! Breaker state is a shared record keyed by destination. Transitions are
//! computed by pure functions on [`BreakerRecord`] and persisted with a
//! version-checked swap, so two concurrent failures can never both flip
//! `closed → open` or restart the cooldown twice.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::delivery::store::DeliveryStore;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Persisted breaker state for one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub destination: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_state_change: DateTime<Utc>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    /// A half-open trial delivery has been handed out and not yet reported
    #[serde(default)]
    pub trial_in_flight: bool,
    #[serde(default)]
    pub trial_started_at: Option<DateTime<Utc>>,
    /// Bumped on every write; the swap precondition
    pub version: u64,
}

impl BreakerRecord {
    pub fn closed(destination: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            destination: destination.into(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_state_change: at,
            opened_at: None,
            trial_in_flight: false,
            trial_started_at: None,
            version: 0,
        }
    }

    fn transition(&self, state: BreakerState, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        if next.state != state {
            next.last_state_change = at;
        }
        next.state = state;
        next
    }

    fn with_trial(mut self, at: DateTime<Utc>) -> Self {
        self.trial_in_flight = true;
        self.trial_started_at = Some(at);
        self
    }

    fn without_trial(mut self) -> Self {
        self.trial_in_flight = false;
        self.trial_started_at = None;
        self
    }
}

/// Whether a delivery attempt may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open attempt
    Trial,
    Rejected,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// A trial not reported within this long is treated as abandoned
    pub trial_timeout: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::seconds(60),
            trial_timeout: Duration::seconds(20),
        }
    }
}

impl BreakerPolicy {
    /// Decide admission; returns the record to persist when the decision changes state
    pub fn admit(&self, record: &BreakerRecord, now: DateTime<Utc>) -> (Admission, Option<BreakerRecord>) {
        match record.state {
            BreakerState::Closed => (Admission::Allowed, None),
            BreakerState::Open => {
                let opened_at = record.opened_at.unwrap_or(record.last_state_change);
                if now - opened_at >= self.cooldown {
                    let next = record.transition(BreakerState::HalfOpen, now).with_trial(now);
                    (Admission::Trial, Some(next))
                } else {
                    (Admission::Rejected, None)
                }
            }
            BreakerState::HalfOpen if record.trial_in_flight && !self.trial_abandoned(record, now) => {
                (Admission::Rejected, None)
            }
            BreakerState::HalfOpen => {
                if record.trial_in_flight {
                    warn!(
                        destination = %record.destination,
                        started_at = ?record.trial_started_at,
                        "abandoning unreported circuit trial"
                    );
                }
                (Admission::Trial, Some(record.clone().with_trial(now)))
            }
        }
    }

    fn trial_abandoned(&self, record: &BreakerRecord, now: DateTime<Utc>) -> bool {
        // Records written before trials were timestamped fall back to the state change
        let started = record.trial_started_at.unwrap_or(record.last_state_change);
        now - started >= self.trial_timeout
    }

    pub fn on_success(&self, record: &BreakerRecord, now: DateTime<Utc>) -> Option<BreakerRecord> {
        if record.state == BreakerState::Closed && record.consecutive_failures == 0 {
            return None;
        }
        let mut next = record.transition(BreakerState::Closed, now).without_trial();
        next.consecutive_failures = 0;
        next.opened_at = None;
        Some(next)
    }

    pub fn on_failure(&self, record: &BreakerRecord, now: DateTime<Utc>) -> BreakerRecord {
        let failures = record.consecutive_failures.saturating_add(1);
        let mut next = match record.state {
            BreakerState::Closed if failures >= self.failure_threshold => {
                let mut open = record.transition(BreakerState::Open, now);
                open.opened_at = Some(now);
                open
            }
            BreakerState::Closed | BreakerState::Open => record.clone(),
            BreakerState::HalfOpen => {
                // Failed trial: reopen and restart the cooldown
                let mut open = record.transition(BreakerState::Open, now);
                open.opened_at = Some(now);
                open
            }
        };
        next.consecutive_failures = failures;
        next.without_trial()
    }
}

/// Store-backed breaker registry shared by all dispatch workers
#[derive(Clone)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    store: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy, store: Arc<dyn DeliveryStore>, clock: Arc<dyn Clock>) -> Self {
        Self { policy, store, clock }
    }

    pub async fn state(&self, destination: &str) -> Result<BreakerRecord> {
        self.store.breaker(destination, self.clock.now()).await
    }

    /// Ask whether an attempt against `destination` may go ahead
    pub async fn admit(&self, destination: &str) -> Result<Admission> {
        loop {
            let now = self.clock.now();
            let current = self.store.breaker(destination, now).await?;
            let (admission, next) = self.policy.admit(&current, now);
            let Some(next) = next else {
                if admission == Admission::Rejected {
                    debug!(destination, state = %current.state, "circuit refused delivery");
                }
                return Ok(admission);
            };
            if self.store.swap_breaker(current.version, next.clone()).await? {
                if next.state != current.state {
                    info!(destination, from = %current.state, to = %next.state, "circuit breaker transition");
                }
                return Ok(admission);
            }
        }
    }

    pub async fn record_success(&self, destination: &str) -> Result<()> {
        loop {
            let now = self.clock.now();
            let current = self.store.breaker(destination, now).await?;
            let Some(next) = self.policy.on_success(&current, now) else {
                return Ok(());
            };
            if self.store.swap_breaker(current.version, next.clone()).await? {
                if next.state != current.state {
                    info!(destination, from = %current.state, to = %next.state, "circuit breaker transition");
                }
                return Ok(());
            }
        }
    }

    pub async fn record_failure(&self, destination: &str) -> Result<()> {
        loop {
            let now = self.clock.now();
            let current = self.store.breaker(destination, now).await?;
            let next = self.policy.on_failure(&current, now);
            if self.store.swap_breaker(current.version, next.clone()).await? {
                if next.state == BreakerState::Open && current.state != BreakerState::Open {
                    warn!(
                        destination,
                        failures = next.consecutive_failures,
                        threshold = self.policy.failure_threshold,
                        cooldown_secs = self.policy.cooldown.num_seconds(),
                        "circuit breaker opened"
                    );
                }
                return Ok(());
            }
        }
    }
}
