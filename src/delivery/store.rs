//! Delivery record and breaker state persistence

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::delivery::breaker::BreakerRecord;
use crate::delivery::record::{DeliveryId, DeliveryRecord, DeliveryStatus};
use crate::error::{RegistryError, Result};

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert or update a record. Dead-lettered records are immutable.
    async fn save_record(&self, record: &DeliveryRecord) -> Result<()>;

    async fn record(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>>;

    /// Records for one destination, oldest first
    async fn records_for(&self, destination: &str) -> Result<Vec<DeliveryRecord>>;

    /// Current breaker state; a never-seen destination starts closed at version 0
    async fn breaker(&self, destination: &str, now: DateTime<Utc>) -> Result<BreakerRecord>;

    /// Replace the breaker record if its stored version is still `expected_version`.
    /// The stored version becomes `expected_version + 1`.
    async fn swap_breaker(&self, expected_version: u64, next: BreakerRecord) -> Result<bool>;

    async fn breakers(&self) -> Result<Vec<BreakerRecord>>;
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<DeliveryId, DeliveryRecord>,
    order: Vec<DeliveryId>,
    breakers: HashMap<String, BreakerRecord>,
}

/// Serialized delivery state: records in insertion order plus every breaker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliverySnapshot {
    #[serde(default)]
    pub records: Vec<DeliveryRecord>,
    #[serde(default)]
    pub breakers: Vec<BreakerRecord>,
}

/// In-memory delivery store
#[derive(Debug, Default)]
pub struct MemoryDeliveryStore {
    state: RwLock<State>,
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        let mut breakers: Vec<BreakerRecord> = self.state.read().breakers.values().cloned().collect();
        breakers.sort_by(|a, b| a.destination.cmp(&b.destination));
        DeliverySnapshot {
            records: self.all_records(),
            breakers,
        }
    }

    pub fn from_snapshot(snapshot: DeliverySnapshot) -> Self {
        let mut state = State::default();
        for record in snapshot.records {
            if state.records.insert(record.id, record.clone()).is_none() {
                state.order.push(record.id);
            }
        }
        state.breakers = snapshot
            .breakers
            .into_iter()
            .map(|b| (b.destination.clone(), b))
            .collect();
        Self {
            state: RwLock::new(state),
        }
    }

    /// Every record, in insertion order
    pub fn all_records(&self) -> Vec<DeliveryRecord> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl DeliveryStore for MemoryDeliveryStore {
    async fn save_record(&self, record: &DeliveryRecord) -> Result<()> {
        let mut state = self.state.write();
        match state.records.get(&record.id) {
            Some(existing) if existing.status == DeliveryStatus::DeadLettered => {
                return Err(RegistryError::Validation(format!(
                    "delivery record {} is dead-lettered and can only be replayed",
                    record.id
                )));
            }
            Some(_) => {}
            None => state.order.push(record.id),
        }
        state.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn record(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        Ok(self.state.read().records.get(&id).cloned())
    }

    async fn records_for(&self, destination: &str) -> Result<Vec<DeliveryRecord>> {
        Ok(self
            .all_records()
            .into_iter()
            .filter(|r| r.destination == destination)
            .collect())
    }

    async fn breaker(&self, destination: &str, now: DateTime<Utc>) -> Result<BreakerRecord> {
        Ok(self
            .state
            .read()
            .breakers
            .get(destination)
            .cloned()
            .unwrap_or_else(|| BreakerRecord::closed(destination, now)))
    }

    async fn swap_breaker(&self, expected_version: u64, mut next: BreakerRecord) -> Result<bool> {
        let mut state = self.state.write();
        let stored = state.breakers.get(&next.destination).map_or(0, |b| b.version);
        if stored != expected_version {
            return Ok(false);
        }
        next.version = expected_version + 1;
        state.breakers.insert(next.destination.clone(), next);
        Ok(true)
    }

    async fn breakers(&self) -> Result<Vec<BreakerRecord>> {
        Ok(self.snapshot().breakers)
    }
}

/// Delivery store mirrored to a pretty JSON file after every write, so
/// breaker state survives between operator runs
#[derive(Debug)]
pub struct FileDeliveryStore {
    inner: MemoryDeliveryStore,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDeliveryStore {
    /// Load the state file, or start empty when it does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let snapshot: DeliverySnapshot = serde_json::from_str(&content)?;
            debug!(
                path = %path.display(),
                records = snapshot.records.len(),
                breakers = snapshot.breakers.len(),
                "loaded delivery state"
            );
            MemoryDeliveryStore::from_snapshot(snapshot)
        } else {
            MemoryDeliveryStore::new()
        };
        Ok(Self {
            inner,
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        self.inner.snapshot()
    }

    fn persist(&self) -> Result<()> {
        // Snapshot under the lock so an older state never overwrites a newer one
        let _guard = self.write_lock.lock();
        let content = serde_json::to_string_pretty(&self.inner.snapshot())?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryStore for FileDeliveryStore {
    async fn save_record(&self, record: &DeliveryRecord) -> Result<()> {
        self.inner.save_record(record).await?;
        self.persist()
    }

    async fn record(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        self.inner.record(id).await
    }

    async fn records_for(&self, destination: &str) -> Result<Vec<DeliveryRecord>> {
        self.inner.records_for(destination).await
    }

    async fn breaker(&self, destination: &str, now: DateTime<Utc>) -> Result<BreakerRecord> {
        self.inner.breaker(destination, now).await
    }

    async fn swap_breaker(&self, expected_version: u64, next: BreakerRecord) -> Result<bool> {
        let swapped = self.inner.swap_breaker(expected_version, next).await?;
        if swapped {
            self.persist()?;
        }
        Ok(swapped)
    }

    async fn breakers(&self) -> Result<Vec<BreakerRecord>> {
        self.inner.breakers().await
    }
}
