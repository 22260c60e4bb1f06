//! Dead-letter sink
//!
//! Durable home for delivery records refused by an open circuit. Entries are
//! never changed after enqueue; replaying one creates a new delivery record
//! that points back at it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::delivery::record::{DeliveryId, DeliveryRecord};
use crate::error::Result;

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn enqueue(&self, record: DeliveryRecord) -> Result<()>;

    /// Entries in enqueue order, optionally for a single destination
    async fn list(&self, destination: Option<&str>) -> Result<Vec<DeliveryRecord>>;

    async fn get(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    entries: RwLock<Vec<DeliveryRecord>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn enqueue(&self, record: DeliveryRecord) -> Result<()> {
        self.entries.write().push(record);
        Ok(())
    }

    async fn list(&self, destination: Option<&str>) -> Result<Vec<DeliveryRecord>> {
        Ok(filter_destination(self.entries.read().clone(), destination))
    }

    async fn get(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        Ok(self.entries.read().iter().find(|r| r.id == id).cloned())
    }
}

/// Append-only JSON-lines file, one record per line
#[derive(Debug)]
pub struct FileDeadLetterSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDeadLetterSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<DeliveryRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DeliveryRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %e,
                    "skipping unreadable dead-letter entry"
                ),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetterSink {
    async fn enqueue(&self, record: DeliveryRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list(&self, destination: Option<&str>) -> Result<Vec<DeliveryRecord>> {
        Ok(filter_destination(self.read_all().await?, destination))
    }

    async fn get(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        Ok(self.read_all().await?.into_iter().find(|r| r.id == id))
    }
}

fn filter_destination(records: Vec<DeliveryRecord>, destination: Option<&str>) -> Vec<DeliveryRecord> {
    match destination {
        Some(dest) => records.into_iter().filter(|r| r.destination == dest).collect(),
        None => records,
    }
}
