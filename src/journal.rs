//! Append-only write journal with a durable monotonic counter.
//!
//! Every record write lands here before its warm-store write becomes
//! visible. After a crash, entries newer than the last save checkpoint are
//! replayed back into the warm tier.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::MemoryError;
use crate::record::{now_ms, MemoryRecord};
use crate::store::{KvStore, StoreName};

const COUNTER_KEY: &str = "journal_counter";
const CHECKPOINT_KEY: &str = "journal_checkpoint";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: u64,
    pub timestamp: i64,
    pub record: MemoryRecord,
}

pub struct Journal {
    kv: Arc<dyn KvStore>,
    counter: AtomicU64,
    rotation_size: u64,
}

/// Zero-padded so lexicographic key order equals numeric entry order.
fn entry_key(id: u64) -> String {
    format!("{id:020}")
}

impl Journal {
    /// Open the journal, restoring the counter persisted in the meta store.
    pub async fn open(kv: Arc<dyn KvStore>, rotation_size: u64) -> Result<Self, MemoryError> {
        let counter = kv
            .get(StoreName::Meta, COUNTER_KEY)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        debug!(counter, "journal opened");
        Ok(Self {
            kv,
            counter: AtomicU64::new(counter),
            rotation_size,
        })
    }

    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Append a record snapshot. The counter is persisted before the entry
    /// so ids stay strictly monotonic across restarts even mid-crash.
    pub async fn append(&self, record: &MemoryRecord) -> Result<u64, MemoryError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.kv
            .put(StoreName::Meta, COUNTER_KEY, serde_json::json!(id))
            .await?;

        let entry = JournalEntry {
            id,
            timestamp: now_ms(),
            record: record.clone(),
        };
        self.kv
            .put(
                StoreName::Journal,
                &entry_key(id),
                serde_json::to_value(&entry)
                    .map_err(|e| MemoryError::Internal(e.to_string()))?,
            )
            .await?;

        if self.kv.count(StoreName::Journal).await? as u64 >= self.rotation_size {
            self.rotate().await?;
        }
        Ok(id)
    }

    pub async fn depth(&self) -> Result<usize, MemoryError> {
        self.kv.count(StoreName::Journal).await
    }

    /// Drop the oldest half of the journal. The counter never resets.
    pub async fn rotate(&self) -> Result<usize, MemoryError> {
        let keys = self.kv.keys(StoreName::Journal).await?;
        let drop_count = keys.len() / 2;
        for key in keys.iter().take(drop_count) {
            self.kv.delete(StoreName::Journal, key).await?;
        }
        if drop_count > 0 {
            info!(dropped = drop_count, "journal rotated");
        }
        Ok(drop_count)
    }

    /// Mark everything up to the current counter as safely persisted.
    /// Called after a successful index + store save.
    pub async fn checkpoint(&self) -> Result<(), MemoryError> {
        self.kv
            .put(
                StoreName::Meta,
                CHECKPOINT_KEY,
                serde_json::json!(self.counter()),
            )
            .await
    }

    pub async fn checkpoint_id(&self) -> Result<u64, MemoryError> {
        Ok(self
            .kv
            .get(StoreName::Meta, CHECKPOINT_KEY)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    /// Entries written after the last checkpoint, oldest first. These are
    /// the candidates for crash-recovery replay.
    pub async fn entries_after_checkpoint(&self) -> Result<Vec<JournalEntry>, MemoryError> {
        let checkpoint = self.checkpoint_id().await?;
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let chunk = self.kv.scan_chunk(StoreName::Journal, offset, 256).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len();
            for (_, value) in chunk {
                let entry: JournalEntry = serde_json::from_value(value)
                    .map_err(|e| MemoryError::Store(format!("corrupt journal entry: {e}")))?;
                if entry.id > checkpoint {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    pub async fn clear(&self) -> Result<(), MemoryError> {
        self.kv.clear(StoreName::Journal).await
    }
}
