//! Approximate-nearest-neighbor indexes for the hot and warm tiers.
//!
//! [`VectorIndex`] is the capability contract; [`GraphIndex`] is the
//! in-crate implementation. [`IndexManager`] owns the hot/warm pair and the
//! soft-delete bookkeeping that drives compaction.

mod graph;

pub use graph::GraphIndex;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::MemoryError;
use crate::store::KvStore;

/// Stable node identifier. Valid from insert until the node is soft-deleted
/// and compacted away; compaction never renumbers survivors.
pub type Handle = u64;

#[derive(Debug, Clone)]
pub struct IndexHit {
    pub handle: Handle,
    pub metadata: Value,
    /// Cosine similarity clamped to [0, 1].
    pub score: f64,
}

/// Contract every backing ANN implementation must satisfy.
///
/// Callers MUST store the handle returned by `insert_with_metadata` on the
/// owning record; later mutation and deletion target nodes by handle, never
/// by "most recent insert".
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn insert_with_metadata(&self, vector: Vec<f32>, metadata: Value) -> Result<Handle, MemoryError>;

    /// Top-k live nodes by similarity. Soft-deleted nodes are never returned.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>, MemoryError>;

    fn update_metadata(&self, handle: Handle, metadata: Value) -> Result<(), MemoryError>;

    /// Logical removal: search skips the node, memory is reclaimed by
    /// `compact`.
    fn soft_delete(&self, handle: Handle) -> Result<(), MemoryError>;

    /// Physically remove soft-deleted nodes and rebuild adjacency.
    /// Returns the number of nodes removed.
    fn compact(&self) -> usize;

    fn get_all_metadata(&self) -> Vec<(Handle, Value)>;

    /// Stored vector for a live node; used when moving a record between
    /// tiers whose only full-precision copy lives in the index.
    fn vector(&self, handle: Handle) -> Option<Vec<f32>>;

    fn live_count(&self) -> usize;

    async fn save(&self, kv: &Arc<dyn KvStore>, name: &str) -> Result<(), MemoryError>;

    /// Returns false when no snapshot exists under `name`.
    async fn load(&self, kv: &Arc<dyn KvStore>, name: &str) -> Result<bool, MemoryError>;
}

/// Owns the hot and warm indexes plus compaction scheduling state.
pub struct IndexManager {
    pub hot: GraphIndex,
    pub warm: GraphIndex,
    deletions_since_compaction: AtomicU64,
    compaction_threshold: u64,
    compact_flag: tokio::sync::Mutex<()>,
}

impl IndexManager {
    pub fn new(compaction_threshold: u64) -> Self {
        Self {
            hot: GraphIndex::new(),
            warm: GraphIndex::new(),
            deletions_since_compaction: AtomicU64::new(0),
            compaction_threshold,
            compact_flag: tokio::sync::Mutex::new(()),
        }
    }

    pub fn deletions_since_compaction(&self) -> u64 {
        self.deletions_since_compaction.load(Ordering::Relaxed)
    }

    /// Count one soft delete; returns true when the threshold is crossed
    /// and a compaction + save should be scheduled.
    pub fn note_soft_delete(&self) -> bool {
        self.note_deletions(1)
    }

    /// Count `n` deletions at once (store-row deletions share the same
    /// compaction budget as index soft deletes).
    pub fn note_deletions(&self, n: u64) -> bool {
        let total = self.deletions_since_compaction.fetch_add(n, Ordering::Relaxed) + n;
        total >= self.compaction_threshold
    }

    /// Compact both indexes. Single-flight: returns None without blocking
    /// when another compaction is already running.
    pub fn compact_all(&self) -> Option<(usize, usize)> {
        let Ok(_guard) = self.compact_flag.try_lock() else {
            info!("compaction already running, skipping");
            return None;
        };
        let hot_removed = self.hot.compact();
        let warm_removed = self.warm.compact();
        self.deletions_since_compaction.store(0, Ordering::Relaxed);
        if hot_removed + warm_removed > 0 {
            info!(hot_removed, warm_removed, "index compaction complete");
        }
        Some((hot_removed, warm_removed))
    }

    pub async fn save_all(&self, kv: &Arc<dyn KvStore>) -> Result<(), MemoryError> {
        self.hot.save(kv, "hot").await?;
        self.warm.save(kv, "warm").await?;
        Ok(())
    }

    pub async fn load_all(&self, kv: &Arc<dyn KvStore>) -> Result<(), MemoryError> {
        self.hot.load(kv, "hot").await?;
        self.warm.load(kv, "warm").await?;
        Ok(())
    }

    pub fn clear(&self) {
        self.hot.reset();
        self.warm.reset();
        self.deletions_since_compaction.store(0, Ordering::Relaxed);
    }
}
