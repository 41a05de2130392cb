//! Five logical key-value stores behind one async interface.
//!
//! The engine never talks to a database directly; everything durable goes
//! through [`KvStore`]. Production uses the SQLite adapter, tests swap in
//! the in-memory fake.

mod memory;
mod sqlite;

pub use memory::MemKv;
pub use sqlite::SqliteKv;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::MemoryError;

/// The five logical stores. `Core` is reserved; the others back tiers,
/// the write-ahead journal, and singleton metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreName {
    Core,
    Warm,
    Cold,
    Journal,
    Meta,
}

impl StoreName {
    pub const ALL: [StoreName; 5] = [
        StoreName::Core,
        StoreName::Warm,
        StoreName::Cold,
        StoreName::Journal,
        StoreName::Meta,
    ];

    pub fn label(self) -> &'static str {
        match self {
            StoreName::Core => "core",
            StoreName::Warm => "warm",
            StoreName::Cold => "cold",
            StoreName::Journal => "journal",
            StoreName::Meta => "meta",
        }
    }
}

/// Async key-value operations over the five logical stores.
///
/// Keys iterate in lexicographic order, so `scan_chunk` pagination is stable
/// as long as writers only append keys that sort after the scan cursor
/// (journal keys are zero-padded for exactly this reason).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, store: StoreName, key: &str, value: Value) -> Result<(), MemoryError>;

    async fn put_batch(
        &self,
        store: StoreName,
        entries: Vec<(String, Value)>,
    ) -> Result<(), MemoryError>;

    async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>, MemoryError>;

    async fn get_all(&self, store: StoreName) -> Result<Vec<(String, Value)>, MemoryError>;

    /// One page of a chunked scan. Peak memory stays bounded by
    /// `chunk_size` regardless of store size; an empty page ends the scan.
    async fn scan_chunk(
        &self,
        store: StoreName,
        offset: usize,
        chunk_size: usize,
    ) -> Result<Vec<(String, Value)>, MemoryError>;

    /// Returns whether the key existed.
    async fn delete(&self, store: StoreName, key: &str) -> Result<bool, MemoryError>;

    async fn count(&self, store: StoreName) -> Result<usize, MemoryError>;

    async fn keys(&self, store: StoreName) -> Result<Vec<String>, MemoryError>;

    async fn clear(&self, store: StoreName) -> Result<(), MemoryError>;

    /// Bytes used by the backing storage, for the pressure probe.
    /// 0 when the backend cannot tell.
    fn size_bytes(&self) -> u64 {
        0
    }
}
