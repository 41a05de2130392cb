//! strata — tiered semantic memory engine.
//! hot → warm → cold vector storage with decay-driven movement, journaled
//! writes, and clustering-based consolidation.

pub mod codec;
pub mod config;
mod consolidate;
pub mod crypto;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod index;
pub mod journal;
pub mod lifecycle;
mod maintain;
pub mod record;
pub mod search;
pub mod store;
mod tier;

pub use config::EngineConfig;
pub use encoder::{
    EmbedCache, EncoderConfig, GenerateOptions, HashingEncoder, HttpEncoder, SharedEncoder,
    TextEncoder,
};
pub use engine::{ExportPayload, MemoryEngine, Stats};
pub use error::MemoryError;
pub use index::{GraphIndex, Handle, IndexHit, IndexManager, VectorIndex};
pub use journal::{Journal, JournalEntry};
pub use lifecycle::{DiskProbe, FixedProbe, MemorySnapshot, StorageProbe};
pub use record::{MemoryRecord, RecordOptions, ScoredRecord, Tier};
pub use search::{SearchFilters, SearchOptions};
pub use store::{KvStore, MemKv, SqliteKv, StoreName};
