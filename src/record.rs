//! The memory record: one remembered text plus its embedding, scored by a
//! decaying weight that drives tier placement and pruning.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::codec;

/// Exponential decay half-life: 14 days in milliseconds.
pub const DECAY_HALF_LIFE_MS: f64 = 14.0 * 86_400_000.0;
/// Hyperbolic temporal-weight scale: 7 days in milliseconds.
pub const TEMPORAL_SCALE_MS: f64 = 7.0 * 86_400_000.0;

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

/// Where a record's embedding currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// In-memory ANN index, fastest retrieval.
    Hot,
    /// Persisted half-float embedding plus an ANN node.
    Warm,
    /// Persisted byte-quantized embedding, linear scan only.
    Cold,
    Unknown,
}

impl Tier {
    pub fn label(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
            Tier::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub text: String,
    /// Absent while the record only exists as quantized bytes in a store;
    /// reconstructed on demand by the tier engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Creation time (ms since epoch).
    pub timestamp: i64,
    pub last_accessed: i64,
    /// Short-term episodic vs long-term semantic.
    pub episodic: bool,
    pub importance: f64,
    pub usage_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_cluster_id: Option<String>,
    /// Salted hash of `text`, fixed at creation.
    pub integrity_hash: String,
    /// Fingerprint of the embedding at creation.
    pub embedding_hash: String,
    pub current_tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hot_index_handle: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warm_index_handle: Option<u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Creation options for the write path.
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    /// Defaults to episodic (short-term); consolidation produces the
    /// long-term semantic records.
    pub episodic: Option<bool>,
    pub importance: Option<f64>,
    pub metadata: Option<HashMap<String, Value>>,
}

impl MemoryRecord {
    /// Build a fresh record destined for the warm tier.
    ///
    /// The id mixes the text with a random nonce so identical texts stored
    /// twice stay distinct.
    pub fn new(text: &str, embedding: Vec<f32>, opts: &RecordOptions, salt: &str) -> Self {
        let nonce = uuid::Uuid::new_v4().to_string();
        let mut id = codec::content_hash(&format!("{text}:{nonce}"), "");
        id.truncate(32);
        let now = now_ms();
        Self {
            id,
            integrity_hash: codec::content_hash(text, salt),
            embedding_hash: codec::embedding_fingerprint(&embedding),
            text: text.to_string(),
            embedding: Some(embedding),
            timestamp: now,
            last_accessed: now,
            episodic: opts.episodic.unwrap_or(true),
            importance: opts.importance.unwrap_or(0.5).clamp(0.0, 1.0),
            usage_count: 0,
            semantic_cluster_id: None,
            current_tier: Tier::Warm,
            hot_index_handle: None,
            warm_index_handle: None,
            metadata: opts.metadata.clone().unwrap_or_default(),
        }
    }

    /// `exp(-age / τ)` with τ = 14 days — 1.0 at creation, 1/e after τ.
    pub fn decay_score(&self, now: i64) -> f64 {
        let age = (now - self.timestamp).max(0) as f64;
        (-age / DECAY_HALF_LIFE_MS).exp()
    }

    /// `1 / (1 + age / scale)` — hyperbolic falloff on a 7-day scale.
    pub fn temporal_weight(&self, now: i64) -> f64 {
        let age = (now - self.timestamp).max(0) as f64;
        1.0 / (1.0 + age / TEMPORAL_SCALE_MS)
    }

    /// Composite ranking weight in [0, 1]. Never stored, always recomputed.
    pub fn effective_weight(&self, now: i64) -> f64 {
        self.importance * self.decay_score(now) * self.temporal_weight(now)
    }

    /// Record a read. No-op when simulating.
    pub fn access(&mut self, simulate: bool) {
        if simulate {
            return;
        }
        self.usage_count += 1;
        self.last_accessed = now_ms();
    }

    /// Full record mirrored into ANN node metadata, minus the embedding —
    /// the index owns the vector, the node metadata owns everything else.
    /// Hot-tier records have no KV row, so this mirror is their only copy.
    pub fn index_metadata(&self) -> Value {
        let mut stripped = self.clone();
        stripped.embedding = None;
        serde_json::to_value(&stripped).unwrap_or(Value::Null)
    }
}

/// A search hit with its retrieval and composite scores.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredRecord {
    #[serde(flatten)]
    pub record: MemoryRecord,
    /// Raw ANN (or linear-scan) cosine similarity in [0, 1].
    pub similarity: f64,
    /// `similarity * effective_weight` — the ranking key.
    pub score: f64,
}
