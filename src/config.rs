//! Engine tunables. Every knob has a conservative default; construct with
//! `EngineConfig::default()` and override what you need.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Embedding dimension. Every stored vector must match.
    pub embed_dim: usize,

    // ── Tier policy ────────────────────────────────────────────────────────

    /// Usage count at or above which a record promotes to the hot tier.
    pub promotion_usage_threshold: i64,
    /// Effective weight at or above which a record promotes to the hot tier.
    pub promotion_weight_threshold: f64,
    /// Decay score below which a hot record becomes a demotion candidate.
    pub demotion_decay_threshold: f64,
    /// Usage count below which a decayed hot record actually demotes.
    pub demotion_usage_threshold: i64,
    /// Ceiling applied to importance at record creation.
    pub max_importance: f64,
    /// Effective-weight floor: cold records below this with zero usage are pruned.
    pub prune_floor: f64,

    // ── Consolidation ──────────────────────────────────────────────────────

    /// Writes between automatic consolidation passes.
    pub consolidation_interval: u64,
    /// Warm records read per consolidation chunk.
    pub consolidation_chunk_size: usize,
    /// Switch to graph-based clustering at or above this warm count.
    pub advanced_clustering_threshold: usize,
    pub use_advanced_clustering: bool,
    /// Maximum cosine distance between cluster members (similarity >= 1 - diameter).
    pub cluster_diameter: f64,
    /// Graph clustering stops after forming this many clusters per pass.
    pub max_clusters_per_pass: usize,

    // ── Storage & maintenance ──────────────────────────────────────────────

    /// Journal entries kept before rotation drops the oldest half.
    pub journal_rotation_size: u64,
    /// Cold records scanned per chunk during search and prune.
    pub cold_search_chunk_size: usize,
    /// Soft deletes accumulated before index compaction is scheduled.
    pub compaction_threshold: u64,

    // ── Lifecycle ──────────────────────────────────────────────────────────

    pub autosave_enabled: bool,
    /// Autosave period in milliseconds.
    pub autosave_interval_ms: u64,
    /// Mutations accumulated before an immediate save is scheduled.
    pub mutation_batch_size: u64,
    /// Memory-pressure probe period in milliseconds.
    pub memory_check_interval_ms: u64,
    /// Remaining bytes below which pressure maintenance runs.
    pub memory_warning_threshold: u64,
    /// Remaining bytes below which emergency cleanup runs.
    pub memory_critical_threshold: u64,
    /// Storage quota the probe measures usage against.
    pub memory_quota_bytes: u64,

    // ── Encoder ────────────────────────────────────────────────────────────

    /// Query-embedding cache capacity.
    pub embed_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embed_dim: 768,
            promotion_usage_threshold: 10,
            promotion_weight_threshold: 0.8,
            demotion_decay_threshold: 0.1,
            demotion_usage_threshold: 2,
            max_importance: 0.9,
            prune_floor: 0.01,
            consolidation_interval: 100,
            consolidation_chunk_size: 500,
            advanced_clustering_threshold: 5000,
            use_advanced_clustering: true,
            cluster_diameter: 0.3,
            max_clusters_per_pass: 100,
            journal_rotation_size: 10_000,
            cold_search_chunk_size: 1000,
            compaction_threshold: 100,
            autosave_enabled: true,
            autosave_interval_ms: 300_000,
            mutation_batch_size: 10,
            memory_check_interval_ms: 60_000,
            memory_warning_threshold: 100 * 1024 * 1024,
            memory_critical_threshold: 50 * 1024 * 1024,
            memory_quota_bytes: 512 * 1024 * 1024,
            embed_cache_capacity: 128,
        }
    }
}
