//! Cascaded retrieval: hot index first, warm index for the remainder, then
//! a chunked linear scan over the cold store. Candidates are rescored by
//! `similarity * effective_weight` before filters and truncation; the
//! surviving top-k drive tier transitions.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::codec;
use crate::error::MemoryError;
use crate::index::VectorIndex;
use crate::record::{now_ms, MemoryRecord, ScoredRecord};
use crate::store::StoreName;
use crate::tier::TierOps;

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub episodic: Option<bool>,
    pub min_importance: Option<f64>,
    /// Exact-equality matches against record metadata.
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Side-effect-free dry run: no access bumps, no tier moves, no lock.
    pub simulate: bool,
    /// Drop results whose raw similarity falls below this.
    pub min_similarity: Option<f64>,
    pub filters: SearchFilters,
}

struct Candidate {
    record: MemoryRecord,
    similarity: f64,
}

fn passes_filters(record: &MemoryRecord, filters: &SearchFilters) -> bool {
    if let Some(episodic) = filters.episodic {
        if record.episodic != episodic {
            return false;
        }
    }
    if let Some(min) = filters.min_importance {
        if record.importance < min {
            return false;
        }
    }
    for (key, expected) in &filters.metadata {
        if record.metadata.get(key) != Some(expected) {
            return false;
        }
    }
    true
}

/// Run the retrieval cascade. The caller holds the search lock (unless
/// simulating) and has already embedded the query.
pub(crate) async fn run_search(
    tier: &TierOps,
    query_emb: &[f32],
    k: usize,
    opts: &SearchOptions,
    cold_chunk_size: usize,
) -> Result<Vec<ScoredRecord>, MemoryError> {
    let want = k.max(1) * 2;
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    // Phase 1: hot index.
    for hit in tier.indexes.hot.search(query_emb, want)? {
        match serde_json::from_value::<MemoryRecord>(hit.metadata) {
            Ok(record) => {
                if seen.insert(record.id.clone()) {
                    candidates.push(Candidate {
                        record,
                        similarity: hit.score,
                    });
                }
            }
            Err(e) => warn!(handle = hit.handle, error = %e, "unreadable hot hit, skipping"),
        }
    }

    // Phase 2: warm index for the remainder.
    if candidates.len() < want {
        for hit in tier.indexes.warm.search(query_emb, want - candidates.len())? {
            match serde_json::from_value::<MemoryRecord>(hit.metadata) {
                Ok(record) => {
                    if seen.insert(record.id.clone()) {
                        candidates.push(Candidate {
                            record,
                            similarity: hit.score,
                        });
                    }
                }
                Err(e) => warn!(handle = hit.handle, error = %e, "unreadable warm hit, skipping"),
            }
        }
    }

    // Phase 3: chunked cold scan, bounded memory, early exit once the pool
    // is comfortably larger than the request.
    if candidates.len() < want {
        let pool_cap = k.max(1) * 5;
        let mut offset = 0;
        loop {
            let chunk = tier
                .kv()
                .scan_chunk(StoreName::Cold, offset, cold_chunk_size)
                .await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len();
            for (_, row) in chunk {
                let record = TierOps::record_from_tier_row(&row)?;
                if !seen.insert(record.id.clone()) {
                    continue;
                }
                let Some(ref emb) = record.embedding else {
                    continue;
                };
                let similarity = codec::cosine_similarity(query_emb, emb)?.max(0.0);
                if similarity > 0.0 {
                    candidates.push(Candidate { record, similarity });
                }
            }
            if candidates.len() >= pool_cap {
                break;
            }
        }
    }

    // Rescore: reconstruct embeddings, bump access, apply composite weight.
    let now = now_ms();
    let mut scored: Vec<ScoredRecord> = Vec::new();
    for mut cand in candidates {
        if cand.record.embedding.is_none() {
            if let Err(e) = tier.reconstruct_embedding(&mut cand.record).await {
                debug!(id = %cand.record.id, error = %e, "embedding reconstruction failed");
            }
        }
        cand.record.access(opts.simulate);

        if let Some(min) = opts.min_similarity {
            if cand.similarity < min {
                continue;
            }
        }
        if !passes_filters(&cand.record, &opts.filters) {
            continue;
        }

        let score = cand.similarity * cand.record.effective_weight(now);
        scored.push(ScoredRecord {
            record: cand.record,
            similarity: cand.similarity,
            score,
        });
    }

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);

    // Only the returned top-k drive tier transitions and persistence;
    // touching every candidate would turn each search into a storm of
    // writes.
    if !opts.simulate {
        for result in &mut scored {
            if let Err(e) = tier.apply_tier_policy(&mut result.record, now).await {
                warn!(id = %result.record.id, error = %e, "tier transition failed");
            }
            if let Err(e) = tier.persist(&result.record).await {
                warn!(id = %result.record.id, error = %e, "result persistence failed");
            }
        }
    }

    Ok(scored)
}
