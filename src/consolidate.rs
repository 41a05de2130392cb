//! Semantic consolidation: cluster related warm records, synthesize one
//! summary record per cluster, and link members to it.
//!
//! Small collections use agglomerative clustering (cosine, average linkage)
//! per chunk; large ones build a throwaway graph index and greedily absorb
//! each record's near neighbors. Records written while a pass runs are not
//! part of that pass — the key snapshot is taken once up front.

use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::EngineConfig;
use crate::encoder::{GenerateOptions, SharedEncoder};
use crate::error::MemoryError;
use crate::index::{GraphIndex, VectorIndex};
use crate::journal::Journal;
use crate::record::{MemoryRecord, RecordOptions};
use crate::store::StoreName;
use crate::tier::TierOps;

const SUMMARY_PROMPT: &str =
    "Summarize the following related notes in one sentence. Reply with the sentence only.";
/// Importance attenuation applied to members once their content is folded
/// into a summary.
const MEMBER_ATTENUATION: f64 = 0.8;
const SUMMARY_IMPORTANCE: f64 = 0.7;
/// Neighbor fan-out per seed in graph clustering.
const GRAPH_NEIGHBORS: usize = 50;

/// Average-linkage agglomerative clustering over cosine similarity.
/// Returns index groups; singletons are kept (callers skip clusters < 2).
fn cluster_hac(embeddings: &[&[f32]], threshold: f64) -> Result<Vec<Vec<usize>>, MemoryError> {
    let n = embeddings.len();
    if n == 0 {
        return Ok(vec![]);
    }
    let mut sim = vec![0.0f64; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            let s = codec::cosine_similarity(embeddings[i], embeddings[j])?;
            sim[i * n + j] = s;
            sim[j * n + i] = s;
        }
    }

    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    // cross[a][b] holds the sum of pairwise similarities between clusters,
    // so average linkage is one division instead of a rescan per merge.
    let mut cross: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| sim[i * n + j]).collect())
        .collect();

    loop {
        let m = members.len();
        if m < 2 {
            break;
        }
        let (mut bi, mut bj, mut best) = (0usize, 0usize, f64::NEG_INFINITY);
        for a in 0..m {
            for b in (a + 1)..m {
                let avg = cross[a][b] / (members[a].len() * members[b].len()) as f64;
                if avg > best {
                    best = avg;
                    bi = a;
                    bj = b;
                }
            }
        }
        if best < threshold {
            break;
        }

        let absorbed = std::mem::take(&mut members[bj]);
        members[bi].extend(absorbed);
        for c in 0..m {
            if c == bi || c == bj {
                continue;
            }
            let add = cross[bj][c];
            cross[bi][c] += add;
            cross[c][bi] += add;
        }
        members.swap_remove(bj);
        cross.swap_remove(bj);
        for row in &mut cross {
            row.swap_remove(bj);
        }
    }
    Ok(members)
}

/// Graph clustering for large collections: every vector goes into a
/// temporary index, then each unprocessed record absorbs up to
/// `GRAPH_NEIGHBORS` unprocessed neighbors above the similarity floor.
fn cluster_graph(
    records: &[MemoryRecord],
    threshold: f64,
    max_clusters: usize,
) -> Result<Vec<Vec<usize>>, MemoryError> {
    let temp = GraphIndex::new();
    let mut by_handle: HashMap<u64, usize> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        let Some(ref emb) = record.embedding else {
            continue;
        };
        let handle = temp.insert_with_metadata(emb.clone(), json!(i))?;
        by_handle.insert(handle, i);
    }

    let mut processed = vec![false; records.len()];
    let mut clusters = Vec::new();
    for i in 0..records.len() {
        if processed[i] || clusters.len() >= max_clusters {
            continue;
        }
        let Some(ref emb) = records[i].embedding else {
            continue;
        };
        processed[i] = true;
        let mut cluster = vec![i];
        for hit in temp.search(emb, GRAPH_NEIGHBORS)? {
            let Some(&j) = by_handle.get(&hit.handle) else {
                continue;
            };
            if j == i || processed[j] || hit.score < threshold {
                continue;
            }
            processed[j] = true;
            cluster.push(j);
        }
        clusters.push(cluster);
    }
    Ok(clusters)
}

fn centroid(members: &[&MemoryRecord]) -> Option<Vec<f32>> {
    let first = members.first()?.embedding.as_ref()?;
    let mut sum = vec![0.0f64; first.len()];
    let mut count = 0usize;
    for m in members {
        let Some(ref emb) = m.embedding else {
            continue;
        };
        if emb.len() != sum.len() {
            continue;
        }
        for (acc, &x) in sum.iter_mut().zip(emb.iter()) {
            *acc += x as f64;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some(sum.into_iter().map(|x| (x / count as f64) as f32).collect())
}

async fn summarize(
    encoder: &SharedEncoder,
    members: &[&MemoryRecord],
    simulate: bool,
) -> Result<String, MemoryError> {
    if simulate {
        // Dry runs skip the generator entirely; a preview is enough.
        let preview: Vec<&str> = members.iter().map(|m| m.text.as_str()).take(3).collect();
        return Ok(preview.join("; "));
    }
    let mut prompt = String::with_capacity(members.len() * 80);
    prompt.push_str(SUMMARY_PROMPT);
    prompt.push('\n');
    for m in members {
        prompt.push_str("- ");
        prompt.push_str(&m.text);
        prompt.push('\n');
    }
    encoder.generate(&prompt, &GenerateOptions::default()).await
}

/// One consolidation pass over the warm tier. The caller holds the
/// consolidate flag. Returns the summary records (in simulate mode, the
/// records that would have been created).
pub(crate) async fn run_consolidation(
    tier: &TierOps,
    encoder: &SharedEncoder,
    journal: &Journal,
    salt: &str,
    config: &EngineConfig,
    simulate: bool,
) -> Result<Vec<MemoryRecord>, MemoryError> {
    // Snapshot the key set up front: records added mid-pass are excluded.
    let keys = tier.kv().keys(StoreName::Warm).await?;
    let total = keys.len();
    if total < 2 {
        return Ok(vec![]);
    }
    let link_threshold = 1.0 - config.cluster_diameter;
    let mut summaries = Vec::new();

    let advanced = config.use_advanced_clustering && total >= config.advanced_clustering_threshold;
    if advanced {
        // Load everything (chunked) and cluster through a temporary index.
        let mut records = Vec::with_capacity(total);
        for chunk in keys.chunks(config.consolidation_chunk_size) {
            for key in chunk {
                if let Some(row) = tier.kv().get(StoreName::Warm, key).await? {
                    records.push(TierOps::record_from_tier_row(&row)?);
                }
            }
            tokio::task::yield_now().await;
        }
        let clusters = cluster_graph(&records, link_threshold, config.max_clusters_per_pass)?;
        debug!(total, clusters = clusters.len(), "graph clustering complete");
        for indices in clusters {
            if indices.len() < 2 {
                continue;
            }
            let members: Vec<&MemoryRecord> = indices.iter().map(|&i| &records[i]).collect();
            if let Some(summary) =
                consolidate_cluster(tier, encoder, journal, salt, &members, simulate).await?
            {
                summaries.push(summary);
            }
        }
    } else {
        for chunk_keys in keys.chunks(config.consolidation_chunk_size) {
            let mut records = Vec::with_capacity(chunk_keys.len());
            for key in chunk_keys {
                if let Some(row) = tier.kv().get(StoreName::Warm, key).await? {
                    records.push(TierOps::record_from_tier_row(&row)?);
                }
            }
            let embeddings: Vec<&[f32]> = records
                .iter()
                .filter_map(|r| r.embedding.as_deref())
                .collect();
            if embeddings.len() != records.len() {
                warn!("warm records missing embeddings, skipping chunk");
                continue;
            }
            let clusters = cluster_hac(&embeddings, link_threshold)?;
            for indices in clusters {
                if indices.len() < 2 {
                    continue;
                }
                let members: Vec<&MemoryRecord> = indices.iter().map(|&i| &records[i]).collect();
                if let Some(summary) =
                    consolidate_cluster(tier, encoder, journal, salt, &members, simulate).await?
                {
                    summaries.push(summary);
                }
            }
            // Cooperative yield between chunks keeps searches responsive.
            tokio::task::yield_now().await;
        }
    }

    if !summaries.is_empty() {
        info!(
            summaries = summaries.len(),
            simulate, "consolidation pass complete"
        );
    }
    Ok(summaries)
}

/// Synthesize and store one summary record, then link and attenuate the
/// members. Returns None when the cluster has no usable centroid.
async fn consolidate_cluster(
    tier: &TierOps,
    encoder: &SharedEncoder,
    journal: &Journal,
    salt: &str,
    members: &[&MemoryRecord],
    simulate: bool,
) -> Result<Option<MemoryRecord>, MemoryError> {
    let Some(center) = centroid(members) else {
        return Ok(None);
    };
    let summary_text = match summarize(encoder, members, simulate).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => return Ok(None),
        Err(e) => {
            // A dead generator shouldn't kill the whole pass.
            warn!(error = %e, "summary generation failed, skipping cluster");
            return Ok(None);
        }
    };

    let mut ids: Vec<&str> = members.iter().map(|m| m.id.as_str()).collect();
    ids.sort_unstable();
    let cluster_id = {
        let mut joined = summary_text.clone();
        for id in &ids {
            joined.push_str(id);
        }
        let mut h = codec::content_hash(&joined, "");
        h.truncate(16);
        h
    };

    let mut metadata = HashMap::new();
    metadata.insert("cluster_id".to_string(), json!(cluster_id));
    metadata.insert("member_count".to_string(), json!(members.len()));
    let mut summary = MemoryRecord::new(
        &summary_text,
        center,
        &RecordOptions {
            episodic: Some(false),
            importance: Some(SUMMARY_IMPORTANCE),
            metadata: Some(metadata),
        },
        salt,
    );
    summary.semantic_cluster_id = Some(cluster_id.clone());

    if simulate {
        return Ok(Some(summary));
    }

    journal.append(&summary).await?;
    tier.insert_warm(&mut summary).await?;

    let now = crate::record::now_ms();
    for member in members {
        let Some(mut fresh) = tier.load_record(&member.id).await? else {
            continue;
        };
        fresh.access(false);
        fresh.semantic_cluster_id = Some(cluster_id.clone());
        fresh.importance = (fresh.importance * MEMBER_ATTENUATION).clamp(0.0, 1.0);
        let moved = tier.apply_tier_policy(&mut fresh, now).await?;
        if !moved {
            tier.persist(&fresh).await?;
        }
    }
    Ok(Some(summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hac_groups_similar_vectors() {
        let a = vec![1.0, 0.0, 0.0];
        let a2 = vec![0.95, 0.05, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let embs: Vec<&[f32]> = vec![&a, &a2, &b];
        let clusters = cluster_hac(&embs, 0.7).unwrap();
        assert_eq!(clusters.len(), 2);
        let big = clusters.iter().find(|c| c.len() == 2).unwrap();
        assert!(big.contains(&0) && big.contains(&1));
    }

    #[test]
    fn hac_impossible_threshold_keeps_singletons() {
        let a = vec![1.0, 0.0];
        let b = vec![0.9, 0.1];
        let embs: Vec<&[f32]> = vec![&a, &b];
        let clusters = cluster_hac(&embs, 1.01).unwrap();
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn hac_empty_input() {
        let embs: Vec<&[f32]> = vec![];
        assert!(cluster_hac(&embs, 0.5).unwrap().is_empty());
    }

    #[test]
    fn centroid_is_component_mean() {
        let a = MemoryRecord::new("a", vec![1.0, 0.0], &RecordOptions::default(), "s");
        let b = MemoryRecord::new("b", vec![0.0, 1.0], &RecordOptions::default(), "s");
        let c = centroid(&[&a, &b]).unwrap();
        assert_eq!(c, vec![0.5, 0.5]);
    }

    #[test]
    fn graph_clustering_respects_pass_cap() {
        let mut records = Vec::new();
        for i in 0..6 {
            let mut v = vec![0.0f32; 8];
            v[i % 8] = 1.0;
            records.push(MemoryRecord::new(
                &format!("r{i}"),
                v,
                &RecordOptions::default(),
                "s",
            ));
        }
        let clusters = cluster_graph(&records, 0.9, 2).unwrap();
        assert!(clusters.len() <= 2);
    }

    #[test]
    fn graph_clustering_groups_identical_vectors() {
        let mut records = Vec::new();
        for i in 0..4 {
            records.push(MemoryRecord::new(
                &format!("r{i}"),
                vec![1.0, 0.0, 0.0],
                &RecordOptions::default(),
                "s",
            ));
        }
        let clusters = cluster_graph(&records, 0.9, 100).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 4);
    }
}
