//! In-memory small-world graph index.
//!
//! Nodes keep full-precision vectors and link to their nearest neighbors.
//! Small collections are scanned linearly; larger ones use greedy beam
//! search over the neighbor graph. Soft-deleted nodes stay traversable
//! until `compact` rebuilds adjacency without them.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::{Handle, IndexHit, VectorIndex};
use crate::codec;
use crate::error::MemoryError;
use crate::store::{KvStore, StoreName};

/// Neighbor links kept per node.
const MAX_NEIGHBORS: usize = 16;
/// Below this many live nodes, linear scan beats graph traversal.
const LINEAR_THRESHOLD: usize = 256;
/// Beam width for graph search.
const SEARCH_BEAM: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    vector: Vec<f32>,
    metadata: Value,
    neighbors: Vec<Handle>,
    deleted: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    nodes: HashMap<Handle, Node>,
    next_handle: Handle,
    entry: Option<Handle>,
}

impl Inner {
    fn live_count(&self) -> usize {
        self.nodes.values().filter(|n| !n.deleted).count()
    }

    /// Cosine clamped to [0, 1] so downstream composite scores stay in range.
    fn similarity(a: &[f32], b: &[f32]) -> Result<f64, MemoryError> {
        Ok(codec::cosine_similarity(a, b)?.max(0.0))
    }

    /// k nearest live nodes by linear scan.
    fn linear_nearest(&self, query: &[f32], k: usize) -> Result<Vec<(Handle, f64)>, MemoryError> {
        let mut scored = Vec::new();
        for (&h, node) in &self.nodes {
            if node.deleted {
                continue;
            }
            scored.push((h, Self::similarity(query, &node.vector)?));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Greedy beam search from the entry point. Deleted nodes are walked
    /// through but never returned.
    fn graph_nearest(&self, query: &[f32], k: usize) -> Result<Vec<(Handle, f64)>, MemoryError> {
        let Some(entry) = self.entry else {
            return Ok(vec![]);
        };
        let beam = SEARCH_BEAM.max(k * 4);

        let mut visited: HashSet<Handle> = HashSet::new();
        let mut frontier: Vec<(Handle, f64)> = Vec::new();
        let mut best: Vec<(Handle, f64)> = Vec::new();

        let entry_node = &self.nodes[&entry];
        let entry_score = Self::similarity(query, &entry_node.vector)?;
        visited.insert(entry);
        frontier.push((entry, entry_score));
        if !entry_node.deleted {
            best.push((entry, entry_score));
        }

        while let Some((current, _)) = frontier.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            for &next in &node.neighbors {
                if !visited.insert(next) {
                    continue;
                }
                let Some(next_node) = self.nodes.get(&next) else {
                    continue;
                };
                let score = Self::similarity(query, &next_node.vector)?;
                // Expand only while the candidate is competitive with the
                // current beam tail; this is the greedy cut.
                let tail = best
                    .iter()
                    .map(|(_, s)| *s)
                    .fold(f64::MAX, f64::min);
                if best.len() < beam || score > tail {
                    frontier.push((next, score));
                    if !next_node.deleted {
                        best.push((next, score));
                        best.sort_by(|a, b| {
                            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                        });
                        best.truncate(beam);
                    }
                }
            }
            frontier.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        }

        best.truncate(k);
        Ok(best)
    }

    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<(Handle, f64)>, MemoryError> {
        if self.live_count() <= LINEAR_THRESHOLD {
            self.linear_nearest(query, k)
        } else {
            self.graph_nearest(query, k)
        }
    }
}

#[derive(Default)]
pub struct GraphIndex {
    inner: RwLock<Inner>,
}

impl GraphIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        *self.inner.write() = Inner::default();
    }

    pub fn total_count(&self) -> usize {
        self.inner.read().nodes.len()
    }
}

#[async_trait]
impl VectorIndex for GraphIndex {
    fn insert_with_metadata(&self, vector: Vec<f32>, metadata: Value) -> Result<Handle, MemoryError> {
        let mut inner = self.inner.write();
        let neighbors: Vec<Handle> = inner
            .nearest(&vector, MAX_NEIGHBORS)?
            .into_iter()
            .map(|(h, _)| h)
            .collect();

        inner.next_handle += 1;
        let handle = inner.next_handle;

        // Bidirectional links; neighbor lists are trimmed to the nearest
        // MAX_NEIGHBORS to bound degree.
        for &n in &neighbors {
            let needs_trim = match inner.nodes.get_mut(&n) {
                Some(node) => {
                    node.neighbors.push(handle);
                    node.neighbors.len() > MAX_NEIGHBORS * 2
                }
                None => false,
            };
            if !needs_trim {
                continue;
            }
            let (base, candidates) = {
                let node = &inner.nodes[&n];
                (node.vector.clone(), node.neighbors.clone())
            };
            let mut linked: Vec<(Handle, f64)> = Vec::new();
            for cand in candidates {
                let score = if cand == handle {
                    Inner::similarity(&base, &vector)?
                } else if let Some(c) = inner.nodes.get(&cand) {
                    Inner::similarity(&base, &c.vector)?
                } else {
                    continue;
                };
                linked.push((cand, score));
            }
            linked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            linked.truncate(MAX_NEIGHBORS);
            if let Some(node) = inner.nodes.get_mut(&n) {
                node.neighbors = linked.into_iter().map(|(h, _)| h).collect();
            }
        }

        inner.nodes.insert(
            handle,
            Node {
                vector,
                metadata,
                neighbors,
                deleted: false,
            },
        );
        if inner.entry.is_none() {
            inner.entry = Some(handle);
        }
        Ok(handle)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>, MemoryError> {
        let inner = self.inner.read();
        let hits = inner.nearest(query, k)?;
        Ok(hits
            .into_iter()
            .filter_map(|(h, score)| {
                inner.nodes.get(&h).map(|n| IndexHit {
                    handle: h,
                    metadata: n.metadata.clone(),
                    score,
                })
            })
            .collect())
    }

    fn update_metadata(&self, handle: Handle, metadata: Value) -> Result<(), MemoryError> {
        let mut inner = self.inner.write();
        match inner.nodes.get_mut(&handle) {
            Some(node) if !node.deleted => {
                node.metadata = metadata;
                Ok(())
            }
            _ => Err(MemoryError::InvalidInput(format!(
                "no live index node for handle {handle}"
            ))),
        }
    }

    fn soft_delete(&self, handle: Handle) -> Result<(), MemoryError> {
        let mut inner = self.inner.write();
        match inner.nodes.get_mut(&handle) {
            Some(node) => {
                node.deleted = true;
                Ok(())
            }
            None => Err(MemoryError::InvalidInput(format!(
                "no index node for handle {handle}"
            ))),
        }
    }

    fn compact(&self) -> usize {
        let mut inner = self.inner.write();
        let doomed: Vec<Handle> = inner
            .nodes
            .iter()
            .filter(|(_, n)| n.deleted)
            .map(|(&h, _)| h)
            .collect();
        if doomed.is_empty() {
            return 0;
        }
        for h in &doomed {
            inner.nodes.remove(h);
        }

        // Rebuild adjacency among survivors. Quadratic, but compaction runs
        // off the hot path and is bounded by the threshold cadence.
        let handles: Vec<Handle> = inner.nodes.keys().copied().collect();
        for &h in &handles {
            let vector = inner.nodes[&h].vector.clone();
            let mut scored: Vec<(Handle, f64)> = Vec::new();
            for &other in &handles {
                if other == h {
                    continue;
                }
                if let Ok(s) = Inner::similarity(&vector, &inner.nodes[&other].vector) {
                    scored.push((other, s));
                }
            }
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(MAX_NEIGHBORS);
            if let Some(node) = inner.nodes.get_mut(&h) {
                node.neighbors = scored.into_iter().map(|(h, _)| h).collect();
            }
        }
        inner.entry = handles.first().copied();
        debug!(removed = doomed.len(), "graph index compacted");
        doomed.len()
    }

    fn get_all_metadata(&self) -> Vec<(Handle, Value)> {
        self.inner
            .read()
            .nodes
            .iter()
            .filter(|(_, n)| !n.deleted)
            .map(|(&h, n)| (h, n.metadata.clone()))
            .collect()
    }

    fn vector(&self, handle: Handle) -> Option<Vec<f32>> {
        let inner = self.inner.read();
        inner
            .nodes
            .get(&handle)
            .filter(|n| !n.deleted)
            .map(|n| n.vector.clone())
    }

    fn live_count(&self) -> usize {
        self.inner.read().live_count()
    }

    async fn save(&self, kv: &Arc<dyn KvStore>, name: &str) -> Result<(), MemoryError> {
        let snapshot = {
            let inner = self.inner.read();
            serde_json::to_value(&*inner).map_err(|e| MemoryError::Internal(e.to_string()))?
        };
        kv.put(StoreName::Meta, &format!("index:{name}"), snapshot)
            .await
    }

    async fn load(&self, kv: &Arc<dyn KvStore>, name: &str) -> Result<bool, MemoryError> {
        match kv.get(StoreName::Meta, &format!("index:{name}")).await? {
            Some(snapshot) => {
                let restored: Inner = serde_json::from_value(snapshot)
                    .map_err(|e| MemoryError::Store(format!("corrupt index snapshot: {e}")))?;
                debug!(name, nodes = restored.nodes.len(), "index snapshot loaded");
                *self.inner.write() = restored;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemKv;
    use serde_json::json;

    fn unit(dim: usize, hot_axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot_axis] = 1.0;
        v
    }

    #[test]
    fn insert_and_search_ranks_by_similarity() {
        let index = GraphIndex::new();
        let a = index
            .insert_with_metadata(vec![1.0, 0.0, 0.0], json!({"id": "a"}))
            .unwrap();
        index
            .insert_with_metadata(vec![0.0, 1.0, 0.0], json!({"id": "b"}))
            .unwrap();
        index
            .insert_with_metadata(vec![0.9, 0.1, 0.0], json!({"id": "c"}))
            .unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].handle, a);
        assert!(hits[0].score > hits[1].score);
        assert_eq!(hits[1].metadata["id"], "c");
    }

    #[test]
    fn soft_deleted_nodes_hidden_until_compact() {
        let index = GraphIndex::new();
        let a = index
            .insert_with_metadata(unit(4, 0), json!({"id": "a"}))
            .unwrap();
        let b = index
            .insert_with_metadata(unit(4, 1), json!({"id": "b"}))
            .unwrap();

        index.soft_delete(a).unwrap();
        let hits = index.search(&unit(4, 0), 10).unwrap();
        assert!(hits.iter().all(|h| h.handle != a));
        assert_eq!(index.live_count(), 1);
        assert_eq!(index.total_count(), 2);

        assert_eq!(index.compact(), 1);
        assert_eq!(index.total_count(), 1);
        // Survivor handles are untouched by compaction.
        assert!(index.vector(b).is_some());
    }

    #[test]
    fn update_metadata_targets_handle() {
        let index = GraphIndex::new();
        let a = index
            .insert_with_metadata(unit(4, 0), json!({"usage": 0}))
            .unwrap();
        index
            .insert_with_metadata(unit(4, 1), json!({"usage": 0}))
            .unwrap();
        index.update_metadata(a, json!({"usage": 5})).unwrap();
        let hits = index.search(&unit(4, 0), 1).unwrap();
        assert_eq!(hits[0].metadata["usage"], 5);
    }

    #[test]
    fn update_after_soft_delete_fails() {
        let index = GraphIndex::new();
        let a = index
            .insert_with_metadata(unit(4, 0), json!({}))
            .unwrap();
        index.soft_delete(a).unwrap();
        assert!(index.update_metadata(a, json!({})).is_err());
    }

    #[test]
    fn dimension_mismatch_is_hard_error() {
        let index = GraphIndex::new();
        index
            .insert_with_metadata(unit(4, 0), json!({}))
            .unwrap();
        assert!(index.search(&[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn graph_search_finds_nearest_beyond_linear_threshold() {
        let index = GraphIndex::new();
        // Enough nodes to leave the linear path.
        for i in 0..400 {
            let angle = i as f32 * 0.01;
            index
                .insert_with_metadata(
                    vec![angle.cos(), angle.sin(), 0.0],
                    json!({"i": i}),
                )
                .unwrap();
        }
        let target = index
            .insert_with_metadata(vec![0.0, 0.0, 1.0], json!({"i": "target"}))
            .unwrap();
        let hits = index.search(&[0.0, 0.0, 1.0], 5).unwrap();
        assert_eq!(hits[0].handle, target);
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let index = GraphIndex::new();
        let a = index
            .insert_with_metadata(unit(4, 0), json!({"id": "a"}))
            .unwrap();
        index.save(&kv, "hot").await.unwrap();

        let restored = GraphIndex::new();
        assert!(restored.load(&kv, "hot").await.unwrap());
        assert_eq!(restored.live_count(), 1);
        assert_eq!(restored.vector(a), Some(unit(4, 0)));
        assert!(!restored.load(&kv, "missing").await.unwrap());
    }
}
