//! Tier placement and movement.
//!
//! Hot records live in the hot ANN index (vector + mirrored metadata),
//! warm records as half-float rows plus a warm ANN node, cold records as
//! byte-quantized rows only. Every transition reconstructs the full
//! embedding from the source tier before writing the destination, so a
//! quantized or index-held vector is never lost in the move.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::codec;
use crate::config::EngineConfig;
use crate::error::MemoryError;
use crate::index::{IndexManager, VectorIndex};
use crate::lifecycle::MaintenanceEvent;
use crate::record::{MemoryRecord, Tier};
use crate::store::{KvStore, StoreName};

pub(crate) struct TierOps {
    kv: Arc<dyn KvStore>,
    pub(crate) indexes: Arc<IndexManager>,
    config: Arc<EngineConfig>,
    events: UnboundedSender<MaintenanceEvent>,
}

/// Warm/cold rows wrap the record (sans embedding) next to its quantized
/// vector so the record schema stays independent of the quantization format.
fn tier_value(record: &MemoryRecord, field: &str, quantized: Value) -> Value {
    serde_json::json!({
        "record": record.index_metadata(),
        (field): quantized,
    })
}

fn record_from_row(value: &Value) -> Result<MemoryRecord, MemoryError> {
    serde_json::from_value(value["record"].clone())
        .map_err(|e| MemoryError::Store(format!("corrupt record row: {e}")))
}

impl TierOps {
    pub fn new(
        kv: Arc<dyn KvStore>,
        indexes: Arc<IndexManager>,
        config: Arc<EngineConfig>,
        events: UnboundedSender<MaintenanceEvent>,
    ) -> Self {
        Self {
            kv,
            indexes,
            config,
            events,
        }
    }

    pub(crate) fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    // ── Policy ─────────────────────────────────────────────────────────────

    pub fn should_promote(&self, record: &MemoryRecord, now: i64) -> bool {
        record.effective_weight(now) >= self.config.promotion_weight_threshold
            || record.usage_count >= self.config.promotion_usage_threshold
    }

    pub fn should_demote(&self, record: &MemoryRecord, now: i64) -> bool {
        record.decay_score(now) < self.config.demotion_decay_threshold
            && record.usage_count < self.config.demotion_usage_threshold
    }

    /// Evaluate promotion first, then demotion, applying at most one move.
    /// This is how reads drive tier transitions.
    pub async fn apply_tier_policy(
        &self,
        record: &mut MemoryRecord,
        now: i64,
    ) -> Result<bool, MemoryError> {
        if record.current_tier != Tier::Hot && self.should_promote(record, now) {
            self.promote_to_hot(record).await?;
            return Ok(true);
        }
        if self.should_demote(record, now) {
            match record.current_tier {
                Tier::Hot => {
                    self.demote_hot_to_warm(record).await?;
                    return Ok(true);
                }
                Tier::Warm => {
                    self.demote_warm_to_cold(record).await?;
                    return Ok(true);
                }
                _ => {}
            }
        }
        Ok(false)
    }

    // ── Storage rows ───────────────────────────────────────────────────────

    pub async fn store_warm_row(&self, record: &MemoryRecord) -> Result<(), MemoryError> {
        let emb = record
            .embedding
            .as_ref()
            .ok_or_else(|| MemoryError::Internal("warm write without embedding".into()))?;
        let row = tier_value(
            record,
            "embedding_f16",
            serde_json::json!(codec::embedding_to_f16(emb)),
        );
        self.kv.put(StoreName::Warm, &record.id, row).await
    }

    pub async fn store_cold_row(&self, record: &MemoryRecord) -> Result<(), MemoryError> {
        let emb = record
            .embedding
            .as_ref()
            .ok_or_else(|| MemoryError::Internal("cold write without embedding".into()))?;
        let row = tier_value(
            record,
            "embedding_i8",
            serde_json::json!(codec::embedding_to_i8(emb)),
        );
        self.kv.put(StoreName::Cold, &record.id, row).await
    }

    /// Parse a warm/cold row back into a record with its embedding restored
    /// to f32.
    pub fn record_from_tier_row(value: &Value) -> Result<MemoryRecord, MemoryError> {
        let mut record = record_from_row(value)?;
        if let Some(bits) = value.get("embedding_f16").and_then(Value::as_array) {
            let raw: Vec<u16> = bits
                .iter()
                .filter_map(|v| v.as_u64().map(|x| x as u16))
                .collect();
            record.embedding = Some(codec::embedding_from_f16(&raw));
        } else if let Some(bytes) = value.get("embedding_i8").and_then(Value::as_array) {
            let raw: Vec<i8> = bytes
                .iter()
                .filter_map(|v| v.as_i64().map(|x| x as i8))
                .collect();
            record.embedding = Some(codec::embedding_from_i8(&raw));
        }
        Ok(record)
    }

    pub async fn load_record(&self, id: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        if let Some(row) = self.kv.get(StoreName::Warm, id).await? {
            return Ok(Some(Self::record_from_tier_row(&row)?));
        }
        if let Some(row) = self.kv.get(StoreName::Cold, id).await? {
            return Ok(Some(Self::record_from_tier_row(&row)?));
        }
        Ok(None)
    }

    /// Fill in a missing embedding from whichever tier holds the vector:
    /// warm f16 row, cold i8 row, or the hot index node itself.
    pub async fn reconstruct_embedding(
        &self,
        record: &mut MemoryRecord,
    ) -> Result<(), MemoryError> {
        if record.embedding.is_some() {
            return Ok(());
        }
        if let Some(row) = self.kv.get(StoreName::Warm, &record.id).await? {
            record.embedding = Self::record_from_tier_row(&row)?.embedding;
        }
        if record.embedding.is_none() {
            if let Some(row) = self.kv.get(StoreName::Cold, &record.id).await? {
                record.embedding = Self::record_from_tier_row(&row)?.embedding;
            }
        }
        if record.embedding.is_none() {
            if let Some(h) = record.hot_index_handle {
                record.embedding = self.indexes.hot.vector(h);
            }
        }
        if record.embedding.is_none() {
            return Err(MemoryError::Internal(format!(
                "no embedding recoverable for record {}",
                record.id
            )));
        }
        Ok(())
    }

    // ── Transitions ────────────────────────────────────────────────────────

    /// Place a brand-new record in the warm tier: ANN node plus f16 row.
    pub async fn insert_warm(&self, record: &mut MemoryRecord) -> Result<(), MemoryError> {
        let emb = record
            .embedding
            .clone()
            .ok_or_else(|| MemoryError::Internal("warm insert without embedding".into()))?;
        record.current_tier = Tier::Warm;
        let handle = self
            .indexes
            .warm
            .insert_with_metadata(emb, record.index_metadata())?;
        record.warm_index_handle = Some(handle);
        // Metadata in the node now carries the handle itself.
        self.indexes.warm.update_metadata(handle, record.index_metadata())?;
        self.store_warm_row(record).await
    }

    pub async fn promote_to_hot(&self, record: &mut MemoryRecord) -> Result<(), MemoryError> {
        self.reconstruct_embedding(record).await?;
        let emb = record
            .embedding
            .clone()
            .ok_or_else(|| MemoryError::Internal("promotion without embedding".into()))?;

        self.kv.delete(StoreName::Warm, &record.id).await?;
        self.kv.delete(StoreName::Cold, &record.id).await?;

        record.current_tier = Tier::Hot;
        let old_warm = record.warm_index_handle.take();
        let handle = self
            .indexes
            .hot
            .insert_with_metadata(emb, record.index_metadata())?;
        record.hot_index_handle = Some(handle);
        self.indexes.hot.update_metadata(handle, record.index_metadata())?;

        if let Some(h) = old_warm {
            self.soft_delete_warm(h);
        }
        debug!(id = %record.id, "promoted to hot");
        Ok(())
    }

    pub async fn demote_hot_to_warm(&self, record: &mut MemoryRecord) -> Result<(), MemoryError> {
        // Pull the vector out of the index before the node goes away.
        if record.embedding.is_none() {
            if let Some(h) = record.hot_index_handle {
                record.embedding = self.indexes.hot.vector(h);
            }
        }
        self.reconstruct_embedding(record).await?;

        let old_hot = record.hot_index_handle.take();
        self.insert_warm(record).await?;
        if let Some(h) = old_hot {
            self.soft_delete_hot(h);
        }
        debug!(id = %record.id, "demoted to warm");
        Ok(())
    }

    pub async fn demote_warm_to_cold(&self, record: &mut MemoryRecord) -> Result<(), MemoryError> {
        self.reconstruct_embedding(record).await?;
        self.kv.delete(StoreName::Warm, &record.id).await?;
        if let Some(h) = record.warm_index_handle.take() {
            self.soft_delete_warm(h);
        }
        record.current_tier = Tier::Cold;
        record.hot_index_handle = None;
        self.store_cold_row(record).await?;
        debug!(id = %record.id, "demoted to cold");
        Ok(())
    }

    // ── Bookkeeping ────────────────────────────────────────────────────────

    /// Record store-row deletions against the shared compaction budget.
    pub(crate) fn note_store_deletions(&self, n: u64) {
        if n > 0 && self.indexes.note_deletions(n) {
            let _ = self.events.send(MaintenanceEvent::CompactAndSave);
        }
    }

    fn soft_delete_hot(&self, handle: u64) {
        if let Err(e) = self.indexes.hot.soft_delete(handle) {
            warn!(handle, error = %e, "hot soft-delete failed");
        }
        if self.indexes.note_soft_delete() {
            let _ = self.events.send(MaintenanceEvent::CompactAndSave);
        }
    }

    fn soft_delete_warm(&self, handle: u64) {
        if let Err(e) = self.indexes.warm.soft_delete(handle) {
            warn!(handle, error = %e, "warm soft-delete failed");
        }
        if self.indexes.note_soft_delete() {
            let _ = self.events.send(MaintenanceEvent::CompactAndSave);
        }
    }

    /// Write updated scalar metadata back to whatever backs the record's
    /// current tier.
    pub async fn persist(&self, record: &MemoryRecord) -> Result<(), MemoryError> {
        match record.current_tier {
            Tier::Hot => {
                if let Some(h) = record.hot_index_handle {
                    self.indexes.hot.update_metadata(h, record.index_metadata())?;
                }
            }
            Tier::Warm => {
                self.store_warm_row(record).await?;
                if let Some(h) = record.warm_index_handle {
                    self.indexes.warm.update_metadata(h, record.index_metadata())?;
                }
            }
            Tier::Cold => {
                self.store_cold_row(record).await?;
            }
            Tier::Unknown => {}
        }
        Ok(())
    }

    /// Remove a record from every tier backing it might occupy. Used by
    /// quarantine and prune.
    pub async fn remove_everywhere(&self, record: &MemoryRecord) -> Result<(), MemoryError> {
        if let Some(h) = record.hot_index_handle {
            self.soft_delete_hot(h);
        }
        if let Some(h) = record.warm_index_handle {
            self.soft_delete_warm(h);
        }
        self.kv.delete(StoreName::Warm, &record.id).await?;
        self.kv.delete(StoreName::Cold, &record.id).await?;
        Ok(())
    }

    /// Every live record across all three tiers.
    pub async fn all_records(&self) -> Result<Vec<MemoryRecord>, MemoryError> {
        let mut out = Vec::new();
        for (_, metadata) in self.indexes.hot.get_all_metadata() {
            match serde_json::from_value::<MemoryRecord>(metadata) {
                Ok(r) => out.push(r),
                Err(e) => warn!(error = %e, "unreadable hot node metadata, skipping"),
            }
        }
        for (_, row) in self.kv.get_all(StoreName::Warm).await? {
            out.push(Self::record_from_tier_row(&row)?);
        }
        for (_, row) in self.kv.get_all(StoreName::Cold).await? {
            out.push(Self::record_from_tier_row(&row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordOptions;
    use crate::store::MemKv;

    fn ops() -> TierOps {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        TierOps::new(
            Arc::new(MemKv::new()),
            Arc::new(IndexManager::new(100)),
            Arc::new(EngineConfig {
                embed_dim: 4,
                ..Default::default()
            }),
            tx,
        )
    }

    fn make_record(importance: f64) -> MemoryRecord {
        MemoryRecord::new(
            "tier test",
            vec![0.5, 0.5, 0.0, 0.0],
            &RecordOptions {
                importance: Some(importance),
                ..Default::default()
            },
            "salt",
        )
    }

    #[tokio::test]
    async fn promotion_moves_warm_row_into_hot_index() {
        let ops = ops();
        let mut record = make_record(0.9);
        ops.insert_warm(&mut record).await.unwrap();
        assert!(record.warm_index_handle.is_some());

        ops.promote_to_hot(&mut record).await.unwrap();
        assert_eq!(record.current_tier, Tier::Hot);
        assert!(record.hot_index_handle.is_some());
        assert!(record.warm_index_handle.is_none());
        assert_eq!(ops.indexes.hot.live_count(), 1);
        assert_eq!(ops.indexes.warm.live_count(), 0);
        assert!(ops.load_record(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn demotion_restores_vector_from_hot_index() {
        let ops = ops();
        let mut record = make_record(0.9);
        ops.insert_warm(&mut record).await.unwrap();
        ops.promote_to_hot(&mut record).await.unwrap();

        // A hot record's only full copy is in the index.
        record.embedding = None;
        ops.demote_hot_to_warm(&mut record).await.unwrap();
        assert_eq!(record.current_tier, Tier::Warm);
        let stored = ops.load_record(&record.id).await.unwrap().unwrap();
        let emb = stored.embedding.unwrap();
        assert_eq!(emb.len(), 4);
        assert!(emb.iter().any(|&x| x != 0.0), "demotion wrote an empty vector");
    }

    #[tokio::test]
    async fn cold_demotion_quantizes_and_drops_warm_backing() {
        let ops = ops();
        let mut record = make_record(0.1);
        ops.insert_warm(&mut record).await.unwrap();
        ops.demote_warm_to_cold(&mut record).await.unwrap();

        assert_eq!(record.current_tier, Tier::Cold);
        assert!(record.warm_index_handle.is_none());
        assert_eq!(ops.indexes.warm.live_count(), 0);
        let reloaded = ops.load_record(&record.id).await.unwrap().unwrap();
        assert_eq!(reloaded.current_tier, Tier::Cold);
        let emb = reloaded.embedding.unwrap();
        assert!((emb[0] - 0.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn policy_thresholds() {
        let ops = ops();
        let now = crate::record::now_ms();
        let mut strong = make_record(0.9);
        assert!(ops.should_promote(&strong, now));
        strong.importance = 0.5;
        assert!(!ops.should_promote(&strong, now));
        strong.usage_count = 10;
        assert!(ops.should_promote(&strong, now));

        // Fresh records never demote (decay_score == 1.0).
        assert!(!ops.should_demote(&strong, now));
        let old = now + (90.0 * 86_400_000.0) as i64;
        let weak = make_record(0.5);
        assert!(ops.should_demote(&weak, old));
    }
}
