//! Cold-tier pruning, integrity verification, and emergency demotion.

use tracing::{info, warn};

use crate::codec;
use crate::config::EngineConfig;
use crate::error::MemoryError;
use crate::index::VectorIndex;
use crate::record::{now_ms, MemoryRecord};
use crate::store::StoreName;
use crate::tier::TierOps;

/// Hot records below this usage count are demoted during emergency cleanup.
const EMERGENCY_USAGE_FLOOR: i64 = 5;

/// Remove cold records whose effective weight fell under the floor and that
/// were never read. The caller holds the prune flag. Returns pruned ids.
pub(crate) async fn run_prune(
    tier: &TierOps,
    config: &EngineConfig,
    simulate: bool,
) -> Result<Vec<String>, MemoryError> {
    let now = now_ms();
    let mut doomed = Vec::new();

    let mut offset = 0;
    loop {
        let chunk = tier
            .kv()
            .scan_chunk(StoreName::Cold, offset, config.cold_search_chunk_size)
            .await?;
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len();
        for (key, row) in chunk {
            let record = match TierOps::record_from_tier_row(&row) {
                Ok(r) => r,
                Err(e) => {
                    warn!(key = %key, error = %e, "unreadable cold row, skipping");
                    continue;
                }
            };
            if record.usage_count == 0 && record.effective_weight(now) < config.prune_floor {
                doomed.push(record.id);
            }
        }
    }

    if simulate || doomed.is_empty() {
        return Ok(doomed);
    }

    // Deletes happen after the scan so pagination never walks a moving set.
    for id in &doomed {
        tier.kv().delete(StoreName::Cold, id).await?;
    }
    tier.note_store_deletions(doomed.len() as u64);
    info!(pruned = doomed.len(), "cold tier pruned");
    Ok(doomed)
}

/// Recompute every live record's salted content hash; quarantine mismatches.
/// Quarantined records vanish from all tiers and are never repaired.
/// Returns the corrupted ids; a second run returns an empty list.
pub(crate) async fn run_integrity(
    tier: &TierOps,
    salt: &str,
) -> Result<Vec<String>, MemoryError> {
    let records = tier.all_records().await?;
    let mut corrupted = Vec::new();
    for record in records {
        if codec::content_hash(&record.text, salt) == record.integrity_hash {
            continue;
        }
        warn!(id = %record.id, "integrity hash mismatch, quarantining");
        tier.remove_everywhere(&record).await?;
        corrupted.push(record.id);
    }
    if !corrupted.is_empty() {
        info!(quarantined = corrupted.len(), "integrity verification complete");
    }
    Ok(corrupted)
}

/// Critical-pressure demotion: push barely-used hot records down to warm so
/// their vectors leave the in-memory index.
pub(crate) async fn run_emergency_demotion(tier: &TierOps) -> Result<usize, MemoryError> {
    let mut demoted = 0usize;
    for (handle, metadata) in tier.indexes.hot.get_all_metadata() {
        let mut record: MemoryRecord = match serde_json::from_value(metadata) {
            Ok(r) => r,
            Err(e) => {
                warn!(handle, error = %e, "unreadable hot node metadata, skipping");
                continue;
            }
        };
        if record.usage_count >= EMERGENCY_USAGE_FLOOR {
            continue;
        }
        // The record object from node metadata has no vector; demotion
        // reloads it from the index before the node goes away.
        match tier.demote_hot_to_warm(&mut record).await {
            Ok(()) => demoted += 1,
            Err(e) => warn!(id = %record.id, error = %e, "emergency demotion failed"),
        }
    }
    if demoted > 0 {
        info!(demoted, "emergency demotion complete");
    }
    Ok(demoted)
}
