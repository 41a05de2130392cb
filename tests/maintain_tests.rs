use std::sync::Arc;
use strata::{
    codec, EngineConfig, HashingEncoder, KvStore, MemKv, MemoryEngine, MemoryRecord,
    RecordOptions, StoreName, TextEncoder, Tier,
};

const DIM: usize = 256;

fn test_config() -> EngineConfig {
    EngineConfig {
        embed_dim: DIM,
        autosave_enabled: false,
        memory_check_interval_ms: 3_600_000,
        ..Default::default()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

fn cold_record(id: &str, text: &str, age_days: i64, usage: i64, importance: f64) -> MemoryRecord {
    let ts = now_ms() - age_days * 86_400_000;
    MemoryRecord {
        id: id.into(),
        text: text.into(),
        embedding: None,
        timestamp: ts,
        last_accessed: ts,
        episodic: true,
        importance,
        usage_count: usage,
        semantic_cluster_id: None,
        integrity_hash: String::new(),
        embedding_hash: String::new(),
        current_tier: Tier::Cold,
        hot_index_handle: None,
        warm_index_handle: None,
        metadata: Default::default(),
    }
}

async fn plant_cold(
    kv: &Arc<MemKv>,
    encoder: &HashingEncoder,
    record: &MemoryRecord,
) {
    let emb = encoder.embed(&record.text).await.unwrap();
    let row = serde_json::json!({
        "record": serde_json::to_value(record).unwrap(),
        "embedding_i8": codec::embedding_to_i8(&emb),
    });
    kv.put(StoreName::Cold, &record.id, row).await.unwrap();
}

#[tokio::test]
async fn prune_removes_only_weightless_unread_records() {
    let kv = Arc::new(MemKv::new());
    let encoder = HashingEncoder::new(DIM);
    let engine = MemoryEngine::new(kv.clone(), Arc::new(HashingEncoder::new(DIM)), test_config());
    engine.initialize().await.unwrap();

    // Ancient, never read: prunable.
    plant_cold(&kv, &encoder, &cold_record("dead", "stale detail", 120, 0, 0.5)).await;
    // Ancient but read three times: protected by usage.
    plant_cold(&kv, &encoder, &cold_record("read", "recalled detail", 120, 3, 0.5)).await;
    // Fresh: protected by weight.
    plant_cold(&kv, &encoder, &cold_record("new", "recent detail", 0, 0, 0.5)).await;

    // Dry run reports without deleting.
    let preview = engine.prune(true).await.unwrap();
    assert_eq!(preview, vec!["dead".to_string()]);
    assert_eq!(engine.get_stats().await.unwrap().cold, 3);

    let pruned = engine.prune(false).await.unwrap();
    assert_eq!(pruned, vec!["dead".to_string()]);
    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.cold, 2);

    // Idempotent: nothing left to prune.
    assert!(engine.prune(false).await.unwrap().is_empty());
}

#[tokio::test]
async fn integrity_verification_quarantines_tampered_records() {
    let kv = Arc::new(MemKv::new());
    let engine = MemoryEngine::new(kv.clone(), Arc::new(HashingEncoder::new(DIM)), test_config());
    engine.initialize().await.unwrap();

    let honest = engine
        .create_memory_record("untouched fact", &RecordOptions::default())
        .await
        .unwrap();
    let victim = engine
        .create_memory_record("original wording", &RecordOptions::default())
        .await
        .unwrap();

    // Clean corpus verifies clean.
    assert!(engine.verify_integrity().await.unwrap().is_empty());

    // Rewrite the stored text behind the engine's back.
    let mut row = kv
        .get(StoreName::Warm, &victim.id)
        .await
        .unwrap()
        .unwrap();
    row["record"]["text"] = serde_json::json!("tampered wording");
    kv.put(StoreName::Warm, &victim.id, row).await.unwrap();

    let corrupted = engine.verify_integrity().await.unwrap();
    assert_eq!(corrupted, vec![victim.id.clone()]);

    // The quarantined record is gone from every surface.
    let all = engine.get_all_records().await.unwrap();
    assert!(all.iter().all(|r| r.id != victim.id));
    assert!(all.iter().any(|r| r.id == honest.id));
    assert!(kv.get(StoreName::Warm, &victim.id).await.unwrap().is_none());

    // Second pass finds nothing: quarantine is idempotent.
    assert!(engine.verify_integrity().await.unwrap().is_empty());
}

#[tokio::test]
async fn critical_pressure_demotes_barely_used_hot_records() {
    let engine = MemoryEngine::with_probe(
        Arc::new(MemKv::new()),
        Arc::new(HashingEncoder::new(DIM)),
        EngineConfig {
            promotion_usage_threshold: 1,
            memory_check_interval_ms: 50,
            ..test_config()
        },
        // Nothing left: every tick is an emergency.
        Box::new(strata::FixedProbe {
            remaining: 0,
            quota: 100 * 1024 * 1024,
        }),
    );
    engine.initialize().await.unwrap();

    engine
        .create_memory_record("rarely used hot record", &RecordOptions::default())
        .await
        .unwrap();
    engine
        .search("rarely used hot record", 1, &strata::SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(engine.get_stats().await.unwrap().hot, 1);

    // The monitor fires on a 50 ms cadence; one firing is enough to demote
    // a hot record with usage below the emergency floor.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.hot, 0);
    assert_eq!(stats.warm, 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn verification_covers_hot_records_without_false_positives() {
    let engine = MemoryEngine::new(
        Arc::new(MemKv::new()),
        Arc::new(HashingEncoder::new(DIM)),
        EngineConfig {
            promotion_usage_threshold: 1,
            ..test_config()
        },
    );
    engine.initialize().await.unwrap();

    let record = engine
        .create_memory_record("promoted and verified", &RecordOptions::default())
        .await
        .unwrap();
    // One read promotes it; its only copy now lives in the hot index.
    engine
        .search("promoted and verified", 1, &strata::SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(engine.get_stats().await.unwrap().hot, 1);

    // The mirrored node metadata must still hash clean, and its handle must
    // stay live so a future quarantine could target it.
    let all = engine.get_all_records().await.unwrap();
    let hot = all.iter().find(|r| r.id == record.id).unwrap();
    assert_eq!(hot.current_tier, Tier::Hot);
    assert!(hot.hot_index_handle.is_some());
    assert!(engine.verify_integrity().await.unwrap().is_empty());
}
