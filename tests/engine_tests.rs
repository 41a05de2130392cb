use std::sync::Arc;
use strata::{
    EngineConfig, HashingEncoder, KvStore, MemKv, MemoryEngine, MemoryError, RecordOptions,
    SearchOptions, Tier,
};

const DIM: usize = 256;

fn test_config() -> EngineConfig {
    EngineConfig {
        embed_dim: DIM,
        autosave_enabled: false,
        // Long cadences so background monitors stay quiet during tests.
        memory_check_interval_ms: 3_600_000,
        ..Default::default()
    }
}

async fn open_engine(kv: Arc<MemKv>, config: EngineConfig) -> MemoryEngine {
    let engine = MemoryEngine::new(kv, Arc::new(HashingEncoder::new(DIM)), config);
    engine.initialize().await.unwrap();
    engine
}

async fn fresh_engine() -> MemoryEngine {
    open_engine(Arc::new(MemKv::new()), test_config()).await
}

#[tokio::test]
async fn operations_require_initialize() {
    let engine = MemoryEngine::new(
        Arc::new(MemKv::new()),
        Arc::new(HashingEncoder::new(DIM)),
        test_config(),
    );
    let err = engine
        .create_memory_record("too early", &RecordOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::NotInitialized));
}

#[tokio::test]
async fn new_record_lands_in_warm_with_journal_entry() {
    let engine = fresh_engine().await;
    let record = engine
        .create_memory_record("the cache invalidation bug", &RecordOptions::default())
        .await
        .unwrap();

    assert_eq!(record.current_tier, Tier::Warm);
    assert!(record.warm_index_handle.is_some());
    assert_eq!(record.usage_count, 0);

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.warm, 1);
    assert_eq!(stats.hot, 0);
    assert_eq!(stats.cold, 0);
    assert_eq!(stats.total, 1);
    assert_eq!(stats.journal_counter, 1);
    assert_eq!(stats.journal, 1);
}

#[tokio::test]
async fn empty_text_is_rejected() {
    let engine = fresh_engine().await;
    let err = engine
        .create_memory_record("   ", &RecordOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::EmptyText));
}

#[tokio::test]
async fn dimension_mismatch_surfaces() {
    let kv = Arc::new(MemKv::new());
    // Encoder emits 32-dim vectors against a 256-dim config.
    let engine = MemoryEngine::new(kv, Arc::new(HashingEncoder::new(32)), test_config());
    engine.initialize().await.unwrap();
    let err = engine
        .create_memory_record("wrong dims", &RecordOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::DimensionMismatch { expected: 256, got: 32 }));
}

#[tokio::test]
async fn write_then_read_returns_the_record() {
    let engine = fresh_engine().await;
    let created = engine
        .create_memory_record("Paris is the capital of France", &RecordOptions::default())
        .await
        .unwrap();

    let results = engine
        .search("Paris is the capital of France", 1, &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record.id, created.id);
    assert!(results[0].similarity >= 0.99, "got {}", results[0].similarity);
}

#[tokio::test]
async fn batch_write_creates_every_record() {
    let engine = fresh_engine().await;
    let texts: Vec<String> = (0..12).map(|i| format!("batch note number {i}")).collect();
    let records = engine
        .create_memory_records(&texts, &RecordOptions::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 12);

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.warm, 12);
    assert_eq!(stats.journal_counter, 12);
}

#[tokio::test]
async fn importance_capped_at_configured_ceiling() {
    let engine = fresh_engine().await;
    let record = engine
        .create_memory_record(
            "extremely important",
            &RecordOptions {
                importance: Some(1.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!((record.importance - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn state_survives_restart() {
    let kv = Arc::new(MemKv::new());
    let texts: Vec<String> = (0..40).map(|i| format!("durable note {i}")).collect();

    let (counter_before, total_before) = {
        let engine = open_engine(kv.clone(), test_config()).await;
        engine
            .create_memory_records(&texts, &RecordOptions::default())
            .await
            .unwrap();
        engine.save().await.unwrap();
        let stats = engine.get_stats().await.unwrap();
        engine.shutdown().await.unwrap();
        (stats.journal_counter, stats.total)
    };

    let engine = open_engine(kv, test_config()).await;
    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.journal_counter, counter_before);
    assert_eq!(stats.total, total_before);

    // And the reopened engine still answers queries.
    let results = engine
        .search("durable note 7", 3, &SearchOptions::default())
        .await
        .unwrap();
    assert!(!results.is_empty());
}

#[tokio::test]
async fn unjournaled_warm_write_is_replayed_after_crash() {
    let kv = Arc::new(MemKv::new());
    let id = {
        let engine = open_engine(kv.clone(), test_config()).await;
        engine.save().await.unwrap();
        let record = engine
            .create_memory_record("write that missed its warm row", &RecordOptions::default())
            .await
            .unwrap();
        // Simulate a crash between the journal append and the warm write
        // by tearing the warm row out from under the engine.
        kv.delete(strata::StoreName::Warm, &record.id).await.unwrap();
        record.id
        // No shutdown: the "process" dies here.
    };

    let engine = open_engine(kv, test_config()).await;
    let all = engine.get_all_records().await.unwrap();
    assert!(all.iter().any(|r| r.id == id), "journal replay lost the record");
}

#[tokio::test]
async fn export_strips_embeddings() {
    let engine = fresh_engine().await;
    engine
        .create_memory_record("exportable", &RecordOptions::default())
        .await
        .unwrap();
    let payload = engine.export().await.unwrap();
    assert_eq!(payload.records.len(), 1);
    assert!(payload.records.iter().all(|r| r.embedding.is_none()));
    assert!(!payload.version.is_empty());

    let sealed = engine.export_encrypted().await.unwrap();
    assert!(!sealed.is_empty());
    // Sealed payload is not the plaintext JSON.
    assert_ne!(&sealed[..4], &b"{\"ve"[..]);
}

#[tokio::test]
async fn clear_wipes_records_but_keeps_counter_monotonic() {
    let engine = fresh_engine().await;
    engine
        .create_memory_record("doomed", &RecordOptions::default())
        .await
        .unwrap();
    let counter_before = engine.get_stats().await.unwrap().journal_counter;

    engine.clear().await.unwrap();
    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.journal, 0);

    let record = engine
        .create_memory_record("after the wipe", &RecordOptions::default())
        .await
        .unwrap();
    assert!(!record.id.is_empty());
    let stats = engine.get_stats().await.unwrap();
    assert!(stats.journal_counter > counter_before);
}

#[tokio::test]
async fn shutdown_rejects_further_operations() {
    let engine = fresh_engine().await;
    engine
        .create_memory_record("last write", &RecordOptions::default())
        .await
        .unwrap();
    engine.shutdown().await.unwrap();
    let err = engine
        .create_memory_record("too late", &RecordOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::NotInitialized));
}

#[tokio::test]
async fn journal_rotates_while_counter_keeps_climbing() {
    let engine = open_engine(
        Arc::new(MemKv::new()),
        EngineConfig {
            journal_rotation_size: 10,
            ..test_config()
        },
    )
    .await;
    let texts: Vec<String> = (0..14).map(|i| format!("journal filler {i}")).collect();
    engine
        .create_memory_records(&texts, &RecordOptions::default())
        .await
        .unwrap();

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.journal_counter, 14);
    assert!(stats.journal < 14, "rotation never ran");
    assert_eq!(stats.total, 14, "rotation must not touch records");
}

#[tokio::test]
async fn autosave_flushes_pending_mutations() {
    let engine = open_engine(
        Arc::new(MemKv::new()),
        EngineConfig {
            autosave_enabled: true,
            autosave_interval_ms: 50,
            // Batch save would preempt the autosave below.
            mutation_batch_size: 1000,
            ..test_config()
        },
    )
    .await;
    engine
        .create_memory_record("autosaved", &RecordOptions::default())
        .await
        .unwrap();
    assert!(engine.get_stats().await.unwrap().mutations_since_last_save > 0);

    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert_eq!(engine.get_stats().await.unwrap().mutations_since_last_save, 0);
}

#[tokio::test]
async fn sqlite_backend_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strata.db");
    let kv = Arc::new(strata::SqliteKv::open(path.to_str().unwrap()).unwrap());
    let engine = MemoryEngine::new(kv, Arc::new(HashingEncoder::new(DIM)), test_config());
    engine.initialize().await.unwrap();

    engine
        .create_memory_record("persisted to disk", &RecordOptions::default())
        .await
        .unwrap();
    let results = engine
        .search("persisted to disk", 1, &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    let stats = engine.get_stats().await.unwrap();
    assert!(stats.memory.supported, "sqlite probe should report usage");
    engine.shutdown().await.unwrap();
}
