//! The engine facade: write path, retrieval, maintenance scheduling, and
//! lifecycle. One engine instance owns its five stores and two indexes;
//! multiple instances must use disjoint store namespaces.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::consolidate::run_consolidation;
use crate::crypto::InstanceSecrets;
use crate::encoder::{EmbedCache, SharedEncoder};
use crate::error::MemoryError;
use crate::index::{IndexManager, VectorIndex};
use crate::journal::Journal;
use crate::lifecycle::{
    pressure_level, DiskProbe, MaintenanceEvent, MemorySnapshot, PressureLevel, StorageProbe,
};
use crate::maintain::{run_emergency_demotion, run_integrity, run_prune};
use crate::record::{now_ms, MemoryRecord, RecordOptions, ScoredRecord};
use crate::search::{run_search, SearchOptions};
use crate::store::{KvStore, StoreName};
use crate::tier::TierOps;

/// Search lock acquisition bound.
const SEARCH_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// Batch embedding requests carry at most this many texts.
const EMBED_BATCH_CHUNK: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total: usize,
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub journal: usize,
    pub journal_counter: u64,
    pub records_since_consolidation: u64,
    pub deletions_since_compaction: u64,
    pub mutations_since_last_save: u64,
    pub memory: MemorySnapshot,
    pub config: EngineConfig,
}

/// Backup payload: everything except embeddings, which are rebuilt from the
/// quantized stores on import.
#[derive(Debug, Clone, Serialize)]
pub struct ExportPayload {
    pub version: String,
    pub timestamp: i64,
    pub config: EngineConfig,
    pub stats: Stats,
    pub records: Vec<MemoryRecord>,
}

pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    kv: Arc<dyn KvStore>,
    encoder: SharedEncoder,
    config: Arc<EngineConfig>,
    indexes: Arc<IndexManager>,
    tier: TierOps,
    probe: Box<dyn StorageProbe>,
    embed_cache: EmbedCache,

    journal: OnceLock<Journal>,
    secrets: OnceLock<InstanceSecrets>,
    initialized: AtomicBool,

    records_since_consolidation: AtomicU64,
    mutations_since_last_save: AtomicU64,

    // Non-reentrant operation flags. Search waits (bounded); the others
    // skip and return empty when already held.
    search_flag: tokio::sync::Mutex<()>,
    consolidate_flag: tokio::sync::Mutex<()>,
    prune_flag: tokio::sync::Mutex<()>,

    events_tx: UnboundedSender<MaintenanceEvent>,
    events_rx: parking_lot::Mutex<Option<UnboundedReceiver<MaintenanceEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MemoryEngine {
    pub fn new(kv: Arc<dyn KvStore>, encoder: SharedEncoder, config: EngineConfig) -> Self {
        Self::with_probe(
            kv.clone(),
            encoder,
            config.clone(),
            Box::new(DiskProbe::new(kv, config.memory_quota_bytes)),
        )
    }

    /// Construct with a custom storage probe (tests drive pressure branches
    /// this way).
    pub fn with_probe(
        kv: Arc<dyn KvStore>,
        encoder: SharedEncoder,
        config: EngineConfig,
        probe: Box<dyn StorageProbe>,
    ) -> Self {
        let config = Arc::new(config);
        let indexes = Arc::new(IndexManager::new(config.compaction_threshold));
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let tier = TierOps::new(
            kv.clone(),
            indexes.clone(),
            config.clone(),
            events_tx.clone(),
        );
        let embed_cache = EmbedCache::new(config.embed_cache_capacity);
        Self {
            inner: Arc::new(EngineInner {
                kv,
                encoder,
                config,
                indexes,
                tier,
                probe,
                embed_cache,
                journal: OnceLock::new(),
                secrets: OnceLock::new(),
                initialized: AtomicBool::new(false),
                records_since_consolidation: AtomicU64::new(0),
                mutations_since_last_save: AtomicU64::new(0),
                search_flag: tokio::sync::Mutex::new(()),
                consolidate_flag: tokio::sync::Mutex::new(()),
                prune_flag: tokio::sync::Mutex::new(()),
                events_tx,
                events_rx: parking_lot::Mutex::new(Some(events_rx)),
                shutdown_tx,
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open stores, load or create secrets, restore indexes and the journal
    /// counter, replay unjournaled writes, and start background monitors.
    pub async fn initialize(&self) -> Result<(), MemoryError> {
        let inner = &self.inner;
        if inner.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let secrets = InstanceSecrets::load_or_create(&inner.kv).await?;
        let _ = inner.secrets.set(secrets);

        let journal = Journal::open(inner.kv.clone(), inner.config.journal_rotation_size).await?;
        let _ = inner.journal.set(journal);

        inner.indexes.load_all(&inner.kv).await?;
        let replayed = inner.replay_journal().await?;

        inner.initialized.store(true, Ordering::SeqCst);
        let _ = inner.shutdown_tx.send(false);
        inner.clone().spawn_background();

        info!(
            journal_counter = inner.journal()?.counter(),
            replayed,
            hot = inner.indexes.hot.live_count(),
            warm = inner.indexes.warm.live_count(),
            "engine initialized"
        );
        Ok(())
    }

    // ── Write path ─────────────────────────────────────────────────────────

    pub async fn create_memory_record(
        &self,
        text: &str,
        opts: &RecordOptions,
    ) -> Result<MemoryRecord, MemoryError> {
        self.inner.ensure_initialized()?;
        if text.trim().is_empty() {
            return Err(MemoryError::EmptyText);
        }
        let embedding = self.inner.encoder.embed(text).await?;
        self.inner.write_record(text, embedding, opts).await
    }

    /// Batch write. Embeddings are fetched in small chunks; each record is
    /// journaled and stored individually, so a mid-batch failure leaves
    /// earlier records durable.
    pub async fn create_memory_records(
        &self,
        texts: &[String],
        opts: &RecordOptions,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        self.inner.ensure_initialized()?;
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(MemoryError::EmptyText);
        }
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(EMBED_BATCH_CHUNK) {
            let embeddings = self.inner.encoder.embed_batch(chunk).await?;
            for (text, embedding) in chunk.iter().zip(embeddings) {
                out.push(self.inner.write_record(text, embedding, opts).await?);
            }
        }
        Ok(out)
    }

    // ── Retrieval ──────────────────────────────────────────────────────────

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        let inner = &self.inner;
        inner.ensure_initialized()?;
        if query.trim().is_empty() {
            return Err(MemoryError::InvalidInput("query must not be empty".into()));
        }

        // Simulated searches are side-effect-free and skip the lock.
        let _guard = if opts.simulate {
            None
        } else {
            Some(
                tokio::time::timeout(SEARCH_LOCK_TIMEOUT, inner.search_flag.lock())
                    .await
                    .map_err(|_| MemoryError::LockTimeout("search"))?,
            )
        };

        let query_emb = match inner.embed_cache.get(query) {
            Some(emb) => emb,
            None => {
                let emb = inner.encoder.embed(query).await?;
                inner.check_dim(&emb)?;
                inner.embed_cache.insert(query.to_string(), emb.clone());
                emb
            }
        };

        run_search(
            &inner.tier,
            &query_emb,
            k,
            opts,
            inner.config.cold_search_chunk_size,
        )
        .await
    }

    // ── Maintenance ────────────────────────────────────────────────────────

    pub async fn consolidate(&self, simulate: bool) -> Result<Vec<MemoryRecord>, MemoryError> {
        self.inner.ensure_initialized()?;
        self.inner.consolidate_internal(simulate).await
    }

    pub async fn prune(&self, simulate: bool) -> Result<Vec<String>, MemoryError> {
        self.inner.ensure_initialized()?;
        self.inner.prune_internal(simulate).await
    }

    pub async fn verify_integrity(&self) -> Result<Vec<String>, MemoryError> {
        let inner = &self.inner;
        inner.ensure_initialized()?;
        run_integrity(&inner.tier, inner.salt()?).await
    }

    // ── Introspection ──────────────────────────────────────────────────────

    pub async fn get_all_records(&self) -> Result<Vec<MemoryRecord>, MemoryError> {
        self.inner.ensure_initialized()?;
        self.inner.tier.all_records().await
    }

    pub async fn get_stats(&self) -> Result<Stats, MemoryError> {
        let inner = &self.inner;
        inner.ensure_initialized()?;
        let hot = inner.indexes.hot.live_count();
        let warm = inner.kv.count(StoreName::Warm).await?;
        let cold = inner.kv.count(StoreName::Cold).await?;
        Ok(Stats {
            total: hot + warm + cold,
            hot,
            warm,
            cold,
            journal: inner.journal()?.depth().await?,
            journal_counter: inner.journal()?.counter(),
            records_since_consolidation: inner.records_since_consolidation.load(Ordering::Relaxed),
            deletions_since_compaction: inner.indexes.deletions_since_compaction(),
            mutations_since_last_save: inner.mutations_since_last_save.load(Ordering::Relaxed),
            memory: inner.probe.snapshot(),
            config: (*inner.config).clone(),
        })
    }

    pub async fn export(&self) -> Result<ExportPayload, MemoryError> {
        let stats = self.get_stats().await?;
        let mut records = self.get_all_records().await?;
        for r in &mut records {
            r.embedding = None;
        }
        Ok(ExportPayload {
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: now_ms(),
            config: (*self.inner.config).clone(),
            stats,
            records,
        })
    }

    /// Export sealed with the instance key.
    pub async fn export_encrypted(&self) -> Result<Vec<u8>, MemoryError> {
        let payload = self.export().await?;
        let raw =
            serde_json::to_vec(&payload).map_err(|e| MemoryError::Internal(e.to_string()))?;
        self.inner.secrets()?.seal(&raw)
    }

    // ── Persistence & lifecycle ────────────────────────────────────────────

    pub async fn save(&self) -> Result<(), MemoryError> {
        self.inner.ensure_initialized()?;
        self.inner.save_internal().await
    }

    /// Best-effort save for host suspension events (page hide, freeze).
    /// Never fails; errors are logged.
    pub async fn suspend(&self) {
        if self.inner.ensure_initialized().is_err() {
            return;
        }
        if let Err(e) = self.inner.save_internal().await {
            warn!(error = %e, "suspend save failed");
        }
    }

    /// Drop every record, journal entry, and index node. Instance secrets
    /// and the journal counter survive (counter monotonicity outlives a
    /// wipe).
    pub async fn clear(&self) -> Result<(), MemoryError> {
        let inner = &self.inner;
        inner.ensure_initialized()?;
        inner.kv.clear(StoreName::Warm).await?;
        inner.kv.clear(StoreName::Cold).await?;
        inner.journal()?.clear().await?;
        inner.indexes.clear();
        inner.embed_cache.clear();
        inner.records_since_consolidation.store(0, Ordering::Relaxed);
        inner.mutations_since_last_save.store(0, Ordering::Relaxed);
        inner.indexes.save_all(&inner.kv).await?;
        info!("engine cleared");
        Ok(())
    }

    /// Flush pending state, stop monitors, and await in-flight background
    /// work. The engine rejects operations afterwards.
    pub async fn shutdown(&self) -> Result<(), MemoryError> {
        let inner = &self.inner;
        inner.ensure_initialized()?;
        if inner.mutations_since_last_save.load(Ordering::Relaxed) > 0 {
            inner.save_internal().await?;
        }
        let _ = inner.shutdown_tx.send(true);
        let tasks: Vec<_> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        inner.initialized.store(false, Ordering::SeqCst);
        info!("engine shut down");
        Ok(())
    }
}

impl EngineInner {
    fn ensure_initialized(&self) -> Result<(), MemoryError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MemoryError::NotInitialized)
        }
    }

    fn journal(&self) -> Result<&Journal, MemoryError> {
        self.journal.get().ok_or(MemoryError::NotInitialized)
    }

    fn secrets(&self) -> Result<&InstanceSecrets, MemoryError> {
        self.secrets.get().ok_or(MemoryError::NotInitialized)
    }

    fn salt(&self) -> Result<&str, MemoryError> {
        Ok(self.secrets()?.salt.as_str())
    }

    fn check_dim(&self, embedding: &[f32]) -> Result<(), MemoryError> {
        if embedding.len() != self.config.embed_dim {
            return Err(MemoryError::DimensionMismatch {
                expected: self.config.embed_dim,
                got: embedding.len(),
            });
        }
        Ok(())
    }

    /// Journal-first write: the entry (and counter) are durable before the
    /// warm tier sees the record.
    async fn write_record(
        &self,
        text: &str,
        embedding: Vec<f32>,
        opts: &RecordOptions,
    ) -> Result<MemoryRecord, MemoryError> {
        self.check_dim(&embedding)?;
        let mut capped = opts.clone();
        capped.importance = Some(
            capped
                .importance
                .unwrap_or(0.5)
                .clamp(0.0, self.config.max_importance),
        );
        let mut record = MemoryRecord::new(text, embedding, &capped, self.salt()?);

        self.journal()?.append(&record).await?;
        self.tier.insert_warm(&mut record).await?;

        let writes = self
            .records_since_consolidation
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if self.config.consolidation_interval > 0
            && writes % self.config.consolidation_interval == 0
        {
            let _ = self.events_tx.send(MaintenanceEvent::Consolidate);
        }
        self.note_mutation();

        debug!(id = %record.id, "record created");
        Ok(record)
    }

    fn note_mutation(&self) {
        let n = self.mutations_since_last_save.fetch_add(1, Ordering::Relaxed) + 1;
        if n == self.config.mutation_batch_size {
            let _ = self.events_tx.send(MaintenanceEvent::Save);
        }
    }

    async fn save_internal(&self) -> Result<(), MemoryError> {
        self.indexes.save_all(&self.kv).await?;
        self.journal()?.checkpoint().await?;
        self.mutations_since_last_save.store(0, Ordering::Relaxed);
        debug!("state saved");
        Ok(())
    }

    /// Single-flight consolidation: skips with an empty result when a pass
    /// is already running.
    async fn consolidate_internal(
        &self,
        simulate: bool,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let Ok(_guard) = self.consolidate_flag.try_lock() else {
            info!("consolidation already running, skipping");
            return Ok(vec![]);
        };
        let summaries = run_consolidation(
            &self.tier,
            &self.encoder,
            self.journal()?,
            self.salt()?,
            &self.config,
            simulate,
        )
        .await?;
        if !simulate {
            self.records_since_consolidation.store(0, Ordering::Relaxed);
            if !summaries.is_empty() {
                self.note_mutation();
            }
        }
        Ok(summaries)
    }

    async fn prune_internal(&self, simulate: bool) -> Result<Vec<String>, MemoryError> {
        let Ok(_guard) = self.prune_flag.try_lock() else {
            info!("prune already running, skipping");
            return Ok(vec![]);
        };
        run_prune(&self.tier, &self.config, simulate).await
    }

    /// Crash recovery: re-insert journaled records newer than the last save
    /// checkpoint that never made it into a tier store.
    async fn replay_journal(&self) -> Result<usize, MemoryError> {
        let pending = self.journal()?.entries_after_checkpoint().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let hot_ids: std::collections::HashSet<String> = self
            .indexes
            .hot
            .get_all_metadata()
            .into_iter()
            .filter_map(|(_, m)| {
                m.get("id").and_then(|v| v.as_str()).map(str::to_string)
            })
            .collect();

        let mut replayed = 0usize;
        for entry in pending {
            let id = &entry.record.id;
            if hot_ids.contains(id)
                || self.kv.get(StoreName::Warm, id).await?.is_some()
                || self.kv.get(StoreName::Cold, id).await?.is_some()
            {
                continue;
            }
            let mut record = entry.record;
            if record.embedding.is_none() {
                warn!(id = %record.id, "journal snapshot has no embedding, cannot replay");
                continue;
            }
            record.hot_index_handle = None;
            record.warm_index_handle = None;
            self.tier.insert_warm(&mut record).await?;
            replayed += 1;
        }
        if replayed > 0 {
            info!(replayed, "journal replay restored records");
        }
        Ok(replayed)
    }

    fn spawn_background(self: Arc<Self>) {
        // Maintenance worker: drains enqueued compact/save/consolidate
        // events without the enqueuer ever awaiting them.
        if let Some(mut rx) = self.events_rx.lock().take() {
            let worker = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        event = rx.recv() => {
                            let Some(event) = event else { break };
                            worker.handle_event(event).await;
                        }
                    }
                }
            });
            self.tasks.lock().push(handle);
        }

        if self.config.autosave_enabled {
            let saver = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = Duration::from_millis(self.config.autosave_interval_ms.max(1));
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(period) => {
                            if saver.mutations_since_last_save.load(Ordering::Relaxed) > 0 {
                                if let Err(e) = saver.save_internal().await {
                                    warn!(error = %e, "autosave failed");
                                }
                            }
                        }
                    }
                }
            });
            self.tasks.lock().push(handle);
        }

        let monitor = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_millis(self.config.memory_check_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(period) => monitor.check_pressure().await,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn handle_event(&self, event: MaintenanceEvent) {
        match event {
            MaintenanceEvent::CompactAndSave => {
                self.indexes.compact_all();
                if let Err(e) = self.save_internal().await {
                    warn!(error = %e, "post-compaction save failed");
                }
            }
            MaintenanceEvent::Save => {
                if let Err(e) = self.save_internal().await {
                    warn!(error = %e, "batch save failed");
                }
            }
            MaintenanceEvent::Consolidate => {
                if let Err(e) = self.consolidate_internal(false).await {
                    warn!(error = %e, "scheduled consolidation failed");
                }
            }
        }
    }

    /// Periodic storage-pressure response. Maintenance failures here are
    /// logged, never propagated.
    async fn check_pressure(&self) {
        let snapshot = self.probe.snapshot();
        match pressure_level(&snapshot, &self.config) {
            PressureLevel::Normal => {}
            PressureLevel::Warning => {
                info!(remaining = snapshot.remaining, "storage pressure warning");
                match self.prune_internal(false).await {
                    Ok(pruned) if !pruned.is_empty() => {
                        self.indexes.compact_all();
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "pressure prune failed"),
                }
            }
            PressureLevel::Critical => {
                warn!(remaining = snapshot.remaining, "storage pressure critical");
                if let Err(e) = self.prune_internal(false).await {
                    warn!(error = %e, "pressure prune failed");
                }
                if let Err(e) = run_emergency_demotion(&self.tier).await {
                    warn!(error = %e, "emergency demotion failed");
                }
                self.indexes.compact_all();
                match self.journal() {
                    Ok(journal) => {
                        if let Err(e) = journal.rotate().await {
                            warn!(error = %e, "journal rotation failed");
                        }
                    }
                    Err(_) => {}
                }
                if let Err(e) = self.save_internal().await {
                    warn!(error = %e, "post-cleanup save failed");
                }
            }
        }
    }
}
