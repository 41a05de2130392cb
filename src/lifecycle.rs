//! Background maintenance plumbing: the event channel that "schedule soon"
//! operations flow through, the storage-pressure probe, and pressure
//! classification.

use serde::Serialize;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::store::KvStore;

/// Work enqueued to the executor by foreground operations. Senders never
/// await completion; a worker task drains the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MaintenanceEvent {
    /// Soft-delete threshold crossed: compact both indexes, then persist.
    CompactAndSave,
    /// Mutation batch threshold crossed: persist indexes and checkpoint.
    Save,
    /// Write count crossed the consolidation interval.
    Consolidate,
}

/// Host storage snapshot surfaced in stats and used by the pressure monitor.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub supported: bool,
    pub usage: u64,
    pub quota: u64,
    pub remaining: u64,
}

/// Capability seam for querying host storage. Production reads the backing
/// store's size; tests inject fixed values to drive the pressure branches.
pub trait StorageProbe: Send + Sync {
    fn snapshot(&self) -> MemorySnapshot;
}

/// Probe backed by the KV store's own size accounting against a configured
/// quota.
pub struct DiskProbe {
    kv: Arc<dyn KvStore>,
    quota: u64,
}

impl DiskProbe {
    pub fn new(kv: Arc<dyn KvStore>, quota: u64) -> Self {
        Self { kv, quota }
    }
}

impl StorageProbe for DiskProbe {
    fn snapshot(&self) -> MemorySnapshot {
        let usage = self.kv.size_bytes();
        MemorySnapshot {
            supported: usage > 0,
            usage,
            quota: self.quota,
            remaining: self.quota.saturating_sub(usage),
        }
    }
}

/// Fixed-value probe for tests.
pub struct FixedProbe {
    pub remaining: u64,
    pub quota: u64,
}

impl StorageProbe for FixedProbe {
    fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            supported: true,
            usage: self.quota.saturating_sub(self.remaining),
            quota: self.quota,
            remaining: self.remaining,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    Normal,
    /// Run prune; compact if anything was removed.
    Warning,
    /// Prune, aggressively demote barely-used hot records, compact, rotate
    /// the journal.
    Critical,
}

pub fn pressure_level(snapshot: &MemorySnapshot, config: &EngineConfig) -> PressureLevel {
    if !snapshot.supported {
        return PressureLevel::Normal;
    }
    if snapshot.remaining < config.memory_critical_threshold {
        PressureLevel::Critical
    } else if snapshot.remaining < config.memory_warning_threshold {
        PressureLevel::Warning
    } else {
        PressureLevel::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_thresholds() {
        let config = EngineConfig::default();
        let level = |remaining| {
            pressure_level(
                &MemorySnapshot {
                    supported: true,
                    usage: 0,
                    quota: 512 * 1024 * 1024,
                    remaining,
                },
                &config,
            )
        };
        assert_eq!(level(200 * 1024 * 1024), PressureLevel::Normal);
        assert_eq!(level(80 * 1024 * 1024), PressureLevel::Warning);
        assert_eq!(level(10 * 1024 * 1024), PressureLevel::Critical);
    }

    #[test]
    fn unsupported_probe_never_reports_pressure() {
        let config = EngineConfig::default();
        let snapshot = MemorySnapshot {
            supported: false,
            usage: 0,
            quota: 0,
            remaining: 0,
        };
        assert_eq!(pressure_level(&snapshot, &config), PressureLevel::Normal);
    }
}
