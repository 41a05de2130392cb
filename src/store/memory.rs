//! In-memory store fake for tests: same contract, no disk.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use super::{KvStore, StoreName};
use crate::error::MemoryError;

/// BTreeMap per store keeps keys in lexicographic order, matching the
/// SQLite adapter's `ORDER BY key` scans.
#[derive(Default)]
pub struct MemKv {
    stores: RwLock<HashMap<StoreName, BTreeMap<String, Value>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemKv {
    async fn put(&self, store: StoreName, key: &str, value: Value) -> Result<(), MemoryError> {
        self.stores
            .write()
            .entry(store)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn put_batch(
        &self,
        store: StoreName,
        entries: Vec<(String, Value)>,
    ) -> Result<(), MemoryError> {
        let mut guard = self.stores.write();
        let map = guard.entry(store).or_default();
        for (k, v) in entries {
            map.insert(k, v);
        }
        Ok(())
    }

    async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>, MemoryError> {
        Ok(self
            .stores
            .read()
            .get(&store)
            .and_then(|m| m.get(key).cloned()))
    }

    async fn get_all(&self, store: StoreName) -> Result<Vec<(String, Value)>, MemoryError> {
        Ok(self
            .stores
            .read()
            .get(&store)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn scan_chunk(
        &self,
        store: StoreName,
        offset: usize,
        chunk_size: usize,
    ) -> Result<Vec<(String, Value)>, MemoryError> {
        Ok(self
            .stores
            .read()
            .get(&store)
            .map(|m| {
                m.iter()
                    .skip(offset)
                    .take(chunk_size)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, store: StoreName, key: &str) -> Result<bool, MemoryError> {
        Ok(self
            .stores
            .write()
            .get_mut(&store)
            .map(|m| m.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn count(&self, store: StoreName) -> Result<usize, MemoryError> {
        Ok(self.stores.read().get(&store).map(|m| m.len()).unwrap_or(0))
    }

    async fn keys(&self, store: StoreName) -> Result<Vec<String>, MemoryError> {
        Ok(self
            .stores
            .read()
            .get(&store)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, store: StoreName) -> Result<(), MemoryError> {
        if let Some(m) = self.stores.write().get_mut(&store) {
            m.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete() {
        let kv = MemKv::new();
        kv.put(StoreName::Warm, "a", json!({"x": 1})).await.unwrap();
        assert_eq!(
            kv.get(StoreName::Warm, "a").await.unwrap(),
            Some(json!({"x": 1}))
        );
        assert!(kv.delete(StoreName::Warm, "a").await.unwrap());
        assert!(!kv.delete(StoreName::Warm, "a").await.unwrap());
        assert_eq!(kv.get(StoreName::Warm, "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stores_are_independent() {
        let kv = MemKv::new();
        kv.put(StoreName::Warm, "k", json!(1)).await.unwrap();
        kv.put(StoreName::Cold, "k", json!(2)).await.unwrap();
        assert_eq!(kv.get(StoreName::Warm, "k").await.unwrap(), Some(json!(1)));
        assert_eq!(kv.get(StoreName::Cold, "k").await.unwrap(), Some(json!(2)));
        kv.clear(StoreName::Warm).await.unwrap();
        assert_eq!(kv.count(StoreName::Warm).await.unwrap(), 0);
        assert_eq!(kv.count(StoreName::Cold).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn chunked_scan_pages_in_key_order() {
        let kv = MemKv::new();
        for i in 0..25 {
            kv.put(StoreName::Cold, &format!("{i:03}"), json!(i))
                .await
                .unwrap();
        }
        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let chunk = kv.scan_chunk(StoreName::Cold, offset, 10).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len();
            seen.extend(chunk.into_iter().map(|(k, _)| k));
        }
        assert_eq!(seen.len(), 25);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }
}
