//! SQLite-backed store adapter: one table per logical store, WAL mode,
//! pooled connections, blocking work routed off the async executor.

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde_json::Value;

use super::{KvStore, StoreName};
use crate::error::MemoryError;

/// Set busy_timeout on every connection handed out by the pool.
/// Prevents SQLITE_BUSY when maintenance and writes overlap.
#[derive(Debug)]
struct BusyTimeoutCustomizer;

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

fn table(store: StoreName) -> &'static str {
    match store {
        StoreName::Core => "kv_core",
        StoreName::Warm => "kv_warm",
        StoreName::Cold => "kv_cold",
        StoreName::Journal => "kv_journal",
        StoreName::Meta => "kv_meta",
    }
}

pub struct SqliteKv {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteKv {
    /// Open (or create) the backing database. `:memory:` opens a private
    /// shared-cache instance so every pooled connection sees the same data.
    pub fn open(path: &str) -> Result<Self, MemoryError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| MemoryError::Store(format!("pool: {e}")))?;

        let conn = pool
            .get()
            .map_err(|e| MemoryError::Store(format!("pool: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        for store in StoreName::ALL {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
                    table(store)
                ),
                [],
            )?;
        }
        drop(conn);

        Ok(Self { pool })
    }

    /// Run a blocking statement on tokio's blocking pool. All SQLite work
    /// goes through here so async workers never stall on disk I/O.
    async fn call<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, MemoryError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| MemoryError::Store(format!("pool: {e}")))?;
            f(&conn)
        })
        .await
        .map_err(|e| MemoryError::Internal(e.to_string()))?
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn put(&self, store: StoreName, key: &str, value: Value) -> Result<(), MemoryError> {
        let key = key.to_string();
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                    table(store)
                ),
                params![key, value.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn put_batch(
        &self,
        store: StoreName,
        entries: Vec<(String, Value)>,
    ) -> Result<(), MemoryError> {
        self.call(move |conn| {
            let sql = format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                table(store)
            );
            conn.execute_batch("BEGIN")?;
            for (key, value) in &entries {
                if let Err(e) = conn.execute(&sql, params![key, value.to_string()]) {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e.into());
                }
            }
            conn.execute_batch("COMMIT")?;
            Ok(())
        })
        .await
    }

    async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>, MemoryError> {
        let key = key.to_string();
        self.call(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    &format!("SELECT value FROM {} WHERE key = ?1", table(store)),
                    params![key],
                    |r| r.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            match raw {
                Some(s) => serde_json::from_str(&s)
                    .map(Some)
                    .map_err(|e| MemoryError::Store(format!("corrupt value: {e}"))),
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_all(&self, store: StoreName) -> Result<Vec<(String, Value)>, MemoryError> {
        self.call(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT key, value FROM {} ORDER BY key", table(store)))?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(k, v)| {
                    serde_json::from_str(&v)
                        .map(|v| (k, v))
                        .map_err(|e| MemoryError::Store(format!("corrupt value: {e}")))
                })
                .collect()
        })
        .await
    }

    async fn scan_chunk(
        &self,
        store: StoreName,
        offset: usize,
        chunk_size: usize,
    ) -> Result<Vec<(String, Value)>, MemoryError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT key, value FROM {} ORDER BY key LIMIT ?1 OFFSET ?2",
                table(store)
            ))?;
            let rows = stmt
                .query_map(params![chunk_size as i64, offset as i64], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(k, v)| {
                    serde_json::from_str(&v)
                        .map(|v| (k, v))
                        .map_err(|e| MemoryError::Store(format!("corrupt value: {e}")))
                })
                .collect()
        })
        .await
    }

    async fn delete(&self, store: StoreName, key: &str) -> Result<bool, MemoryError> {
        let key = key.to_string();
        self.call(move |conn| {
            let n = conn.execute(
                &format!("DELETE FROM {} WHERE key = ?1", table(store)),
                params![key],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn count(&self, store: StoreName) -> Result<usize, MemoryError> {
        self.call(move |conn| {
            let n: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table(store)), [], |r| {
                    r.get(0)
                })?;
            Ok(n as usize)
        })
        .await
    }

    async fn keys(&self, store: StoreName) -> Result<Vec<String>, MemoryError> {
        self.call(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT key FROM {} ORDER BY key", table(store)))?;
            let rows = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn clear(&self, store: StoreName) -> Result<(), MemoryError> {
        self.call(move |conn| {
            conn.execute(&format!("DELETE FROM {}", table(store)), [])?;
            Ok(())
        })
        .await
    }

    fn size_bytes(&self) -> u64 {
        self.pool
            .get()
            .ok()
            .and_then(|conn| {
                conn.query_row(
                    "SELECT page_count * page_size FROM pragma_page_count, pragma_page_size",
                    [],
                    |r| r.get::<_, i64>(0),
                )
                .ok()
            })
            .map(|n| n.max(0) as u64)
            .unwrap_or(0)
    }
}
