//! Key-value storage for per-user conversation state.
//!
//! [`KvStore`] is the seam the chat service depends on. Two backends ship:
//! - [`SqliteStore`] — Turso Embedded / libSQL file database (default)
//! - [`MemoryStore`] — process-local map for development and tests
//!
//! The typed wrappers [`HistoryStore`] and [`PendingQuestionStore`] sit on top
//! and give every read a defined empty default.

mod memory;
mod migrations;
mod stores;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use parley_shared::{ParleyError, Result, StoreBackend, StoreConfig};

pub use memory::MemoryStore;
pub use stores::{HistoryStore, PendingQuestionStore};

/// Namespaced string key-value store.
///
/// `get` on an absent key is `Ok(None)`; errors are reserved for
/// infrastructure failures.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the value stored under `(namespace, key)`.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;
    /// Replace the value stored under `(namespace, key)`.
    async fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()>;
    /// Remove `(namespace, key)`. Removing an absent key is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;
}

/// Open the backend selected by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend {
        StoreBackend::Sqlite => {
            let path = config.resolved_path()?;
            tracing::info!(path = %path.display(), "opening sqlite store");
            Ok(Arc::new(SqliteStore::open(&path).await?))
        }
        StoreBackend::Memory => {
            tracing::info!("using in-memory store; state is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Open the backend selected by `config` for inspection only.
///
/// The sqlite backend is opened read-only and must already exist; writes
/// through the returned store fail. The memory backend is always empty.
pub async fn open_store_readonly(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend {
        StoreBackend::Sqlite => {
            let path = config.resolved_path()?;
            if !path.exists() {
                return Err(ParleyError::Storage(format!(
                    "no database at {}",
                    path.display()
                )));
            }
            tracing::debug!(path = %path.display(), "opening sqlite store read-only");
            Ok(Arc::new(SqliteStore::open_readonly(&path).await?))
        }
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// libSQL-backed [`KvStore`].
pub struct SqliteStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl SqliteStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ParleyError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ParleyError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ParleyError::Storage(e.to_string()))?;

        let store = Self {
            db,
            conn,
            readonly: false,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open a database at `path` in read-only mode (for inspection tooling).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ParleyError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ParleyError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ParleyError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ParleyError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )
            .await
            .map_err(|e| ParleyError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value: String = row
                    .get(0)
                    .map_err(|e| ParleyError::Storage(e.to_string()))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(ParleyError::Storage(e.to_string())),
        }
    }

    async fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO kv (namespace, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![namespace, key, value, now.as_str()],
            )
            .await
            .map_err(|e| ParleyError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )
            .await
            .map_err(|e| ParleyError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file store for testing.
    async fn test_store() -> SqliteStore {
        let tmp = std::env::temp_dir().join(format!("parley_test_{}.db", Uuid::now_v7()));
        SqliteStore::open(&tmp).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let store = test_store().await;
        assert_eq!(store.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("parley_test_{}.db", Uuid::now_v7()));
        let s1 = SqliteStore::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = SqliteStore::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = test_store().await;

        assert_eq!(store.get("history", "alice").await.unwrap(), None);

        store.put("history", "alice", "one").await.expect("put");
        store.put("history", "alice", "two").await.expect("overwrite");
        assert_eq!(
            store.get("history", "alice").await.unwrap().as_deref(),
            Some("two")
        );

        store.delete("history", "alice").await.expect("delete");
        assert_eq!(store.get("history", "alice").await.unwrap(), None);

        // Deleting again is fine.
        store.delete("history", "alice").await.expect("delete absent");
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let store = test_store().await;
        store.put("history", "bob", "h").await.unwrap();
        store.put("pending", "bob", "p").await.unwrap();

        assert_eq!(store.get("history", "bob").await.unwrap().as_deref(), Some("h"));
        assert_eq!(store.get("pending", "bob").await.unwrap().as_deref(), Some("p"));

        store.delete("pending", "bob").await.unwrap();
        assert_eq!(store.get("history", "bob").await.unwrap().as_deref(), Some("h"));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("parley_test_{}.db", Uuid::now_v7()));
        let rw = SqliteStore::open(&tmp).await.unwrap();
        rw.put("history", "carol", "[]").await.unwrap();
        drop(rw);

        let ro = SqliteStore::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.get("history", "carol").await.unwrap().as_deref(), Some("[]"));

        let result = ro.put("history", "carol", "x").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn open_store_readonly_reads_but_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("parley_test_{}.db", Uuid::now_v7()));
        let rw = SqliteStore::open(&tmp).await.unwrap();
        rw.put("history", "erin", "[]").await.unwrap();
        drop(rw);

        let config = StoreConfig {
            backend: StoreBackend::Sqlite,
            path: tmp.to_string_lossy().into_owned(),
        };
        let ro = open_store_readonly(&config).await.expect("open read-only");
        assert_eq!(ro.get("history", "erin").await.unwrap().as_deref(), Some("[]"));
        assert!(ro.delete("history", "erin").await.is_err());
    }

    #[tokio::test]
    async fn open_store_readonly_requires_existing_database() {
        let tmp = std::env::temp_dir().join(format!("parley_missing_{}.db", Uuid::now_v7()));
        let config = StoreConfig {
            backend: StoreBackend::Sqlite,
            path: tmp.to_string_lossy().into_owned(),
        };
        let err = open_store_readonly(&config).await.err().expect("missing db");
        assert!(err.to_string().contains("no database"));
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn open_store_selects_memory_backend() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            path: String::new(),
        };
        let store = open_store(&config).await.expect("open memory");
        store.put("pending", "dave", "q").await.unwrap();
        assert_eq!(store.get("pending", "dave").await.unwrap().as_deref(), Some("q"));
    }
}
