//! Pooled SQLite handle shared by every index component
//!
//! Components never open connections themselves: they hold a cloned
//! `MirrorStore` and run each logical operation through `execute_blocking`
//! or `execute_transaction`, which check a connection out of the pool on a
//! blocking thread and hand it back on every exit path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tokio::task;
use tracing::debug;

use crate::errors::{IndexError, Result};
use crate::migrations::run_migrations;
use crate::schema::{BASE_SCHEMA_VERSION, CONNECTION_PRAGMAS, MEMORY_PRAGMAS, SCHEMA, SCHEMA_VERSION};

/// Storage handle for the entity index and change log
#[derive(Clone)]
pub struct MirrorStore {
    pool: Pool<SqliteConnectionManager>,
}

impl MirrorStore {
    /// Open (or create) a file-backed store with default pool settings
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().path(path).build()
    }

    /// Create an in-memory store (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| initialize_connection(conn, MEMORY_PRAGMAS));

        // Every in-memory connection is its own database, so keep exactly one
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(|e| IndexError::Pool(format!("Pool creation failed: {}", e)))?;

        Ok(Self { pool })
    }

    /// Create a builder for configuring the store
    pub fn builder() -> MirrorStoreBuilder {
        MirrorStoreBuilder::new()
    }

    /// Run a read operation on a pooled connection
    pub(crate) async fn execute_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| IndexError::Pool(format!("Failed to get connection: {}", e)))?;

            f(&conn)
        })
        .await
        .map_err(|e| IndexError::TaskJoin(e.to_string()))?
    }

    /// Run a write operation inside one transaction.
    ///
    /// The transaction rolls back when `f` fails or the closure panics.
    pub(crate) async fn execute_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| IndexError::Pool(format!("Failed to get connection: {}", e)))?;

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = f(&tx)?;
            tx.commit()?;

            Ok(result)
        })
        .await
        .map_err(|e| IndexError::TaskJoin(e.to_string()))?
    }

    /// Current schema version of the underlying database
    pub async fn schema_version(&self) -> Result<u32> {
        self.execute_blocking(|conn| {
            let version = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get::<_, Option<u32>>(0)
            })?;
            Ok(version.unwrap_or(0))
        })
        .await
    }

    /// Get connection pool statistics as (connections, idle connections)
    pub fn pool_stats(&self) -> (u32, u32) {
        let state = self.pool.state();
        (state.connections, state.idle_connections)
    }
}

/// Builder for MirrorStore with pool configuration options
pub struct MirrorStoreBuilder {
    path: Option<PathBuf>,
    max_size: u32,
    connection_timeout: Duration,
}

impl MirrorStoreBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            path: None,
            max_size: 8,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Set the database file path
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the maximum number of connections in the pool
    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set how long to wait for a free connection
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Build the store
    pub fn build(self) -> Result<MirrorStore> {
        let path = self.path.ok_or_else(|| {
            IndexError::Pool(
                "Path is required for file-based stores. Use new_in_memory() for in-memory stores."
                    .to_string(),
            )
        })?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&path)
            .with_init(|conn| initialize_connection(conn, CONNECTION_PRAGMAS));

        let pool = Pool::builder()
            .max_size(self.max_size)
            .connection_timeout(self.connection_timeout)
            .build(manager)
            .map_err(|e| IndexError::Pool(format!("Pool creation failed: {}", e)))?;

        debug!("Opened mirror store at {}", path.display());
        Ok(MirrorStore { pool })
    }
}

impl Default for MirrorStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply pragmas, the base schema and pending migrations to a new connection
fn initialize_connection(conn: &mut Connection, pragmas: &str) -> rusqlite::Result<()> {
    conn.execute_batch(pragmas)?;
    conn.execute_batch(SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
        params![BASE_SCHEMA_VERSION],
    )?;

    run_migrations(conn, SCHEMA_VERSION).map_err(|e| {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_SCHEMA),
            Some(format!("Migration failed: {}", e)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_in_memory_store_is_migrated() {
        let store = MirrorStore::new_in_memory().unwrap();
        assert_eq!(store.schema_version().await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_file_store_reopens() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("state").join("mirror.db");

        {
            let store = MirrorStore::open(&db_path).unwrap();
            store
                .execute_transaction(|tx| {
                    tx.execute(
                        "INSERT INTO entities (path, size, digest, modify_time) VALUES ('a', 1, 'x', '2024-01-01T00:00:00Z')",
                        [],
                    )?;
                    Ok(())
                })
                .await
                .unwrap();
        }

        let store = MirrorStore::open(&db_path).unwrap();
        assert_eq!(store.schema_version().await.unwrap(), SCHEMA_VERSION);
        let count: i64 = store
            .execute_blocking(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let store = MirrorStore::new_in_memory().unwrap();

        let result: Result<()> = store
            .execute_transaction(|tx| {
                tx.execute(
                    "INSERT INTO entities (path, size, digest, modify_time) VALUES ('a', 1, 'x', 'now')",
                    [],
                )?;
                Err(IndexError::MalformedEvent("abort".to_string()))
            })
            .await;
        assert!(result.is_err());

        let (entities, changes): (i64, i64) = store
            .execute_blocking(|conn| {
                Ok(conn.query_row(
                    "SELECT (SELECT COUNT(*) FROM entities), (SELECT COUNT(*) FROM changes)",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .await
            .unwrap();
        assert_eq!((entities, changes), (0, 0));
    }

    #[test]
    fn test_builder_requires_path() {
        let store = MirrorStore::builder()
            .max_size(2)
            .connection_timeout(Duration::from_secs(1))
            .build();
        assert!(matches!(store, Err(IndexError::Pool(_))));
    }

    #[tokio::test]
    async fn test_connections_wait_for_locks() {
        let dir = tempdir().unwrap();
        let store = MirrorStore::builder()
            .path(dir.path().join("mirror.db"))
            .max_size(4)
            .build()
            .unwrap();

        let timeout: i64 = store
            .execute_blocking(|conn| {
                Ok(conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(timeout, 5000);

        // Concurrent writers queue up instead of failing with SQLITE_BUSY
        let writes = (0..8).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .execute_transaction(move |tx| {
                        tx.execute(
                            "INSERT INTO entities (path, size, digest, modify_time) VALUES (?1, 1, 'x', '2024-01-01T00:00:00Z')",
                            [format!("f{}", i)],
                        )?;
                        Ok(())
                    })
                    .await
            })
        });
        for write in writes.collect::<Vec<_>>() {
            write.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_pool_stats() {
        let store = MirrorStore::new_in_memory().unwrap();
        let (total, idle) = store.pool_stats();
        assert!(total <= 1);
        assert!(idle <= total);
    }
}
