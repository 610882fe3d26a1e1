//! Forward-only schema migrations applied when a connection is opened
//!
//! `SCHEMA` always creates the version-1 layout; each later version is a
//! `Migration` registered here. Statements must be idempotent because every
//! pooled connection runs the check when it is created.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::errors::{IndexError, Result};

/// A single database migration
pub struct Migration {
    /// Migration version number
    pub version: u32,
    /// Description of what this migration does
    pub description: String,
    /// SQL statements to apply the migration
    pub up: Vec<String>,
}

impl Migration {
    /// Create a new migration
    pub fn new(version: u32, description: impl Into<String>, up: Vec<String>) -> Self {
        Self {
            version,
            description: description.into(),
            up,
        }
    }

    /// Apply this migration to a database connection
    pub fn apply(&self, conn: &mut Connection) -> Result<()> {
        info!("Applying migration {}: {}", self.version, self.description);

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for statement in &self.up {
            tx.execute_batch(statement)?;
        }

        tx.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![self.version],
        )?;

        tx.commit()?;
        Ok(())
    }
}

/// Database migration manager
pub struct MigrationManager {
    migrations: BTreeMap<u32, Migration>,
    target_version: u32,
}

impl MigrationManager {
    /// Create a manager with every known migration registered
    pub fn new(target_version: u32) -> Self {
        let mut manager = Self::empty(target_version);
        manager.register_migrations();
        manager
    }

    /// Create a manager with no migrations registered
    pub fn empty(target_version: u32) -> Self {
        Self {
            migrations: BTreeMap::new(),
            target_version,
        }
    }

    fn register_migrations(&mut self) {
        self.add_migration(Migration::new(
            2,
            "Add checkpoints table for change log consumers",
            vec![r#"
                CREATE TABLE IF NOT EXISTS checkpoints (
                    consumer TEXT PRIMARY KEY,
                    seq INTEGER NOT NULL DEFAULT 0,
                    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                );
                "#
            .to_string()],
        ));
    }

    /// Add a migration to the manager
    pub fn add_migration(&mut self, migration: Migration) {
        let version = migration.version;
        if self.migrations.insert(version, migration).is_some() {
            warn!("Replacing existing migration for version {}", version);
        }
    }

    /// Get the current database schema version
    pub fn current_version(&self, conn: &Connection) -> Result<u32> {
        let version = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get::<_, Option<u32>>(0)
            })?
            .unwrap_or(0);

        Ok(version)
    }

    /// Versions registered but not yet applied, ascending
    pub fn pending(&self, conn: &Connection) -> Result<Vec<u32>> {
        let current = self.current_version(conn)?;
        if current >= self.target_version {
            return Ok(Vec::new());
        }

        Ok(self
            .migrations
            .range(current + 1..=self.target_version)
            .map(|(version, _)| *version)
            .collect())
    }

    /// Migrate the database up to the target version.
    ///
    /// A database written by a newer build is rejected rather than rolled back.
    pub fn migrate(&self, conn: &mut Connection) -> Result<()> {
        let current = self.current_version(conn)?;

        if current > self.target_version {
            return Err(IndexError::SchemaVersionMismatch {
                expected: self.target_version,
                actual: current,
            });
        }

        if current == self.target_version {
            debug!("Database schema up to date (version {})", current);
            return Ok(());
        }

        for version in self.pending(conn)? {
            if let Some(migration) = self.migrations.get(&version) {
                migration.apply(conn)?;
            }
        }

        let reached = self.current_version(conn)?;
        if reached != self.target_version {
            return Err(IndexError::SchemaVersionMismatch {
                expected: self.target_version,
                actual: reached,
            });
        }

        info!("Database migrated from version {} to {}", current, reached);
        Ok(())
    }
}

/// Helper to run migrations during connection initialization
pub fn run_migrations(conn: &mut Connection, target_version: u32) -> Result<()> {
    MigrationManager::new(target_version).migrate(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BASE_SCHEMA_VERSION, SCHEMA, SCHEMA_VERSION};

    fn base_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![BASE_SCHEMA_VERSION],
        )
        .unwrap();
        conn
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_migrates_base_schema_to_current() {
        let mut conn = base_connection();
        let manager = MigrationManager::new(SCHEMA_VERSION);

        assert_eq!(manager.pending(&conn).unwrap(), vec![2]);
        manager.migrate(&mut conn).unwrap();

        assert!(table_exists(&conn, "checkpoints"));
        assert_eq!(manager.current_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(manager.pending(&conn).unwrap().is_empty());

        // Running again is a no-op
        manager.migrate(&mut conn).unwrap();
    }

    #[test]
    fn test_rejects_newer_database() {
        let mut conn = base_connection();
        conn.execute("INSERT INTO schema_version (version) VALUES (99)", [])
            .unwrap();

        let result = MigrationManager::new(SCHEMA_VERSION).migrate(&mut conn);
        assert!(matches!(
            result,
            Err(IndexError::SchemaVersionMismatch { actual: 99, .. })
        ));
    }

    #[test]
    fn test_missing_migration_is_reported() {
        let mut conn = base_connection();
        let manager = MigrationManager::empty(3);

        let result = manager.migrate(&mut conn);
        assert!(matches!(
            result,
            Err(IndexError::SchemaVersionMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }
}
