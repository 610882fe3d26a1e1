//! Persisted path → metadata index
//!
//! Every mutation here is observed by the change-log triggers, so callers
//! never write change records themselves.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::entity::{EntityId, EntityMetadata, EntityRecord, EntityStat};
use crate::errors::{IndexError, Result};
use crate::paths::is_within;
use crate::store::MirrorStore;

const ENTITY_COLUMNS: &str = "id, path, size, digest, modify_time, raw_stat";

/// Matches an entity path and every path beneath it (`?1` is the prefix)
const PREFIX_PREDICATE: &str = "(path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/')";

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(EntityId),
    Updated(EntityId),
}

impl UpsertOutcome {
    pub fn id(&self) -> EntityId {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => *id,
        }
    }
}

/// Entity index over a shared store
#[derive(Clone)]
pub struct EntityIndex {
    store: MirrorStore,
}

impl EntityIndex {
    pub fn new(store: MirrorStore) -> Self {
        Self { store }
    }

    /// Identifier of the live entity at `path`
    pub async fn lookup(&self, path: &str) -> Result<Option<EntityId>> {
        let path = path.to_string();
        self.store
            .execute_blocking(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id FROM entities WHERE path = ?1",
                        params![path],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await
    }

    /// Full row for the entity at `path`
    pub async fn get_metadata(&self, path: &str) -> Result<Option<EntityRecord>> {
        let path = path.to_string();
        self.store
            .execute_blocking(move |conn| select_one(conn, "path = ?1", &path))
            .await
    }

    /// Full row for an entity identifier
    pub async fn get_by_id(&self, id: EntityId) -> Result<Option<EntityRecord>> {
        self.store
            .execute_blocking(move |conn| select_one(conn, "id = ?1", &id))
            .await
    }

    /// Insert a new entity at `path`, or overwrite the metadata of the existing one
    pub async fn upsert(&self, path: &str, metadata: EntityMetadata) -> Result<UpsertOutcome> {
        let path = path.to_string();
        let raw_stat = encode_stat(&metadata)?;

        self.store
            .execute_transaction(move |tx| {
                let existing: Option<EntityId> = tx
                    .query_row(
                        "SELECT id FROM entities WHERE path = ?1",
                        params![path],
                        |row| row.get(0),
                    )
                    .optional()?;

                match existing {
                    None => {
                        let id = tx.query_row(
                            r#"
                            INSERT INTO entities (path, size, digest, modify_time, raw_stat)
                            VALUES (?1, ?2, ?3, ?4, ?5)
                            RETURNING id
                            "#,
                            params![
                                path,
                                metadata.size as i64,
                                metadata.digest,
                                metadata.modify_time.to_rfc3339(),
                                raw_stat,
                            ],
                            |row| row.get(0),
                        )?;
                        debug!("Indexed new entity {} at {}", id, path);
                        Ok(UpsertOutcome::Inserted(id))
                    }
                    Some(id) => {
                        tx.execute(
                            r#"
                            UPDATE entities
                            SET size = ?2, digest = ?3, modify_time = ?4, raw_stat = ?5
                            WHERE id = ?1
                            "#,
                            params![
                                id,
                                metadata.size as i64,
                                metadata.digest,
                                metadata.modify_time.to_rfc3339(),
                                raw_stat,
                            ],
                        )?;
                        debug!("Refreshed entity {} at {}", id, path);
                        Ok(UpsertOutcome::Updated(id))
                    }
                }
            })
            .await
    }

    /// Overwrite the metadata at `path` only if its size or digest differ.
    ///
    /// Returns `false` for a stale write (nothing changed) or an unknown path.
    pub async fn update_if_changed(&self, path: &str, metadata: EntityMetadata) -> Result<bool> {
        let path = path.to_string();
        let raw_stat = encode_stat(&metadata)?;

        self.store
            .execute_transaction(move |tx| {
                let updated = tx.execute(
                    r#"
                    UPDATE entities
                    SET size = ?2, digest = ?3, modify_time = ?4, raw_stat = ?5
                    WHERE path = ?1 AND (size != ?2 OR digest != ?3)
                    "#,
                    params![
                        path,
                        metadata.size as i64,
                        metadata.digest,
                        metadata.modify_time.to_rfc3339(),
                        raw_stat,
                    ],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Move the entity at `from`, and everything beneath it, to `to`.
    ///
    /// Identifiers are preserved. Entities already at or beneath `to` are
    /// replaced, as the filesystem rename replaced them. Returns the number
    /// of entities moved; zero when nothing was indexed at `from`.
    pub async fn rename(&self, from: &str, to: &str) -> Result<usize> {
        if from == to {
            return Ok(0);
        }
        if is_within(to, from) || is_within(from, to) {
            return Err(IndexError::MalformedEvent(format!(
                "cannot move {} into itself as {}",
                from, to
            )));
        }

        let from = from.to_string();
        let to = to.to_string();

        self.store
            .execute_transaction(move |tx| {
                let sources: i64 = tx.query_row(
                    &format!("SELECT COUNT(*) FROM entities WHERE {}", PREFIX_PREDICATE),
                    params![from],
                    |row| row.get(0),
                )?;
                if sources == 0 {
                    return Ok(0);
                }

                let replaced = tx.execute(
                    &format!("DELETE FROM entities WHERE {}", PREFIX_PREDICATE),
                    params![to],
                )?;
                if replaced > 0 {
                    debug!("Move onto {} replaced {} entities", to, replaced);
                }

                let moved = tx.execute(
                    &format!(
                        "UPDATE entities SET path = ?2 || substr(path, length(?1) + 1) WHERE {}",
                        PREFIX_PREDICATE
                    ),
                    params![from, to],
                )?;
                debug!("Moved {} entities from {} to {}", moved, from, to);
                Ok(moved)
            })
            .await
    }

    /// Remove the entity at `path` and every entity beneath it
    pub async fn delete_by_prefix(&self, path: &str) -> Result<usize> {
        let path = path.to_string();
        self.store
            .execute_transaction(move |tx| {
                let removed = tx.execute(
                    &format!("DELETE FROM entities WHERE {}", PREFIX_PREDICATE),
                    params![path],
                )?;
                debug!("Removed {} entities under {}", removed, path);
                Ok(removed)
            })
            .await
    }

    /// Every live entity, ordered by path
    pub async fn entities(&self) -> Result<Vec<EntityRecord>> {
        self.store
            .execute_blocking(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM entities ORDER BY path",
                    ENTITY_COLUMNS
                ))?;
                let rows = stmt.query_map([], row_to_record)?;

                let mut records = Vec::new();
                for record in rows {
                    records.push(record?);
                }
                Ok(records)
            })
            .await
    }

    /// Number of live entities
    pub async fn count(&self) -> Result<u64> {
        self.store
            .execute_blocking(|conn| {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await
    }
}

fn encode_stat(metadata: &EntityMetadata) -> Result<Option<String>> {
    metadata.stat.as_ref().map(EntityStat::encode).transpose()
}

fn select_one<P: rusqlite::ToSql>(
    conn: &Connection,
    predicate: &str,
    value: &P,
) -> Result<Option<EntityRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM entities WHERE {}", ENTITY_COLUMNS, predicate),
            params![value],
            row_to_record,
        )
        .optional()?)
}

pub(crate) fn parse_time(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<EntityRecord> {
    let id: EntityId = row.get(0)?;
    let path: String = row.get(1)?;
    let raw_stat: Option<String> = row.get(5)?;

    let stat = match raw_stat {
        Some(raw) => match EntityStat::decode(&raw) {
            Ok(stat) => Some(stat),
            Err(e) => {
                warn!("Undecodable stat record for {}: {}", path, e);
                None
            }
        },
        None => None,
    };

    Ok(EntityRecord {
        id,
        metadata: EntityMetadata {
            size: row.get::<_, i64>(2)? as u64,
            digest: row.get(3)?,
            modify_time: parse_time(4, &row.get::<_, String>(4)?)?,
            stat,
        },
        path,
    })
}
