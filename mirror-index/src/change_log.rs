//! Read side of the append-only change log and consumer checkpoints

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::entity_index::parse_time;
use crate::errors::{IndexError, Result};
use crate::store::MirrorStore;

/// Kind of a raw change record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Delete,
    Content,
    /// Rename or move
    Path,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Delete => "delete",
            ChangeType::Content => "content",
            ChangeType::Path => "path",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(ChangeType::Create),
            "delete" => Ok(ChangeType::Delete),
            "content" => Ok(ChangeType::Content),
            "path" => Ok(ChangeType::Path),
            other => Err(IndexError::MalformedEvent(format!(
                "unknown change type {:?}",
                other
            ))),
        }
    }
}

/// Latest indexed state of an entity, joined onto its change records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub path: String,
    pub size: u64,
    pub digest: String,
    pub modify_time: DateTime<Utc>,
}

/// One raw change record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: i64,
    pub entity_id: EntityId,
    pub change_type: ChangeType,
    /// Path before the change; absent for creates
    pub source: Option<String>,
    /// Path after the change; absent for deletes
    pub target: Option<String>,
    /// Current index state of the entity; absent once it was deleted
    pub node: Option<NodeState>,
}

impl ChangeRecord {
    /// Path the record starts from: `source` when present, else `target`
    pub fn effective_path(&self) -> Option<&str> {
        self.source.as_deref().or(self.target.as_deref())
    }
}

/// Change log reader over a shared store
#[derive(Clone)]
pub struct ChangeLog {
    store: MirrorStore,
}

impl ChangeLog {
    pub fn new(store: MirrorStore) -> Self {
        Self { store }
    }

    /// Records with `seq > since_seq`, ordered by `(entity_id, seq)`
    pub async fn records_since(&self, since_seq: i64) -> Result<Vec<ChangeRecord>> {
        self.store
            .execute_blocking(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT c.seq, c.entity_id, c.change_type, c.source, c.target,
                           e.path, e.size, e.digest, e.modify_time
                    FROM changes c
                    LEFT JOIN entities e ON e.id = c.entity_id
                    WHERE c.seq > ?1
                    ORDER BY c.entity_id, c.seq ASC
                    "#,
                )?;

                let rows = stmt.query_map(params![since_seq], row_to_change)?;

                let mut records = Vec::new();
                for row in rows {
                    let (record, raw_type) = row?;
                    records.push(ChangeRecord {
                        change_type: raw_type.parse()?,
                        ..record
                    });
                }
                Ok(records)
            })
            .await
    }

    /// Highest sequence number written so far (0 for an empty log)
    pub async fn latest_seq(&self) -> Result<i64> {
        self.store
            .execute_blocking(|conn| {
                let seq: Option<i64> =
                    conn.query_row("SELECT MAX(seq) FROM changes", [], |row| row.get(0))?;
                Ok(seq.unwrap_or(0))
            })
            .await
    }

    /// Stored checkpoint of a consumer (0 when it never acknowledged anything)
    pub async fn checkpoint(&self, consumer: &str) -> Result<i64> {
        let consumer = consumer.to_string();
        self.store
            .execute_blocking(move |conn| {
                let seq: Option<i64> = conn
                    .query_row(
                        "SELECT seq FROM checkpoints WHERE consumer = ?1",
                        params![consumer],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(seq.unwrap_or(0))
            })
            .await
    }

    /// Move a consumer's checkpoint forward; never moves it back.
    ///
    /// Returns the checkpoint now stored.
    pub async fn advance_checkpoint(&self, consumer: &str, seq: i64) -> Result<i64> {
        let consumer = consumer.to_string();
        self.store
            .execute_transaction(move |tx| {
                let stored = tx.query_row(
                    r#"
                    INSERT INTO checkpoints (consumer, seq) VALUES (?1, ?2)
                    ON CONFLICT(consumer) DO UPDATE SET
                        seq = MAX(checkpoints.seq, excluded.seq),
                        updated_at = CURRENT_TIMESTAMP
                    RETURNING seq
                    "#,
                    params![consumer, seq],
                    |row| row.get(0),
                )?;
                Ok(stored)
            })
            .await
    }
}

/// Row mapping; the change type is parsed by the caller so a bad value
/// surfaces as a malformed-event error instead of a SQL conversion error
fn row_to_change(row: &Row<'_>) -> rusqlite::Result<(ChangeRecord, String)> {
    let node_path: Option<String> = row.get(5)?;
    let node = match node_path {
        Some(path) => Some(NodeState {
            path,
            size: row.get::<_, i64>(6)? as u64,
            digest: row.get(7)?,
            modify_time: parse_time(8, &row.get::<_, String>(8)?)?,
        }),
        None => None,
    };

    Ok((
        ChangeRecord {
            seq: row.get(0)?,
            entity_id: row.get(1)?,
            change_type: ChangeType::Create,
            source: row.get(3)?,
            target: row.get(4)?,
            node,
        },
        row.get(2)?,
    ))
}
