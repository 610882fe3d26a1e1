//! Compaction of raw change records into logical changes
//!
//! Records of one entity are folded together as long as each record starts
//! where the previous one left off. A folded group is emitted only when it
//! still describes a difference: the path moved or the content changed.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::change_log::{ChangeLog, ChangeRecord, ChangeType, NodeState};
use crate::entity::EntityId;
use crate::errors::Result;
use crate::store::MirrorStore;

/// One entity's net change between two checkpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalChange {
    pub entity_id: EntityId,
    /// Sequence number of the last record folded into this change
    pub seq: i64,
    pub change_type: ChangeType,
    pub source: Option<String>,
    pub target: Option<String>,
    /// Latest indexed state, absent when the entity no longer exists
    pub node: Option<NodeState>,
}

impl LogicalChange {
    fn start(record: ChangeRecord) -> Self {
        Self {
            entity_id: record.entity_id,
            seq: record.seq,
            change_type: record.change_type,
            source: record.source,
            target: record.target,
            node: record.node,
        }
    }

    /// Whether `record` continues this change's path chain
    fn continues_with(&self, record: &ChangeRecord) -> bool {
        record.entity_id == self.entity_id
            && self.target.is_some()
            && record.effective_path() == self.target.as_deref()
    }

    fn absorb(&mut self, record: ChangeRecord) {
        self.change_type = match (self.change_type, record.change_type) {
            (ChangeType::Create, ChangeType::Path | ChangeType::Content) => ChangeType::Create,
            (_, incoming) => incoming,
        };
        self.target = record.target;
        self.seq = record.seq;
        self.node = record.node;
    }

    fn is_effective(&self) -> bool {
        self.source != self.target || self.change_type == ChangeType::Content
    }
}

/// Result of one compaction pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactedChanges {
    pub changes: Vec<LogicalChange>,
    /// Checkpoint to hand back once the changes are applied
    pub last_seq: i64,
}

/// Fold `records` (ordered by entity, then sequence) into logical changes
pub fn compact(records: Vec<ChangeRecord>, since_seq: i64) -> CompactedChanges {
    let last_seq = records
        .iter()
        .map(|record| record.seq)
        .max()
        .unwrap_or(since_seq)
        .max(since_seq);

    let mut changes = Vec::new();
    let mut current: Option<LogicalChange> = None;

    for record in records {
        if let Some(group) = current.as_mut() {
            if group.continues_with(&record) {
                group.absorb(record);
                continue;
            }
        }
        if let Some(done) = current.replace(LogicalChange::start(record)) {
            emit(&mut changes, done);
        }
    }
    if let Some(done) = current {
        emit(&mut changes, done);
    }

    CompactedChanges { changes, last_seq }
}

fn emit(changes: &mut Vec<LogicalChange>, change: LogicalChange) {
    if change.is_effective() {
        changes.push(change);
    } else {
        debug!(
            "Dropping no-op {} change of entity {} at seq {}",
            change.change_type, change.entity_id, change.seq
        );
    }
}

/// Serves compacted changes to consumers and tracks their checkpoints
#[derive(Clone)]
pub struct ChangeCompactor {
    log: ChangeLog,
}

impl ChangeCompactor {
    pub fn new(store: MirrorStore) -> Self {
        Self {
            log: ChangeLog::new(store),
        }
    }

    /// Logical changes recorded after `since_seq`
    pub async fn get_changes(&self, since_seq: i64) -> Result<CompactedChanges> {
        let records = self.log.records_since(since_seq).await?;
        let read = records.len();
        let compacted = compact(records, since_seq);

        debug!(
            "Compacted {} records after seq {} into {} changes (last seq {})",
            read,
            since_seq,
            compacted.changes.len(),
            compacted.last_seq
        );
        Ok(compacted)
    }

    /// Logical changes a consumer has not acknowledged yet
    pub async fn changes_for(&self, consumer: &str) -> Result<CompactedChanges> {
        let since = self.log.checkpoint(consumer).await?;
        self.get_changes(since).await
    }

    /// Record that `consumer` applied everything up to `seq`
    pub async fn acknowledge(&self, consumer: &str, seq: i64) -> Result<i64> {
        let stored = self.log.advance_checkpoint(consumer, seq).await?;
        debug!("Checkpoint of {} now at {}", consumer, stored);
        Ok(stored)
    }

    pub fn log(&self) -> &ChangeLog {
        &self.log
    }
}
