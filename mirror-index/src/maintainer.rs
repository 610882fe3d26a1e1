//! Keeps the entity index in step with filesystem notifications

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, trace, warn};

use crate::entity::{EntityMetadata, EntityStat, DIRECTORY_DIGEST};
use crate::entity_index::{EntityIndex, UpsertOutcome};
use crate::errors::{IndexError, Result};
use crate::filter::{MaintainerConfig, PathFilter};
use crate::paths::{is_within, to_absolute, to_relative, SEPARATOR};
use crate::snapshot::{Snapshot, SnapshotDiff};
use crate::store::MirrorStore;
use crate::watcher::FsNotification;

/// Top-level names used to park entities while reconciliation applies moves
const PARKING_PREFIX: &str = ".fsmirror-reconcile-";

/// Applies notifications for one watched root to the entity index
pub struct IndexMaintainer {
    root: PathBuf,
    index: EntityIndex,
    filter: PathFilter,
}

impl IndexMaintainer {
    pub fn new(store: MirrorStore, root: impl Into<PathBuf>, config: &MaintainerConfig) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            index: EntityIndex::new(store),
            filter: PathFilter::new(config)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index(&self) -> &EntityIndex {
        &self.index
    }

    /// Apply one notification
    pub async fn handle(&self, event: FsNotification) -> Result<()> {
        match event {
            FsNotification::Created { path, .. } => {
                let relative = self.relative(&path)?;
                self.on_create(&relative).await
            }
            FsNotification::Deleted { path } => {
                let relative = self.relative(&path)?;
                self.on_delete(&relative).await
            }
            FsNotification::Modified { path, is_directory } => {
                let relative = self.relative(&path)?;
                if is_directory {
                    self.on_directory_modify(&relative).await
                } else {
                    self.on_modify(&relative).await
                }
            }
            FsNotification::Moved { from, to } => {
                match (to_relative(&self.root, &from)?, to_relative(&self.root, &to)?) {
                    (Some(from), Some(to)) => self.on_move(&from, &to).await,
                    // Moved in from outside the root
                    (None, Some(to)) => self.on_create(&to).await,
                    // Moved out of the root
                    (Some(from), None) => self.on_delete(&from).await,
                    (None, None) => Err(IndexError::MalformedEvent(format!(
                        "move {:?} -> {:?} outside of {:?}",
                        from, to, self.root
                    ))),
                }
            }
            FsNotification::Rescan => {
                info!("Notifications for {:?} were lost, rescanning", self.root);
                self.reconcile().await.map(drop)
            }
        }
    }

    /// Drain `receiver` until it closes.
    ///
    /// Events that fail for non-storage reasons are logged and dropped; a
    /// storage failure stops the loop and is returned.
    pub async fn run(&self, mut receiver: mpsc::UnboundedReceiver<FsNotification>) -> Result<()> {
        info!("Index maintainer started for {:?}", self.root);

        while let Some(event) = receiver.recv().await {
            trace!("Handling {:?}", event);
            let path = event.path().unwrap_or(&self.root).to_path_buf();

            match self.handle(event).await {
                Ok(()) => {}
                Err(e) if e.is_storage() => {
                    error!("Storage failure while handling {:?}: {}", path, e);
                    return Err(e);
                }
                Err(e) => warn!("Dropping event for {:?}: {}", path, e),
            }
        }

        info!("Notification channel closed, index maintainer stopping");
        Ok(())
    }

    /// Digest of the entity at `relative`: indexed value first, then the live file
    pub async fn lookup_digest(&self, relative: &str) -> Result<Option<String>> {
        if let Some(record) = self.index.get_metadata(relative).await? {
            return Ok(Some(record.metadata.digest));
        }

        let path = to_absolute(&self.root, relative);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => Ok(Some(DIRECTORY_DIGEST.to_string())),
            Ok(_) => Ok(Some(hash_file(path).await?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Bring the index in line with the filesystem in one pass.
    ///
    /// Returns the differences that were found and applied.
    pub async fn reconcile(&self) -> Result<SnapshotDiff> {
        let live = Snapshot::capture(&self.root, &self.filter).await?;
        let indexed = Snapshot::load(&self.index).await?;
        let diff = self.confirm_moves(live.diff(&indexed), &live).await?;

        if !diff.has_changes() {
            debug!("Index already matches {:?}", self.root);
            return Ok(diff);
        }

        let moves = self.apply_moves(&diff.moved).await?;

        for path in &diff.deleted {
            let current = relocate(path, &moves);
            tolerate(self.index.delete_by_prefix(&current).await.map(drop))?;
        }

        // BTreeSet order puts parents before their children
        for path in &diff.created {
            tolerate(self.index_entity(path).await.map(drop))?;
        }

        for path in &diff.modified {
            tolerate(self.index_entity(path).await.map(drop))?;
        }

        info!(
            "Reconciled {:?}: {} created, {} deleted, {} modified, {} moved",
            self.root,
            diff.created.len(),
            diff.deleted.len(),
            diff.modified.len(),
            diff.moved.len()
        );
        Ok(diff)
    }

    async fn on_create(&self, relative: &str) -> Result<()> {
        if !self.filter.included(relative) {
            return Ok(());
        }
        if self.index_entity(relative).await? {
            self.index_children(relative).await?;
        }
        Ok(())
    }

    async fn on_delete(&self, relative: &str) -> Result<()> {
        if !self.filter.included(relative) {
            return Ok(());
        }
        let removed = self.index.delete_by_prefix(relative).await?;
        debug!("Deleted {} ({} entities)", relative, removed);
        Ok(())
    }

    async fn on_move(&self, from: &str, to: &str) -> Result<()> {
        if self.index.lookup(from).await?.is_none() {
            debug!("Move source {} not indexed, indexing {} instead", from, to);
            return self.on_create(to).await;
        }

        let moved = self.index.rename(from, to).await?;
        debug!("Moved {} -> {} ({} entities)", from, to, moved);
        Ok(())
    }

    async fn on_modify(&self, relative: &str) -> Result<()> {
        if !self.filter.included(relative) {
            return Ok(());
        }

        let stat = self.stat(relative).await?;
        if stat.is_dir {
            trace!("Ignoring file modify on directory {}", relative);
            return Ok(());
        }

        if self.index.lookup(relative).await?.is_none() {
            debug!("Modified file {} not indexed yet", relative);
            return self.index_entity(relative).await.map(drop);
        }

        let digest = hash_file(to_absolute(&self.root, relative)).await?;
        if self
            .index
            .update_if_changed(relative, EntityMetadata::file(stat, digest))
            .await?
        {
            debug!("Updated content of {}", relative);
        } else {
            trace!("Content of {} unchanged", relative);
        }
        Ok(())
    }

    /// A directory notification stands for its most recently modified file
    async fn on_directory_modify(&self, relative: &str) -> Result<()> {
        let dir = to_absolute(&self.root, relative);
        let mut entries = fs::read_dir(&dir).await?;
        let mut newest: Option<(std::time::SystemTime, String)> = None;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let modified = metadata.modified()?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if newest.as_ref().map_or(true, |(time, _)| modified > *time) {
                newest = Some((modified, name));
            }
        }

        match newest {
            Some((_, name)) => {
                self.on_modify(&format!("{}{}{}", relative, SEPARATOR, name))
                    .await
            }
            None => {
                trace!("No regular file in modified directory {}", relative);
                Ok(())
            }
        }
    }

    /// Stat (and hash) the live entity and upsert it; returns whether it is a directory
    async fn index_entity(&self, relative: &str) -> Result<bool> {
        let stat = self.stat(relative).await?;
        let is_dir = stat.is_dir;

        let metadata = if is_dir {
            EntityMetadata::directory(stat)
        } else {
            let digest = hash_file(to_absolute(&self.root, relative)).await?;
            EntityMetadata::file(stat, digest)
        };

        match self.index.upsert(relative, metadata).await? {
            UpsertOutcome::Inserted(id) => debug!("Indexed {} as entity {}", relative, id),
            UpsertOutcome::Updated(id) => debug!("Refreshed {} (entity {})", relative, id),
        }

        Ok(is_dir)
    }

    /// Index everything below a directory that arrived without its own notifications
    async fn index_children(&self, relative: &str) -> Result<()> {
        let mut pending = vec![relative.to_string()];

        while let Some(current) = pending.pop() {
            let mut entries = fs::read_dir(to_absolute(&self.root, &current)).await?;

            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    warn!("Skipping non UTF-8 name {:?} in {}", file_name, current);
                    continue;
                };
                let child = format!("{}{}{}", current, SEPARATOR, name);
                let file_type = entry.file_type().await?;
                if file_type.is_symlink() {
                    continue;
                }
                if file_type.is_dir() {
                    pending.push(child.clone());
                }
                if self.filter.included(&child) {
                    tolerate(self.index_entity(&child).await.map(drop))?;
                }
            }
        }
        Ok(())
    }

    /// Inode numbers get reused, so a move matched by inode is kept only when
    /// the live entity is still the indexed one: same kind, and for files the
    /// same content. Other pairs become a delete and a create.
    async fn confirm_moves(&self, mut diff: SnapshotDiff, live: &Snapshot) -> Result<SnapshotDiff> {
        let mut confirmed = Vec::with_capacity(diff.moved.len());

        for (from, to) in std::mem::take(&mut diff.moved) {
            if self.is_same_entity(&from, &to, live).await? {
                confirmed.push((from, to));
            } else {
                debug!("{} -> {} only shares an inode, not a move", from, to);
                diff.modified.remove(&to);
                diff.deleted.insert(from);
                diff.created.insert(to);
            }
        }

        diff.moved = confirmed;
        Ok(diff)
    }

    async fn is_same_entity(&self, from: &str, to: &str, live: &Snapshot) -> Result<bool> {
        let (Some(record), Some(stat)) = (self.index.get_metadata(from).await?, live.stat(to))
        else {
            return Ok(false);
        };

        match (record.metadata.is_directory(), stat.is_dir) {
            (true, true) => Ok(true),
            (false, false) => match hash_file(to_absolute(&self.root, to)).await {
                Ok(digest) => Ok(digest == record.metadata.digest),
                Err(e) if e.is_storage() => Err(e),
                Err(e) => {
                    warn!("Cannot confirm move {} -> {}: {}", from, to, e);
                    Ok(false)
                }
            },
            _ => Ok(false),
        }
    }

    /// Apply snapshot moves in two phases so that swaps and moves into
    /// just-vacated paths never overwrite each other.
    ///
    /// Returns the applied `(old, new)` pairs.
    async fn apply_moves(&self, moved: &[(String, String)]) -> Result<Vec<(String, String)>> {
        let mut ordered = moved.to_vec();
        ordered.sort();

        let mut parked: Vec<(String, String, String)> = Vec::new();
        let mut parked_at: Vec<(String, String)> = Vec::new();

        for (i, (from, to)) in ordered.iter().enumerate() {
            let current = relocate(from, &parked_at);
            if self.index.lookup(&current).await?.is_none() {
                trace!("Move source {} already gone", current);
                continue;
            }

            let parking = format!("{}{}", PARKING_PREFIX, i);
            self.index.rename(&current, &parking).await?;
            parked_at.push((from.clone(), parking.clone()));
            parked.push((from.clone(), parking, to.clone()));
        }

        let mut applied = Vec::with_capacity(parked.len());
        for (from, parking, to) in parked {
            self.index.rename(&parking, &to).await?;
            applied.push((from, to));
        }
        Ok(applied)
    }

    fn relative(&self, path: &Path) -> Result<String> {
        to_relative(&self.root, path)?.ok_or_else(|| {
            IndexError::MalformedEvent(format!("{:?} is not under {:?}", path, self.root))
        })
    }

    async fn stat(&self, relative: &str) -> Result<EntityStat> {
        let metadata = fs::metadata(to_absolute(&self.root, relative)).await?;
        EntityStat::from_metadata(&metadata)
    }
}

/// Where `path` lives after the given moves; the deepest matching move wins
fn relocate(path: &str, moves: &[(String, String)]) -> String {
    moves
        .iter()
        .filter(|(from, _)| is_within(path, from))
        .max_by_key(|(from, _)| from.len())
        .map(|(from, to)| format!("{}{}", to, &path[from.len()..]))
        .unwrap_or_else(|| path.to_string())
}

/// Keep going after per-entity failures; only storage failures abort
fn tolerate(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_storage() => Err(e),
        Err(e) => {
            warn!("Skipping entity: {}", e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

async fn hash_file(path: PathBuf) -> Result<String> {
    let hash = task::spawn_blocking(move || mirror_hash::hash_file(&path))
        .await
        .map_err(|e| IndexError::TaskJoin(e.to_string()))??;
    Ok(hash.to_hex())
}
