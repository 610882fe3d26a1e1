//! Point-in-time views of the index and the differences between them

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, trace, warn};

use crate::entity::EntityStat;
use crate::entity_index::EntityIndex;
use crate::errors::Result;
use crate::filter::PathFilter;
use crate::paths::to_relative;

/// Immutable map of index paths to their OS metadata.
///
/// Entities are also addressable by their OS identifier (inode). Entities
/// without one, which is every entity on platforms lacking stable inode
/// numbers, cannot be matched across paths, so a move of such an entity
/// shows up in a [`SnapshotDiff`] as an unrelated delete and create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, EntityStat>",
    into = "BTreeMap<String, EntityStat>"
)]
pub struct Snapshot {
    entries: BTreeMap<String, EntityStat>,
    by_os_id: BTreeMap<u64, String>,
}

impl From<BTreeMap<String, EntityStat>> for Snapshot {
    fn from(entries: BTreeMap<String, EntityStat>) -> Self {
        let by_os_id = entries
            .iter()
            .filter_map(|(path, stat)| stat.os_id.map(|id| (id, path.clone())))
            .collect();
        Self { entries, by_os_id }
    }
}

impl From<Snapshot> for BTreeMap<String, EntityStat> {
    fn from(snapshot: Snapshot) -> Self {
        snapshot.entries
    }
}

impl FromIterator<(String, EntityStat)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, EntityStat)>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<BTreeMap<_, _>>())
    }
}

impl Snapshot {
    /// Snapshot of everything currently in the index.
    ///
    /// Rows without a usable stat record are left out.
    pub async fn load(index: &EntityIndex) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for record in index.entities().await? {
            match record.metadata.stat {
                Some(stat) => {
                    entries.insert(record.path, stat);
                }
                None => debug!("Snapshot skips {} without stat record", record.path),
            }
        }
        Ok(Self::from(entries))
    }

    /// Snapshot of the live filesystem under `root`.
    ///
    /// Directories are always descended into; only entries passing the
    /// filter are recorded. Symbolic links are not followed.
    pub async fn capture(root: &Path, filter: &PathFilter) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut dirs_to_process = vec![root.to_path_buf()];

        while let Some(current_dir) = dirs_to_process.pop() {
            let mut dir = fs::read_dir(&current_dir).await?;

            while let Some(entry) = dir.next_entry().await? {
                let path = entry.path();
                let relative = match to_relative(root, &path) {
                    Ok(Some(relative)) => relative,
                    Ok(None) => continue,
                    Err(e) => {
                        // Neither the entry nor anything below it can be indexed
                        warn!("Skipping {:?}: {}", path, e);
                        continue;
                    }
                };

                let metadata = match fs::symlink_metadata(&path).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        // Vanished between listing and stat
                        warn!("Failed to stat {:?}: {}", path, e);
                        continue;
                    }
                };

                if metadata.file_type().is_symlink() {
                    trace!("Skipping symlink: {:?}", path);
                    continue;
                }
                if metadata.is_dir() {
                    dirs_to_process.push(path);
                }
                if filter.included(&relative) {
                    entries.insert(relative, EntityStat::from_metadata(&metadata)?);
                }
            }
        }

        debug!("Captured {} entries under {:?}", entries.len(), root);
        Ok(Self::from(entries))
    }

    pub fn stat(&self, path: &str) -> Option<&EntityStat> {
        self.entries.get(path)
    }

    pub fn stat_for_os_id(&self, os_id: u64) -> Option<&EntityStat> {
        self.path_for_os_id(os_id).and_then(|path| self.stat(path))
    }

    pub fn path_for_os_id(&self, os_id: u64) -> Option<&str> {
        self.by_os_id.get(&os_id).map(String::as_str)
    }

    pub fn paths(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// What changed going from `older` to `self`
    pub fn diff(&self, older: &Snapshot) -> SnapshotDiff {
        let mut created: BTreeSet<String> = self
            .entries
            .keys()
            .filter(|path| !older.entries.contains_key(*path))
            .cloned()
            .collect();
        let mut deleted: BTreeSet<String> = older
            .entries
            .keys()
            .filter(|path| !self.entries.contains_key(*path))
            .cloned()
            .collect();
        let mut modified = BTreeSet::new();

        for (path, new_stat) in &self.entries {
            let Some(old_stat) = older.entries.get(path) else {
                continue;
            };
            if !same_identity(old_stat, new_stat) {
                // Another object now lives at this path
                deleted.insert(path.clone());
                created.insert(path.clone());
            } else if stat_changed(old_stat, new_stat) {
                modified.insert(path.clone());
            }
        }

        let mut moved = Vec::new();
        for old_path in deleted.clone() {
            let Some(os_id) = older.entries[&old_path].os_id else {
                continue;
            };
            let Some(new_path) = self.path_for_os_id(os_id) else {
                continue;
            };
            if !created.contains(new_path) {
                continue;
            }

            deleted.remove(&old_path);
            created.remove(new_path);
            if stat_changed(&older.entries[&old_path], &self.entries[new_path]) {
                modified.insert(new_path.to_string());
            }
            moved.push((old_path, new_path.to_string()));
        }

        SnapshotDiff {
            created,
            deleted,
            modified,
            moved,
        }
    }
}

fn same_identity(a: &EntityStat, b: &EntityStat) -> bool {
    match (a.os_id, b.os_id) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

fn stat_changed(a: &EntityStat, b: &EntityStat) -> bool {
    a.size != b.size || a.modified != b.modified || a.is_dir != b.is_dir
}

/// Differences between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub created: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    /// `(old path, new path)`, ordered by old path
    pub moved: Vec<(String, String)>,
}

impl SnapshotDiff {
    pub fn has_changes(&self) -> bool {
        self.change_count() > 0
    }

    pub fn change_count(&self) -> usize {
        self.created.len() + self.deleted.len() + self.modified.len() + self.moved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityMetadata, STAT_VERSION};
    use crate::store::MirrorStore;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::tempdir;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 9, minute, 0).unwrap()
    }

    fn stat(size: u64, minute: u32, os_id: Option<u64>) -> EntityStat {
        EntityStat {
            version: STAT_VERSION,
            size,
            modified: at(minute),
            is_dir: false,
            os_id,
            device: None,
            mode: None,
            platform: BTreeMap::new(),
        }
    }

    fn snapshot(entries: &[(&str, EntityStat)]) -> Snapshot {
        entries
            .iter()
            .map(|(path, stat)| (path.to_string(), stat.clone()))
            .collect()
    }

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_created_deleted_modified() {
        let old = snapshot(&[
            ("keep", stat(1, 0, Some(1))),
            ("gone", stat(1, 0, Some(2))),
            ("edit", stat(1, 0, Some(3))),
        ]);
        let new = snapshot(&[
            ("keep", stat(1, 0, Some(1))),
            ("edit", stat(2, 5, Some(3))),
            ("fresh", stat(1, 0, Some(4))),
        ]);

        let diff = new.diff(&old);
        assert_eq!(diff.created, set(&["fresh"]));
        assert_eq!(diff.deleted, set(&["gone"]));
        assert_eq!(diff.modified, set(&["edit"]));
        assert!(diff.moved.is_empty());
        assert_eq!(diff.change_count(), 3);
    }

    #[test]
    fn test_move_detected_by_os_id() {
        let old = snapshot(&[("a", stat(1, 0, Some(7)))]);
        let new = snapshot(&[("b", stat(1, 0, Some(7)))]);

        let diff = new.diff(&old);
        assert_eq!(diff.moved, vec![("a".to_string(), "b".to_string())]);
        assert!(diff.created.is_empty());
        assert!(diff.deleted.is_empty());
        assert!(diff.modified.is_empty());
    }

    #[test]
    fn test_move_with_edit_is_also_modified() {
        let old = snapshot(&[("a", stat(1, 0, Some(7)))]);
        let new = snapshot(&[("b", stat(9, 3, Some(7)))]);

        let diff = new.diff(&old);
        assert_eq!(diff.moved, vec![("a".to_string(), "b".to_string())]);
        assert_eq!(diff.modified, set(&["b"]));
    }

    #[test]
    fn test_replaced_object_is_delete_and_create() {
        let old = snapshot(&[("a", stat(1, 0, Some(7)))]);
        let new = snapshot(&[("a", stat(1, 0, Some(8)))]);

        let diff = new.diff(&old);
        assert_eq!(diff.created, set(&["a"]));
        assert_eq!(diff.deleted, set(&["a"]));
        assert!(diff.modified.is_empty());
    }

    #[test]
    fn test_swap_yields_two_moves() {
        let old = snapshot(&[("a", stat(1, 0, Some(1))), ("b", stat(2, 0, Some(2)))]);
        let new = snapshot(&[("a", stat(2, 0, Some(2))), ("b", stat(1, 0, Some(1)))]);

        let diff = new.diff(&old);
        assert_eq!(
            diff.moved,
            vec![
                ("a".to_string(), "b".to_string()),
                ("b".to_string(), "a".to_string())
            ]
        );
        assert!(diff.created.is_empty());
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn test_missing_os_id_degrades_to_create_and_delete() {
        let old = snapshot(&[("a", stat(1, 0, None))]);
        let new = snapshot(&[("b", stat(1, 0, None))]);

        let diff = new.diff(&old);
        assert!(diff.moved.is_empty());
        assert_eq!(diff.created, set(&["b"]));
        assert_eq!(diff.deleted, set(&["a"]));
    }

    #[test]
    fn test_diff_symmetry() {
        let old = snapshot(&[("a", stat(1, 0, None)), ("b", stat(1, 0, None))]);
        let new = snapshot(&[("b", stat(1, 0, None)), ("c", stat(1, 0, None))]);

        assert_eq!(new.diff(&old).created, old.diff(&new).deleted);
        assert_eq!(new.diff(&old).deleted, old.diff(&new).created);
    }

    #[test]
    fn test_serde_rebuilds_os_id_map() {
        let original = snapshot(&[("a", stat(1, 0, Some(11)))]);
        let json = serde_json::to_string(&original).unwrap();
        let restored: Snapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, original);
        assert_eq!(restored.path_for_os_id(11), Some("a"));
        assert_eq!(restored.stat_for_os_id(11).unwrap().size, 1);
    }

    #[tokio::test]
    async fn test_load_skips_rows_without_stat() {
        let store = MirrorStore::new_in_memory().unwrap();
        let index = EntityIndex::new(store);

        let with_stat = stat(3, 0, Some(5));
        index
            .upsert(
                "a.txt",
                EntityMetadata {
                    size: 3,
                    digest: "d".to_string(),
                    modify_time: with_stat.modified,
                    stat: Some(with_stat),
                },
            )
            .await
            .unwrap();
        index
            .upsert(
                "b.txt",
                EntityMetadata {
                    size: 3,
                    digest: "d".to_string(),
                    modify_time: at(0),
                    stat: None,
                },
            )
            .await
            .unwrap();

        let snapshot = Snapshot::load(&index).await.unwrap();
        assert_eq!(snapshot.paths(), set(&["a.txt"]));
        assert_eq!(snapshot.path_for_os_id(5), Some("a.txt"));
    }

    #[tokio::test]
    async fn test_capture_walks_and_filters() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/nested")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("docs/nested/b.txt"), b"bb").unwrap();
        std::fs::write(dir.path().join("docs/scratch.tmp"), b"x").unwrap();

        let filter = PathFilter::new(&crate::filter::MaintainerConfig::default()).unwrap();
        let snapshot = Snapshot::capture(dir.path(), &filter).await.unwrap();

        assert_eq!(
            snapshot.paths(),
            set(&["docs", "docs/a.txt", "docs/nested", "docs/nested/b.txt"])
        );
        assert!(snapshot.stat("docs").unwrap().is_dir);
        assert_eq!(snapshot.stat("docs/nested/b.txt").unwrap().size, 2);
        assert!(snapshot.stat("docs/scratch.tmp").is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_capture_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        let bad = dir.path().join(OsStr::from_bytes(b"bad\xffdir"));
        std::fs::create_dir(&bad).unwrap();
        std::fs::write(bad.join("inner.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("good.txt"), b"g").unwrap();

        let filter = PathFilter::new(&crate::filter::MaintainerConfig::default()).unwrap();
        let snapshot = Snapshot::capture(dir.path(), &filter).await.unwrap();

        assert_eq!(snapshot.paths(), set(&["good.txt"]));
    }
}
