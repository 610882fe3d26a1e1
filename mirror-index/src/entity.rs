//! Entity metadata as stored in the index

use std::collections::BTreeMap;
use std::fs::Metadata;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Digest recorded for directories in place of a content hash
pub const DIRECTORY_DIGEST: &str = "directory";

/// Stable identifier of an indexed entity; survives renames, never reused
pub type EntityId = i64;

/// Current encoding version of [`EntityStat`]
pub const STAT_VERSION: u32 = 1;

/// Cross-platform OS metadata captured for an entity.
///
/// Serialized as versioned JSON into the `raw_stat` column. `os_id` is the
/// inode number on Unix and `None` on platforms without a stable
/// identifier; snapshots cannot detect moves of entities without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStat {
    pub version: u32,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
    pub os_id: Option<u64>,
    pub device: Option<u64>,
    pub mode: Option<u32>,
    /// Platform-specific extras with no portable meaning
    #[serde(default)]
    pub platform: BTreeMap<String, u64>,
}

impl EntityStat {
    /// Capture the portable subset of filesystem metadata
    pub fn from_metadata(metadata: &Metadata) -> Result<Self> {
        let modified = DateTime::<Utc>::from(metadata.modified()?);
        let is_dir = metadata.is_dir();
        let size = if is_dir { 0 } else { metadata.len() };

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            let mut platform = BTreeMap::new();
            platform.insert("nlink".to_string(), metadata.nlink());
            platform.insert("uid".to_string(), u64::from(metadata.uid()));
            platform.insert("gid".to_string(), u64::from(metadata.gid()));

            Ok(Self {
                version: STAT_VERSION,
                size,
                modified,
                is_dir,
                os_id: Some(metadata.ino()),
                device: Some(metadata.dev()),
                mode: Some(metadata.mode()),
                platform,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {
                version: STAT_VERSION,
                size,
                modified,
                is_dir,
                os_id: None,
                device: None,
                mode: None,
                platform: BTreeMap::new(),
            })
        }
    }

    /// Encode for the `raw_stat` column
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a `raw_stat` column value
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Metadata written to the index for one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub size: u64,
    pub digest: String,
    pub modify_time: DateTime<Utc>,
    pub stat: Option<EntityStat>,
}

impl EntityMetadata {
    /// Metadata for a directory, which carries the sentinel digest and no size
    pub fn directory(stat: EntityStat) -> Self {
        Self {
            size: 0,
            digest: DIRECTORY_DIGEST.to_string(),
            modify_time: stat.modified,
            stat: Some(stat),
        }
    }

    /// Metadata for a regular file with a computed digest
    pub fn file(stat: EntityStat, digest: String) -> Self {
        Self {
            size: stat.size,
            digest,
            modify_time: stat.modified,
            stat: Some(stat),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.digest == DIRECTORY_DIGEST
    }
}

/// A row of the entity index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub path: String,
    pub metadata: EntityMetadata,
}
