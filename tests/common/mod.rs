#![allow(dead_code)]

use anyhow::{Context, Result};
use fsmirror::index::{
    ChangeCompactor, EntityId, FsNotification, IndexMaintainer, LogicalChange, MaintainerConfig,
    MirrorStore,
};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// A watched temp directory with a maintainer and compactor over one store
pub struct MirrorFixture {
    pub temp_dir: TempDir,
    pub store: MirrorStore,
    pub maintainer: IndexMaintainer,
    pub compactor: ChangeCompactor,
}

impl MirrorFixture {
    pub fn new() -> Result<Self> {
        Self::with_config(MaintainerConfig::default())
    }

    pub fn with_config(config: MaintainerConfig) -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temp directory")?;
        let store = MirrorStore::new_in_memory()?;
        let maintainer = IndexMaintainer::new(store.clone(), temp_dir.path(), &config)?;
        let compactor = ChangeCompactor::new(store.clone());

        Ok(Self {
            temp_dir,
            store,
            maintainer,
            compactor,
        })
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.temp_dir.path().join(relative)
    }

    /// Write a file and report its creation
    pub async fn create_file(&self, relative: &str, content: &[u8]) -> Result<()> {
        fs::write(self.path(relative), content)?;
        self.notify(FsNotification::Created {
            path: self.path(relative),
            is_directory: false,
        })
        .await
    }

    pub async fn create_dir(&self, relative: &str) -> Result<()> {
        fs::create_dir(self.path(relative))?;
        self.notify(FsNotification::Created {
            path: self.path(relative),
            is_directory: true,
        })
        .await
    }

    pub async fn modify_file(&self, relative: &str, content: &[u8]) -> Result<()> {
        fs::write(self.path(relative), content)?;
        self.notify(FsNotification::Modified {
            path: self.path(relative),
            is_directory: false,
        })
        .await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.path(from), self.path(to))?;
        self.notify(FsNotification::Moved {
            from: self.path(from),
            to: self.path(to),
        })
        .await
    }

    pub async fn remove(&self, relative: &str) -> Result<()> {
        let path = self.path(relative);
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        self.notify(FsNotification::Deleted { path }).await
    }

    pub async fn notify(&self, event: FsNotification) -> Result<()> {
        self.maintainer.handle(event).await?;
        Ok(())
    }

    pub async fn id_of(&self, relative: &str) -> Result<Option<EntityId>> {
        Ok(self.maintainer.index().lookup(relative).await?)
    }

    /// Compacted changes after `since`
    pub async fn changes_since(&self, since: i64) -> Result<(Vec<LogicalChange>, i64)> {
        let compacted = self.compactor.get_changes(since).await?;
        Ok((compacted.changes, compacted.last_seq))
    }

    pub async fn latest_seq(&self) -> Result<i64> {
        Ok(self.compactor.log().latest_seq().await?)
    }
}
