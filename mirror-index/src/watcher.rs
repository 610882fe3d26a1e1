//! Filesystem notifications for the index maintainer
//!
//! Wraps `notify`'s recommended backend. Raw events are paired up where a
//! backend reports the two halves of a rename separately, converted into
//! [`FsNotification`]s and forwarded over an unbounded channel in arrival
//! order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::errors::{IndexError, Result};

/// How long the first half of a rename waits for its second half
const RENAME_WINDOW: Duration = Duration::from_millis(100);

/// One filesystem change, with absolute paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsNotification {
    Created { path: PathBuf, is_directory: bool },
    Deleted { path: PathBuf },
    Modified { path: PathBuf, is_directory: bool },
    Moved { from: PathBuf, to: PathBuf },
    /// Events were lost; only a full rescan brings the index back in line
    Rescan,
}

impl FsNotification {
    /// Path the notification is primarily about
    pub fn path(&self) -> Option<&Path> {
        match self {
            FsNotification::Created { path, .. }
            | FsNotification::Deleted { path }
            | FsNotification::Modified { path, .. } => Some(path),
            FsNotification::Moved { to, .. } => Some(to),
            FsNotification::Rescan => None,
        }
    }
}

/// Recursive watch over one root
pub struct NotificationSource {
    root: PathBuf,
    watcher: RecommendedWatcher,
    raw: Option<mpsc::UnboundedReceiver<notify::Result<Event>>>,
}

impl NotificationSource {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(|e| IndexError::WatcherError(format!("Cannot canonicalize root: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if tx.send(res).is_err() {
                    trace!("Raw event channel closed");
                }
            },
            Config::default(),
        )
        .map_err(|e| IndexError::WatcherError(format!("Failed to create notify watcher: {}", e)))?;

        Ok(Self {
            root,
            watcher,
            raw: Some(rx),
        })
    }

    /// Canonical root being watched
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start delivering notifications for everything under the root
    pub fn watch(&mut self) -> Result<()> {
        debug!("Watching {:?}", self.root);
        self.watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| IndexError::WatcherError(format!("Failed to watch path: {}", e)))
    }

    /// Receiving end of the notification channel; available once.
    ///
    /// Spawns the task that pairs and converts raw events, so it must be
    /// called from within a tokio runtime.
    pub fn take_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<FsNotification>> {
        let raw = self.raw.take()?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(raw, tx));
        Some(rx)
    }
}

async fn forward_events(
    mut raw: mpsc::UnboundedReceiver<notify::Result<Event>>,
    tx: mpsc::UnboundedSender<FsNotification>,
) {
    let mut pairing = RenamePairing::default();

    loop {
        let next = if pairing.has_pending() {
            match timeout(RENAME_WINDOW, raw.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    if !send_all(&tx, pairing.flush()) {
                        return;
                    }
                    continue;
                }
            }
        } else {
            raw.recv().await
        };

        let notifications = match next {
            Some(Ok(event)) => pairing.push(event),
            Some(Err(e)) => {
                error!("notify watcher error: {}", e);
                continue;
            }
            None => {
                send_all(&tx, pairing.flush());
                debug!("Watcher stopped");
                return;
            }
        };

        if !send_all(&tx, notifications) {
            return;
        }
    }
}

fn send_all(tx: &mpsc::UnboundedSender<FsNotification>, notifications: Vec<FsNotification>) -> bool {
    for notification in notifications {
        if tx.send(notification).is_err() {
            error!("Notification channel closed");
            return false;
        }
    }
    true
}

/// Joins the `From` and `To` halves of renames into moves.
///
/// Halves are matched by the backend's tracker id, or by arrival order when
/// the backend has none. A `From` still waiting when any other event arrives
/// (or on [`flush`](Self::flush)) was a move out of the watch and becomes a
/// delete; a `To` without its `From` becomes a create.
#[derive(Debug, Default)]
pub struct RenamePairing {
    pending: Vec<(Option<usize>, PathBuf)>,
    /// Trackers already reported, whose trailing `Both` is a duplicate
    completed: HashSet<usize>,
}

impl RenamePairing {
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Take in one raw event; returns what it completes, in order
    pub fn push(&mut self, event: Event) -> Vec<FsNotification> {
        let tracker = event.tracker();
        let kind = event.kind;

        match kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) if !event.need_rescan() => {
                self.pending
                    .extend(event.paths.into_iter().map(|path| (tracker, path)));
                Vec::new()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) if !event.need_rescan() => event
                .paths
                .into_iter()
                .map(|to| match self.take_pending(tracker) {
                    Some(from) => {
                        if let Some(tracker) = tracker {
                            self.completed.insert(tracker);
                        }
                        FsNotification::Moved { from, to }
                    }
                    None => FsNotification::Created {
                        is_directory: to.is_dir(),
                        path: to,
                    },
                })
                .collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both))
                if tracker.map_or(false, |t| self.completed.remove(&t)) =>
            {
                trace!("Rename {:?} already reported", tracker);
                Vec::new()
            }
            _ => {
                let mut notifications = self.flush();
                match convert_notify_event(event) {
                    Ok(Some(notification)) => notifications.push(notification),
                    Ok(None) => {}
                    Err(e) => warn!("Dropping event: {}", e),
                }
                notifications
            }
        }
    }

    /// Give up on every waiting `From`, reporting each as a delete
    pub fn flush(&mut self) -> Vec<FsNotification> {
        self.completed.clear();
        self.pending
            .drain(..)
            .map(|(_, path)| FsNotification::Deleted { path })
            .collect()
    }

    fn take_pending(&mut self, tracker: Option<usize>) -> Option<PathBuf> {
        let position = self.pending.iter().position(|(t, _)| *t == tracker)?;
        Some(self.pending.remove(position).1)
    }
}

/// Convert a single `notify` event.
///
/// A lone rename half stands for a move across the watch boundary: `From` is
/// a delete and `To` a create. Renames and events of unknown kind that carry
/// one path are resolved by whether the path still exists. Access and
/// attribute-only events are ignored.
pub fn convert_notify_event(event: Event) -> Result<Option<FsNotification>> {
    if event.need_rescan() {
        return Ok(Some(FsNotification::Rescan));
    }

    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        let mut paths = event.paths.into_iter();
        return match (paths.next(), paths.next()) {
            (Some(from), Some(to)) => Ok(Some(FsNotification::Moved { from, to })),
            _ => Err(IndexError::MalformedEvent(
                "rename without both paths".to_string(),
            )),
        };
    }

    let kind = event.kind;
    let Some(path) = event.paths.into_iter().next() else {
        return match kind {
            EventKind::Any | EventKind::Other => Ok(Some(FsNotification::Rescan)),
            _ => Err(IndexError::MalformedEvent(format!(
                "{:?} event without a path",
                kind
            ))),
        };
    };

    let notification = match kind {
        EventKind::Create(create_kind) => FsNotification::Created {
            is_directory: match create_kind {
                CreateKind::Folder => true,
                CreateKind::File => false,
                _ => path.is_dir(),
            },
            path,
        },
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            FsNotification::Deleted { path }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FsNotification::Created {
            is_directory: path.is_dir(),
            path,
        },
        EventKind::Any
        | EventKind::Modify(ModifyKind::Name(RenameMode::Any | RenameMode::Other)) => {
            match std::fs::symlink_metadata(&path) {
                Ok(metadata) => FsNotification::Created {
                    is_directory: metadata.is_dir(),
                    path,
                },
                Err(_) => FsNotification::Deleted { path },
            }
        }
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
            FsNotification::Modified {
                is_directory: path.is_dir(),
                path,
            }
        }
        other => {
            trace!("Ignoring {:?} on {:?}", other, path);
            return Ok(None);
        }
    };

    Ok(Some(notification))
}
