pub mod change_log;
pub mod compactor;
pub mod entity;
pub mod entity_index;
pub mod errors;
pub mod filter;
pub mod maintainer;
pub mod migrations;
pub mod paths;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod watcher;

pub use change_log::{ChangeLog, ChangeRecord, ChangeType, NodeState};
pub use compactor::{compact, ChangeCompactor, CompactedChanges, LogicalChange};
pub use entity::{EntityId, EntityMetadata, EntityRecord, EntityStat, DIRECTORY_DIGEST};
pub use entity_index::{EntityIndex, UpsertOutcome};
pub use errors::{IndexError, Result};
pub use filter::{MaintainerConfig, PathFilter};
pub use maintainer::IndexMaintainer;
pub use migrations::{run_migrations, Migration, MigrationManager};
pub use snapshot::{Snapshot, SnapshotDiff};
pub use store::{MirrorStore, MirrorStoreBuilder};
pub use watcher::{convert_notify_event, FsNotification, NotificationSource};
