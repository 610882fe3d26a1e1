/// Database schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Version written by `SCHEMA` itself; later versions come from migrations
pub const BASE_SCHEMA_VERSION: u32 = 1;

/// Per-connection settings for file-backed databases
pub const CONNECTION_PRAGMAS: &str = r#"
PRAGMA busy_timeout = 5000;
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

/// Per-connection settings for in-memory databases (no WAL)
pub const MEMORY_PRAGMAS: &str = r#"
PRAGMA synchronous = OFF;
PRAGMA journal_mode = MEMORY;
"#;

/// SQL schema for the mirror database.
///
/// The `changes` table is never written by application code: the triggers
/// below append one record per insert, delete, rename or content update of
/// an entity row.
pub const SCHEMA: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

-- One row per live file or directory under the watched root
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    digest TEXT NOT NULL,
    modify_time TEXT NOT NULL,
    raw_stat TEXT,
    indexed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_entities_digest ON entities(digest);

-- Append-only change log; AUTOINCREMENT keeps seq from ever being reused
CREATE TABLE IF NOT EXISTS changes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL,
    change_type TEXT NOT NULL CHECK (change_type IN ('create', 'delete', 'content', 'path')),
    source TEXT,
    target TEXT,
    recorded_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_changes_entity_seq ON changes(entity_id, seq);

CREATE TRIGGER IF NOT EXISTS log_entity_insert AFTER INSERT ON entities
BEGIN
    INSERT INTO changes (entity_id, change_type, source, target)
    VALUES (new.id, 'create', NULL, new.path);
END;

CREATE TRIGGER IF NOT EXISTS log_entity_delete AFTER DELETE ON entities
BEGIN
    INSERT INTO changes (entity_id, change_type, source, target)
    VALUES (old.id, 'delete', old.path, NULL);
END;

CREATE TRIGGER IF NOT EXISTS log_entity_path AFTER UPDATE OF path ON entities
WHEN old.path != new.path
BEGIN
    INSERT INTO changes (entity_id, change_type, source, target)
    VALUES (new.id, 'path', old.path, new.path);
END;

CREATE TRIGGER IF NOT EXISTS log_entity_content AFTER UPDATE OF size, digest ON entities
WHEN old.digest != new.digest OR old.size != new.size
BEGIN
    INSERT INTO changes (entity_id, change_type, source, target)
    VALUES (new.id, 'content', new.path, new.path);
END;
"#;
