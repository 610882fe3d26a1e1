use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hash error: {0}")]
    Hash(#[from] mirror_hash::HashError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] globset::Error),

    #[error("Watcher error: {0}")]
    WatcherError(String),
}

impl IndexError {
    /// Whether the persisted store itself failed (as opposed to one event or file)
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            IndexError::Database(_)
                | IndexError::Pool(_)
                | IndexError::TaskJoin(_)
                | IndexError::SchemaVersionMismatch { .. }
        )
    }

    /// Whether the caller may reasonably retry the same operation later
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexError::Pool(_) => true,
            IndexError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let pool = IndexError::Pool("timed out".to_string());
        assert!(pool.is_storage());
        assert!(pool.is_retryable());

        let busy = IndexError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_storage());
        assert!(busy.is_retryable());

        let malformed = IndexError::MalformedEvent("rename without target".to_string());
        assert!(!malformed.is_storage());
        assert!(!malformed.is_retryable());

        let io = IndexError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(!io.is_storage());
    }
}
