//! Error types for the event store

use thiserror::Error;

/// Event store errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Writer computed a stale current version; the whole batch was refused
    #[error("version conflict on {aggregate_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Aggregate being written
        aggregate_id: String,
        /// Version the writer believed was current
        expected: u64,
        /// Version actually stored
        actual: u64,
    },

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backing database failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored history cannot be folded into a valid aggregate
    #[error("corrupt history for {aggregate_id}: {reason}")]
    Corrupt {
        /// Aggregate being replayed
        aggregate_id: String,
        /// What was wrong
        reason: String,
    },

    /// Backing store refused the write for a reason other than a conflict
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for event store operations
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Build a `Corrupt` error
    pub fn corrupt(aggregate_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            aggregate_id: aggregate_id.into(),
            reason: reason.into(),
        }
    }

    /// True if retrying the same write after re-reading state can succeed
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
