//! Error type for storage backends.
//!
//! Each variant carries the failing key or entity so problems can be
//! diagnosed from logs alone. Values (secret envelopes, refresh tokens)
//! never appear in error messages.

/// Errors from KV and entity store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Failed to open or connect to the backend.
    #[error("failed to open storage at '{target}': {reason}")]
    Open { target: String, reason: String },

    /// A read operation failed.
    #[error("failed to read '{what}': {reason}")]
    Read { what: String, reason: String },

    /// A write operation failed.
    #[error("failed to write '{what}': {reason}")]
    Write { what: String, reason: String },

    /// A delete operation failed.
    #[error("failed to delete '{what}': {reason}")]
    Delete { what: String, reason: String },

    /// A unique constraint was violated (duplicate username, email, name…).
    #[error("conflict on '{what}'")]
    Conflict { what: String },

    /// Stored data failed to round-trip through serde.
    #[error("corrupt record '{what}': {reason}")]
    Corrupt { what: String, reason: String },
}

impl StoreError {
    /// Classify an sqlx error for the given subject, mapping unique
    /// violations to [`StoreError::Conflict`].
    pub(crate) fn from_sqlx(what: &str, err: &sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = err {
            if db.is_unique_violation() {
                return Self::Conflict {
                    what: what.to_owned(),
                };
            }
        }
        Self::Write {
            what: what.to_owned(),
            reason: err.to_string(),
        }
    }
}
