use thiserror::Error;

use huddle_shared::ModelError;

/// Errors produced by the storage boundary.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient network or service failure. Retryable; the repository never
    /// retries on its own, the caller owns the retry policy.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A node decoded into something other than its path family allows.
    #[error("malformed node at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    /// An operation needed a record that does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The write violated a structural invariant of the data model.
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
