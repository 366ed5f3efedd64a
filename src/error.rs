//! RelayDB error abstractions.

use thiserror::Error;

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// The maximum allowed length of a user key in a bucket store.
pub const MAX_KEY_LENGTH: usize = 255;

/// Application error variants.
#[derive(Debug, Error, PartialEq)]
pub enum AppError {
    /// A caller violated an API precondition.
    ///
    /// This always indicates a caller bug and must never be retried.
    #[error("precondition failed for the requested operation")]
    PreconditionFailed,
    /// No nodes with spare capacity are available for token placement.
    ///
    /// Transient: the next cluster membership or capacity event may clear it.
    #[error("no nodes with non-zero capacity are available")]
    NoNodesAvailable,
    /// An empty key, key set or batch was given where one is required.
    #[error("an empty key or batch was given")]
    Empty,
    /// A key exceeds the maximum sorting key length.
    #[error("key exceeds the maximum length of {} bytes", MAX_KEY_LENGTH)]
    Length,
    /// A merkle node ID lies outside the tree.
    #[error("merkle node is out of range for the tree")]
    MerkleRange,
    /// The resource specified in the request is not known.
    #[error("the requested resource is not found")]
    ResourceNotFound,
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The caller is unauthorized to perform the requested action.
    #[error("unauthorized to perform the requested action")]
    Unauthorized,
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
