//! Store errors
//!
//! One error enum across the ports; callers map storage failures into their
//! own taxonomy at the boundary.

use thiserror::Error;

/// Errors surfaced by repository implementations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness or concurrent-update conflict
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend failure (connection, transaction, I/O)
    #[error("storage error: {0}")]
    Storage(String),

    /// Row could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}
