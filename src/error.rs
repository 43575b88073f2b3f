use std::sync::PoisonError;

use bincode::ErrorKind;
use thiserror::Error;

/// Custom Result type for staydb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for staydb
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// NOT NULL / CHECK / UNIQUE / enum-membership failure
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    /// Foreign key target missing, or delete blocked by restrict policy
    #[error("referential integrity: {0}")]
    ReferentialIntegrity(String),
    /// Row, table, index or partition does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// New partition range intersects an existing one
    #[error("overlapping partition range: {0}")]
    OverlappingRange(String),
    /// Column named by a query descriptor does not exist
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    /// Unqualified column name present in more than one joined table
    #[error("ambiguous column: {0}")]
    AmbiguousColumn(String),
    /// Comparison between incompatible scalar types
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// Concurrent mutation of the same row lost the race
    #[error("write conflict, retry the operation")]
    WriteConflict,
    /// Encoding or decoding of a stored payload failed
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Internal error (storage, catalog corruption, etc.)
    #[error("internal error: {0}")]
    Internal(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(value: PoisonError<T>) -> Self {
        Error::Internal(value.to_string())
    }
}

impl From<Box<ErrorKind>> for Error {
    fn from(value: Box<ErrorKind>) -> Self {
        Error::Serialization(value.to_string())
    }
}
