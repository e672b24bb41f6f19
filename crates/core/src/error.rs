//! Error taxonomy.
//!
//! The Resolver, Sweeper, and Recall Engine never leak raw `redb` or
//! `tantivy` errors to callers — everything is translated to one of these
//! variants. Missing data is a null object, not an error; see the `_details`
//! and `explain` read paths.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Lock contention held past the configured busy timeout.
    #[error("storage busy: could not acquire write lock within {waited:?}: {last_error}")]
    StorageBusy {
        waited: std::time::Duration,
        last_error: String,
    },

    /// The on-disk schema version is newer than this build's target, or a
    /// migration could not be applied. Fatal: refuses further writes.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A unique constraint (slug, content hash+session, …) was violated
    /// in a way a single retry could not resolve.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Lookup miss. Read paths prefer a null object over this error; it is
    /// reserved for write paths that require an existing row (e.g.
    /// `correct_fact` on an unknown id).
    #[error("not found: {0}")]
    NotFound(String),

    /// A malformed `Extraction` payload (empty subject, bad predicate, …).
    #[error("invalid extraction: {0}")]
    InvalidExtraction(String),

    /// A query or insert embedding's length did not match the deployment's
    /// fixed dimension.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    VectorDimensionMismatch { expected: usize, actual: usize },

    /// The extraction payload was not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Underlying storage engine error, after redb's typed errors have been
    /// collapsed into a single string. Budget-exceeded is reported in stats,
    /// not as an error, and constraint violations get their own variant, so
    /// this is reserved for I/O-class failures.
    #[error("storage error: {0}")]
    Storage(String),

    /// Full-text index error.
    #[error("search error: {0}")]
    Search(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(e.to_string())
    }
}
impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(e.to_string())
    }
}
impl From<redb::CompactionError> for Error {
    fn from(e: redb::CompactionError) -> Self {
        Error::Storage(e.to_string())
    }
}
#[cfg(feature = "fulltext")]
impl From<tantivy::TantivyError> for Error {
    fn from(e: tantivy::TantivyError) -> Self {
        Error::Search(e.to_string())
    }
}
#[cfg(feature = "fulltext")]
impl From<tantivy::query::QueryParserError> for Error {
    fn from(e: tantivy::query::QueryParserError) -> Self {
        Error::Search(e.to_string())
    }
}
