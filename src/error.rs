//! Error types for the store and the crawler.
//!
//! Mirrors the hand-rolled enum + manual `Display`/`Error` style used
//! throughout `cmdr`'s indexing module: no `thiserror`, explicit `From`
//! impls for the underlying `rusqlite`/`io` errors.

use std::fmt;

/// Errors surfaced by a [`crate::store::Store`] implementation.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    /// Another indexing operation already holds the exclusive lock.
    AlreadyLocked,
    /// No active transaction to commit/rollback, or one already active.
    NoActiveTransaction,
    SchemaMismatch { expected: String, found: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::AlreadyLocked => write!(f, "another indexing operation is already in progress"),
            StoreError::NoActiveTransaction => write!(f, "no active transaction"),
            StoreError::SchemaMismatch { expected, found } => {
                write!(f, "schema mismatch: expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors surfaced by a [`crate::source::Source`] implementation.
#[derive(Debug)]
pub enum SourceError {
    NotFound,
    PermissionDenied,
    /// The path is a symlink; deliberately not followed (see crate docs).
    SkipSymlink,
    Io(std::io::Error),
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound,
            std::io::ErrorKind::PermissionDenied => SourceError::PermissionDenied,
            _ => SourceError::Io(err),
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::NotFound => write!(f, "path not found"),
            SourceError::PermissionDenied => write!(f, "permission denied"),
            SourceError::SkipSymlink => write!(f, "path is a symlink, skipped"),
            SourceError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Fatal crawl errors. Per-entry I/O failures are counted, not raised —
/// see [`crate::crawler::Stats::errors`].
#[derive(Debug)]
pub enum CrawlError {
    /// `validate_path` / freshness-gate precondition failed.
    InaccessibleRoot(String),
    /// The store's exclusive indexing lock is held by another run.
    AlreadyLocked,
    /// A transaction boundary commit failed; the batch was rolled back.
    BatchCommitError(StoreError),
    /// `delete_stale` failed; the run is aborted and the job marked failed.
    DeleteStaleError(StoreError),
    /// `compute_aggregates` failed; the run is aborted and the job marked failed.
    AggregateError(StoreError),
    /// The run was cancelled before completion.
    Cancelled,
    Store(StoreError),
}

impl From<StoreError> for CrawlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyLocked => CrawlError::AlreadyLocked,
            other => CrawlError::Store(other),
        }
    }
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlError::InaccessibleRoot(path) => write!(f, "inaccessible root: {path}"),
            CrawlError::AlreadyLocked => write!(f, "another indexing operation is already in progress"),
            CrawlError::BatchCommitError(e) => write!(f, "batch commit failed: {e}"),
            CrawlError::DeleteStaleError(e) => write!(f, "stale-entry deletion failed: {e}"),
            CrawlError::AggregateError(e) => write!(f, "aggregate computation failed: {e}"),
            CrawlError::Cancelled => write!(f, "crawl cancelled"),
            CrawlError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for CrawlError {}
