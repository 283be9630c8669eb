//! The persistence contract the crawler is written against.
//!
//! The crawler never depends on `rusqlite` directly; it only calls
//! through this trait, mirroring how `cmdr::indexing::scanner` only
//! calls through `IndexStore`/`WriterHandle` rather than touching
//! `Connection` itself. [`sqlite::SqliteStore`] is the reference
//! implementation.

pub mod sqlite;

use crate::entry::{Entry, IndexJob, JobMetadata, JobStatus, PathScanInfo, RunId};
use crate::error::StoreError;

pub use sqlite::SqliteStore;

/// Transactional persistence of entries, index jobs, and scan metadata,
/// with an exclusive cross-connection indexing lock.
///
/// All methods that mutate rows assume they run inside the transaction
/// opened by [`Store::begin`]; `commit`/`rollback` make (or discard) the
/// accumulated writes together.
pub trait Store {
    fn begin(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    /// Safe to call after `commit`; a no-op if no transaction is open.
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Exclusive, cross-connection indexing lock. Fails with
    /// `StoreError::AlreadyLocked` when another connection already holds it.
    fn lock_indexing(&mut self) -> Result<(), StoreError>;
    /// Must be called on every exit path once `lock_indexing` succeeded.
    fn unlock_indexing(&mut self) -> Result<(), StoreError>;

    /// Upsert on `path`, stamping `last_scanned = entry.last_scanned`. Idempotent.
    fn insert_or_update(&mut self, entry: &Entry) -> Result<(), StoreError>;
    /// Same as `insert_or_update`, reporting whether the row was newly created.
    fn insert_or_update_with_change(&mut self, entry: &Entry) -> Result<bool, StoreError>;

    /// Entries under `root` (inclusive) whose `last_scanned < run_id`.
    fn get_stale_entries(&self, root: &str, run_id: RunId) -> Result<Vec<Entry>, StoreError>;
    /// Remove the rows `get_stale_entries` would return. Returns the count removed.
    fn delete_stale(&mut self, root: &str, run_id: RunId) -> Result<u64, StoreError>;

    /// Bottom-up: every directory under `root` (inclusive) gets `size` set
    /// to the sum of its direct children's `size`.
    fn compute_aggregates(&mut self, root: &str) -> Result<(), StoreError>;

    /// The freshness-gate input for `root`.
    fn get_path_scan_info(&self, root: &str) -> Result<PathScanInfo, StoreError>;

    fn create_index_job(&mut self, root_path: &str, created_at: i64) -> Result<i64, StoreError>;
    fn start_index_job(&mut self, job_id: i64, started_at: i64) -> Result<(), StoreError>;
    fn update_index_job_progress(
        &mut self,
        job_id: i64,
        progress: u8,
        metadata: &JobMetadata,
    ) -> Result<(), StoreError>;
    fn update_index_job_status(
        &mut self,
        job_id: i64,
        status: JobStatus,
        completed_at: Option<i64>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
    fn get_index_job(&self, job_id: i64) -> Result<Option<IndexJob>, StoreError>;

    /// Post-index validation: how many rows exist under `root` (inclusive).
    fn get_entry_count(&self, root: &str) -> Result<u64, StoreError>;
}
