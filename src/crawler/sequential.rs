//! Stack-based DFS crawler: the canonical, single-writer indexing path.
//!
//! Grounded on `indexing/scanner.rs::run_scan` (stat → classify → batch
//! → flush) and `indexing/mod.rs::start_scan` (lock → estimate → walk →
//! aggregate → lifecycle → finalize), reshaped from `jwalk`'s internal
//! parallel iterator onto an explicit `Vec<String>` stack.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::crawler::{join_child, now_secs, split_parent, CrawlOptions, ProgressCallback, Stats};
use crate::entry::{Entry, EntryKind, JobMetadata, JobStatus};
use crate::error::{CrawlError, StoreError};
use crate::progress::{Phase, ProgressTracker};
use crate::source::Source;
use crate::store::Store;
use crate::writequeue::WriteQueue;

type SharedStore = Arc<Mutex<dyn Store + Send>>;

/// Releases the store's exclusive indexing lock on every exit path,
/// including an unwind — the `defer`-equivalent the store contract requires.
struct IndexingLockGuard {
    store: SharedStore,
}

impl Drop for IndexingLockGuard {
    fn drop(&mut self) {
        if let Ok(mut store) = self.store.lock() {
            let _ = store.unlock_indexing();
        }
    }
}

/// Index `root` with default options (`force=false`, `max_age_seconds=3600`).
pub fn index(
    root: &str,
    store: SharedStore,
    source: &dyn Source,
    job_id: Option<i64>,
    progress_cb: Option<ProgressCallback>,
) -> Result<Stats, CrawlError> {
    index_with_options(root, store, source, job_id, progress_cb, CrawlOptions::default())
}

pub fn index_with_options(
    root: &str,
    store: SharedStore,
    source: &dyn Source,
    job_id: Option<i64>,
    progress_cb: Option<ProgressCallback>,
    opts: CrawlOptions,
) -> Result<Stats, CrawlError> {
    let start_time = now_secs();

    if source.stat(Path::new(root)).is_err() {
        return Err(CrawlError::InaccessibleRoot(root.to_string()));
    }

    let scan_info = {
        let store = store.lock().unwrap_or_else(|p| p.into_inner());
        store.get_path_scan_info(root)?
    };

    let job_id = ensure_job(&store, root, job_id, start_time)?;

    if !opts.force && opts.max_age_seconds > 0 {
        if let Some(last_scanned) = scan_info.last_scanned {
            if scan_info.entry_count > 0 && start_time - last_scanned < opts.max_age_seconds {
                let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
                store.update_index_job_progress(job_id, 100, &JobMetadata::new())?;
                store.update_index_job_status(job_id, JobStatus::Completed, Some(start_time), None)?;
                return Ok(Stats::skipped(start_time, "root scanned within max_age_seconds"));
            }
        }
    }

    let run_id = {
        let next = start_time;
        match scan_info.last_scanned {
            Some(prev) if next <= prev => prev + 1,
            _ => next,
        }
    };

    {
        let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
        match store.lock_indexing() {
            Ok(()) => {}
            Err(StoreError::AlreadyLocked) => return Err(CrawlError::AlreadyLocked),
            Err(e) => return Err(e.into()),
        }
        store.start_index_job(job_id, start_time)?;
    }
    let _lock_guard = IndexingLockGuard {
        store: Arc::clone(&store),
    };

    // An invariant violation mid-walk panics rather than propagating an
    // ordinary error; `catch_unwind` here is what rolls back the active
    // transaction before the panic resumes, per the store contract's
    // "defer rollback" discipline.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        run_crawl(root, &store, source, job_id, progress_cb, &opts, run_id, start_time)
    }));

    let result = match outcome {
        Ok(result) => result,
        Err(payload) => {
            let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
            let _ = store.rollback();
            let _ = store.update_index_job_status(
                job_id,
                JobStatus::Failed,
                Some(now_secs()),
                Some("crawl panicked; transaction rolled back"),
            );
            std::panic::resume_unwind(payload);
        }
    };

    match &result {
        Ok(_) => {
            let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
            let _ = store.update_index_job_status(job_id, JobStatus::Completed, Some(now_secs()), None);
        }
        Err(e) => {
            let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
            let _ = store.rollback();
            let _ = store.update_index_job_status(job_id, JobStatus::Failed, Some(now_secs()), Some(&e.to_string()));
        }
    }

    result
}

fn ensure_job(store: &SharedStore, root: &str, job_id: Option<i64>, created_at: i64) -> Result<i64, CrawlError> {
    match job_id {
        Some(id) => Ok(id),
        None => {
            let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
            Ok(store.create_index_job(root, created_at)?)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_crawl(
    root: &str,
    store: &SharedStore,
    source: &dyn Source,
    job_id: i64,
    progress_cb: Option<ProgressCallback>,
    opts: &CrawlOptions,
    run_id: i64,
    start_time: i64,
) -> Result<Stats, CrawlError> {
    let estimated_total = source.estimate_size(Path::new(root));
    let mut tracker = ProgressTracker::new(estimated_total);
    tracker.set_phase(Phase::Crawling);

    let write_queue = WriteQueue::spawn(Arc::clone(store), job_id);

    let mut files_processed = 0u64;
    let mut directories_processed = 0u64;
    let mut total_size: i64 = 0;
    let mut errors = 0u64;
    let mut batch_count = 0usize;

    let mut added: Vec<Entry> = Vec::new();
    let mut refreshed: Vec<Entry> = Vec::new();

    {
        let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
        store.begin()?;
    }

    let mut stack = vec![root.to_string()];
    let mut last_progress_emit = std::time::Instant::now();

    while let Some(path) = stack.pop() {
        let item = match source.stat(Path::new(&path)) {
            Ok(item) => item,
            Err(_) => {
                errors += 1;
                tracker.record_error();
                continue;
            }
        };

        let parent = split_parent(&path);
        let kind = if item.is_dir { EntryKind::Directory } else { EntryKind::File };
        let entry = Entry {
            path: path.clone(),
            parent,
            size: if item.is_dir { 0 } else { item.size as i64 },
            kind,
            ctime: item.mtime,
            mtime: item.mtime,
            last_scanned: run_id,
        };

        {
            let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
            if opts.lifecycle_trigger.is_some() {
                let created = store.insert_or_update_with_change(&entry)?;
                if kind == EntryKind::File {
                    if created {
                        added.push(entry.clone());
                    } else {
                        refreshed.push(entry.clone());
                    }
                }
            } else {
                store.insert_or_update(&entry)?;
            }
        }

        if item.is_dir {
            directories_processed += 1;
            if let Ok(children) = source.read_dir(Path::new(&path)) {
                for child in children {
                    stack.push(join_child(&path, &child.name));
                }
            }
        } else {
            files_processed += 1;
            total_size += entry.size;
        }

        tracker.record_item();
        batch_count += 1;

        if batch_count >= opts.batch_size {
            let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
            store.commit().map_err(CrawlError::BatchCommitError)?;
            store.begin()?;
            batch_count = 0;
        }

        if last_progress_emit.elapsed() >= crate::crawler::PROGRESS_INTERVAL {
            emit_progress(&tracker, &write_queue, &progress_cb, files_processed, directories_processed, total_size, errors, start_time);
            last_progress_emit = std::time::Instant::now();
        }
    }

    {
        let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
        store.commit().map_err(CrawlError::BatchCommitError)?;
    }

    tracker.set_phase(Phase::Cleanup);
    emit_progress(&tracker, &write_queue, &progress_cb, files_processed, directories_processed, total_size, errors, start_time);

    let mut removed: Vec<Entry> = Vec::new();
    if opts.lifecycle_trigger.is_some() {
        let stale = {
            let store = store.lock().unwrap_or_else(|p| p.into_inner());
            store.get_stale_entries(root, run_id).map_err(CrawlError::DeleteStaleError)?
        };
        removed.extend(stale.into_iter().filter(|e| e.kind == EntryKind::File));
    }
    {
        let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
        store.delete_stale(root, run_id).map_err(CrawlError::DeleteStaleError)?;
    }

    tracker.set_phase(Phase::Aggregation);
    emit_progress(&tracker, &write_queue, &progress_cb, files_processed, directories_processed, total_size, errors, start_time);
    {
        let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
        store.compute_aggregates(root).map_err(CrawlError::AggregateError)?;
    }

    if let Some(trigger) = &opts.lifecycle_trigger {
        trigger.on_add(&added);
        trigger.on_remove(&removed);
        trigger.on_refresh(&refreshed);
    }

    let post_count = {
        let store = store.lock().unwrap_or_else(|p| p.into_inner());
        store.get_entry_count(root)?
    };
    if post_count == 0 && files_processed > 0 {
        log::warn!("index: root {root} has zero entries after indexing {files_processed} files; possible permissions problem");
    }

    tracker.set_phase(Phase::Complete);
    write_queue.update(100, JobMetadata::new());
    write_queue.flush_sync(std::time::Duration::from_secs(5));
    write_queue.shutdown();

    let end_time = now_secs();
    Ok(Stats {
        files_processed,
        directories_processed,
        total_size,
        errors,
        duration: std::time::Duration::from_secs((end_time - start_time).max(0) as u64),
        start_time,
        end_time,
        skipped: false,
        skip_reason: String::new(),
    })
}

#[allow(clippy::too_many_arguments)]
fn emit_progress(
    tracker: &ProgressTracker,
    write_queue: &WriteQueue,
    progress_cb: &Option<ProgressCallback>,
    files_processed: u64,
    directories_processed: u64,
    total_size: i64,
    errors: u64,
    start_time: i64,
) {
    let percent = tracker.percent_complete();
    let mut metadata = JobMetadata::new();
    metadata.insert("files_processed".to_string(), serde_json::json!(files_processed));
    metadata.insert("directories_processed".to_string(), serde_json::json!(directories_processed));
    metadata.insert("total_size".to_string(), serde_json::json!(total_size));
    metadata.insert("error_count".to_string(), serde_json::json!(errors));
    write_queue.update(percent, metadata);

    if let Some(cb) = progress_cb {
        let stats = Stats {
            files_processed,
            directories_processed,
            total_size,
            errors,
            duration: tracker.elapsed(),
            start_time,
            end_time: now_secs(),
            skipped: false,
            skip_reason: String::new(),
        };
        cb(&stats, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FilesystemSource;
    use crate::store::SqliteStore;
    use std::fs;

    fn shared(store: SqliteStore) -> SharedStore {
        Arc::new(Mutex::new(store))
    }

    #[test]
    fn small_tree_produces_expected_entries_and_aggregates() {
        let root_dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        let root = root_dir.path().join("t");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("file.txt"), vec![0u8; 12]).unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/file2.txt"), vec![0u8; 14]).unwrap();

        let store = shared(SqliteStore::open(&db_dir.path().join("i.db")).unwrap());
        let source = FilesystemSource::new();
        let root_str = root.to_string_lossy().to_string();

        let stats = index(&root_str, Arc::clone(&store), &source, None, None).unwrap();

        assert_eq!(stats.files_processed, 2);
        assert_eq!(stats.directories_processed, 2);
        assert!(!stats.skipped);

        let guard = store.lock().unwrap();
        assert_eq!(guard.get_entry_count(&root_str).unwrap(), 4);
        let stale = guard.get_stale_entries(&root_str, i64::MAX).unwrap();
        let sizes: std::collections::HashMap<_, _> = stale.iter().map(|e| (e.path.clone(), e.size)).collect();
        assert_eq!(sizes[&root_str], 26);
        assert_eq!(sizes[&format!("{root_str}/sub")], 14);
    }

    #[test]
    fn freshness_gate_skips_recent_scan() {
        let root_dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        let root = root_dir.path().join("t");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("file.txt"), vec![0u8; 12]).unwrap();

        let store = shared(SqliteStore::open(&db_dir.path().join("i.db")).unwrap());
        let source = FilesystemSource::new();
        let root_str = root.to_string_lossy().to_string();

        index(&root_str, Arc::clone(&store), &source, None, None).unwrap();
        let stats = index(&root_str, Arc::clone(&store), &source, None, None).unwrap();

        assert!(stats.skipped);
    }

    #[test]
    fn force_bypasses_freshness_gate_and_picks_up_new_files() {
        let root_dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        let root = root_dir.path().join("t");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("file.txt"), vec![0u8; 12]).unwrap();

        let store = shared(SqliteStore::open(&db_dir.path().join("i.db")).unwrap());
        let source = FilesystemSource::new();
        let root_str = root.to_string_lossy().to_string();

        index(&root_str, Arc::clone(&store), &source, None, None).unwrap();
        fs::write(root.join("new.txt"), vec![0u8; 5]).unwrap();

        let mut opts = CrawlOptions::default();
        opts.force = true;
        let stats = index_with_options(&root_str, Arc::clone(&store), &source, None, None, opts).unwrap();

        assert!(!stats.skipped);
        assert_eq!(stats.files_processed, 2);

        let guard = store.lock().unwrap();
        assert_eq!(guard.get_entry_count(&root_str).unwrap(), 3);
    }

    #[test]
    fn symlinks_are_never_indexed() {
        #[cfg(unix)]
        {
            let root_dir = tempfile::tempdir().unwrap();
            let db_dir = tempfile::tempdir().unwrap();
            let root = root_dir.path().join("t");
            fs::create_dir(&root).unwrap();
            fs::write(root.join("file.txt"), vec![0u8; 1]).unwrap();
            std::os::unix::fs::symlink(root.join("file.txt"), root.join("link.txt")).unwrap();

            let store = shared(SqliteStore::open(&db_dir.path().join("i.db")).unwrap());
            let source = FilesystemSource::new();
            let root_str = root.to_string_lossy().to_string();

            let stats = index(&root_str, Arc::clone(&store), &source, None, None).unwrap();
            assert_eq!(stats.files_processed, 1);

            let guard = store.lock().unwrap();
            let link_path = root.join("link.txt").to_string_lossy().to_string();
            assert_eq!(guard.get_entry_count(&link_path).unwrap(), 0);
        }
    }

    #[test]
    fn concurrent_runs_against_the_same_store_reject_one() {
        let root_dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        let root = root_dir.path().join("big");
        fs::create_dir(&root).unwrap();
        for i in 0..50 {
            fs::write(root.join(format!("f{i}.txt")), vec![0u8; 1]).unwrap();
        }

        let db_path = db_dir.path().join("i.db");
        let a = shared(SqliteStore::open(&db_path).unwrap());
        let b = shared(SqliteStore::open(&db_path).unwrap());

        let mut a_store = a.lock().unwrap();
        a_store.lock_indexing().unwrap();
        drop(a_store);

        let source = FilesystemSource::new();
        let root_str = root.to_string_lossy().to_string();
        let result = index(&root_str, Arc::clone(&b), &source, None, None);
        assert!(matches!(result, Err(CrawlError::AlreadyLocked)));
    }
}
