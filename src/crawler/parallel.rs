//! Parallel crawler: one [`crate::workerpool::Job`] per filesystem path,
//! fork-joined across a [`WorkerPool`].
//!
//! Grounded on the same `indexing/mod.rs::start_scan` phase sequencing as
//! [`super::sequential`], but the walk itself follows
//! `spacedriveapp-spacedrive`'s `job_system::runner` shape: a job that does
//! one unit of work and submits its own children back onto the pool,
//! rather than a single thread popping an explicit stack. Writes are
//! serialized through one [`SharedWriter`] behind a mutex — the store
//! contract is still single-writer, only the stat/read_dir work is
//! parallel.

use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::crawler::{join_child, now_secs, split_parent, ParallelCrawlOptions, ProgressCallback, Stats, PROGRESS_INTERVAL};
use crate::entry::{Entry, EntryKind, JobMetadata, JobStatus};
use crate::error::{CrawlError, StoreError};
use crate::progress::crawling_percent;
use crate::source::Source;
use crate::store::Store;
use crate::workerpool::{CancelToken, Job, WorkerPool, WorkerPoolHandle};
use crate::writequeue::{WriteQueue, WriteQueueHandle};

type SharedStore = Arc<Mutex<dyn Store + Send>>;
type SharedSource = Arc<dyn Source>;

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

/// Lock-free counters updated from worker threads; the progress reporter
/// snapshots these rather than sharing a [`crate::progress::ProgressTracker`].
#[derive(Default)]
struct Counters {
    files_processed: AtomicU64,
    directories_processed: AtomicU64,
    total_size: AtomicI64,
    errors: AtomicU64,
}

/// The one point every worker thread funnels writes through. Guarded by a
/// single mutex so the store's single-writer contract holds even though
/// stat/read_dir run concurrently across the pool.
struct SharedWriter {
    store: SharedStore,
    batch_count: usize,
    batch_size: usize,
    lifecycle_enabled: bool,
    added: Vec<Entry>,
    refreshed: Vec<Entry>,
}

impl SharedWriter {
    fn write(&mut self, entry: &Entry) -> Result<(), StoreError> {
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        if self.lifecycle_enabled {
            let created = store.insert_or_update_with_change(entry)?;
            if entry.kind == EntryKind::File {
                if created {
                    self.added.push(entry.clone());
                } else {
                    self.refreshed.push(entry.clone());
                }
            }
        } else {
            store.insert_or_update(entry)?;
        }

        self.batch_count += 1;
        if self.batch_count >= self.batch_size {
            store.commit()?;
            store.begin()?;
            self.batch_count = 0;
        }
        Ok(())
    }
}

/// Stats one path, writes it, and submits one child job per directory
/// entry it finds. The unit of fork-join work for the whole crawl.
struct DirectoryScanJob {
    path: String,
    source: SharedSource,
    writer: Arc<Mutex<SharedWriter>>,
    counters: Arc<Counters>,
    run_id: i64,
}

impl Job for DirectoryScanJob {
    fn id(&self) -> &str {
        &self.path
    }

    fn run(self: Box<Self>, handle: &WorkerPoolHandle, cancel: &CancelToken) {
        if cancel.is_cancelled() {
            return;
        }

        let item = match self.source.stat(Path::new(&self.path)) {
            Ok(item) => item,
            Err(_) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let parent = split_parent(&self.path);
        let kind = if item.is_dir { EntryKind::Directory } else { EntryKind::File };
        let entry = Entry {
            path: self.path.clone(),
            parent,
            size: if item.is_dir { 0 } else { item.size as i64 },
            kind,
            ctime: item.mtime,
            mtime: item.mtime,
            last_scanned: self.run_id,
        };

        {
            let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = writer.write(&entry) {
                log::warn!("parallel crawl: failed to write {}: {e}", self.path);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if item.is_dir {
            self.counters.directories_processed.fetch_add(1, Ordering::Relaxed);
            match self.source.read_dir(Path::new(&self.path)) {
                Ok(children) => {
                    for child in children {
                        let child_path = join_child(&self.path, &child.name);
                        handle.submit(Box::new(DirectoryScanJob {
                            path: child_path,
                            source: Arc::clone(&self.source),
                            writer: Arc::clone(&self.writer),
                            counters: Arc::clone(&self.counters),
                            run_id: self.run_id,
                        }));
                    }
                }
                Err(_) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else {
            self.counters.files_processed.fetch_add(1, Ordering::Relaxed);
            self.counters.total_size.fetch_add(entry.size, Ordering::Relaxed);
        }
    }
}

/// Index `root` using a worker pool instead of a single-threaded stack walk.
/// Same phase sequence and store contract as [`super::sequential::index`];
/// only the crawling phase itself is parallel.
pub fn index_parallel(
    root: &str,
    store: SharedStore,
    source: SharedSource,
    job_id: Option<i64>,
    progress_cb: Option<ProgressCallback>,
    opts: ParallelCrawlOptions,
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

    // Mirrors the sequential crawler: an invariant violation in the pool's
    // driving thread rolls back the active transaction before the panic
    // resumes, rather than leaving a half-written batch uncommitted.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        run_crawl(root, &store, &source, job_id, progress_cb, &opts, run_id, start_time)
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
    source: &SharedSource,
    job_id: i64,
    progress_cb: Option<ProgressCallback>,
    opts: &ParallelCrawlOptions,
    run_id: i64,
    start_time: i64,
) -> Result<Stats, CrawlError> {
    {
        let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
        store.begin()?;
    }

    let counters = Arc::new(Counters::default());
    let writer = Arc::new(Mutex::new(SharedWriter {
        store: Arc::clone(store),
        batch_count: 0,
        batch_size: opts.batch_size.max(1),
        lifecycle_enabled: opts.lifecycle_trigger.is_some(),
        added: Vec::new(),
        refreshed: Vec::new(),
    }));

    let write_queue = WriteQueue::spawn(Arc::clone(store), job_id);
    let estimated_total = source.estimate_size(Path::new(root)).max(1);

    let mut pool = WorkerPool::new(opts.worker_count, opts.queue_size);
    pool.start();
    let pool_handle = pool.handle();

    pool_handle.submit(Box::new(DirectoryScanJob {
        path: root.to_string(),
        source: Arc::clone(source),
        writer: Arc::clone(&writer),
        counters: Arc::clone(&counters),
        run_id,
    }));

    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    let reporter = {
        let counters = Arc::clone(&counters);
        let write_handle = write_queue.handle();
        let pool_handle = pool_handle.clone();
        thread::Builder::new()
            .name("parallel-crawl-progress".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(PROGRESS_INTERVAL) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {
                        report_once(&counters, estimated_total, start_time, &write_handle, &pool_handle, &progress_cb);
                    }
                }
            })
            .expect("failed to spawn parallel-crawl progress reporter thread")
    };

    let _pool_stats = pool.wait();
    let _ = stop_tx.send(());
    let _ = reporter.join();

    {
        let mut store = store.lock().unwrap_or_else(|p| p.into_inner());
        store.commit().map_err(CrawlError::BatchCommitError)?;
    }

    let (added, refreshed) = {
        let mut w = writer.lock().unwrap_or_else(|p| p.into_inner());
        (std::mem::take(&mut w.added), std::mem::take(&mut w.refreshed))
    };

    let files_processed = counters.files_processed.load(Ordering::Relaxed);
    let directories_processed = counters.directories_processed.load(Ordering::Relaxed);
    let total_size = counters.total_size.load(Ordering::Relaxed);
    let errors = counters.errors.load(Ordering::Relaxed);

    emit_checkpoint(&write_queue, 87);

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

    emit_checkpoint(&write_queue, 95);
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
        log::warn!("index_parallel: root {root} has zero entries after indexing {files_processed} files; possible permissions problem");
    }

    emit_checkpoint(&write_queue, 100);
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

fn report_once(
    counters: &Counters,
    estimated_total: u64,
    start_time: i64,
    write_handle: &WriteQueueHandle,
    pool_handle: &WorkerPoolHandle,
    progress_cb: &Option<ProgressCallback>,
) {
    let files_processed = counters.files_processed.load(Ordering::Relaxed);
    let directories_processed = counters.directories_processed.load(Ordering::Relaxed);
    let total_size = counters.total_size.load(Ordering::Relaxed);
    let errors = counters.errors.load(Ordering::Relaxed);

    let items_done = files_processed + directories_processed;
    let percent = crawling_percent(items_done, estimated_total);

    let mut metadata = JobMetadata::new();
    metadata.insert("files_processed".to_string(), serde_json::json!(files_processed));
    metadata.insert("directories_processed".to_string(), serde_json::json!(directories_processed));
    metadata.insert("total_size".to_string(), serde_json::json!(total_size));
    metadata.insert("error_count".to_string(), serde_json::json!(errors));
    write_handle.update(percent, metadata);

    if let Some(cb) = progress_cb {
        let pool_stats = pool_handle.stats();
        let queue_remaining = pool_stats.jobs_queued.saturating_sub(pool_stats.jobs_processed + pool_stats.jobs_failed);
        let stats = Stats {
            files_processed,
            directories_processed,
            total_size,
            errors,
            duration: std::time::Duration::from_secs((now_secs() - start_time).max(0) as u64),
            start_time,
            end_time: now_secs(),
            skipped: false,
            skip_reason: String::new(),
        };
        cb(&stats, queue_remaining);
    }
}

fn emit_checkpoint(write_queue: &WriteQueue, percent: u8) {
    write_queue.update(percent, JobMetadata::new());
}
