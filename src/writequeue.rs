//! Coalesced, rate-limited job-progress writer.
//!
//! The crawler holds an exclusive transaction while walking; writing job
//! progress on every batch would contend with its own writes. Grounded on
//! `cmdr::indexing::writer`'s dedicated writer thread draining an mpsc
//! channel, narrowed to this crate's single concern: progress updates,
//! coalesced so only the latest one per window is ever persisted.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::entry::JobMetadata;
use crate::store::Store;

const DEFAULT_WINDOW: Duration = Duration::from_secs(3);

enum Msg {
    Update(u8, JobMetadata),
    FlushSync(mpsc::Sender<()>),
    Shutdown,
}

/// Handle to a running flusher thread for one job's progress.
///
/// Cloning is not supported; a queue belongs to exactly one crawl run.
/// `update` never blocks on I/O — it only pushes onto the channel.
pub struct WriteQueue {
    sender: mpsc::Sender<Msg>,
    handle: Option<thread::JoinHandle<()>>,
}

impl WriteQueue {
    pub fn spawn(store: Arc<Mutex<dyn Store + Send>>, job_id: i64) -> Self {
        Self::spawn_with_window(store, job_id, DEFAULT_WINDOW)
    }

    pub fn spawn_with_window(store: Arc<Mutex<dyn Store + Send>>, job_id: i64, window: Duration) -> Self {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("write-queue-flusher".into())
            .spawn(move || flusher_loop(store, job_id, receiver, window))
            .expect("failed to spawn write-queue flusher thread");
        Self {
            sender,
            handle: Some(handle),
        }
    }

    /// Overwrite the pending-update slot. Last writer wins; never blocks.
    pub fn update(&self, progress: u8, metadata: JobMetadata) {
        let _ = self.sender.send(Msg::Update(progress, metadata));
    }

    /// Force an immediate drain and block until it is durable.
    pub fn flush_sync(&self, timeout: Duration) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.sender.send(Msg::FlushSync(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.recv_timeout(timeout);
    }

    /// Flush any pending update and stop the flusher thread.
    pub fn shutdown(mut self) {
        let _ = self.sender.send(Msg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// A cheap-to-clone handle sharing this queue's channel, for callers
    /// (like the parallel crawler's progress reporter thread) that need
    /// to publish updates without owning the flusher thread.
    pub fn handle(&self) -> WriteQueueHandle {
        WriteQueueHandle {
            sender: self.sender.clone(),
        }
    }
}

/// Cloneable sender half of a [`WriteQueue`]. Does not own the flusher
/// thread; dropping all handles and the original queue is what stops it.
#[derive(Clone)]
pub struct WriteQueueHandle {
    sender: mpsc::Sender<Msg>,
}

impl WriteQueueHandle {
    pub fn update(&self, progress: u8, metadata: JobMetadata) {
        let _ = self.sender.send(Msg::Update(progress, metadata));
    }

    pub fn flush_sync(&self, timeout: Duration) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.sender.send(Msg::FlushSync(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.recv_timeout(timeout);
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        let _ = self.sender.send(Msg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn flusher_loop(
    store: Arc<Mutex<dyn Store + Send>>,
    job_id: i64,
    receiver: mpsc::Receiver<Msg>,
    window: Duration,
) {
    let mut latest: Option<(u8, JobMetadata)> = None;
    loop {
        match receiver.recv_timeout(window) {
            Ok(Msg::Update(progress, metadata)) => {
                latest = Some((progress, metadata));
                // Drain anything else that queued up within this tick so a
                // burst of updates still costs one write.
                loop {
                    match receiver.try_recv() {
                        Ok(Msg::Update(p, m)) => latest = Some((p, m)),
                        Ok(Msg::FlushSync(done)) => {
                            flush(&store, job_id, &mut latest);
                            let _ = done.send(());
                        }
                        Ok(Msg::Shutdown) => {
                            flush(&store, job_id, &mut latest);
                            return;
                        }
                        Err(mpsc::TryRecvError::Empty) => break,
                        Err(mpsc::TryRecvError::Disconnected) => {
                            flush(&store, job_id, &mut latest);
                            return;
                        }
                    }
                }
            }
            Ok(Msg::FlushSync(done)) => {
                flush(&store, job_id, &mut latest);
                let _ = done.send(());
            }
            Ok(Msg::Shutdown) => {
                flush(&store, job_id, &mut latest);
                return;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                flush(&store, job_id, &mut latest);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn flush(store: &Arc<Mutex<dyn Store + Send>>, job_id: i64, latest: &mut Option<(u8, JobMetadata)>) {
    let Some((progress, metadata)) = latest.take() else {
        return;
    };
    let mut store = match store.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(e) = store.update_index_job_progress(job_id, progress, &metadata) {
        log::warn!("write queue: failed to persist job {job_id} progress: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn temp_store_with_job() -> (Arc<Mutex<dyn Store + Send>>, i64, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SqliteStore::open(&dir.path().join("q.db")).unwrap();
        let job_id = store.create_index_job("/tmp/t", 1).unwrap();
        (Arc::new(Mutex::new(store)), job_id, dir)
    }

    #[test]
    fn flush_sync_persists_latest_update() {
        let (store, job_id, _dir) = temp_store_with_job();
        let queue = WriteQueue::spawn_with_window(Arc::clone(&store), job_id, Duration::from_secs(60));
        queue.update(10, JobMetadata::new());
        queue.update(42, JobMetadata::new());
        queue.flush_sync(Duration::from_secs(5));

        let guard = store.lock().unwrap();
        let job = guard.get_index_job(job_id).unwrap().unwrap();
        assert_eq!(job.progress, 42);
    }

    #[test]
    fn shutdown_flushes_pending_update() {
        let (store, job_id, _dir) = temp_store_with_job();
        let queue = WriteQueue::spawn_with_window(Arc::clone(&store), job_id, Duration::from_secs(60));
        queue.update(99, JobMetadata::new());
        queue.shutdown();

        let guard = store.lock().unwrap();
        let job = guard.get_index_job(job_id).unwrap().unwrap();
        assert_eq!(job.progress, 99);
    }
}
