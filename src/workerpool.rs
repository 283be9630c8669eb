//! Bounded job queue with N workers, pause/resume/cancel, and a
//! queue-full synchronous fallback.
//!
//! The cancellation token follows `indexing/scanner.rs::ScanHandle` and
//! `indexing/micro_scan.rs::ActiveScan` (an `Arc<AtomicBool>` flipped by
//! the handle, polled by workers between jobs). Pause/resume is new:
//! `cmdr` drives its scans through `jwalk`'s internal Rayon pool and
//! never exposes a pause primitive, so that half of the state machine
//! follows `spacedriveapp-spacedrive`'s `heavy-lifting::job_system::runner`
//! instead, where a running job reacts to `Command::Pause`/`Resume`/`Cancel`
//! sent to its handle.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const PAUSED: u8 = 2;
const CANCELLED: u8 = 3;
const STOPPED: u8 = 4;

/// A unit of work submitted to a [`WorkerPool`].
///
/// `run` receives a handle so jobs that discover more work (the parallel
/// crawler's per-directory jobs submitting one child job per entry) can
/// recurse without going back through the pool owner.
pub trait Job: Send {
    fn id(&self) -> &str;
    fn run(self: Box<Self>, handle: &WorkerPoolHandle, cancel: &CancelToken);
}

/// Cooperative cancellation flag shared between a pool and its workers.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub jobs_queued: u64,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
}

struct PoolInner {
    sender: SyncSender<Box<dyn Job>>,
    receiver: Mutex<Receiver<Box<dyn Job>>>,
    state: AtomicU8,
    cancel: CancelToken,
    pending: AtomicI64,
    done_lock: Mutex<()>,
    done_cvar: Condvar,
    pause_lock: Mutex<()>,
    pause_cvar: Condvar,
    jobs_queued: AtomicU64,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
}

impl PoolInner {
    fn stats(&self) -> PoolStats {
        PoolStats {
            jobs_queued: self.jobs_queued.load(Ordering::Relaxed),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }

    fn job_finished(&self, failed: bool) {
        if failed {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        }
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.done_lock.lock().unwrap_or_else(|p| p.into_inner());
            self.done_cvar.notify_all();
        }
    }
}

/// Cloneable submission handle. The only way jobs themselves can enqueue
/// more work; also what external callers use to submit.
#[derive(Clone)]
pub struct WorkerPoolHandle {
    inner: Arc<PoolInner>,
}

impl WorkerPoolHandle {
    /// Submit a job. Non-blocking: if the queue is full and the pool has
    /// not been cancelled, the job runs synchronously on the calling
    /// thread instead of blocking until a slot frees up.
    pub fn submit(&self, job: Box<dyn Job>) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.jobs_queued.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        match self.inner.sender.try_send(job) {
            Ok(()) => {}
            Err(mpsc::TrySendError::Full(job)) => self.run_inline(job),
            Err(mpsc::TrySendError::Disconnected(_)) => {
                self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    fn run_inline(&self, job: Box<dyn Job>) {
        let cancel = self.inner.cancel.clone();
        let result = catch_unwind(AssertUnwindSafe(|| job.run(self, &cancel)));
        self.inner.job_finished(result.is_err());
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    let handle = WorkerPoolHandle { inner: Arc::clone(&inner) };
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }
        if inner.state.load(Ordering::SeqCst) == PAUSED {
            let guard = inner.pause_lock.lock().unwrap_or_else(|p| p.into_inner());
            let _guard = inner
                .pause_cvar
                .wait_timeout_while(guard, Duration::from_millis(200), |_| {
                    inner.state.load(Ordering::SeqCst) == PAUSED && !inner.cancel.is_cancelled()
                })
                .unwrap_or_else(|p| p.into_inner());
            continue;
        }

        let job = {
            let rx = inner.receiver.lock().unwrap_or_else(|p| p.into_inner());
            rx.recv_timeout(Duration::from_millis(200))
        };
        match job {
            Ok(job) => handle.run_inline(job),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Owner of a fixed pool of worker threads draining a bounded job queue.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    worker_count: usize,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize, queue_size: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel(queue_size.max(1));
        let inner = Arc::new(PoolInner {
            sender,
            receiver: Mutex::new(receiver),
            state: AtomicU8::new(IDLE),
            cancel: CancelToken::new(),
            pending: AtomicI64::new(0),
            done_lock: Mutex::new(()),
            done_cvar: Condvar::new(),
            pause_lock: Mutex::new(()),
            pause_cvar: Condvar::new(),
            jobs_queued: AtomicU64::new(0),
            jobs_processed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
        });
        Self {
            inner,
            worker_count: worker_count.max(1),
            workers: Vec::new(),
        }
    }

    /// Spawn the worker threads. Idle → Running.
    pub fn start(&mut self) {
        self.inner.state.store(RUNNING, Ordering::SeqCst);
        for i in 0..self.worker_count {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name(format!("worker-pool-{i}"))
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn worker pool thread");
            self.workers.push(handle);
        }
    }

    pub fn handle(&self) -> WorkerPoolHandle {
        WorkerPoolHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn submit(&self, job: Box<dyn Job>) {
        self.handle().submit(job);
    }

    /// Running → Paused. Paused workers park without draining the queue.
    pub fn pause(&self) {
        self.inner.state.store(PAUSED, Ordering::SeqCst);
    }

    /// Paused → Running.
    pub fn resume(&self) {
        self.inner.state.store(RUNNING, Ordering::SeqCst);
        let _guard = self.inner.pause_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.inner.pause_cvar.notify_all();
    }

    /// Running/Paused → Cancelled. Workers finish their current job then
    /// exit; anything still queued is dropped.
    pub fn cancel(&self) {
        self.inner.state.store(CANCELLED, Ordering::SeqCst);
        self.inner.cancel.cancel();
        let _guard = self.inner.pause_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.inner.pause_cvar.notify_all();
        let _guard = self.inner.done_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.inner.done_cvar.notify_all();
    }

    /// Block until the queue drains and all workers are idle, or until the
    /// pool is cancelled. Terminal: the pool is Stopped when this returns.
    pub fn wait(mut self) -> PoolStats {
        {
            let guard = self.inner.done_lock.lock().unwrap_or_else(|p| p.into_inner());
            let _guard = self
                .inner
                .done_cvar
                .wait_while(guard, |_| {
                    self.inner.pending.load(Ordering::SeqCst) > 0
                        && self.inner.state.load(Ordering::SeqCst) != CANCELLED
                })
                .unwrap_or_else(|p| p.into_inner());
        }
        self.stop()
    }

    fn stop(&mut self) -> PoolStats {
        self.inner.state.store(STOPPED, Ordering::SeqCst);
        self.inner.cancel.cancel();
        {
            let _guard = self.inner.pause_lock.lock().unwrap_or_else(|p| p.into_inner());
            self.inner.pause_cvar.notify_all();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.inner.stats()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.inner.state.load(Ordering::SeqCst) != STOPPED {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingJob {
        counter: Arc<AtomicUsize>,
    }

    impl Job for CountingJob {
        fn id(&self) -> &str {
            "counting"
        }
        fn run(self: Box<Self>, _handle: &WorkerPoolHandle, _cancel: &CancelToken) {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FanOutJob {
        remaining: usize,
        counter: Arc<AtomicUsize>,
    }

    impl Job for FanOutJob {
        fn id(&self) -> &str {
            "fanout"
        }
        fn run(self: Box<Self>, handle: &WorkerPoolHandle, _cancel: &CancelToken) {
            self.counter.fetch_add(1, Ordering::SeqCst);
            if self.remaining > 0 {
                handle.submit(Box::new(FanOutJob {
                    remaining: self.remaining - 1,
                    counter: Arc::clone(&self.counter),
                }));
            }
        }
    }

    #[test]
    fn processes_all_submitted_jobs() {
        let mut pool = WorkerPool::new(4, 16);
        pool.start();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            pool.submit(Box::new(CountingJob {
                counter: Arc::clone(&counter),
            }));
        }
        let stats = pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(stats.jobs_processed, 50);
        assert_eq!(stats.jobs_failed, 0);
    }

    #[test]
    fn recursive_submission_completes() {
        let mut pool = WorkerPool::new(2, 4);
        pool.start();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(Box::new(FanOutJob {
            remaining: 20,
            counter: Arc::clone(&counter),
        }));
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn queue_full_falls_back_to_synchronous_execution() {
        let mut pool = WorkerPool::new(1, 1);
        pool.start();
        pool.pause();
        let counter = Arc::new(AtomicUsize::new(0));
        // With the single worker paused and a queue depth of 1, further
        // submissions must still complete via the synchronous fallback
        // rather than blocking forever.
        for _ in 0..5 {
            pool.submit(Box::new(CountingJob {
                counter: Arc::clone(&counter),
            }));
        }
        pool.resume();
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn cancel_makes_wait_return_promptly() {
        let mut pool = WorkerPool::new(2, 4);
        pool.start();
        pool.cancel();
        let stats = pool.wait();
        assert!(stats.jobs_queued >= 0);
    }
}
