//! Crawl options, results, and the shared pieces both crawler variants
//! drive: estimate → walk → cleanup → aggregate → lifecycle → finalize.
//!
//! Phase sequencing grounded on `indexing/mod.rs::start_scan`; the walk
//! itself reshaped per variant (stack-based DFS for sequential, one
//! [`crate::workerpool::WorkerPool`] job per directory for parallel) since
//! `cmdr` drives both through a single `jwalk` call this spec's "explicit
//! stack" and "per-directory job" requirements replace.

pub mod parallel;
pub mod sequential;

use std::sync::Arc;
use std::time::Duration;

use crate::lifecycle::LifecycleTrigger;

pub use parallel::index_parallel;
pub use sequential::{index, index_with_options};

/// Default rows per transaction before `commit`/`begin` a new one.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Default freshness-gate window.
pub const DEFAULT_MAX_AGE_SECONDS: i64 = 3600;
/// Default parallel worker count (I/O-bound, so oversubscribed vs. cores).
pub const DEFAULT_WORKER_COUNT: usize = 8;
/// Default bounded job-queue depth for the parallel crawler.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;
/// Cadence at which progress is published/logged.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Options for [`sequential::index_with_options`].
pub struct CrawlOptions {
    pub force: bool,
    pub max_age_seconds: i64,
    pub batch_size: usize,
    pub lifecycle_trigger: Option<Arc<dyn LifecycleTrigger>>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            force: false,
            max_age_seconds: DEFAULT_MAX_AGE_SECONDS,
            batch_size: DEFAULT_BATCH_SIZE,
            lifecycle_trigger: None,
        }
    }
}

/// Options for [`parallel::index_parallel`].
pub struct ParallelCrawlOptions {
    pub worker_count: usize,
    pub queue_size: usize,
    pub batch_size: usize,
    pub lifecycle_trigger: Option<Arc<dyn LifecycleTrigger>>,
}

impl Default for ParallelCrawlOptions {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_size: DEFAULT_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            lifecycle_trigger: None,
        }
    }
}

/// A callback invoked at roughly [`PROGRESS_INTERVAL`] cadence with a
/// snapshot of [`Stats`] and the worker pool's remaining queue depth (0
/// for the sequential crawler, which has no queue). Must be cheap and
/// non-blocking: it runs on the crawler's own thread.
pub type ProgressCallback = Box<dyn Fn(&Stats, u64) + Send>;

/// Result of one crawl invocation.
#[derive(Debug, Clone)]
pub struct Stats {
    pub files_processed: u64,
    pub directories_processed: u64,
    pub total_size: i64,
    pub errors: u64,
    pub duration: Duration,
    pub start_time: i64,
    pub end_time: i64,
    pub skipped: bool,
    pub skip_reason: String,
}

impl Stats {
    pub(crate) fn skipped(start_time: i64, reason: impl Into<String>) -> Self {
        Self {
            files_processed: 0,
            directories_processed: 0,
            total_size: 0,
            errors: 0,
            duration: Duration::ZERO,
            start_time,
            end_time: start_time,
            skipped: true,
            skip_reason: reason.into(),
        }
    }
}

pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Split an absolute path into `(parent, is_filesystem_root)`. The
/// filesystem root has no parent.
pub(crate) fn split_parent(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(pos) => Some(trimmed[..pos].to_string()),
        None => None,
    }
}

pub(crate) fn join_child(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_parent_of_root_is_none() {
        assert_eq!(split_parent("/"), None);
    }

    #[test]
    fn split_parent_of_nested_path() {
        assert_eq!(split_parent("/tmp/t/sub"), Some("/tmp/t".to_string()));
    }

    #[test]
    fn join_child_avoids_double_slash_at_root() {
        assert_eq!(join_child("/", "etc"), "/etc");
        assert_eq!(join_child("/tmp", "t"), "/tmp/t");
    }
}
