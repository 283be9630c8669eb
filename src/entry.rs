//! Data model: [`Entry`], [`IndexJob`], [`PathScanInfo`], and the run-id alias.
//!
//! Mirrors the shape of `cmdr::indexing::store::ScannedEntry` /
//! `IndexStatus`, generalized from `cmdr`'s `dir_stats`-only model to the
//! entry-with-aggregated-size model this crate's store contract requires.

use std::collections::HashMap;

/// Monotonically increasing identifier for one crawl. Seconds-since-epoch
/// of the crawl's start; stamped onto every entry the crawl touches and
/// used as the staleness key by `get_stale_entries`/`delete_stale`.
pub type RunId = i64;

/// Whether an [`Entry`] is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn is_directory(self) -> bool {
        matches!(self, EntryKind::Directory)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }

    pub fn from_str(s: &str) -> Self {
        if s == "directory" {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }
}

/// One row of the index: a single filesystem object.
///
/// `path` is the primary key: canonical, absolute, no trailing slash
/// except for the filesystem root. `parent` is absent only for the root
/// of a scan.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Entry {
    pub path: String,
    pub parent: Option<String>,
    /// Stat'd size for files; post-aggregation sum of descendants for directories.
    pub size: i64,
    pub kind: EntryKind,
    pub ctime: i64,
    pub mtime: i64,
    /// `run_id` of the crawl that most recently saw this entry.
    pub last_scanned: RunId,
}

impl Entry {
    pub fn is_directory(&self) -> bool {
        self.kind.is_directory()
    }
}

/// Lifecycle status of an [`IndexJob`]. Terminal states are never
/// reanimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Pending,
        }
    }
}

/// Free-form metadata attached to an [`IndexJob`]: files/directories
/// processed, total size, error count, worker count, etc.
pub type JobMetadata = HashMap<String, serde_json::Value>;

/// A persistent record of one indexing invocation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IndexJob {
    pub id: i64,
    pub root_path: String,
    pub status: JobStatus,
    /// Percent complete, `0..=100`.
    pub progress: u8,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
    pub metadata: JobMetadata,
}

/// Derived answer to "has this root been scanned recently, and did it
/// produce anything?" — the freshness-gate input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathScanInfo {
    pub exists: bool,
    pub last_scanned: Option<i64>,
    pub entry_count: u64,
}
