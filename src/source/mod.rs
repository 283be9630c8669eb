//! Abstract directory-tree reader.
//!
//! The crawler never touches `std::fs` directly; it goes through a
//! [`Source`] so that tests can substitute a fake tree and so the
//! filesystem-specific symlink/estimate logic lives in one place. Grounded
//! on `cmdr::indexing::scanner`'s `stat`/`read_dir`-shaped helpers, but
//! exposed here as an explicit trait rather than free functions since this
//! crate's crawler is generic over the source.

pub mod filesystem;

use std::path::Path;

pub use crate::error::SourceError;
pub use filesystem::FilesystemSource;

/// Metadata for one path, as returned by [`Source::stat`].
#[derive(Debug, Clone)]
pub struct ItemInfo {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub mtime: i64,
    pub mode: u32,
}

/// One child of a directory, as returned by [`Source::read_dir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Abstract tree reader: `stat`, `read_dir`, `estimate_size`, `close`.
///
/// Implementations MUST NOT follow symlinks: `stat` fails with
/// [`SourceError::SkipSymlink`] for any symlink, and `read_dir` never
/// reports a symlinked subdirectory as traversable.
///
/// `Send + Sync` so the parallel crawler can share one source across its
/// worker pool behind an `Arc`.
pub trait Source: Send + Sync {
    /// Lstat-equivalent: never dereferences symlinks.
    fn stat(&self, path: &Path) -> Result<ItemInfo, SourceError>;

    /// List the direct children of a directory. Ordering is unspecified.
    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, SourceError>;

    /// Estimate the number of items under `root`, for progress pacing only.
    /// Never zero (callers use this as a denominator).
    fn estimate_size(&self, root: &Path) -> u64;

    /// Release any external handles. Idempotent.
    fn close(&mut self) {}
}
