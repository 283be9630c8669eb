//! Filesystem-backed [`Source`].
//!
//! `stat` uses `std::fs::symlink_metadata` (never dereferences a
//! symlink), matching the lstat discipline `cmdr::indexing::scanner`
//! applies before computing physical size. This crate reports the
//! stat'd logical size rather than `st_blocks * 512`: the spec this
//! source implements defines `size` as "the stat'd size at scan time",
//! and physical-size accounting is a `cmdr`-specific product choice this
//! crate does not carry over (see `DESIGN.md`).

use std::path::Path;
use std::time::Instant;

use super::{DirEntry, ItemInfo, Source, SourceError};

/// Wall-clock budget for [`FilesystemSource::estimate_size`] before it
/// aborts and returns whatever it has accumulated.
const DEFAULT_ESTIMATE_BUDGET_SECS: u64 = 5;

/// Depth below which every subdirectory is read during estimation.
const FULL_SAMPLE_DEPTH: usize = 3;
/// Depth at and beyond which only 5% of subdirectories are sampled.
const SPARSE_SAMPLE_DEPTH: usize = 6;

/// A [`Source`] backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemSource {
    estimate_budget_secs: u64,
}

impl FilesystemSource {
    pub fn new() -> Self {
        Self {
            estimate_budget_secs: DEFAULT_ESTIMATE_BUDGET_SECS,
        }
    }

    /// Construct with a non-default estimation wall-clock budget (for tests).
    pub fn with_estimate_budget_secs(secs: u64) -> Self {
        Self {
            estimate_budget_secs: secs,
        }
    }
}

impl Source for FilesystemSource {
    fn stat(&self, path: &Path) -> Result<ItemInfo, SourceError> {
        let meta = std::fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            return Err(SourceError::SkipSymlink);
        }
        let mtime = mtime_secs(&meta);
        Ok(ItemInfo {
            path: path.to_string_lossy().to_string(),
            size: meta.len(),
            is_dir: meta.is_dir(),
            mtime,
            mode: file_mode(&meta),
        })
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, SourceError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            // Symlinked children are surfaced so the crawler's own `stat`
            // call drops them with SkipSymlink and counts them as such,
            // rather than silently vanishing from read_dir's results.
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: file_type.is_dir() && !file_type.is_symlink(),
            });
        }
        Ok(out)
    }

    fn estimate_size(&self, root: &Path) -> u64 {
        let start = Instant::now();
        let budget = std::time::Duration::from_secs(self.estimate_budget_secs);
        let estimate = estimate_recursive(root, 0, start, budget);
        if estimate == 0 { 1000 } else { estimate }
    }
}

/// Depth-adaptive sampling estimate. Returns the accumulated item count;
/// aborts early (returning whatever has accumulated) once `start.elapsed()`
/// exceeds `budget`.
fn estimate_recursive(dir: &Path, depth: usize, start: Instant, budget: std::time::Duration) -> u64 {
    if start.elapsed() > budget {
        return 0;
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(Result::ok).collect::<Vec<_>>(),
        Err(_) => return 0,
    };

    let mut estimate = entries.len() as u64;

    let subdirs: Vec<_> = entries
        .iter()
        .filter(|e| e.file_type().map(|t| t.is_dir() && !t.is_symlink()).unwrap_or(false))
        .collect();

    if subdirs.is_empty() {
        return estimate;
    }

    let sample_rate = if depth < FULL_SAMPLE_DEPTH {
        1.0
    } else if depth > SPARSE_SAMPLE_DEPTH {
        0.05
    } else {
        0.2
    };

    let sample_count = ((subdirs.len() as f64 * sample_rate).round() as usize).max(1);
    let sample_count = sample_count.min(subdirs.len());

    // Deterministic sampling by index position: every `stride`-th entry.
    let stride = (subdirs.len() / sample_count).max(1);

    let mut sampled = 0usize;
    let mut sampled_total = 0u64;
    for (i, entry) in subdirs.iter().enumerate() {
        if start.elapsed() > budget {
            break;
        }
        if i % stride != 0 {
            continue;
        }
        if sampled >= sample_count {
            break;
        }
        let child_estimate = estimate_recursive(&entry.path(), depth + 1, start, budget);
        sampled_total += child_estimate;
        sampled += 1;
        estimate += child_estimate;
    }

    if sampled > 0 && sampled < subdirs.len() {
        let unsampled = subdirs.len() - sampled;
        let avg = sampled_total / sampled as u64;
        estimate += avg * unsampled as u64;
    }

    estimate
}

#[cfg(unix)]
fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime()
}

#[cfg(not(unix))]
fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn stat_reports_file_size_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello world").unwrap();

        let src = FilesystemSource::new();
        let info = src.stat(&file).unwrap();
        assert_eq!(info.size, 11);
        assert!(!info.is_dir);
    }

    #[test]
    fn stat_reports_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();

        let src = FilesystemSource::new();
        let info = src.stat(&sub).unwrap();
        assert!(info.is_dir);
    }

    #[test]
    #[cfg(unix)]
    fn stat_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real.txt");
        fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let src = FilesystemSource::new();
        let result = src.stat(&link);
        assert!(matches!(result, Err(SourceError::SkipSymlink)));
    }

    #[test]
    fn stat_not_found() {
        let src = FilesystemSource::new();
        let result = src.stat(Path::new("/definitely/does/not/exist/xyz"));
        assert!(matches!(result, Err(SourceError::NotFound)));
    }

    #[test]
    fn read_dir_lists_children() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"1").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let src = FilesystemSource::new();
        let children = src.read_dir(dir.path()).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().any(|c| c.name == "a.txt" && !c.is_dir));
        assert!(children.iter().any(|c| c.name == "sub" && c.is_dir));
    }

    #[test]
    fn estimate_size_empty_dir_is_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let src = FilesystemSource::new();
        assert_eq!(src.estimate_size(dir.path()), 1000);
    }

    #[test]
    fn estimate_size_counts_entries() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("f{i}.txt")), b"x").unwrap();
        }
        let src = FilesystemSource::new();
        assert_eq!(src.estimate_size(dir.path()), 5);
    }

    #[test]
    fn estimate_size_is_deterministic_on_unchanged_tree() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            let sub = dir.path().join(format!("sub{i}"));
            fs::create_dir(&sub).unwrap();
            fs::write(sub.join("f.txt"), b"x").unwrap();
        }
        let src = FilesystemSource::new();
        let a = src.estimate_size(dir.path());
        let b = src.estimate_size(dir.path());
        assert_eq!(a, b);
    }

    #[test]
    fn estimate_size_respects_budget() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), b"x").unwrap();
        let src = FilesystemSource::with_estimate_budget_secs(0);
        // Even with a zero budget the call must return a positive estimate.
        assert!(src.estimate_size(dir.path()) > 0);
    }
}
