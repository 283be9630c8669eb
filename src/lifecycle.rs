//! Hook by which the crawler notifies external plan logic of added,
//! removed, and refreshed files.
//!
//! `cmdr`'s indexing module has no equivalent — classifier dispatch lives
//! entirely outside it — so this trait is authored fresh, in the
//! `Arc<dyn Trait + Send + Sync>` idiom the wider example pack uses for
//! similar hook points (`ferrex-core`'s classifier hooks).

use crate::entry::Entry;

/// Notified after a crawl's aggregation pass with the file-kind entries
/// it added, removed, or refreshed. Directories are never passed: they
/// are uninteresting to classifiers.
pub trait LifecycleTrigger: Send + Sync {
    /// Files newly present in the store as of this run.
    fn on_add(&self, entries: &[Entry]);
    /// Files removed by this run's stale-entry sweep.
    fn on_remove(&self, entries: &[Entry]);
    /// Files that already existed and were re-scanned this run.
    fn on_refresh(&self, entries: &[Entry]);
}

/// A trigger that does nothing. The default when no lifecycle plan is
/// configured.
pub struct NoopLifecycleTrigger;

impl LifecycleTrigger for NoopLifecycleTrigger {
    fn on_add(&self, _entries: &[Entry]) {}
    fn on_remove(&self, _entries: &[Entry]) {}
    fn on_refresh(&self, _entries: &[Entry]) {}
}
