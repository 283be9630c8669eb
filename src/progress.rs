//! In-memory progress snapshot for a running crawl.
//!
//! Grounded on `cmdr::indexing::writer`'s `JobProgressTracker`: a plain
//! struct updated in place by the crawler and read by whatever thread
//! is forwarding progress to the caller. This module only holds the
//! numbers; persisting them to `index_jobs` is `WriteQueue`'s job.
//!
//! The percent-complete formula is phase-weighted and deliberately
//! non-linear: crawling covers 5–85%, cleanup and aggregation are fixed
//! checkpoints at 87% and 95%, and 100% is reserved for completion. This
//! keeps the externally observed value monotonic even when the
//! estimate itself is wrong.

use std::time::Instant;

/// Which stage of a crawl is currently running, in the order a crawl
/// passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Estimating,
    Crawling,
    Cleanup,
    Aggregation,
    Complete,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Estimating => "estimating",
            Phase::Crawling => "crawling",
            Phase::Cleanup => "cleanup",
            Phase::Aggregation => "aggregation",
            Phase::Complete => "complete",
        }
    }
}

/// Mutable progress state for one crawl. Not `Sync`; callers share it
/// behind a `Mutex` (sequential crawler) or via periodic snapshots sent
/// over a channel (parallel crawler).
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    phase: Phase,
    estimated_total: u64,
    items_done: u64,
    errors: u64,
    started_at: Instant,
}

impl ProgressTracker {
    pub fn new(estimated_total: u64) -> Self {
        Self {
            phase: Phase::Estimating,
            estimated_total: estimated_total.max(1),
            items_done: 0,
            errors: 0,
            started_at: Instant::now(),
        }
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn record_item(&mut self) {
        self.items_done += 1;
    }

    pub fn record_items(&mut self, n: u64) {
        self.items_done += n;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn items_done(&self) -> u64 {
        self.items_done
    }

    /// Revise the denominator. The estimator keeps running in the
    /// background in `cmdr::indexing::micro_scan`'s design; this lets a
    /// caller feed in a refined figure without resetting progress already
    /// made.
    pub fn revise_estimate(&mut self, estimated_total: u64) {
        self.estimated_total = estimated_total.max(1);
    }

    /// Phase-weighted percent complete, per the table in crate docs:
    /// estimating=0, crawling=5..=85, cleanup=87, aggregation=95, complete=100.
    pub fn percent_complete(&self) -> u8 {
        match self.phase {
            Phase::Estimating => 0,
            Phase::Crawling => crawling_percent(self.items_done, self.estimated_total),
            Phase::Cleanup => 87,
            Phase::Aggregation => 95,
            Phase::Complete => 100,
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Linear extrapolation from elapsed time and the crawling-phase
    /// ratio. Returns `None` until at least one item has been processed.
    pub fn estimated_time_remaining(&self) -> Option<std::time::Duration> {
        if self.items_done == 0 {
            return None;
        }
        let elapsed = self.elapsed().as_secs_f64();
        let rate = self.items_done as f64 / elapsed.max(0.001);
        let remaining_items = (self.estimated_total.saturating_sub(self.items_done)) as f64;
        Some(std::time::Duration::from_secs_f64((remaining_items / rate).max(0.0)))
    }
}

/// The crawling-phase slice of [`ProgressTracker::percent_complete`], split
/// out so the parallel crawler's atomic-counter-based reporter (which has
/// no `ProgressTracker` of its own) can share the exact same formula.
pub(crate) fn crawling_percent(items_done: u64, estimated_total: u64) -> u8 {
    let ratio = items_done as f64 / estimated_total.max(1) as f64;
    let raw = 5.0 + (80.0 * ratio.min(1.0)).floor();
    raw.clamp(5.0, 85.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_complete_is_zero_while_estimating() {
        let p = ProgressTracker::new(100);
        assert_eq!(p.percent_complete(), 0);
    }

    #[test]
    fn percent_complete_scales_during_crawling() {
        let mut p = ProgressTracker::new(200);
        p.set_phase(Phase::Crawling);
        p.record_items(100);
        assert_eq!(p.percent_complete(), 45); // 5 + floor(80 * 0.5)
    }

    #[test]
    fn percent_complete_never_exceeds_85_while_crawling() {
        let mut p = ProgressTracker::new(10);
        p.set_phase(Phase::Crawling);
        p.record_items(10_000); // far beyond the estimate
        assert_eq!(p.percent_complete(), 85);
    }

    #[test]
    fn percent_complete_checkpoints_for_cleanup_and_aggregation() {
        let mut p = ProgressTracker::new(10);
        p.set_phase(Phase::Cleanup);
        assert_eq!(p.percent_complete(), 87);
        p.set_phase(Phase::Aggregation);
        assert_eq!(p.percent_complete(), 95);
    }

    #[test]
    fn percent_complete_is_100_only_when_complete() {
        let mut p = ProgressTracker::new(10);
        p.set_phase(Phase::Aggregation);
        assert_eq!(p.percent_complete(), 95);
        p.set_phase(Phase::Complete);
        assert_eq!(p.percent_complete(), 100);
    }

    #[test]
    fn estimated_time_remaining_is_none_before_any_progress() {
        let p = ProgressTracker::new(100);
        assert!(p.estimated_time_remaining().is_none());
    }

    #[test]
    fn revise_estimate_does_not_reset_items_done() {
        let mut p = ProgressTracker::new(10);
        p.record_items(5);
        p.revise_estimate(50);
        assert_eq!(p.items_done(), 5);
    }
}
