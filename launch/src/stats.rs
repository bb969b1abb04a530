//! Dispatch statistics
//!
//! Counters shared between a [`Launcher`](crate::Launcher) and the rank
//! tasks it submits. Rank tasks update them from their worker threads, so
//! every counter is a relaxed atomic and [`DispatchStats::snapshot`] is only
//! consistent once no dispatch is in flight.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::info;

/// Where rank 0 started, relative to the coordinator node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankZeroPlacement {
    /// On the coordinator, submitted with node affinity
    Pinned,
    /// On the coordinator, placed by the bias window
    Biased,
    /// Anywhere else
    Misplaced,
}

/// Live counters for one launcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatches: AtomicU64,
    last_world_size: AtomicUsize,
    ranks_completed: AtomicU64,
    ranks_failed: AtomicU64,
    ranks_running: AtomicU64,
    rank_time_ms: AtomicU64,
    rank_zero_pinned: AtomicU64,
    rank_zero_biased: AtomicU64,
    rank_zero_misplaced: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub dispatches: u64,
    /// World size of the most recent dispatch
    pub last_world_size: usize,
    pub ranks_completed: u64,
    pub ranks_failed: u64,
    pub ranks_running: u64,
    /// Wall time spent inside rank functions, summed over ranks
    pub rank_time_ms: u64,
    pub rank_zero_pinned: u64,
    pub rank_zero_biased: u64,
    pub rank_zero_misplaced: u64,
}

impl StatsSnapshot {
    /// Rank invocations that finished, either way.
    pub fn ranks_finished(&self) -> u64 {
        self.ranks_completed + self.ranks_failed
    }

    /// Fraction of finished ranks that succeeded, `None` before any finished.
    pub fn success_rate(&self) -> Option<f64> {
        match self.ranks_finished() {
            0 => None,
            n => Some(self.ranks_completed as f64 / n as f64),
        }
    }

    pub fn mean_rank_time_ms(&self) -> Option<f64> {
        match self.ranks_finished() {
            0 => None,
            n => Some(self.rank_time_ms as f64 / n as f64),
        }
    }
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_dispatch(&self, world_size: usize) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        self.last_world_size.store(world_size, Ordering::Relaxed);
    }

    pub(crate) fn record_rank_zero(&self, placement: RankZeroPlacement) {
        let counter = match placement {
            RankZeroPlacement::Pinned => &self.rank_zero_pinned,
            RankZeroPlacement::Biased => &self.rank_zero_biased,
            RankZeroPlacement::Misplaced => &self.rank_zero_misplaced,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark one rank function as running until the returned timer resolves.
    pub(crate) fn begin_rank(&self) -> RankTimer<'_> {
        self.ranks_running.fetch_add(1, Ordering::Relaxed);
        RankTimer {
            stats: self,
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            last_world_size: self.last_world_size.load(Ordering::Relaxed),
            ranks_completed: self.ranks_completed.load(Ordering::Relaxed),
            ranks_failed: self.ranks_failed.load(Ordering::Relaxed),
            ranks_running: self.ranks_running.load(Ordering::Relaxed),
            rank_time_ms: self.rank_time_ms.load(Ordering::Relaxed),
            rank_zero_pinned: self.rank_zero_pinned.load(Ordering::Relaxed),
            rank_zero_biased: self.rank_zero_biased.load(Ordering::Relaxed),
            rank_zero_misplaced: self.rank_zero_misplaced.load(Ordering::Relaxed),
        }
    }

    /// Log the current counters at info level.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            dispatches = s.dispatches,
            last_world_size = s.last_world_size,
            completed = s.ranks_completed,
            failed = s.ranks_failed,
            running = s.ranks_running,
            mean_rank_time_ms = ?s.mean_rank_time_ms(),
            rank_zero_pinned = s.rank_zero_pinned,
            rank_zero_biased = s.rank_zero_biased,
            rank_zero_misplaced = s.rank_zero_misplaced,
            "Dispatch statistics"
        );
    }
}

/// A running rank function. Dropping it without a verdict counts as a failure.
pub(crate) struct RankTimer<'a> {
    stats: &'a DispatchStats,
    started: Instant,
}

impl RankTimer<'_> {
    /// Record the outcome and return the elapsed milliseconds.
    pub(crate) fn finish(self, succeeded: bool) -> u64 {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let counter = if succeeded {
            &self.stats.ranks_completed
        } else {
            &self.stats.ranks_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.stats.rank_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.stats.ranks_running.fetch_sub(1, Ordering::Relaxed);
        std::mem::forget(self);
        elapsed_ms
    }
}

impl Drop for RankTimer<'_> {
    fn drop(&mut self) {
        self.stats.ranks_failed.fetch_add(1, Ordering::Relaxed);
        self.stats.ranks_running.fetch_sub(1, Ordering::Relaxed);
    }
}
