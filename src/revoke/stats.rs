//! Sweep Statistics
//!
//! Counters a cookie accumulates while it is used. Collection is
//! selected at build time by the `stats` feature; without it every
//! counter update compiles to nothing.
//!
//! Counters are monotone for the life of the cookie. Callers that want
//! per-epoch numbers take two snapshots and subtract.

use core::sync::atomic::{AtomicU64, Ordering};

/// Things the engine counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    /// Pages walked with write access.
    PagesScanned,
    /// Pages walked read-only.
    PagesScannedRo,
    /// Pages skipped by their hints.
    PagesSkipped,
    /// Pages that faulted during a walk.
    PagesFaulted,
    /// Tagged capabilities seen.
    CapsFound,
    /// Capabilities revoked in memory.
    CapsRevoked,
    /// Capabilities revoked in hoards.
    CapsHoardRevoked,
    /// Shadow bits newly set.
    BitsSet,
    /// Hoarder callbacks run.
    HoardersRun,
}

impl Counter {
    /// Number of counters.
    pub const COUNT: usize = 9;
}

/// Destination for counter updates.
pub trait StatsSink: Send + Sync {
    /// Add `n` to a counter.
    fn add(&self, counter: Counter, n: u64);

    /// Current values.
    fn snapshot(&self) -> StatsSnapshot;

    /// Add one to a counter.
    #[inline]
    fn bump(&self, counter: Counter) {
        self.add(counter, 1);
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    values: [u64; Counter::COUNT],
}

impl StatsSnapshot {
    /// Value of one counter.
    #[inline]
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize]
    }

    /// Per-counter difference from an earlier snapshot.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        let mut values = [0; Counter::COUNT];
        for (i, v) in values.iter_mut().enumerate() {
            *v = self.values[i].wrapping_sub(earlier.values[i]);
        }
        StatsSnapshot { values }
    }

    /// Capabilities revoked in memory and in hoards.
    pub fn total_revoked(&self) -> u64 {
        self.get(Counter::CapsRevoked) + self.get(Counter::CapsHoardRevoked)
    }
}

/// Atomic counters.
#[derive(Default)]
pub struct RevokeStats {
    values: [AtomicU64; Counter::COUNT],
}

impl RevokeStats {
    /// Create zeroed counters.
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            values: [ZERO; Counter::COUNT],
        }
    }
}

impl StatsSink for RevokeStats {
    #[inline]
    fn add(&self, counter: Counter, n: u64) {
        if n != 0 {
            self.values[counter as usize].fetch_add(n, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let mut values = [0; Counter::COUNT];
        for (v, a) in values.iter_mut().zip(self.values.iter()) {
            *v = a.load(Ordering::Relaxed);
        }
        StatsSnapshot { values }
    }
}

/// Counters that discard every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStats;

impl NullStats {
    /// Create the sink.
    pub const fn new() -> Self {
        Self
    }
}

impl StatsSink for NullStats {
    #[inline(always)]
    fn add(&self, _counter: Counter, _n: u64) {}

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot::default()
    }
}

/// Counters carried by a cookie in this build.
#[cfg(feature = "stats")]
pub type Stats = RevokeStats;

/// Counters carried by a cookie in this build.
#[cfg(not(feature = "stats"))]
pub type Stats = NullStats;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RevokeStats::new();
        stats.bump(Counter::CapsFound);
        stats.add(Counter::CapsFound, 3);
        stats.add(Counter::CapsRevoked, 2);
        let snap = stats.snapshot();
        assert_eq!(snap.get(Counter::CapsFound), 4);
        assert_eq!(snap.get(Counter::CapsRevoked), 2);
        assert_eq!(snap.get(Counter::BitsSet), 0);
    }

    #[test]
    fn test_since_gives_delta() {
        let stats = RevokeStats::new();
        stats.add(Counter::PagesScanned, 5);
        let before = stats.snapshot();
        stats.add(Counter::PagesScanned, 2);
        stats.add(Counter::CapsHoardRevoked, 1);
        let delta = stats.snapshot().since(&before);
        assert_eq!(delta.get(Counter::PagesScanned), 2);
        assert_eq!(delta.total_revoked(), 1);
    }

    #[test]
    fn test_null_stats_discard() {
        let stats = NullStats::new();
        stats.add(Counter::CapsRevoked, 10);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
