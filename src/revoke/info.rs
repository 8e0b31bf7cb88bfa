//! Shared Revocation Info Page
//!
//! The page user space reads to learn how far revocation has progressed.
//!
//! # Protocol
//! - `epoch_init` counts epochs begun. An allocator records it when it
//!   quarantines memory
//! - `generation` counts epochs published. Memory quarantined at stamp
//!   `s` is safe to reuse once `generation > s`
//! - The summary fields describe the last published epoch. They are
//!   guarded by a sequence counter so readers never see a summary from
//!   one epoch paired with the generation of another
//!
//! The generation is stored with release ordering after every memory
//! write of the epoch. A reader that acquires a generation value sees all
//! revocations that value promises.

use core::hint::spin_loop;
use core::sync::atomic::{fence, AtomicU64, Ordering};

/// Summary of one published epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochInfo {
    /// Epochs begun.
    pub epoch_init: u64,
    /// Epochs published.
    pub generation: u64,
    /// Pages scanned in the last published epoch.
    pub pages_scanned: u64,
    /// Capabilities revoked in the last published epoch.
    pub caps_revoked: u64,
    /// Shadow bits set in the last published epoch.
    pub bits_set: u64,
    /// Coarse flags that were in force at some point in the epoch.
    pub excluded: u8,
}

/// The info page shared with user space.
pub struct InfoPage {
    seq: AtomicU64,
    epoch_init: AtomicU64,
    generation: AtomicU64,
    pages_scanned: AtomicU64,
    caps_revoked: AtomicU64,
    bits_set: AtomicU64,
    excluded: AtomicU64,
}

impl InfoPage {
    /// A fresh page: nothing begun, nothing published.
    pub const fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            epoch_init: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            pages_scanned: AtomicU64::new(0),
            caps_revoked: AtomicU64::new(0),
            bits_set: AtomicU64::new(0),
            excluded: AtomicU64::new(0),
        }
    }

    /// Record that an epoch has begun. Returns the new begun count.
    pub fn begin_epoch(&self) -> u64 {
        self.epoch_init.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Stamp for memory quarantined now.
    ///
    /// Memory quarantined while an epoch is open may already have been
    /// passed by the sweep, so the stamp names the open epoch.
    #[inline]
    pub fn epoch_stamp(&self) -> u64 {
        self.epoch_init.load(Ordering::Acquire)
    }

    /// Epochs published so far.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Check if memory stamped `stamp` may be reused.
    #[inline]
    pub fn is_safe(&self, stamp: u64) -> bool {
        self.generation() > stamp
    }

    /// Publish a finished epoch.
    ///
    /// The generation only moves forward. A `generation` below the current
    /// value is ignored along with its summary.
    pub fn publish(&self, generation: u64, summary: &EpochInfo) {
        let seq = self.write_begin();
        // Writers are serialised by the sequence lock.
        if generation >= self.generation.load(Ordering::Relaxed) {
            self.pages_scanned.store(summary.pages_scanned, Ordering::Relaxed);
            self.caps_revoked.store(summary.caps_revoked, Ordering::Relaxed);
            self.bits_set.store(summary.bits_set, Ordering::Relaxed);
            self.excluded.store(summary.excluded as u64, Ordering::Relaxed);
            self.generation.store(generation, Ordering::Release);
        }
        self.seq.store(seq + 2, Ordering::Release);
    }

    /// Take the writer side of the sequence lock. Returns the even value
    /// it was taken at.
    fn write_begin(&self) -> u64 {
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if seq & 1 == 0
                && self
                    .seq
                    .compare_exchange_weak(seq, seq + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                fence(Ordering::Release);
                return seq;
            }
            spin_loop();
        }
    }

    /// Read a consistent snapshot.
    pub fn read(&self) -> EpochInfo {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 != 0 {
                spin_loop();
                continue;
            }
            let info = EpochInfo {
                epoch_init: self.epoch_init.load(Ordering::Acquire),
                generation: self.generation.load(Ordering::Acquire),
                pages_scanned: self.pages_scanned.load(Ordering::Relaxed),
                caps_revoked: self.caps_revoked.load(Ordering::Relaxed),
                bits_set: self.bits_set.load(Ordering::Relaxed),
                excluded: self.excluded.load(Ordering::Relaxed) as u8,
            };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return info;
            }
        }
    }
}

impl Default for InfoPage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_and_safety() {
        let page = InfoPage::new();
        let stamp = page.epoch_stamp();
        assert_eq!(stamp, 0);
        assert!(!page.is_safe(stamp));

        assert_eq!(page.begin_epoch(), 1);
        // Quarantined mid-epoch: the open epoch does not make it safe.
        let mid = page.epoch_stamp();
        page.publish(1, &EpochInfo::default());
        assert!(page.is_safe(stamp));
        assert!(!page.is_safe(mid));

        page.begin_epoch();
        page.publish(2, &EpochInfo::default());
        assert!(page.is_safe(mid));
    }

    #[test]
    fn test_publish_is_monotonic() {
        let page = InfoPage::new();
        page.publish(3, &EpochInfo::default());
        page.publish(2, &EpochInfo::default());
        assert_eq!(page.generation(), 3);
    }

    #[test]
    fn test_stale_publish_keeps_summary() {
        let page = InfoPage::new();
        let current = EpochInfo {
            pages_scanned: 12,
            caps_revoked: 5,
            bits_set: 5,
            excluded: 0,
            ..EpochInfo::default()
        };
        page.publish(3, &current);
        let stale = EpochInfo {
            pages_scanned: 99,
            caps_revoked: 40,
            bits_set: 40,
            excluded: 1,
            ..EpochInfo::default()
        };
        page.publish(1, &stale);

        let info = page.read();
        assert_eq!(info.generation, 3);
        assert_eq!(info.pages_scanned, 12);
        assert_eq!(info.caps_revoked, 5);
        assert_eq!(info.bits_set, 5);
        assert_eq!(info.excluded, 0);
    }

    #[test]
    fn test_read_sees_summary() {
        let page = InfoPage::new();
        page.begin_epoch();
        let summary = EpochInfo {
            pages_scanned: 4,
            caps_revoked: 7,
            bits_set: 7,
            excluded: 1,
            ..EpochInfo::default()
        };
        page.publish(1, &summary);
        let info = page.read();
        assert_eq!(info.epoch_init, 1);
        assert_eq!(info.generation, 1);
        assert_eq!(info.caps_revoked, 7);
        assert_eq!(info.excluded, 1);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_pairs() {
        let page = InfoPage::new();
        std::thread::scope(|s| {
            s.spawn(|| {
                for g in 1..=200u64 {
                    page.publish(
                        g,
                        &EpochInfo {
                            caps_revoked: g,
                            bits_set: g,
                            ..EpochInfo::default()
                        },
                    );
                }
            });
            s.spawn(|| {
                for _ in 0..200 {
                    let info = page.read();
                    assert_eq!(info.caps_revoked, info.generation);
                    assert_eq!(info.bits_set, info.generation);
                }
            });
        });
    }
}
