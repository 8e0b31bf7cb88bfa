//! Shadow Bitmaps
//!
//! Side tables with one bit per capability granule of a swept map.
//!
//! # Design
//! - `ShadowBitmap` records granules confirmed revoked in the current
//!   epoch. Each 64-bit word holds 32 flag bits and a 32-bit epoch
//!   stamp; a word whose stamp is not current reads as all-clear, so
//!   starting an epoch is a single counter bump instead of a wipe
//! - `PaintBitmap` records granules the allocator has freed and wants
//!   revoked. It is plain and persists across epochs
//! - A shadow address is `window + addr / 128`: pure arithmetic, no
//!   lookup tables
//!
//! # Concurrency
//! Bits are set with compare-and-swap and are idempotent. Setting a bit
//! that is already set is a no-op.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::address::{VirtAddr, CAP_SHIFT, SHADOW_BASE, SHADOW_WINDOW};
use crate::cap::{Capability, Perms};
use crate::revoke::error::{ResourceFault, RevokeError};

/// Flag bits per stamped shadow word.
const FLAG_BITS: usize = 32;

/// Granules covered by one shadow byte.
const GRANULES_PER_BYTE_SHIFT: usize = CAP_SHIFT + 3;

#[inline]
const fn stamp_of(word: u64) -> u32 {
    (word >> FLAG_BITS) as u32
}

/// Epoch-stamped bitmap of revoked granules.
pub struct ShadowBitmap {
    /// Stamp in the high half, flags in the low half.
    words: Box<[AtomicU64]>,
    /// Current epoch stamp. Zero is never current.
    stamp: AtomicU32,
    /// Number of granules tracked.
    granules: usize,
}

impl ShadowBitmap {
    /// Create a bitmap covering `granules` granules, all clear.
    pub fn new(granules: usize) -> Self {
        let words: Vec<AtomicU64> = (0..granules.div_ceil(FLAG_BITS))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            words: words.into_boxed_slice(),
            stamp: AtomicU32::new(1),
            granules,
        }
    }

    /// Number of granules tracked.
    #[inline]
    pub fn granules(&self) -> usize {
        self.granules
    }

    /// The stamp that marks words written in the current epoch.
    #[inline]
    pub fn epoch_stamp(&self) -> u32 {
        self.stamp.load(Ordering::Acquire)
    }

    /// Start a new epoch: every bit reads as clear afterwards.
    ///
    /// Only the stamp moves. The words are wiped once every 2^32 epochs
    /// when the stamp wraps.
    pub fn advance(&self) {
        let next = self.stamp.load(Ordering::Acquire).wrapping_add(1);
        if next == 0 {
            for word in self.words.iter() {
                word.store(0, Ordering::Relaxed);
            }
            self.stamp.store(1, Ordering::Release);
        } else {
            self.stamp.store(next, Ordering::Release);
        }
    }

    #[inline]
    fn locate(&self, granule: usize) -> Option<(&AtomicU64, u64)> {
        if granule >= self.granules {
            return None;
        }
        let word = &self.words[granule / FLAG_BITS];
        Some((word, 1u64 << (granule % FLAG_BITS)))
    }

    /// Check if a granule is marked in the current epoch.
    #[inline]
    pub fn test(&self, granule: usize) -> bool {
        let Some((word, bit)) = self.locate(granule) else {
            return false;
        };
        let value = word.load(Ordering::Acquire);
        stamp_of(value) == self.epoch_stamp() && value & bit != 0
    }

    /// Mark a granule in the current epoch.
    ///
    /// Returns true if this call set the bit, false if it was already set
    /// or the granule is out of range.
    pub fn set(&self, granule: usize) -> bool {
        let Some((word, bit)) = self.locate(granule) else {
            return false;
        };
        let stamp = self.epoch_stamp();
        let fresh = (stamp as u64) << FLAG_BITS;
        let mut old = word.load(Ordering::Relaxed);
        loop {
            let current = if stamp_of(old) == stamp { old } else { fresh };
            if current & bit != 0 {
                return false;
            }
            match word.compare_exchange_weak(old, current | bit, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    /// Count granules marked in the current epoch.
    pub fn count(&self) -> usize {
        let stamp = self.epoch_stamp();
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire))
            .filter(|&w| stamp_of(w) == stamp)
            .map(|w| (w as u32).count_ones() as usize)
            .sum()
    }
}

/// Plain bitmap of granules painted as freed by the allocator.
pub struct PaintBitmap {
    words: Box<[AtomicU64]>,
    granules: usize,
}

impl PaintBitmap {
    /// Create a bitmap covering `granules` granules, all clear.
    pub fn new(granules: usize) -> Self {
        let words: Vec<AtomicU64> = (0..granules.div_ceil(64))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            words: words.into_boxed_slice(),
            granules,
        }
    }

    /// Check if a granule is painted.
    #[inline]
    pub fn test(&self, granule: usize) -> bool {
        if granule >= self.granules {
            return false;
        }
        self.words[granule / 64].load(Ordering::Acquire) & (1 << (granule % 64)) != 0
    }

    /// Paint one granule. Returns true if it was clear before.
    #[inline]
    pub fn set(&self, granule: usize) -> bool {
        if granule >= self.granules {
            return false;
        }
        let bit = 1u64 << (granule % 64);
        self.words[granule / 64].fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Apply `op` to every word overlapping `[first, first + count)`.
    fn for_range(&self, first: usize, count: usize, op: impl Fn(&AtomicU64, u64)) {
        let end = first.saturating_add(count).min(self.granules);
        let mut granule = first;
        while granule < end {
            let offset = granule % 64;
            let run = (64 - offset).min(end - granule);
            let mask = if run == 64 {
                u64::MAX
            } else {
                ((1u64 << run) - 1) << offset
            };
            op(&self.words[granule / 64], mask);
            granule += run;
        }
    }

    /// Paint a run of granules.
    pub fn paint(&self, first: usize, count: usize) {
        self.for_range(first, count, |word, mask| {
            word.fetch_or(mask, Ordering::AcqRel);
        });
    }

    /// Clear a run of granules.
    pub fn unpaint(&self, first: usize, count: usize) {
        self.for_range(first, count, |word, mask| {
            word.fetch_and(!mask, Ordering::AcqRel);
        });
    }
}

/// Which shadow window a capability or view refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShadowSelector {
    /// Granules revoked in the current epoch.
    Revoked,
    /// Granules painted as freed.
    Painted,
}

impl ShadowSelector {
    /// Base address of this selector's window.
    #[inline]
    pub const fn window(self) -> usize {
        match self {
            Self::Revoked => SHADOW_BASE,
            Self::Painted => SHADOW_BASE + SHADOW_WINDOW,
        }
    }

    /// Shadow byte holding the bit for `addr`.
    #[inline]
    pub const fn shadow_addr(self, addr: VirtAddr) -> usize {
        self.window() + (addr.as_usize() >> GRANULES_PER_BYTE_SHIFT)
    }
}

/// The shadow installed into one map.
pub struct ShadowRegion {
    /// First address of the covered user range.
    base: VirtAddr,
    /// Revoked-in-this-epoch bits.
    revoked: ShadowBitmap,
    /// Painted-as-freed bits.
    painted: PaintBitmap,
}

impl ShadowRegion {
    /// Create a shadow for `[base, base + size)`.
    pub fn new(base: VirtAddr, size: usize) -> Self {
        let granules = size >> CAP_SHIFT;
        Self {
            base,
            revoked: ShadowBitmap::new(granules),
            painted: PaintBitmap::new(granules),
        }
    }

    /// First address covered.
    #[inline]
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Number of granules covered.
    #[inline]
    pub fn granules(&self) -> usize {
        self.revoked.granules()
    }

    /// Granule index of `addr`, if covered.
    #[inline]
    pub fn granule_of(&self, addr: VirtAddr) -> Option<usize> {
        let offset = addr.as_usize().checked_sub(self.base.as_usize())?;
        let granule = offset >> CAP_SHIFT;
        (granule < self.granules()).then_some(granule)
    }

    /// Shadow bytes `(start, len)` backing this region in a window.
    pub fn extent(&self, sel: ShadowSelector) -> (usize, usize) {
        let start = sel.shadow_addr(self.base);
        let end_addr = self.base.add(self.granules() << CAP_SHIFT);
        let end = sel.window() + end_addr.as_usize().div_ceil(1 << GRANULES_PER_BYTE_SHIFT);
        (start, end - start)
    }

    /// The revoked-granule bitmap.
    #[inline]
    pub fn revoked(&self) -> &ShadowBitmap {
        &self.revoked
    }

    /// The painted-granule bitmap.
    #[inline]
    pub fn painted(&self) -> &PaintBitmap {
        &self.painted
    }

    /// Paint `[addr, addr + len)` as freed. Partial granules are included.
    pub fn paint(&self, addr: VirtAddr, len: usize) {
        if let Some((first, count)) = self.granule_span(addr, len) {
            self.painted.paint(first, count);
        }
    }

    /// Clear paint over `[addr, addr + len)`.
    pub fn unpaint(&self, addr: VirtAddr, len: usize) {
        if let Some((first, count)) = self.granule_span(addr, len) {
            self.painted.unpaint(first, count);
        }
    }

    /// Check if `addr` is painted.
    #[inline]
    pub fn is_painted(&self, addr: VirtAddr) -> bool {
        self.granule_of(addr).is_some_and(|g| self.painted.test(g))
    }

    fn granule_span(&self, addr: VirtAddr, len: usize) -> Option<(usize, usize)> {
        if len == 0 {
            return None;
        }
        let first = self.granule_of(addr)?;
        let last_addr = addr.as_usize().checked_add(len - 1)?;
        let last = self
            .granule_of(VirtAddr::new(last_addr))
            .unwrap_or(self.granules() - 1);
        Some((first, last - first + 1))
    }
}

/// Access to one shadow window, authorised by a shadow capability.
pub struct ShadowView<'m> {
    region: &'m ShadowRegion,
    sel: ShadowSelector,
    cap: Capability,
}

impl<'m> ShadowView<'m> {
    /// Bind a shadow capability to the region it names.
    ///
    /// The capability must be tagged, grant `LOAD`, and cover the whole
    /// extent of the region in the selected window.
    pub fn new(
        region: &'m ShadowRegion,
        sel: ShadowSelector,
        cap: Capability,
    ) -> Result<Self, RevokeError> {
        let (start, len) = region.extent(sel);
        if !cap.tag() || !cap.perms().contains(Perms::LOAD) || !cap.covers(start, len) {
            return Err(RevokeError::Resource(ResourceFault::ShadowBounds));
        }
        Ok(Self { region, sel, cap })
    }

    /// The capability authorising this view.
    #[inline]
    pub fn capability(&self) -> &Capability {
        &self.cap
    }

    /// The window this view addresses.
    #[inline]
    pub fn selector(&self) -> ShadowSelector {
        self.sel
    }

    /// The underlying region.
    #[inline]
    pub fn region(&self) -> &'m ShadowRegion {
        self.region
    }

    /// Check if the view may set bits.
    #[inline]
    pub fn writable(&self) -> bool {
        self.cap.perms().contains(Perms::STORE)
    }

    /// Test the bit for `addr`.
    #[inline]
    pub fn test_bit(&self, addr: VirtAddr) -> bool {
        let Some(granule) = self.region.granule_of(addr) else {
            return false;
        };
        debug_assert!(self.cap.covers(self.sel.shadow_addr(addr), 1));
        match self.sel {
            ShadowSelector::Revoked => self.region.revoked.test(granule),
            ShadowSelector::Painted => self.region.painted.test(granule),
        }
    }

    /// Set the bit for `addr`. Returns true if this call changed it.
    #[inline]
    pub fn set_bit(&self, addr: VirtAddr) -> bool {
        if !self.writable() {
            return false;
        }
        let Some(granule) = self.region.granule_of(addr) else {
            return false;
        };
        debug_assert!(self.cap.covers(self.sel.shadow_addr(addr), 1));
        match self.sel {
            ShadowSelector::Revoked => self.region.revoked.set(granule),
            ShadowSelector::Painted => self.region.painted.set(granule),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address::{CAP_SIZE, PAGE_SIZE};

    #[test]
    fn test_set_bit_is_idempotent() {
        let bitmap = ShadowBitmap::new(256);
        assert!(!bitmap.test(17));
        assert!(bitmap.set(17));
        assert!(!bitmap.set(17));
        assert!(bitmap.test(17));
        assert_eq!(bitmap.count(), 1);
    }

    #[test]
    fn test_advance_clears_lazily() {
        let bitmap = ShadowBitmap::new(256);
        bitmap.set(0);
        bitmap.set(255);
        bitmap.advance();
        assert!(!bitmap.test(0));
        assert!(!bitmap.test(255));
        assert_eq!(bitmap.count(), 0);
        // A stale word is restamped on the first set.
        assert!(bitmap.set(1));
        assert!(bitmap.test(1));
        assert!(!bitmap.test(0));
    }

    #[test]
    fn test_stamp_wrap_wipes_words() {
        let bitmap = ShadowBitmap::new(64);
        bitmap.stamp.store(u32::MAX, Ordering::Release);
        bitmap.set(5);
        assert!(bitmap.test(5));
        bitmap.advance();
        assert_eq!(bitmap.epoch_stamp(), 1);
        assert!(!bitmap.test(5));
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let bitmap = ShadowBitmap::new(10);
        assert!(!bitmap.set(10));
        assert!(!bitmap.test(10));
    }

    #[test]
    fn test_concurrent_set_counts_once() {
        let bitmap = ShadowBitmap::new(64);
        let winners = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for g in 0..64 {
                        if bitmap.set(g) {
                            winners.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(winners.load(Ordering::Relaxed), 64);
        assert_eq!(bitmap.count(), 64);
    }

    #[test]
    fn test_paint_ranges() {
        let region = ShadowRegion::new(VirtAddr::new(0x10_0000), 4 * PAGE_SIZE);
        let addr = VirtAddr::new(0x10_0000 + 60 * CAP_SIZE);
        region.paint(addr, 10 * CAP_SIZE);
        assert!(!region.is_painted(VirtAddr::new(addr.as_usize() - CAP_SIZE)));
        assert!(region.is_painted(addr));
        assert!(region.is_painted(addr.add(9 * CAP_SIZE)));
        assert!(!region.is_painted(addr.add(10 * CAP_SIZE)));
        region.unpaint(addr, 5 * CAP_SIZE);
        assert!(!region.is_painted(addr));
        assert!(region.is_painted(addr.add(5 * CAP_SIZE)));
    }

    #[test]
    fn test_view_requires_covering_capability() {
        let region = ShadowRegion::new(VirtAddr::new(0x10_0000), PAGE_SIZE);
        let (start, len) = region.extent(ShadowSelector::Revoked);
        assert_eq!(len, PAGE_SIZE / CAP_SIZE / 8);

        let short = Capability::new(start, len - 1, Perms::DATA_RW);
        assert!(ShadowView::new(&region, ShadowSelector::Revoked, short).is_err());

        let full = Capability::new(start, len, Perms::DATA_RW);
        let view = ShadowView::new(&region, ShadowSelector::Revoked, full).unwrap();
        let addr = VirtAddr::new(0x10_0000 + 4 * CAP_SIZE);
        assert!(view.set_bit(addr));
        assert!(view.test_bit(addr));

        let ro = Capability::new(start, len, Perms::LOAD);
        let ro_view = ShadowView::new(&region, ShadowSelector::Revoked, ro).unwrap();
        assert!(ro_view.test_bit(addr));
        assert!(!ro_view.set_bit(addr.add(CAP_SIZE)));
    }
}
