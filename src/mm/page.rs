//! Pages and Capability Granules
//!
//! A page is the unit the sweep walks: 256 capability granules mapped at
//! a known virtual range, plus the two soft hints the VM layer keeps.
//!
//! # Granule Atomicity
//! Every granule sits behind its own spinlock. Holding it is the
//! capability transfer section: the load, test and store of one granule
//! happen as a unit, so no observer sees a half-revoked capability. The
//! section never spans more than one granule.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::address::{VirtAddr, CAP_SIZE, GRANULES_PER_PAGE};
use crate::cap::Capability;

bitflags! {
    /// Soft hints kept per page by the VM layer.
    ///
    /// They may be stale in the safe direction only: a page that gains a
    /// capability always has `HAS_CAPS | DIRTY` set by the store.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PageHints: u8 {
        /// The page may contain tagged capabilities.
        const HAS_CAPS = 0x01;
        /// A capability was stored since the last sweep of this page.
        const DIRTY = 0x02;
    }
}

/// One capability-sized slot of memory.
pub struct Granule {
    slot: Mutex<Capability>,
}

impl Granule {
    const fn new() -> Self {
        Self {
            slot: Mutex::new(Capability::null()),
        }
    }

    /// Run `f` inside the transfer section of this granule.
    #[inline]
    pub fn transfer<R>(&self, f: impl FnOnce(&mut Capability) -> R) -> R {
        let mut slot = self.slot.lock();
        f(&mut slot)
    }

    /// Read the granule atomically.
    #[inline]
    pub fn load(&self) -> Capability {
        *self.slot.lock()
    }
}

/// A mapped page of capability memory.
pub struct Page {
    /// First virtual address of the page.
    base: VirtAddr,
    /// The granules, in address order.
    granules: Box<[Granule]>,
    /// `PageHints` bits.
    hints: AtomicU8,
    /// Whether the page is resident and mapped.
    present: AtomicBool,
    /// Whether the mapping permits stores.
    writable: AtomicBool,
    /// Epoch of the last terminal scan, 0 if never.
    swept: AtomicU64,
}

impl Page {
    /// Create a zeroed page at `base`.
    pub fn new(base: VirtAddr, writable: bool) -> Self {
        debug_assert!(base.is_aligned());
        let granules: Vec<Granule> = (0..GRANULES_PER_PAGE).map(|_| Granule::new()).collect();
        Self {
            base,
            granules: granules.into_boxed_slice(),
            hints: AtomicU8::new(0),
            present: AtomicBool::new(true),
            writable: AtomicBool::new(writable),
            swept: AtomicU64::new(0),
        }
    }

    /// First virtual address.
    #[inline]
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// The granule holding `addr`, if `addr` lies in this page.
    #[inline]
    pub fn granule(&self, addr: VirtAddr) -> Option<&Granule> {
        if addr.align_down() != self.base {
            return None;
        }
        self.granules.get(addr.granule_in_page())
    }

    /// Iterate over granules with their addresses.
    pub fn granules(&self) -> impl Iterator<Item = (VirtAddr, &Granule)> {
        let base = self.base;
        self.granules
            .iter()
            .enumerate()
            .map(move |(i, g)| (base.add(i * CAP_SIZE), g))
    }

    /// Current soft hints.
    #[inline]
    pub fn hints(&self) -> PageHints {
        PageHints::from_bits_truncate(self.hints.load(Ordering::Acquire))
    }

    /// Set hint bits.
    #[inline]
    pub fn set_hints(&self, hints: PageHints) {
        self.hints.fetch_or(hints.bits(), Ordering::AcqRel);
    }

    /// Clear `DIRTY` ahead of a scan; returns the hints seen before.
    #[inline]
    pub(crate) fn begin_scan(&self) -> PageHints {
        let old = self.hints.fetch_and(!PageHints::DIRTY.bits(), Ordering::AcqRel);
        PageHints::from_bits_truncate(old)
    }

    /// Record what a scan found.
    ///
    /// `HAS_CAPS` is only dropped if no store re-dirtied the page while it
    /// was being scanned.
    pub(crate) fn settle_hints(&self, has_caps: bool) {
        if has_caps {
            self.set_hints(PageHints::HAS_CAPS);
            return;
        }
        let mut old = self.hints.load(Ordering::Acquire);
        loop {
            if old & PageHints::DIRTY.bits() != 0 {
                return;
            }
            let new = old & !PageHints::HAS_CAPS.bits();
            match self
                .hints
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => old = actual,
            }
        }
    }

    /// Check if the page is resident.
    #[inline]
    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    /// Check if the mapping permits stores.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Epoch whose terminal pass last scanned this page.
    #[inline]
    pub fn swept_epoch(&self) -> u64 {
        self.swept.load(Ordering::Acquire)
    }

    pub(crate) fn mark_swept(&self, epoch: u64) {
        self.swept.store(epoch, Ordering::Release);
    }

    pub(crate) fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::Release);
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }

    /// Store a value into the granule at `addr` (mutator path).
    ///
    /// Returns false if `addr` is not in this page.
    pub(crate) fn store(&self, addr: VirtAddr, cap: Capability) -> bool {
        let Some(granule) = self.granule(addr) else {
            return false;
        };
        granule.transfer(|slot| *slot = cap);
        if cap.tag() {
            self.set_hints(PageHints::HAS_CAPS | PageHints::DIRTY);
        }
        true
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Page({}, {:?}, present={}, writable={})",
            self.base,
            self.hints(),
            self.is_present(),
            self.is_writable()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::Perms;

    #[test]
    fn test_store_sets_hints() {
        let page = Page::new(VirtAddr::new(0x8000), true);
        assert!(page.hints().is_empty());
        assert!(page.store(VirtAddr::new(0x8010), Capability::untagged(1, 2, Perms::NONE)));
        assert!(page.hints().is_empty());
        assert!(page.store(VirtAddr::new(0x8020), Capability::new(0x8000, 16, Perms::LOAD)));
        assert_eq!(page.hints(), PageHints::HAS_CAPS | PageHints::DIRTY);
        assert!(!page.store(VirtAddr::new(0x9000), Capability::null()));
    }

    #[test]
    fn test_settle_keeps_caps_when_redirtied() {
        let page = Page::new(VirtAddr::new(0x8000), true);
        page.set_hints(PageHints::HAS_CAPS | PageHints::DIRTY);
        page.begin_scan();
        assert_eq!(page.hints(), PageHints::HAS_CAPS);
        // A store lands during the scan.
        page.set_hints(PageHints::DIRTY);
        page.settle_hints(false);
        assert!(page.hints().contains(PageHints::HAS_CAPS));

        page.begin_scan();
        page.settle_hints(false);
        assert!(page.hints().is_empty());
    }

    #[test]
    fn test_granule_lookup() {
        let page = Page::new(VirtAddr::new(0x8000), true);
        assert!(page.granule(VirtAddr::new(0x8ff0)).is_some());
        assert!(page.granule(VirtAddr::new(0x9000)).is_none());
        assert_eq!(page.granules().count(), GRANULES_PER_PAGE);
    }
}
