//! Page Walker
//!
//! The innermost loop of a sweep: visit every granule of one page, test
//! the capabilities found there and overwrite the matches.
//!
//! # Per-Granule Protocol
//! 1. Enter the granule's transfer section
//! 2. Load into the walker's scratch register, test, store the revoked
//!    image back to the same granule
//! 3. Leave the section, then set the shadow bit
//!
//! The shadow bit therefore never reads as set before the revoked image
//! is visible, and a mutator reading the granule sees either the old
//! capability or the whole revoked image.

use crate::arch::ctemp::CapTemp;
use crate::mm::page::Page;
use crate::revoke::cookie::{Cookie, SlotOutcome};
use crate::revoke::epoch::SweepFlags;
use crate::revoke::error::{Result, RevokeError};
use crate::revoke::stats::Counter;

/// What a walk found on one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOutcome {
    /// The page held at least one tagged capability.
    pub has_caps: bool,
    /// The walk changed (or, read-only, would change) the page.
    pub dirty: bool,
    /// Tagged capabilities seen.
    pub caps_found: u64,
    /// Capabilities overwritten (or that would be).
    pub caps_revoked: u64,
    /// Shadow bits newly set.
    pub bits_set: u64,
}

impl PageOutcome {
    fn record(&mut self, slot: SlotOutcome) {
        if slot.had_tag() {
            self.has_caps = true;
            self.caps_found += 1;
        }
        if slot == SlotOutcome::Revoked {
            self.dirty = true;
            self.caps_revoked += 1;
        }
    }
}

fn check_mapped(page: &Page, write: bool) -> Result<()> {
    if !page.is_present() || (write && !page.is_writable()) {
        return Err(RevokeError::Access {
            addr: page.base().as_usize(),
        });
    }
    Ok(())
}

/// Sweep one page, writing revoked images over every match.
pub fn walk_page(cookie: &Cookie<'_>, page: &Page) -> Result<PageOutcome> {
    walk_page_with(cookie, page, SweepFlags::empty())
}

/// Sweep one page under the given pass flags.
///
/// With `QUICK_SUCCESSOR` granules whose shadow bit is already set in
/// this epoch are not reloaded; they count as holding a capability.
pub fn walk_page_with(cookie: &Cookie<'_>, page: &Page, flags: SweepFlags) -> Result<PageOutcome> {
    check_mapped(page, true)?;
    let quick = flags.contains(SweepFlags::QUICK_SUCCESSOR);
    let view = cookie.revoked_view();
    let mut temp = CapTemp::new();
    let mut out = PageOutcome::default();

    page.begin_scan();
    for (addr, granule) in page.granules() {
        if quick && view.test_bit(addr) {
            out.has_caps = true;
            continue;
        }
        let slot = granule.transfer(|cap| cookie.revoke_slot(&mut temp, cap));
        out.record(slot);
        if slot.matched() && view.set_bit(addr) {
            out.bits_set += 1;
        }
    }
    page.settle_hints(out.has_caps);

    cookie.add_stat(Counter::PagesScanned, 1);
    cookie.add_stat(Counter::CapsFound, out.caps_found);
    cookie.add_stat(Counter::CapsRevoked, out.caps_revoked);
    cookie.add_stat(Counter::BitsSet, out.bits_set);
    Ok(out)
}

/// Scan one page without writing anything.
///
/// `dirty` and `caps_revoked` report what `walk_page` would change.
pub fn walk_page_ro(cookie: &Cookie<'_>, page: &Page) -> Result<PageOutcome> {
    check_mapped(page, false)?;
    let mut out = PageOutcome::default();
    for (_, granule) in page.granules() {
        let cap = granule.load();
        let slot = if !cap.tag() {
            SlotOutcome::Untagged
        } else if !cookie.test(&cap) {
            SlotOutcome::Kept
        } else if cap.revoked(cookie.image()) == cap {
            SlotOutcome::Inert
        } else {
            SlotOutcome::Revoked
        };
        out.record(slot);
    }
    cookie.add_stat(Counter::PagesScannedRo, 1);
    cookie.add_stat(Counter::CapsFound, out.caps_found);
    Ok(out)
}

/// Sweep one page on behalf of the controller.
///
/// Read-only pages are scanned first and only made writable if the scan
/// shows the walk would change them. Returns `None` for a page skipped
/// on its hints.
pub(crate) fn sweep_page(
    cookie: &Cookie<'_>,
    page: &Page,
    flags: SweepFlags,
    may_skip: bool,
) -> Result<Option<PageOutcome>> {
    check_mapped(page, false)?;
    if may_skip && page.hints().is_empty() {
        cookie.add_stat(Counter::PagesSkipped, 1);
        return Ok(None);
    }
    if !page.is_writable() {
        let ro = walk_page_ro(cookie, page)?;
        if !ro.dirty {
            // Stores fault on a read-only page, so the scan saw its final contents.
            page.begin_scan();
            page.settle_hints(ro.has_caps);
            return Ok(Some(ro));
        }
        cookie.map().make_writable(page)?;
    }
    walk_page_with(cookie, page, flags).map(Some)
}
