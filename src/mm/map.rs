//! Address-Space Map
//!
//! The swept map: a sparse set of capability pages, the shadow installed
//! for it, and the info page shared with its owner.
//!
//! # Mutator Path
//! Loads and stores from the owning process go through `load_cap` and
//! `store_cap`. A store takes the world lock for reading; the terminal
//! pass of an epoch holds it for writing so no store races the last
//! sweep.
//!
//! # Security Properties
//! - Only page-aligned addresses inside the map's range can be mapped
//! - Stores to read-only or non-resident pages fail instead of faulting in
//! - A torn-down map refuses every operation

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};

use spin::{Once, RwLock, RwLockWriteGuard};

use super::address::{VirtAddr, PAGE_SIZE};
use super::page::Page;
use super::shadow::{ShadowRegion, ShadowSelector};
use crate::cap::{Capability, Perms};
use crate::revoke::error::{ResourceFault, Result, RevokeError};
use crate::revoke::info::InfoPage;

/// A user address space that can be swept.
pub struct VmMap {
    /// First mapped address.
    base: VirtAddr,
    /// Size of the managed range in bytes.
    size: usize,
    /// Resident pages by base address.
    pages: RwLock<BTreeMap<usize, Arc<Page>>>,
    /// Shadow bitmaps, installed once.
    shadow: Once<ShadowRegion>,
    /// Held for reading by stores, for writing to stop them.
    world: RwLock<()>,
    /// Set once the map is torn down.
    dead: AtomicBool,
    /// Tagged stores since creation.
    mutations: AtomicU64,
    /// Progress page shared with the owner.
    info: InfoPage,
}

impl VmMap {
    /// Create an empty map managing `[base, base + size)`.
    pub fn new(base: VirtAddr, size: usize) -> Self {
        debug_assert!(base.is_aligned() && size % PAGE_SIZE == 0);
        debug_assert!(base.add(size).as_usize() <= super::address::USER_END);
        Self {
            base,
            size,
            pages: RwLock::new(BTreeMap::new()),
            shadow: Once::new(),
            world: RwLock::new(()),
            dead: AtomicBool::new(false),
            mutations: AtomicU64::new(0),
            info: InfoPage::new(),
        }
    }

    /// First managed address.
    #[inline]
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// One past the last managed address.
    #[inline]
    pub fn end(&self) -> VirtAddr {
        self.base.add(self.size)
    }

    /// Check if `addr` lies in the managed range.
    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// The shared info page.
    #[inline]
    pub fn info(&self) -> &InfoPage {
        &self.info
    }

    /// Check if the map has been torn down.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_dead() {
            return Err(ResourceFault::MapDead.into());
        }
        Ok(())
    }

    /// Tagged stores performed so far.
    #[inline]
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::Acquire)
    }

    /// Install the shadow bitmaps for the whole managed range.
    pub fn install_shadow(&self) -> Result<()> {
        self.check_alive()?;
        let mut installed = false;
        self.shadow.call_once(|| {
            installed = true;
            ShadowRegion::new(self.base, self.size)
        });
        if !installed {
            return Err(ResourceFault::ShadowInstalled.into());
        }
        log::debug!("[VM] Shadow installed for {}..{}", self.base, self.end());
        Ok(())
    }

    /// The installed shadow.
    pub fn shadow(&self) -> Result<&ShadowRegion> {
        self.shadow
            .get()
            .ok_or(RevokeError::Resource(ResourceFault::ShadowMissing))
    }

    /// Mint a capability over the shadow bytes for `[base, base + size)`
    /// in one window.
    ///
    /// Rights are `perm_mask` limited to what the window allows: the
    /// revoked window may be read and written, the painted window only
    /// read. The range must lie inside the map.
    pub fn shadow_capability(
        &self,
        sel: ShadowSelector,
        base: VirtAddr,
        size: usize,
        perm_mask: Perms,
    ) -> Result<Capability> {
        self.shadow()?;
        let end = base.as_usize().checked_add(size);
        if size == 0 || base < self.base || end.map_or(true, |end| end > self.end().as_usize()) {
            return Err(ResourceFault::ShadowBounds.into());
        }
        let allowed = match sel {
            ShadowSelector::Revoked => Perms::DATA_RW,
            ShadowSelector::Painted => Perms::LOAD,
        };
        let start = sel.shadow_addr(base);
        let last = sel.shadow_addr(base.add(size - 1));
        Ok(Capability::new(start, last - start + 1, perm_mask.intersect(allowed)))
    }

    /// Map a zeroed page at `addr`. Returns the existing page if one is
    /// already mapped there.
    pub fn map_page(&self, addr: VirtAddr, writable: bool) -> Result<Arc<Page>> {
        self.check_alive()?;
        if !addr.is_aligned() || !self.contains(addr) {
            return Err(RevokeError::Access {
                addr: addr.as_usize(),
            });
        }
        let mut pages = self.pages.write();
        let page = pages
            .entry(addr.as_usize())
            .or_insert_with(|| Arc::new(Page::new(addr, writable)))
            .clone();
        Ok(page)
    }

    /// Remove the page at `addr`.
    pub fn unmap_page(&self, addr: VirtAddr) -> Option<Arc<Page>> {
        let page = self.pages.write().remove(&addr.align_down().as_usize())?;
        page.set_present(false);
        Some(page)
    }

    /// Mark the page at `addr` non-resident. Its contents are kept.
    pub fn evict_page(&self, addr: VirtAddr) -> bool {
        self.lookup_page(addr)
            .map(|page| page.set_present(false))
            .is_some()
    }

    /// Bring an evicted page back.
    pub fn page_in(&self, addr: VirtAddr) -> bool {
        self.lookup_page(addr)
            .map(|page| page.set_present(true))
            .is_some()
    }

    /// Change the write permission of the page at `addr`.
    pub fn protect(&self, addr: VirtAddr, writable: bool) -> Result<()> {
        self.check_alive()?;
        let page = self.lookup_page(addr).ok_or(RevokeError::Access {
            addr: addr.as_usize(),
        })?;
        page.set_writable(writable);
        Ok(())
    }

    /// Upgrade a read-only page so the sweep can write it.
    pub fn make_writable(&self, page: &Page) -> Result<()> {
        self.check_alive()?;
        if !page.is_present() {
            return Err(RevokeError::Access {
                addr: page.base().as_usize(),
            });
        }
        if !page.is_writable() {
            log::trace!("[VM] Upgrading {} to writable", page.base());
            page.set_writable(true);
        }
        Ok(())
    }

    /// The page holding `addr`.
    pub fn lookup_page(&self, addr: VirtAddr) -> Option<Arc<Page>> {
        self.pages.read().get(&addr.align_down().as_usize()).cloned()
    }

    /// Snapshot of the pages overlapping `[start, end)`, in address order.
    pub fn pages_in(&self, start: VirtAddr, end: VirtAddr) -> Vec<Arc<Page>> {
        let first = start.align_down().as_usize();
        if end <= start {
            return Vec::new();
        }
        self.pages
            .read()
            .range(first..end.as_usize())
            .map(|(_, page)| page.clone())
            .collect()
    }

    /// Number of mapped pages.
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    fn page_for_access(&self, addr: VirtAddr, write: bool) -> Result<Arc<Page>> {
        self.check_alive()?;
        let fault = RevokeError::Access {
            addr: addr.as_usize(),
        };
        if !addr.is_cap_aligned() {
            return Err(fault);
        }
        let page = self.lookup_page(addr).ok_or(fault)?;
        if !page.is_present() || (write && !page.is_writable()) {
            return Err(fault);
        }
        Ok(page)
    }

    /// Store a capability-sized value (mutator path).
    pub fn store_cap(&self, addr: VirtAddr, cap: Capability) -> Result<()> {
        let page = self.page_for_access(addr, true)?;
        let _world = self.world.read();
        page.store(addr, cap);
        if cap.tag() {
            self.mutations.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Load a capability-sized value (mutator path).
    pub fn load_cap(&self, addr: VirtAddr) -> Result<Capability> {
        let page = self.page_for_access(addr, false)?;
        page.granule(addr)
            .map(|granule| granule.load())
            .ok_or(RevokeError::Access {
                addr: addr.as_usize(),
            })
    }

    /// Stop mutator stores until the guard is dropped.
    pub fn quiesce(&self) -> RwLockWriteGuard<'_, ()> {
        self.world.write()
    }

    /// Wait for every in-flight store to drain and make the sweep's
    /// writes visible to all CPUs.
    pub fn pmap_sync(&self) {
        drop(self.world.write());
        fence(Ordering::SeqCst);
    }

    /// Tear the map down. Pages are released; the info page survives for
    /// readers that still hold the map.
    pub fn teardown(&self) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        let pages = core::mem::take(&mut *self.pages.write());
        for page in pages.values() {
            page.set_present(false);
        }
        log::debug!("[VM] Map {} torn down ({} pages)", self.base, pages.len());
    }
}
