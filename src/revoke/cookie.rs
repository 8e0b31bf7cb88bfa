//! Revocation Cookie
//!
//! The session object for one reclamation episode. It binds the target
//! map, two shadow views, the shared info page, the active predicate and
//! the statistics block.
//!
//! # Lifecycle
//! ```text
//! init ──► Ready ──enter──► InUse ──drop guard──► Ready ──release──► Released
//! ```
//! A cookie only exists once `init` succeeds, so there is no
//! uninitialised state to misuse. A released cookie fails every call
//! with `LifecycleFault::Released`.
//!
//! # Ownership
//! The cookie owns its statistics. The map, the shadow and the info page
//! are borrowed and outlive it.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::arch::ctemp::CapTemp;
use crate::cap::{Capability, CoarseFlags, Perms, Predicate, RevokeImage};
use crate::mm::address::VirtAddr;
use crate::mm::map::VmMap;
use crate::mm::shadow::{ShadowSelector, ShadowView};
use crate::revoke::error::{LifecycleFault, ResourceFault, Result, RevokeError};
use crate::revoke::info::InfoPage;
use crate::revoke::stats::{Counter, Stats, StatsSink};

const READY: u8 = 0;
const IN_USE: u8 = 1;
const RELEASED: u8 = 2;

/// Observable cookie state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieState {
    /// Usable, no pass in flight.
    Ready,
    /// A pass holds the cookie.
    InUse,
    /// Released; unusable.
    Released,
}

/// What `revoke_slot` found in one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// Plain data.
    Untagged,
    /// A capability the predicate keeps.
    Kept,
    /// A match that was already its own revoked image.
    Inert,
    /// A match that was overwritten.
    Revoked,
}

impl SlotOutcome {
    /// Check if the slot held a capability.
    #[inline]
    pub fn had_tag(self) -> bool {
        self != Self::Untagged
    }

    /// Check if the predicate matched.
    #[inline]
    pub fn matched(self) -> bool {
        matches!(self, Self::Inert | Self::Revoked)
    }
}

/// One revocation session against one map.
pub struct Cookie<'m> {
    map: &'m VmMap,
    revoked: ShadowView<'m>,
    painted: ShadowView<'m>,
    info: &'m InfoPage,
    stats: Stats,
    predicate: Predicate,
    image: RevokeImage,
    state: AtomicU8,
}

impl<'m> Cookie<'m> {
    /// Open a session on `map` with fresh statistics.
    pub fn init(map: &'m VmMap) -> Result<Self> {
        Self::with_stats(map, Stats::new())
    }

    /// Open a session on `map` that takes ownership of `stats`.
    pub fn with_stats(map: &'m VmMap, stats: Stats) -> Result<Self> {
        if map.is_dead() {
            return Err(ResourceFault::MapDead.into());
        }
        let region = map.shadow()?;
        let (base, end) = (map.base(), map.end());
        let size = end.as_usize() - base.as_usize();
        let revoked_cap = map.shadow_capability(ShadowSelector::Revoked, base, size, Perms::DATA_RW)?;
        let painted_cap = map.shadow_capability(ShadowSelector::Painted, base, size, Perms::LOAD)?;
        Ok(Self {
            map,
            revoked: ShadowView::new(region, ShadowSelector::Revoked, revoked_cap)?,
            painted: ShadowView::new(region, ShadowSelector::Painted, painted_cap)?,
            info: map.info(),
            stats,
            predicate: Predicate::default(),
            image: RevokeImage::DEFAULT,
            state: AtomicU8::new(READY),
        })
    }

    /// Set the exemption flags, keeping the predicate variant.
    pub fn configure(&mut self, flags: CoarseFlags) -> Result<()> {
        self.check_live()?;
        self.predicate = self.predicate.with_flags(flags);
        Ok(())
    }

    /// Replace the predicate.
    pub fn set_predicate(&mut self, predicate: Predicate) -> Result<()> {
        self.check_live()?;
        self.predicate = predicate;
        Ok(())
    }

    /// Choose the revoked image written over matches.
    pub fn set_image(&mut self, image: RevokeImage) -> Result<()> {
        self.check_live()?;
        self.image = image;
        Ok(())
    }

    /// Release the cookie. Only the first call succeeds.
    pub fn release(&self) -> Result<()> {
        match self
            .state
            .compare_exchange(READY, RELEASED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(IN_USE) => Err(LifecycleFault::InUse.into()),
            Err(_) => {
                log::error!("[REVOKE] Cookie released twice");
                Err(LifecycleFault::Released.into())
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CookieState {
        match self.state.load(Ordering::Acquire) {
            READY => CookieState::Ready,
            IN_USE => CookieState::InUse,
            _ => CookieState::Released,
        }
    }

    /// Fail if the cookie has been released.
    pub fn check_live(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) == RELEASED {
            log::error!("[REVOKE] Use of released cookie");
            return Err(LifecycleFault::Released.into());
        }
        Ok(())
    }

    /// Claim the cookie for one pass.
    pub(crate) fn enter(&self) -> Result<PassGuard<'_>> {
        match self
            .state
            .compare_exchange(READY, IN_USE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(PassGuard { state: &self.state }),
            Err(IN_USE) => Err(LifecycleFault::InUse.into()),
            Err(_) => {
                log::error!("[REVOKE] Use of released cookie");
                Err(LifecycleFault::Released.into())
            }
        }
    }

    /// The target map.
    #[inline]
    pub fn map(&self) -> &'m VmMap {
        self.map
    }

    /// The shared info page.
    #[inline]
    pub fn info(&self) -> &'m InfoPage {
        self.info
    }

    /// The statistics block.
    #[inline]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The active predicate.
    #[inline]
    pub fn predicate(&self) -> Predicate {
        self.predicate
    }

    /// The revoked image in use.
    #[inline]
    pub fn image(&self) -> RevokeImage {
        self.image
    }

    /// The view of the revoked-granule window.
    #[inline]
    pub(crate) fn revoked_view(&self) -> &ShadowView<'m> {
        &self.revoked
    }

    /// Decide whether `cap` must be revoked.
    #[inline]
    pub fn test(&self, cap: &Capability) -> bool {
        self.predicate
            .test(cap, |base| self.painted.test_bit(VirtAddr::new(base)))
    }

    /// Check a capability a mutator is about to use.
    ///
    /// Fails if the cookie has been released.
    pub fn test_capability(&self, cap: &Capability) -> Result<bool> {
        self.check_live()?;
        Ok(self.test(cap))
    }

    /// Test one slot and overwrite it with its revoked image on a match.
    /// The value moves through `temp`, which is wiped before returning.
    ///
    /// Callers hold whatever lock makes the slot theirs.
    pub fn revoke_slot(&self, temp: &mut CapTemp, slot: &mut Capability) -> SlotOutcome {
        let loaded = *temp.load(slot);
        let outcome = if !loaded.tag() {
            SlotOutcome::Untagged
        } else if !self.test(&loaded) {
            SlotOutcome::Kept
        } else {
            let image = loaded.revoked(self.image);
            if image == loaded {
                SlotOutcome::Inert
            } else {
                temp.set(image);
                temp.store(slot);
                SlotOutcome::Revoked
            }
        };
        temp.wipe();
        outcome
    }

    /// Revoke a capability held outside swept memory. Returns true if it
    /// was changed.
    #[inline]
    pub fn revoke_cap(&self, temp: &mut CapTemp, cap: &mut Capability) -> bool {
        self.revoke_slot(temp, cap) == SlotOutcome::Revoked
    }

    /// Check if the granule at `addr` was revoked in the current epoch.
    #[inline]
    pub fn is_revoked(&self, addr: VirtAddr) -> bool {
        self.revoked.test_bit(addr)
    }

    pub(crate) fn add_stat(&self, counter: Counter, n: u64) {
        self.stats.add(counter, n);
    }
}

impl core::fmt::Debug for Cookie<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cookie")
            .field("map", &self.map.base())
            .field("predicate", &self.predicate)
            .field("image", &self.image)
            .field("state", &self.state())
            .finish()
    }
}

/// Holds a cookie in `InUse` until dropped.
pub(crate) struct PassGuard<'c> {
    state: &'c AtomicU8,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .state
            .compare_exchange(IN_USE, READY, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Fail with `ForeignCookie` unless `cookie` was opened on `map`.
pub(crate) fn check_map(cookie: &Cookie<'_>, map: &VmMap) -> Result<()> {
    if !core::ptr::eq(cookie.map(), map) {
        log::error!("[REVOKE] Cookie for {} used on {}", cookie.map().base(), map.base());
        return Err(RevokeError::Lifecycle(LifecycleFault::ForeignCookie));
    }
    Ok(())
}
