//! Epoch Controller
//!
//! Drives sweeps across a map and decides when an epoch is complete.
//!
//! # State Machine
//! ```text
//!  Idle ──open──► Init ──► Sweeping ──LAST_INIT──► LastSweep ──LAST_FINI──► Published
//!   ▲               │                                  ▲                        │
//!   │               └──────────LAST_INIT───────────────┘                        │
//!   └──────────────────────────── next pass opens a new epoch ◄─────────────────┘
//! ```
//! - A call without `INCREMENTAL` is a whole epoch: it implies
//!   `LAST_INIT | LAST_FINI` and must cover the whole map
//! - Passes before `LAST_INIT` may skip pages whose hints show no
//!   capabilities; the terminal pass never skips
//! - While a terminal chunk runs, mutator stores are held off. The
//!   `LAST_FINI` chunk also sweeps every resident page no terminal chunk
//!   of this epoch reached and every page stored to since it was swept,
//!   then runs the hoarders and publishes
//! - A hoarder failure leaves the epoch in `LastSweep` with the
//!   generation unchanged; the terminal pass can be retried
//!
//! # Faults
//! A page that is not resident is counted and skipped; the sweep goes on.
//! Lifecycle errors abort before any page is touched.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use spin::{Mutex, RwLock};

use crate::cap::CoarseFlags;
use crate::hoard::{HoardTally, HoarderRegistry, Process};
use crate::mm::address::{VirtAddr, PAGE_SIZE};
use crate::mm::map::VmMap;
use crate::mm::page::{Page, PageHints};
use crate::revoke::cookie::{check_map, Cookie};
use crate::revoke::error::{LifecycleFault, ResourceFault, Result, RevokeError};
use crate::revoke::info::EpochInfo;
use crate::revoke::publish;
use crate::revoke::stats::Counter;
use crate::revoke::walker::{sweep_page, PageOutcome};

bitflags! {
    /// Transition flags for one sweep call.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct SweepFlags: u8 {
        /// This call covers part of the map; more calls follow.
        const INCREMENTAL = 0x01;
        /// First call of the terminal pass. Hints are ignored from here.
        const LAST_INIT = 0x02;
        /// Last call of the terminal pass. Publishes the epoch.
        const LAST_FINI = 0x04;
        /// Synchronise with the page-table layer around the pass.
        const PMAP_SYNC = 0x08;
        /// Set by the controller: nothing was stored since the previous
        /// pass began, so marked granules need not be reloaded.
        const QUICK_SUCCESSOR = 0x10;
    }
}

/// Where an epoch stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochState {
    /// No epoch open.
    Idle,
    /// The first pass of a new epoch is running.
    Init,
    /// Non-terminal passes are in progress.
    Sweeping,
    /// The terminal pass is in progress.
    LastSweep,
    /// The last epoch was published.
    Published,
}

/// Address range a sweep call covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    /// The whole map.
    All,
    /// Pages overlapping `[start, end)`.
    Range {
        /// First address.
        start: VirtAddr,
        /// One past the last address.
        end: VirtAddr,
    },
}

impl Span {
    /// The single page holding `addr`.
    pub fn page(addr: VirtAddr) -> Self {
        let start = addr.align_down();
        Self::Range {
            start,
            end: start.add(PAGE_SIZE),
        }
    }

    fn bounds(self, map: &VmMap) -> (VirtAddr, VirtAddr) {
        match self {
            Self::All => (map.base(), map.end()),
            Self::Range { start, end } => (start, end),
        }
    }
}

/// Result of one sweep call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Epoch the call belonged to.
    pub epoch: u64,
    /// Pages walked (including read-only scans).
    pub pages_scanned: u64,
    /// Pages skipped on their hints.
    pub pages_skipped: u64,
    /// Pages that were not resident.
    pub pages_faulted: u64,
    /// Tagged capabilities seen.
    pub caps_found: u64,
    /// Capabilities revoked in memory.
    pub caps_revoked: u64,
    /// Shadow bits newly set.
    pub bits_set: u64,
    /// Capabilities revoked by hoarders.
    pub hoard_revoked: u64,
    /// Generation published by this call, if any.
    pub published: Option<u64>,
}

impl SweepReport {
    fn add(&mut self, page: &PageOutcome) {
        self.pages_scanned += 1;
        self.caps_found += page.caps_found;
        self.caps_revoked += page.caps_revoked;
        self.bits_set += page.bits_set;
    }
}

/// Totals carried across the calls of one epoch.
#[derive(Debug, Clone, Copy, Default)]
struct EpochTally {
    pages_scanned: u64,
    caps_revoked: u64,
    bits_set: u64,
}

impl EpochTally {
    fn add(&mut self, report: &SweepReport) {
        self.pages_scanned += report.pages_scanned;
        self.caps_revoked += report.caps_revoked + report.hoard_revoked;
        self.bits_set += report.bits_set;
    }
}

struct Inner {
    state: EpochState,
    epoch: u64,
    tally: EpochTally,
    excluded: CoarseFlags,
    last_mutations: Option<u64>,
    busy: bool,
}

/// Parameters fixed when a call is admitted.
struct Pass {
    epoch: u64,
    flags: SweepFlags,
    terminal: bool,
    strict: bool,
    mutations: u64,
}

/// Sequences sweeps and publication for one map.
pub struct EpochController<'m> {
    map: &'m VmMap,
    inner: Mutex<Inner>,
    hoarders: HoarderRegistry,
    procs: RwLock<Vec<Arc<Process>>>,
}

impl<'m> EpochController<'m> {
    /// A controller for `map` with the built-in hoarders.
    pub fn new(map: &'m VmMap) -> Self {
        Self::with_hoarders(map, HoarderRegistry::with_defaults())
    }

    /// A controller for `map` with a custom hoarder table.
    pub fn with_hoarders(map: &'m VmMap, hoarders: HoarderRegistry) -> Self {
        Self {
            map,
            inner: Mutex::new(Inner {
                state: EpochState::Idle,
                epoch: 0,
                tally: EpochTally::default(),
                excluded: CoarseFlags::empty(),
                last_mutations: None,
                busy: false,
            }),
            hoarders,
            procs: RwLock::new(Vec::new()),
        }
    }

    /// The swept map.
    #[inline]
    pub fn map(&self) -> &'m VmMap {
        self.map
    }

    /// The hoarder table.
    #[inline]
    pub fn hoarders(&self) -> &HoarderRegistry {
        &self.hoarders
    }

    /// Make a process's hoards part of every following epoch.
    pub fn attach(&self, proc: Arc<Process>) {
        self.procs.write().push(proc);
    }

    /// Stop tracking a process.
    pub fn detach(&self, pid: u32) -> Option<Arc<Process>> {
        let mut procs = self.procs.write();
        let pos = procs.iter().position(|p| p.pid() == pid)?;
        Some(procs.swap_remove(pos))
    }

    /// Current state.
    pub fn state(&self) -> EpochState {
        self.inner.lock().state
    }

    /// The epoch most recently opened.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Run one sweep call.
    pub fn sweep(&self, cookie: &Cookie<'_>, flags: SweepFlags, span: Span) -> Result<SweepReport> {
        let mut flags = flags;
        if flags.contains(SweepFlags::QUICK_SUCCESSOR) {
            log::warn!("[REVOKE] Ignoring caller-supplied QUICK_SUCCESSOR");
            flags.remove(SweepFlags::QUICK_SUCCESSOR);
        }
        if !flags.contains(SweepFlags::INCREMENTAL) {
            if span != Span::All {
                log::error!("[REVOKE] Range sweep outside an incremental epoch");
                return Err(LifecycleFault::RangeWithoutIncremental.into());
            }
            flags |= SweepFlags::LAST_INIT | SweepFlags::LAST_FINI;
        }
        self.call(cookie, flags, span, false)
    }

    /// Revoke within the single page holding `addr`, in the current epoch
    /// (opening one if none is open).
    ///
    /// Unlike `sweep`, a non-resident page is an error here.
    pub fn revoke_one(&self, cookie: &Cookie<'_>, flags: SweepFlags, addr: VirtAddr) -> Result<SweepReport> {
        if flags.intersects(SweepFlags::LAST_INIT | SweepFlags::LAST_FINI) {
            return Err(LifecycleFault::BadTransition.into());
        }
        if self.map.lookup_page(addr).is_none() {
            return Err(RevokeError::Access {
                addr: addr.as_usize(),
            });
        }
        let flags = (flags - SweepFlags::QUICK_SUCCESSOR) | SweepFlags::INCREMENTAL;
        self.call(cookie, flags, Span::page(addr), true)
    }

    /// Give up on the open epoch between calls. Nothing is published.
    pub fn abandon(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.busy {
            return Err(LifecycleFault::InUse.into());
        }
        if matches!(inner.state, EpochState::Sweeping | EpochState::LastSweep) {
            log::info!("[REVOKE] Epoch {} abandoned", inner.epoch);
            inner.state = EpochState::Idle;
            inner.last_mutations = None;
        }
        Ok(())
    }

    fn call(&self, cookie: &Cookie<'_>, flags: SweepFlags, span: Span, strict: bool) -> Result<SweepReport> {
        check_map(cookie, self.map)?;
        let _pass_guard = cookie.enter()?;
        let pass = self.admit(cookie, flags, strict)?;

        let mut report = SweepReport {
            epoch: pass.epoch,
            ..SweepReport::default()
        };
        let result = self.run(cookie, &pass, span, &mut report);

        let mut inner = self.inner.lock();
        inner.busy = false;
        inner.tally.add(&report);
        inner.last_mutations = Some(pass.mutations);
        if inner.state == EpochState::Init {
            inner.state = EpochState::Sweeping;
        }
        if report.published.is_some() {
            inner.state = EpochState::Published;
        }
        drop(inner);

        log::debug!(
            "[REVOKE] Epoch {} pass: {} pages, {} skipped, {} faulted, {} revoked",
            pass.epoch,
            report.pages_scanned,
            report.pages_skipped,
            report.pages_faulted,
            report.caps_revoked
        );
        result.map(|()| report)
    }

    /// Validate `flags` against the state and open an epoch if needed.
    fn admit(&self, cookie: &Cookie<'_>, flags: SweepFlags, strict: bool) -> Result<Pass> {
        let mut inner = self.inner.lock();
        if inner.busy {
            return Err(LifecycleFault::InUse.into());
        }
        let last_init = flags.contains(SweepFlags::LAST_INIT);
        if flags.contains(SweepFlags::LAST_FINI) && !last_init && inner.state != EpochState::LastSweep {
            log::error!("[REVOKE] LAST_FINI in state {:?}", inner.state);
            return Err(LifecycleFault::BadTransition.into());
        }
        if self.map.is_dead() {
            return Err(ResourceFault::MapDead.into());
        }
        let shadow = self.map.shadow()?;

        if matches!(inner.state, EpochState::Idle | EpochState::Published) {
            shadow.revoked().advance();
            inner.epoch = self.map.info().begin_epoch();
            inner.tally = EpochTally::default();
            inner.excluded = CoarseFlags::empty();
            inner.last_mutations = None;
            inner.state = EpochState::Init;
            log::info!("[REVOKE] Epoch {} opened", inner.epoch);
        }
        if last_init {
            inner.state = EpochState::LastSweep;
        }

        let mutations = self.map.mutations();
        let mut flags = flags;
        if inner.last_mutations == Some(mutations) {
            flags |= SweepFlags::QUICK_SUCCESSOR;
        }
        inner.excluded |= cookie.predicate().flags();
        inner.busy = true;
        Ok(Pass {
            epoch: inner.epoch,
            flags,
            terminal: inner.state == EpochState::LastSweep,
            strict,
            mutations,
        })
    }

    fn run(&self, cookie: &Cookie<'_>, pass: &Pass, span: Span, report: &mut SweepReport) -> Result<()> {
        let map = self.map;
        let sync = pass.flags.contains(SweepFlags::PMAP_SYNC);
        if sync {
            map.pmap_sync();
        }
        let world = pass.terminal.then(|| map.quiesce());

        let (start, end) = span.bounds(map);
        for page in map.pages_in(start, end) {
            self.sweep_one(cookie, &page, pass.flags, pass, report)?;
        }

        if pass.flags.contains(SweepFlags::LAST_FINI) {
            // Pages no terminal chunk reached, and pages stored to after
            // their terminal scan.
            let flags = pass.flags - SweepFlags::QUICK_SUCCESSOR;
            for page in map.pages_in(map.base(), map.end()) {
                if !page.is_present() {
                    continue;
                }
                if page.swept_epoch() != pass.epoch || page.hints().contains(PageHints::DIRTY) {
                    self.sweep_one(cookie, &page, flags, pass, report)?;
                }
            }
            self.finish(cookie, pass, report)?;
        }

        if sync {
            match world {
                Some(_) => fence(Ordering::SeqCst),
                None => map.pmap_sync(),
            }
        }
        drop(world);
        Ok(())
    }

    fn sweep_one(
        &self,
        cookie: &Cookie<'_>,
        page: &Page,
        flags: SweepFlags,
        pass: &Pass,
        report: &mut SweepReport,
    ) -> Result<()> {
        let may_skip = !pass.terminal && !pass.strict;
        match sweep_page(cookie, page, flags, may_skip) {
            Ok(Some(outcome)) => {
                if pass.terminal {
                    page.mark_swept(pass.epoch);
                }
                report.add(&outcome);
            }
            Ok(None) => report.pages_skipped += 1,
            Err(RevokeError::Access { addr }) if !pass.strict => {
                log::warn!("[REVOKE] Page {:#x} not resident, skipped", addr);
                cookie.add_stat(Counter::PagesFaulted, 1);
                report.pages_faulted += 1;
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Run the hoarders and publish.
    fn finish(&self, cookie: &Cookie<'_>, pass: &Pass, report: &mut SweepReport) -> Result<()> {
        let procs = self.procs.read().clone();
        let mut hoard = HoardTally::default();
        let result = self.hoarders.revoke_hoards(&procs, cookie, pass.epoch, &mut hoard);
        // Hoards revoked before a failing hoarder still count toward the epoch.
        report.hoard_revoked = hoard.revoked;
        cookie.add_stat(Counter::CapsHoardRevoked, hoard.revoked);
        cookie.add_stat(Counter::HoardersRun, hoard.callbacks);
        result.map_err(|err| {
            log::warn!("[REVOKE] Epoch {} not published: {}", pass.epoch, err);
            err
        })?;

        let (mut tally, excluded) = {
            let inner = self.inner.lock();
            (inner.tally, inner.excluded)
        };
        tally.add(report);
        let summary = EpochInfo {
            epoch_init: pass.epoch,
            generation: pass.epoch,
            pages_scanned: tally.pages_scanned,
            caps_revoked: tally.caps_revoked,
            bits_set: tally.bits_set,
            excluded: excluded.bits(),
        };
        let generation = publish(cookie, &summary)?;
        report.published = Some(generation);
        log::info!(
            "[REVOKE] Epoch {} published: {} pages, {} revoked",
            generation,
            summary.pages_scanned,
            summary.caps_revoked
        );
        Ok(())
    }
}
