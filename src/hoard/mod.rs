//! Hoarder Callbacks
//!
//! Kernel subsystems that keep capabilities outside swept memory. Each
//! registers a callback the epoch controller runs after the terminal
//! sweep and before publication.
//!
//! # Contract
//! - A callback revokes every capability it holds for one owner
//! - It makes bounded progress; a callback that cannot finish returns an
//!   error and the epoch is not published
//! - It runs at most once per owner per epoch, and never while the owner
//!   is being torn down

pub mod aio;
pub mod kqueue;
pub mod ktimer;
pub mod proc;
pub mod sigaltstack;

use alloc::sync::Arc;

use crate::arch::frame::td_frame_revoke;
use crate::revoke::cookie::Cookie;
use crate::revoke::error::{ResourceFault, Result};

pub use proc::{HoardMark, Process, Thread};

/// Maximum number of registered hoarders.
pub const MAX_HOARDERS: usize = 8;

/// Per-process revocation callback.
pub type ProcessRevokeFn = fn(&Process, &Cookie<'_>) -> Result<u64>;

/// Per-thread revocation callback.
pub type ThreadRevokeFn = fn(&Thread, &Cookie<'_>) -> Result<u64>;

/// A registered hoarder and the kind of owner it runs for.
#[derive(Clone, Copy)]
pub enum Hoarder {
    /// Runs once per process.
    Process {
        /// Subsystem name.
        name: &'static str,
        /// Callback.
        revoke: ProcessRevokeFn,
    },
    /// Runs once per thread.
    Thread {
        /// Subsystem name.
        name: &'static str,
        /// Callback.
        revoke: ThreadRevokeFn,
    },
}

impl Hoarder {
    /// Subsystem name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Process { name, .. } | Self::Thread { name, .. } => *name,
        }
    }
}

impl core::fmt::Debug for Hoarder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Process { name, .. } => write!(f, "Hoarder::Process({})", name),
            Self::Thread { name, .. } => write!(f, "Hoarder::Thread({})", name),
        }
    }
}

fn frame_revoke(thread: &Thread, cookie: &Cookie<'_>) -> Result<u64> {
    Ok(td_frame_revoke(&mut thread.frame.lock(), cookie))
}

/// Fixed table of hoarders.
#[derive(Debug)]
pub struct HoarderRegistry {
    slots: [Option<Hoarder>; MAX_HOARDERS],
    len: usize,
}

impl HoarderRegistry {
    /// An empty registry.
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_HOARDERS],
            len: 0,
        }
    }

    /// A registry holding every built-in hoarder.
    pub fn with_defaults() -> Self {
        let defaults = [
            Hoarder::Process {
                name: "aio",
                revoke: aio::revoke,
            },
            Hoarder::Process {
                name: "kqueue",
                revoke: kqueue::revoke,
            },
            Hoarder::Process {
                name: "ktimer",
                revoke: ktimer::revoke,
            },
            Hoarder::Thread {
                name: "sigaltstack",
                revoke: sigaltstack::revoke,
            },
            Hoarder::Thread {
                name: "td_frame",
                revoke: frame_revoke,
            },
        ];
        let mut slots = [None; MAX_HOARDERS];
        for (slot, hoarder) in slots.iter_mut().zip(defaults) {
            *slot = Some(hoarder);
        }
        Self {
            slots,
            len: defaults.len(),
        }
    }

    /// Add a hoarder. Returns its slot.
    pub fn register(&mut self, hoarder: Hoarder) -> Result<usize> {
        if self.len == MAX_HOARDERS {
            return Err(ResourceFault::RegistryFull.into());
        }
        let slot = self.len;
        self.slots[slot] = Some(hoarder);
        self.len += 1;
        Ok(slot)
    }

    /// Number of registered hoarders.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no hoarder is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Registered hoarders with their slots.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Hoarder)> {
        self.slots[..self.len]
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.as_ref().map(|h| (i, h)))
    }

    /// Run every hoarder for every live owner in `procs` for `epoch`.
    ///
    /// Owners already marked done for a hoarder this epoch are skipped,
    /// so a retried terminal pass resumes where the failed one stopped.
    /// Capabilities revoked and callbacks run are added to `tally`, including
    /// those completed before a hoarder fails.
    pub fn revoke_hoards(
        &self,
        procs: &[Arc<Process>],
        cookie: &Cookie<'_>,
        epoch: u64,
        tally: &mut HoardTally,
    ) -> Result<()> {
        for proc in procs {
            let proc: &Process = proc;
            let Some(_alive) = proc.pin() else {
                continue;
            };
            for (slot, hoarder) in self.iter() {
                match *hoarder {
                    Hoarder::Process { name, revoke } => {
                        if proc.mark().is_done(epoch, slot) {
                            continue;
                        }
                        tally.revoked += run(name, proc.pid(), || revoke(proc, cookie))?;
                        tally.callbacks += 1;
                        proc.mark().mark_done(epoch, slot);
                    }
                    Hoarder::Thread { name, revoke } => {
                        for thread in proc.threads() {
                            let Some(_alive) = thread.pin() else {
                                continue;
                            };
                            if thread.mark().is_done(epoch, slot) {
                                continue;
                            }
                            tally.revoked +=
                                run(name, thread.tid(), || revoke(&*thread, cookie))?;
                            tally.callbacks += 1;
                            thread.mark().mark_done(epoch, slot);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for HoarderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Totals from one `revoke_hoards` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HoardTally {
    /// Capabilities revoked.
    pub revoked: u64,
    /// Callbacks run.
    pub callbacks: u64,
}

fn run(name: &str, owner: u32, f: impl FnOnce() -> Result<u64>) -> Result<u64> {
    f().map_err(|err| {
        log::warn!("[HOARD] {} failed for {}: {}", name, owner, err);
        err
    })
}

#[cfg(test)]
mod tests {
    use super::aio::AioRequest;
    use super::kqueue::Knote;
    use super::ktimer::KTimer;
    use super::sigaltstack::SigAltStack;
    use super::*;
    use crate::cap::{Capability, Perms};
    use crate::mm::address::{VirtAddr, PAGE_SIZE};
    use crate::mm::map::VmMap;
    use crate::revoke::error::RevokeError;

    fn setup() -> VmMap {
        let map = VmMap::new(VirtAddr::new(0x100_0000), PAGE_SIZE);
        map.install_shadow().unwrap();
        map
    }

    fn live() -> Capability {
        Capability::new(0x200_0000, 0x100, Perms::USER_DATA)
    }

    fn revoke_all(
        registry: &HoarderRegistry,
        proc: &Arc<Process>,
        cookie: &Cookie<'_>,
        epoch: u64,
    ) -> Result<HoardTally> {
        let mut tally = HoardTally::default();
        registry.revoke_hoards(&[proc.clone()], cookie, epoch, &mut tally)?;
        Ok(tally)
    }

    fn hoarding_process() -> Arc<Process> {
        let proc = Arc::new(Process::new(1));
        proc.aio.submit(AioRequest {
            id: 1,
            buf: live(),
            sigev_value: Capability::untagged(5, 0, Perms::NONE),
        });
        proc.open_kqueue().register(Knote {
            ident: 3,
            filter: -1,
            udata: live(),
        });
        proc.timers.lock().push(KTimer {
            id: 9,
            sigev_value: live(),
        });
        let thread = proc.spawn_thread(10);
        thread.frame.lock().creg[4] = live();
        thread.frame.lock().ddc = live();
        *thread.sigaltstack.lock() = SigAltStack {
            ss_sp: live(),
            ss_size: 0x4000,
            ss_flags: 0,
        };
        proc
    }

    #[test]
    fn test_defaults_registered() {
        let registry = HoarderRegistry::with_defaults();
        assert_eq!(registry.len(), 5);
        let names: alloc::vec::Vec<_> = registry.iter().map(|(_, h)| h.name()).collect();
        assert_eq!(names, ["aio", "kqueue", "ktimer", "sigaltstack", "td_frame"]);
    }

    #[test]
    fn test_registry_full() {
        let mut registry = HoarderRegistry::with_defaults();
        for _ in registry.len()..MAX_HOARDERS {
            registry
                .register(Hoarder::Process {
                    name: "extra",
                    revoke: |_, _| Ok(0),
                })
                .unwrap();
        }
        assert_eq!(
            registry.register(Hoarder::Process {
                name: "extra",
                revoke: |_, _| Ok(0),
            }),
            Err(RevokeError::Resource(ResourceFault::RegistryFull))
        );
    }

    #[test]
    fn test_revoke_every_hoard() {
        let map = setup();
        let cookie = Cookie::init(&map).unwrap();
        let proc = hoarding_process();
        let registry = HoarderRegistry::with_defaults();

        let tally = revoke_all(&registry, &proc, &cookie, 1).unwrap();
        // aio buf, knote, timer, sigaltstack, two frame registers
        assert_eq!(tally.revoked, 6);
        assert_eq!(tally.callbacks, 5);

        assert!(!proc.aio.get(1).unwrap().buf.is_valid());
        assert!(!proc.kqueues.read()[0].get(3, -1).unwrap().udata.is_valid());
        assert!(!proc.timers.lock()[0].sigev_value.is_valid());
        let thread = &proc.threads()[0];
        assert!(!thread.sigaltstack.lock().ss_sp.is_valid());
        assert!(!thread.frame.lock().creg[4].is_valid());
        assert!(!thread.frame.lock().ddc.is_valid());
    }

    #[test]
    fn test_at_most_once_per_epoch() {
        let map = setup();
        let cookie = Cookie::init(&map).unwrap();
        let proc = hoarding_process();
        let registry = HoarderRegistry::with_defaults();

        revoke_all(&registry, &proc, &cookie, 1).unwrap();
        proc.timers.lock()[0].sigev_value = live();
        let again = revoke_all(&registry, &proc, &cookie, 1).unwrap();
        assert_eq!(again, HoardTally::default());
        assert!(proc.timers.lock()[0].sigev_value.is_valid());

        let next = revoke_all(&registry, &proc, &cookie, 2).unwrap();
        assert_eq!(next.revoked, 1);
    }

    #[test]
    fn test_kqueue_lock_held_fails() {
        let map = setup();
        let cookie = Cookie::init(&map).unwrap();
        let proc = hoarding_process();
        let registry = HoarderRegistry::with_defaults();

        let kq = proc.kqueues.read()[0].clone();
        {
            let _held = kq.lock();
            assert_eq!(
                revoke_all(&registry, &proc, &cookie, 1),
                Err(RevokeError::Hoarder {
                    hoarder: "kqueue",
                    owner: 1
                })
            );
        }
        // aio ran before the failure and is not repeated.
        let tally = revoke_all(&registry, &proc, &cookie, 1).unwrap();
        assert_eq!(tally.callbacks, 4);
    }

    #[test]
    fn test_failed_run_keeps_partial_tally() {
        let map = setup();
        let cookie = Cookie::init(&map).unwrap();
        let proc = hoarding_process();
        let registry = HoarderRegistry::with_defaults();

        let kq = proc.kqueues.read()[0].clone();
        let mut tally = HoardTally::default();
        {
            let _held = kq.lock();
            assert!(registry
                .revoke_hoards(&[proc.clone()], &cookie, 1, &mut tally)
                .is_err());
        }
        // The aio buffer was revoked before kqueue failed.
        assert_eq!(tally, HoardTally { revoked: 1, callbacks: 1 });

        registry
            .revoke_hoards(&[proc.clone()], &cookie, 1, &mut tally)
            .unwrap();
        assert_eq!(tally, HoardTally { revoked: 6, callbacks: 5 });
    }

    #[test]
    fn test_dead_owner_skipped() {
        let map = setup();
        let cookie = Cookie::init(&map).unwrap();
        let proc = hoarding_process();
        proc.exit();
        let registry = HoarderRegistry::with_defaults();
        let tally = revoke_all(&registry, &proc, &cookie, 1).unwrap();
        assert_eq!(tally, HoardTally::default());
    }
}
