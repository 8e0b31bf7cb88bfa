//! Processes and Threads
//!
//! The owning entities hoarders run for. Each carries the private state
//! its hoarders revoke, a liveness lock that keeps callbacks and teardown
//! apart, and a mark of which hoarders already ran this epoch.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock, RwLockReadGuard};

use super::aio::AioQueue;
use super::kqueue::KQueue;
use super::ktimer::KTimer;
use super::sigaltstack::SigAltStack;
use crate::arch::frame::TrapFrame;

/// Which hoarders have completed for an entity in one epoch.
#[derive(Debug, Default)]
pub struct HoardMark {
    inner: Mutex<(u64, u32)>,
}

impl HoardMark {
    /// Check if hoarder `slot` already ran for `epoch`.
    pub fn is_done(&self, epoch: u64, slot: usize) -> bool {
        let (marked, done) = *self.inner.lock();
        marked == epoch && done & (1 << slot) != 0
    }

    /// Record that hoarder `slot` ran for `epoch`.
    pub fn mark_done(&self, epoch: u64, slot: usize) {
        let mut inner = self.inner.lock();
        if inner.0 != epoch {
            *inner = (epoch, 0);
        }
        inner.1 |= 1 << slot;
    }
}

/// Liveness flag. Hoarders hold it shared; teardown takes it exclusively.
#[derive(Debug)]
struct Liveness(RwLock<bool>);

impl Liveness {
    fn new() -> Self {
        Self(RwLock::new(true))
    }

    fn pin(&self) -> Option<RwLockReadGuard<'_, bool>> {
        let guard = self.0.read();
        (*guard).then_some(guard)
    }

    fn kill(&self) -> bool {
        let mut alive = self.0.write();
        core::mem::replace(&mut *alive, false)
    }
}

/// A thread and the capability state it keeps outside memory.
#[derive(Debug)]
pub struct Thread {
    tid: u32,
    alive: Liveness,
    mark: HoardMark,
    /// Register state saved on kernel entry.
    pub frame: Mutex<TrapFrame>,
    /// Alternate signal stack.
    pub sigaltstack: Mutex<SigAltStack>,
}

impl Thread {
    /// A new live thread with an empty frame.
    pub fn new(tid: u32) -> Self {
        Self {
            tid,
            alive: Liveness::new(),
            mark: HoardMark::default(),
            frame: Mutex::new(TrapFrame::new()),
            sigaltstack: Mutex::new(SigAltStack::disabled()),
        }
    }

    /// Thread identifier.
    #[inline]
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Hold the thread alive for a hoarder callback.
    pub fn pin(&self) -> Option<RwLockReadGuard<'_, bool>> {
        self.alive.pin()
    }

    /// Per-epoch hoarder marks.
    #[inline]
    pub fn mark(&self) -> &HoardMark {
        &self.mark
    }

    /// Tear the thread down. Waits for running hoarders to finish.
    pub fn exit(&self) {
        if self.alive.kill() {
            *self.frame.lock() = TrapFrame::new();
            log::trace!("[HOARD] Thread {} exited", self.tid);
        }
    }
}

/// A process and the capability state its subsystems keep for it.
#[derive(Debug)]
pub struct Process {
    pid: u32,
    alive: Liveness,
    mark: HoardMark,
    threads: RwLock<Vec<Arc<Thread>>>,
    /// Outstanding asynchronous I/O requests.
    pub aio: AioQueue,
    /// Open event queues.
    pub kqueues: RwLock<Vec<Arc<KQueue>>>,
    /// Interval timers.
    pub timers: Mutex<Vec<KTimer>>,
}

impl Process {
    /// A new live process with no threads.
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            alive: Liveness::new(),
            mark: HoardMark::default(),
            threads: RwLock::new(Vec::new()),
            aio: AioQueue::new(),
            kqueues: RwLock::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Process identifier.
    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Add a thread.
    pub fn spawn_thread(&self, tid: u32) -> Arc<Thread> {
        let thread = Arc::new(Thread::new(tid));
        self.threads.write().push(thread.clone());
        thread
    }

    /// Snapshot of the live threads.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.read().clone()
    }

    /// Open an event queue.
    pub fn open_kqueue(&self) -> Arc<KQueue> {
        let kq = Arc::new(KQueue::new());
        self.kqueues.write().push(kq.clone());
        kq
    }

    /// Hold the process alive for a hoarder callback.
    pub fn pin(&self) -> Option<RwLockReadGuard<'_, bool>> {
        self.alive.pin()
    }

    /// Per-epoch hoarder marks.
    #[inline]
    pub fn mark(&self) -> &HoardMark {
        &self.mark
    }

    /// Tear the process down with all its threads. Waits for running
    /// hoarders to finish.
    pub fn exit(&self) {
        if !self.alive.kill() {
            return;
        }
        for thread in self.threads.write().drain(..) {
            thread.exit();
        }
        self.aio.clear();
        self.kqueues.write().clear();
        self.timers.lock().clear();
        log::debug!("[HOARD] Process {} exited", self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_resets_per_epoch() {
        let mark = HoardMark::default();
        mark.mark_done(3, 1);
        assert!(mark.is_done(3, 1));
        assert!(!mark.is_done(3, 0));
        assert!(!mark.is_done(4, 1));
        mark.mark_done(4, 0);
        assert!(!mark.is_done(4, 1));
    }

    #[test]
    fn test_exit_unpins() {
        let proc = Process::new(7);
        let thread = proc.spawn_thread(70);
        assert!(proc.pin().is_some());
        proc.exit();
        assert!(proc.pin().is_none());
        assert!(thread.pin().is_none());
        assert!(proc.threads().is_empty());
    }
}
