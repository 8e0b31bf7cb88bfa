//! Event Queue Hoarder
//!
//! Registered event filters carry a user data capability returned with
//! every event. Each open queue has its own lock, which the owner may be
//! holding while it waits for events, so the hoarder only tries it a
//! bounded number of times.

use alloc::vec::Vec;
use core::hint::spin_loop;

use spin::Mutex;

use super::proc::Process;
use crate::arch::ctemp::CapTemp;
use crate::cap::Capability;
use crate::revoke::cookie::Cookie;
use crate::revoke::error::{Result, RevokeError};

/// Attempts to take a queue lock before giving up on the epoch.
pub const KQ_LOCK_RETRIES: usize = 64;

/// A registered event filter.
#[derive(Debug, Clone, Copy)]
pub struct Knote {
    /// Watched identifier (descriptor, timer id, ...).
    pub ident: u64,
    /// Filter kind.
    pub filter: i16,
    /// Opaque user data returned with events.
    pub udata: Capability,
}

/// One open event queue.
#[derive(Debug, Default)]
pub struct KQueue {
    knotes: Mutex<Vec<Knote>>,
}

impl KQueue {
    /// An empty queue.
    pub const fn new() -> Self {
        Self {
            knotes: Mutex::new(Vec::new()),
        }
    }

    /// Register a filter, replacing any with the same ident and kind.
    pub fn register(&self, knote: Knote) {
        let mut knotes = self.knotes.lock();
        match knotes
            .iter_mut()
            .find(|k| k.ident == knote.ident && k.filter == knote.filter)
        {
            Some(existing) => *existing = knote,
            None => knotes.push(knote),
        }
    }

    /// Look up a filter.
    pub fn get(&self, ident: u64, filter: i16) -> Option<Knote> {
        self.knotes
            .lock()
            .iter()
            .find(|k| k.ident == ident && k.filter == filter)
            .copied()
    }

    /// Hold the queue lock (as the owner does while scanning events).
    pub fn lock(&self) -> spin::MutexGuard<'_, Vec<Knote>> {
        self.knotes.lock()
    }
}

/// Revoke user data held by every open queue of a process.
pub fn revoke(proc: &Process, cookie: &Cookie<'_>) -> Result<u64> {
    let mut temp = CapTemp::new();
    let mut revoked = 0;
    for kq in proc.kqueues.read().iter() {
        let mut knotes = (0..KQ_LOCK_RETRIES)
            .find_map(|_| {
                let guard = kq.knotes.try_lock();
                if guard.is_none() {
                    spin_loop();
                }
                guard
            })
            .ok_or(RevokeError::Hoarder {
                hoarder: "kqueue",
                owner: proc.pid(),
            })?;
        for knote in knotes.iter_mut() {
            revoked += cookie.revoke_cap(&mut temp, &mut knote.udata) as u64;
        }
    }
    Ok(revoked)
}
