//! Interval Timer Hoarder
//!
//! A timer armed with a signal notification keeps the value to deliver.

use super::proc::Process;
use crate::arch::ctemp::CapTemp;
use crate::cap::Capability;
use crate::revoke::cookie::Cookie;
use crate::revoke::error::Result;

/// A per-process interval timer.
#[derive(Debug, Clone, Copy)]
pub struct KTimer {
    /// Timer identifier.
    pub id: u32,
    /// Value delivered with the expiry signal.
    pub sigev_value: Capability,
}

/// Revoke the notification values of a process's timers.
pub fn revoke(proc: &Process, cookie: &Cookie<'_>) -> Result<u64> {
    let mut temp = CapTemp::new();
    let mut revoked = 0;
    for timer in proc.timers.lock().iter_mut() {
        if cookie.revoke_cap(&mut temp, &mut timer.sigev_value) {
            revoked += 1;
        }
    }
    Ok(revoked)
}
