//! Alternate Signal Stack Hoarder

use super::proc::Thread;
use crate::arch::ctemp::CapTemp;
use crate::cap::Capability;
use crate::revoke::cookie::Cookie;
use crate::revoke::error::Result;

/// `ss_flags` value: the stack is disabled.
pub const SS_DISABLE: u32 = 0x4;

/// A thread's alternate signal stack.
#[derive(Debug, Clone, Copy)]
pub struct SigAltStack {
    /// Stack base.
    pub ss_sp: Capability,
    /// Stack size in bytes.
    pub ss_size: usize,
    /// Stack flags.
    pub ss_flags: u32,
}

impl SigAltStack {
    /// No alternate stack.
    pub const fn disabled() -> Self {
        Self {
            ss_sp: Capability::null(),
            ss_size: 0,
            ss_flags: SS_DISABLE,
        }
    }
}

/// Revoke a thread's alternate stack pointer.
pub fn revoke(thread: &Thread, cookie: &Cookie<'_>) -> Result<u64> {
    let mut temp = CapTemp::new();
    let mut stack = thread.sigaltstack.lock();
    Ok(cookie.revoke_cap(&mut temp, &mut stack.ss_sp) as u64)
}
