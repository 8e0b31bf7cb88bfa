//! Saved Trap Frame
//!
//! The register state a thread leaves behind when it enters the kernel.
//! Every capability register is a place a live capability can hide from
//! the page sweep.
//!
//! This module is the only code that looks inside a frame. The thread
//! hoarder calls `td_frame_revoke` and nothing else.

use crate::arch::ctemp::CapTemp;
use crate::cap::Capability;
use crate::revoke::cookie::Cookie;

/// Number of general-purpose capability registers (c0-c30).
pub const NUM_CREGS: usize = 31;

/// Capability context saved on kernel entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    /// General purpose capability registers c0-c30
    pub creg: [Capability; NUM_CREGS],
    /// Stack pointer capability
    pub csp: Capability,
    /// Program counter capability (exception link)
    pub pcc: Capability,
    /// Default data capability
    pub ddc: Capability,
    /// Saved Program Status Register
    pub spsr: u64,
    /// Exception Syndrome Register
    pub esr: u64,
    /// Fault Address Register
    pub far: u64,
}

impl TrapFrame {
    /// An empty frame.
    pub const fn new() -> Self {
        Self {
            creg: [Capability::null(); NUM_CREGS],
            csp: Capability::null(),
            pcc: Capability::null(),
            ddc: Capability::null(),
            spsr: 0,
            esr: 0,
            far: 0,
        }
    }

    fn caps_mut(&mut self) -> impl Iterator<Item = &mut Capability> {
        self.creg
            .iter_mut()
            .chain(core::iter::once(&mut self.csp))
            .chain(core::iter::once(&mut self.pcc))
            .chain(core::iter::once(&mut self.ddc))
    }
}

/// Revoke every matching capability held in a saved frame.
///
/// Returns the number of registers revoked.
pub fn td_frame_revoke(frame: &mut TrapFrame, cookie: &Cookie<'_>) -> u64 {
    let mut temp = CapTemp::new();
    frame
        .caps_mut()
        .map(|reg| cookie.revoke_cap(&mut temp, reg))
        .filter(|&hit| hit)
        .count() as u64
}
