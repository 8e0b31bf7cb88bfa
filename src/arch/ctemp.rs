//! Capability Scratch Register
//!
//! Capabilities moved between memory and the predicate pass through a
//! scratch slot. Each walker owns its own on the stack; nothing is
//! shared between CPUs.
//!
//! # Security Properties
//! - The slot is wiped after every transfer and on drop, so no capability
//!   survives in scratch state once the granule section ends
//! - Wiping uses volatile writes that cannot be optimised away

use core::ptr;
use core::sync::atomic::{compiler_fence, Ordering};

use crate::cap::Capability;

/// Owned scratch slot for one capability transfer at a time.
#[derive(Debug, Default)]
pub struct CapTemp {
    slot: Capability,
}

impl CapTemp {
    /// An empty scratch slot.
    #[inline]
    pub const fn new() -> Self {
        Self {
            slot: Capability::null(),
        }
    }

    /// Load `src` into the slot and return it.
    #[inline]
    pub fn load(&mut self, src: &Capability) -> &Capability {
        self.slot = *src;
        &self.slot
    }

    /// Store the slot back to `dst`, then wipe it.
    #[inline]
    pub fn store(&mut self, dst: &mut Capability) {
        *dst = self.slot;
        self.wipe();
    }

    /// Replace the slot contents.
    #[inline]
    pub fn set(&mut self, cap: Capability) {
        self.slot = cap;
    }

    /// Overwrite the slot with the null capability.
    #[inline]
    pub fn wipe(&mut self) {
        // SAFETY: `self.slot` is a valid, aligned, exclusively borrowed
        // Capability.
        unsafe {
            ptr::write_volatile(&mut self.slot, Capability::null());
        }
        compiler_fence(Ordering::SeqCst);
    }

    /// Check if the slot holds a tagged value.
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.slot.tag()
    }
}

impl Drop for CapTemp {
    fn drop(&mut self) {
        self.wipe();
    }
}
