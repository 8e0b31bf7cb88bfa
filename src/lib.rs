//! caprevoke - Capability Revocation for Temporal Memory Safety
//!
//! When memory is freed on a capability machine, every live capability
//! into it must be neutralised before the memory is reused. This crate is
//! the kernel half of that protocol.
//!
//! # Components
//! - Predicate: which capabilities a sweep revokes (`cap`)
//! - Shadow bitmaps and the swept address space (`mm`)
//! - Cookie, page walker, epoch controller, publication (`revoke`)
//! - Subsystems that hold capabilities outside swept memory (`hoard`)
//! - Saved register state and the walker's scratch register (`arch`)
//!
//! # Guarantees
//! - A capability derived before epoch G began, into memory freed before
//!   G began, has no valid copy once G is published
//! - A mutator never observes a half-revoked capability
//! - Revocation only removes rights
//!
//! # Usage
//! ```ignore
//! let cookie = Cookie::init(&map)?;
//! let controller = EpochController::new(&map);
//! controller.sweep(&cookie, SweepFlags::empty(), Span::All)?;
//! cookie.release()?;
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod cap;
pub mod hoard;
pub mod mm;
pub mod revoke;

pub use cap::{Capability, CoarseFlags, ObjType, Perms, Predicate, RevokeImage};
pub use hoard::{Hoarder, HoarderRegistry, Process, Thread};
pub use mm::{VirtAddr, VmMap};
pub use revoke::{
    publish, Cookie, EpochController, EpochInfo, EpochState, InfoPage, RevokeError, Span,
    SweepFlags, SweepReport,
};
