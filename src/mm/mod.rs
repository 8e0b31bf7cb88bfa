//! Memory Model for the Revocation Engine
//!
//! Provides:
//! - Address constants and `VirtAddr`
//! - Pages of capability granules with soft skip hints
//! - The swept address space (`VmMap`) and its mutator entry points
//! - Shadow bitmaps addressed by arithmetic from a granule address
//!
//! # Invariants
//! - A granule is only ever read or written under its own lock
//! - Shadow state is per map and outlives every cookie opened on it

pub mod address;
pub mod map;
pub mod page;
pub mod shadow;

pub use address::VirtAddr;
pub use map::VmMap;
pub use page::{Granule, Page, PageHints};
pub use shadow::{PaintBitmap, ShadowBitmap, ShadowRegion, ShadowSelector, ShadowView};
