//! Address Types and Layout Constants
//!
//! Type-safe wrapper for user virtual addresses plus the granule
//! arithmetic the sweep relies on.
//!
//! # Layout
//! - Pages are 4 KiB
//! - Capabilities are 16 bytes and 16-byte aligned (one granule)
//! - A page holds 256 granules
//! - The shadow windows sit at fixed addresses above the user range

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Capability size in bytes (one tagged granule)
pub const CAP_SIZE: usize = 16;
/// Capability alignment mask
pub const CAP_MASK: usize = CAP_SIZE - 1;
/// Bits to shift for granule number
pub const CAP_SHIFT: usize = 4;

/// Capability granules per page
pub const GRANULES_PER_PAGE: usize = PAGE_SIZE / CAP_SIZE;

/// Highest user address (exclusive) that a swept map may cover
pub const USER_END: usize = 0x0000_4000_0000_0000;

/// Base of the shadow windows. Each window is `SHADOW_WINDOW` bytes and
/// holds one bit per granule of the user range.
pub const SHADOW_BASE: usize = 0x0000_7000_0000_0000;
/// Size of a single shadow window
pub const SHADOW_WINDOW: usize = USER_END >> (CAP_SHIFT + 3);

/// A user virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Create a new virtual address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Check if the address is capability-aligned.
    #[inline]
    pub const fn is_cap_aligned(self) -> bool {
        self.0 & CAP_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align the address up to the nearest page boundary.
    #[inline]
    pub const fn align_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Index of this address's granule within its page.
    #[inline]
    pub const fn granule_in_page(self) -> usize {
        self.page_offset() >> CAP_SHIFT
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Check if this is a user address.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < USER_END
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
