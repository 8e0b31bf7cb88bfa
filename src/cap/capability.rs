//! Capability Values
//!
//! The in-memory image of a hardware capability as the revocation engine
//! sees it.
//!
//! # Capability Structure
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Capability                          │
//! ├──────────────────────────────────────────────────────────┤
//! │  tag: bool               - Validity tag (hardware bit)   │
//! │  base: usize             - Lowest addressable byte       │
//! │  length: usize           - Size of the addressable range │
//! │  perms: Perms            - Permitted operations          │
//! │  otype: Option<ObjType>  - Seal (object type), if any    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Revoked Images
//! A revoked capability is never re-tagged by this crate. Its image is
//! either tagged with no permissions (`PermStrip`) or untagged
//! (`ClearTag`). In both cases a sealed input comes back unsealed.

use core::fmt;

/// Permissions carried by a capability.
///
/// Rights are a bitmask. Revocation only ever removes bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Perms(u32);

impl Perms {
    /// No permissions.
    pub const NONE: Self = Self(0);

    /// Capability may be stored anywhere (not stack-local).
    pub const GLOBAL: Self = Self(1 << 0);

    /// Instruction fetch.
    pub const EXECUTE: Self = Self(1 << 1);

    /// Data load.
    pub const LOAD: Self = Self(1 << 2);

    /// Data store.
    pub const STORE: Self = Self(1 << 3);

    /// Load of tagged capabilities.
    pub const LOAD_CAP: Self = Self(1 << 4);

    /// Store of tagged capabilities.
    pub const STORE_CAP: Self = Self(1 << 5);

    /// Store of non-global capabilities.
    pub const STORE_LOCAL_CAP: Self = Self(1 << 6);

    /// Seal other capabilities with an object type in range.
    pub const SEAL: Self = Self(1 << 7);

    /// Invoke sealed code/data pairs.
    pub const INVOKE: Self = Self(1 << 8);

    /// Unseal capabilities sealed with an object type in range.
    pub const UNSEAL: Self = Self(1 << 9);

    /// Access to privileged system registers.
    pub const SYSTEM_REGS: Self = Self(1 << 10);

    /// Set the compartment identifier.
    pub const SET_CID: Self = Self(1 << 11);

    /// Software permission: manipulate the address-space mapping
    /// (map, unmap, protect) through this capability.
    pub const VMMAP: Self = Self(1 << 15);

    /// All rights combined.
    pub const ALL: Self = Self(0x8FFF);

    /// Read and write data.
    pub const DATA_RW: Self = Self(Self::LOAD.0 | Self::STORE.0);

    /// Ordinary user heap pointer.
    pub const USER_DATA: Self = Self(
        Self::GLOBAL.0 | Self::LOAD.0 | Self::STORE.0 | Self::LOAD_CAP.0 | Self::STORE_CAP.0,
    );

    /// Create permissions from raw bits.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Get the raw bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check if these permissions include all of the specified ones.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if any of the specified permissions are present.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Combine two permission sets (union).
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Intersect two permission sets.
    #[inline]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Remove permissions.
    #[inline]
    pub const fn remove(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Everything in `ALL` that is not in `self`.
    #[inline]
    pub const fn complement(self) -> Self {
        Self(Self::ALL.0 & !self.0)
    }

    /// Check if empty (no permissions).
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for Perms {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for Perms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Perms({:#06x})", self.0)
    }
}

/// Object type used to seal a capability.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct ObjType(u32);

impl ObjType {
    /// Largest architecturally valid object type.
    pub const MAX: u32 = (1 << 18) - 1;

    /// Create an object type, or None if out of range.
    #[inline]
    pub const fn new(otype: u32) -> Option<Self> {
        if otype <= Self::MAX {
            Some(Self(otype))
        } else {
            None
        }
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

/// Shape of the image written over a revoked capability.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RevokeImage {
    /// Keep the tag, drop every permission and any seal.
    PermStrip,
    /// Clear the tag. Permissions and seal are dropped as well so that
    /// the bit pattern never looks like a sealed token.
    ClearTag,
}

impl RevokeImage {
    /// Image selected by the build configuration.
    #[cfg(not(feature = "cleartags"))]
    pub const DEFAULT: Self = Self::PermStrip;

    /// Image selected by the build configuration.
    #[cfg(feature = "cleartags")]
    pub const DEFAULT: Self = Self::ClearTag;
}

impl Default for RevokeImage {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// One capability-sized, capability-aligned granule of memory or a
/// capability register.
///
/// Untagged values are plain data that happens to share the layout.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Validity tag.
    tag: bool,

    /// Lowest address reachable through this capability.
    base: usize,

    /// Length of the reachable range in bytes.
    length: usize,

    /// Permissions granted by this capability.
    perms: Perms,

    /// Object type if sealed.
    otype: Option<ObjType>,
}

impl Capability {
    /// The null capability: untagged, no bounds, no rights.
    pub const fn null() -> Self {
        Self {
            tag: false,
            base: 0,
            length: 0,
            perms: Perms::NONE,
            otype: None,
        }
    }

    /// Create a tagged, unsealed capability.
    ///
    /// Minting is the job of the kernel's capability constructors; this
    /// is the value they produce.
    pub const fn new(base: usize, length: usize, perms: Perms) -> Self {
        Self {
            tag: true,
            base,
            length,
            perms,
            otype: None,
        }
    }

    /// Create an untagged value with the same layout (plain data).
    pub const fn untagged(base: usize, length: usize, perms: Perms) -> Self {
        Self {
            tag: false,
            base,
            length,
            perms,
            otype: None,
        }
    }

    /// Seal this capability with an object type.
    #[inline]
    pub const fn sealed(self, otype: ObjType) -> Self {
        Self {
            otype: Some(otype),
            ..self
        }
    }

    /// Check the validity tag.
    #[inline]
    pub const fn tag(&self) -> bool {
        self.tag
    }

    /// Check if the capability can still authorise anything.
    ///
    /// A tagged capability with no permissions is inert.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.tag && !self.perms.is_empty()
    }

    /// Get the base address.
    #[inline]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Get the length in bytes.
    #[inline]
    pub const fn length(&self) -> usize {
        self.length
    }

    /// One past the highest reachable address.
    #[inline]
    pub const fn top(&self) -> usize {
        self.base.saturating_add(self.length)
    }

    /// Get the permissions.
    #[inline]
    pub const fn perms(&self) -> Perms {
        self.perms
    }

    /// Get the object type, if sealed.
    #[inline]
    pub const fn otype(&self) -> Option<ObjType> {
        self.otype
    }

    /// Check if sealed.
    #[inline]
    pub const fn is_sealed(&self) -> bool {
        self.otype.is_some()
    }

    /// Check if `[addr, addr + len)` lies within the bounds.
    #[inline]
    pub const fn covers(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.top(),
            None => false,
        }
    }

    /// Check if this is the revoked image of some capability.
    #[inline]
    pub const fn is_revoked_image(&self) -> bool {
        self.perms.is_empty() && self.otype.is_none()
    }

    /// Compute the revoked image of this capability.
    ///
    /// Sealed inputs come back unsealed with no permissions, so software
    /// using the seal as a type tag sees a mismatch instead of a sealed
    /// but powerless value.
    pub const fn revoked(self, image: RevokeImage) -> Self {
        let stripped = Self {
            perms: Perms::NONE,
            otype: None,
            ..self
        };
        match image {
            RevokeImage::PermStrip => stripped,
            RevokeImage::ClearTag => Self {
                tag: false,
                ..stripped
            },
        }
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tag && self.perms.is_empty() && self.length == 0 {
            return write!(f, "Cap(null)");
        }
        write!(
            f,
            "Cap({}{:#x}+{:#x}, {:?}",
            if self.tag { "" } else { "untagged " },
            self.base,
            self.length,
            self.perms
        )?;
        if let Some(otype) = self.otype {
            write!(f, ", sealed={}", otype.value())?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoked_unsealed_keeps_bounds() {
        let cap = Capability::new(0x1000, 0x40, Perms::USER_DATA);
        let r = cap.revoked(RevokeImage::PermStrip);
        assert!(r.tag());
        assert!(!r.is_valid());
        assert_eq!(r.base(), 0x1000);
        assert_eq!(r.length(), 0x40);
        assert!(r.is_revoked_image());
    }

    #[test]
    fn test_revoked_sealed_is_unsealed() {
        let otype = ObjType::new(7).unwrap();
        let cap = Capability::new(0x2000, 0x10, Perms::USER_DATA | Perms::INVOKE).sealed(otype);
        for image in [RevokeImage::PermStrip, RevokeImage::ClearTag] {
            let r = cap.revoked(image);
            assert!(!r.is_sealed());
            assert!(r.perms().is_empty());
        }
    }

    #[test]
    fn test_cleartag_image() {
        let cap = Capability::new(0x3000, 0x10, Perms::DATA_RW);
        let r = cap.revoked(RevokeImage::ClearTag);
        assert!(!r.tag());
        assert!(!r.is_valid());
    }

    #[test]
    fn test_revocation_is_idempotent() {
        let cap = Capability::new(0x3000, 0x10, Perms::ALL);
        let once = cap.revoked(RevokeImage::PermStrip);
        assert_eq!(once.revoked(RevokeImage::PermStrip), once);
    }

    #[test]
    fn test_perms_complement() {
        assert_eq!(Perms::ALL.complement(), Perms::NONE);
        assert!(!Perms::VMMAP.complement().contains(Perms::VMMAP));
        assert!(Perms::VMMAP.complement().contains(Perms::SEAL));
    }

    #[test]
    fn test_covers() {
        let cap = Capability::new(0x1000, 0x100, Perms::LOAD);
        assert!(cap.covers(0x1000, 0x100));
        assert!(!cap.covers(0x10ff, 2));
        assert!(!cap.covers(usize::MAX, 2));
    }
}
