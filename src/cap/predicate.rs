//! Revocation Predicate
//!
//! Decides whether a capability must be revoked in the current sweep.
//!
//! # Immune Classes
//! Each coarse flag names a class of capabilities that the sweep may
//! ignore: those carrying none of the rights the flag watches.
//!
//! | Flag            | Watched rights     | Immune class rights      |
//! |-----------------|--------------------|--------------------------|
//! | `NO_COARSE_MEM` | `VMMAP`            | everything but `VMMAP`   |
//! | `NO_OTYPES`     | `SEAL`, `UNSEAL`   | everything but those two |
//! | `NO_CIDS`       | `SET_CID`          | everything but `SET_CID` |
//!
//! A capability is immune when its rights fit inside the union of the
//! immune-class rights of the set flags. With no flags set every tagged
//! capability is revoked; with all flags set none is.

use bitflags::bitflags;

use super::capability::{Capability, Perms};

bitflags! {
    /// Predicate configuration: which capability classes are exempt.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct CoarseFlags: u8 {
        /// Capabilities without VM-manipulation rights are immune.
        const NO_COARSE_MEM = 0x01;
        /// Capabilities without seal/unseal rights are immune.
        const NO_OTYPES = 0x02;
        /// Capabilities without compartment-identity rights are immune.
        const NO_CIDS = 0x04;
    }
}

impl CoarseFlags {
    /// Rights watched by a single flag.
    fn watched(self) -> Perms {
        let mut watched = Perms::NONE;
        if self.contains(Self::NO_COARSE_MEM) {
            watched = watched.union(Perms::VMMAP);
        }
        if self.contains(Self::NO_OTYPES) {
            watched = watched.union(Perms::SEAL).union(Perms::UNSEAL);
        }
        if self.contains(Self::NO_CIDS) {
            watched = watched.union(Perms::SET_CID);
        }
        watched
    }

    /// Union of the rights named by every set flag's immune class.
    pub fn immune_rights(self) -> Perms {
        self.iter()
            .fold(Perms::NONE, |acc, flag| acc.union(flag.watched().complement()))
    }
}

/// Check if `cap` falls into one of the immune classes of `flags`.
#[inline]
pub fn is_immune(cap: &Capability, flags: CoarseFlags) -> bool {
    !flags.is_empty() && flags.immune_rights().contains(cap.perms())
}

/// Coarse test: revoke iff tagged and not immune.
#[inline]
pub fn test(cap: &Capability, flags: CoarseFlags) -> bool {
    cap.tag() && !is_immune(cap, flags)
}

/// The closed set of predicates a sweep can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// Revoke every tagged capability outside the immune classes.
    Coarse(CoarseFlags),

    /// As `Coarse`, restricted to capabilities whose base lies in memory
    /// the allocator painted as freed.
    Painted(CoarseFlags),
}

impl Predicate {
    /// Revoke every tagged capability.
    pub const UNCONDITIONAL: Self = Self::Coarse(CoarseFlags::empty());

    /// The exemption flags in force.
    #[inline]
    pub const fn flags(self) -> CoarseFlags {
        match self {
            Self::Coarse(flags) | Self::Painted(flags) => flags,
        }
    }

    /// Same variant, different exemption flags.
    #[inline]
    pub const fn with_flags(self, flags: CoarseFlags) -> Self {
        match self {
            Self::Coarse(_) => Self::Coarse(flags),
            Self::Painted(_) => Self::Painted(flags),
        }
    }

    /// Evaluate the predicate.
    ///
    /// `painted` answers whether an address lies in painted memory; it is
    /// only consulted by `Painted`.
    #[inline]
    pub fn test<F>(self, cap: &Capability, painted: F) -> bool
    where
        F: FnOnce(usize) -> bool,
    {
        match self {
            Self::Coarse(flags) => test(cap, flags),
            Self::Painted(flags) => test(cap, flags) && painted(cap.base()),
        }
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Self::UNCONDITIONAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::capability::ObjType;

    fn caps() -> [Capability; 6] {
        let otype = ObjType::new(3).unwrap();
        [
            Capability::new(0x1000, 16, Perms::USER_DATA),
            Capability::new(0x1000, 16, Perms::USER_DATA | Perms::VMMAP),
            Capability::new(0x1000, 16, Perms::SEAL | Perms::UNSEAL),
            Capability::new(0x1000, 16, Perms::SET_CID | Perms::LOAD),
            Capability::new(0x1000, 16, Perms::ALL).sealed(otype),
            Capability::new(0x1000, 16, Perms::NONE),
        ]
    }

    #[test]
    fn test_no_flags_revokes_every_tagged_cap() {
        for cap in caps() {
            assert!(test(&cap, CoarseFlags::empty()));
        }
        let data = Capability::untagged(0x1000, 16, Perms::ALL);
        assert!(!test(&data, CoarseFlags::empty()));
    }

    #[test]
    fn test_all_flags_is_noop() {
        for cap in caps() {
            assert!(!test(&cap, CoarseFlags::all()));
        }
    }

    #[test]
    fn test_no_coarse_mem_exempts_plain_pointers() {
        let flags = CoarseFlags::NO_COARSE_MEM;
        let [plain, vmmap, ..] = caps();
        assert!(!test(&plain, flags));
        assert!(test(&vmmap, flags));
    }

    #[test]
    fn test_no_otypes_targets_sealing_rights() {
        let flags = CoarseFlags::NO_OTYPES;
        let [plain, _, sealer, cid, ..] = caps();
        assert!(!test(&plain, flags));
        assert!(test(&sealer, flags));
        assert!(!test(&cid, flags));
    }

    #[test]
    fn test_immune_iff_rights_subset() {
        for bits in 0..8u8 {
            let flags = CoarseFlags::from_bits_truncate(bits);
            if flags.is_empty() {
                continue;
            }
            let immune = flags.immune_rights();
            for cap in caps() {
                let expected = !immune.contains(cap.perms());
                assert_eq!(test(&cap, flags), expected, "{:?} {:?}", flags, cap);
            }
        }
    }

    #[test]
    fn test_painted_variant_consults_paint() {
        let cap = Capability::new(0x4000, 16, Perms::USER_DATA);
        let p = Predicate::Painted(CoarseFlags::empty());
        assert!(p.test(&cap, |addr| addr == 0x4000));
        assert!(!p.test(&cap, |_| false));
        assert!(Predicate::UNCONDITIONAL.test(&cap, |_| false));
    }
}
