//! Revocation Errors
//!
//! Every failure the engine reports falls in one of four families. None
//! of them leaves a capability half-revoked or a generation published
//! early.

use core::fmt;

/// Error type for revocation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeError {
    /// A cookie or epoch was used out of order.
    Lifecycle(LifecycleFault),
    /// A resource the sweep needs is missing or unusable.
    Resource(ResourceFault),
    /// A page could not be read or written.
    Access {
        /// Faulting user address.
        addr: usize,
    },
    /// A hoarder callback failed; the epoch was not published.
    Hoarder {
        /// Name of the failing hoarder.
        hoarder: &'static str,
        /// Process or thread the callback was running for.
        owner: u32,
    },
}

/// Ways a cookie or epoch can be misused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleFault {
    /// The cookie has been released.
    Released,
    /// Another pass already holds the cookie.
    InUse,
    /// The sweep flags do not fit the epoch's current state.
    BadTransition,
    /// A range sweep was requested outside an incremental epoch.
    RangeWithoutIncremental,
    /// The cookie was initialised against a different map.
    ForeignCookie,
}

/// Missing or unusable resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceFault {
    /// The map has no shadow installed.
    ShadowMissing,
    /// A shadow is already installed.
    ShadowInstalled,
    /// A shadow capability does not cover its window.
    ShadowBounds,
    /// The map has been torn down.
    MapDead,
    /// The hoarder registry is full.
    RegistryFull,
}

impl fmt::Display for LifecycleFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released => write!(f, "cookie already released"),
            Self::InUse => write!(f, "cookie in use by another pass"),
            Self::BadTransition => write!(f, "sweep flags invalid in current epoch state"),
            Self::RangeWithoutIncremental => write!(f, "range sweep requires an incremental epoch"),
            Self::ForeignCookie => write!(f, "cookie belongs to another map"),
        }
    }
}

impl fmt::Display for ResourceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShadowMissing => write!(f, "no shadow installed"),
            Self::ShadowInstalled => write!(f, "shadow already installed"),
            Self::ShadowBounds => write!(f, "shadow capability out of bounds"),
            Self::MapDead => write!(f, "map torn down"),
            Self::RegistryFull => write!(f, "hoarder registry full"),
        }
    }
}

impl fmt::Display for RevokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifecycle(fault) => write!(f, "lifecycle error: {}", fault),
            Self::Resource(fault) => write!(f, "resource error: {}", fault),
            Self::Access { addr } => write!(f, "access error at {:#x}", addr),
            Self::Hoarder { hoarder, owner } => {
                write!(f, "hoarder {} failed for {}", hoarder, owner)
            }
        }
    }
}

impl From<LifecycleFault> for RevokeError {
    fn from(fault: LifecycleFault) -> Self {
        Self::Lifecycle(fault)
    }
}

impl From<ResourceFault> for RevokeError {
    fn from(fault: ResourceFault) -> Self {
        Self::Resource(fault)
    }
}

/// Result alias used across the engine.
pub type Result<T> = core::result::Result<T, RevokeError>;
