//! Capability Values and the Revocation Predicate
//!
//! # Design
//! - A capability is a tagged value: base, length, permissions, seal
//! - The predicate is a pure function of one capability and a small
//!   configuration of exempt classes
//!
//! # Security Properties
//! - Revocation only removes rights, never adds them
//! - A revoked image is never re-tagged
//! - Sealed capabilities are unsealed when revoked

pub mod capability;
pub mod predicate;

pub use capability::{Capability, ObjType, Perms, RevokeImage};
pub use predicate::{CoarseFlags, Predicate};
