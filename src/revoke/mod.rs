//! Revocation Engine
//!
//! Sessions, the page walker, the epoch controller and publication.
//!
//! # Flow
//! 1. Open a `Cookie` on a map and configure its predicate
//! 2. Drive an `EpochController` with one or more sweep calls
//! 3. The `LAST_FINI` call runs the hoarders and calls `publish`
//! 4. Allocators compare their `epoch_stamp` against the published
//!    generation before reusing memory
//!
//! # Memory Ordering
//! Sweep writes happen-before the generation store (release); a reader
//! that loads the generation with acquire sees every revoked image.

pub mod cookie;
pub mod epoch;
pub mod error;
pub mod info;
pub mod stats;
pub mod walker;

pub use cookie::{Cookie, CookieState, SlotOutcome};
pub use epoch::{EpochController, EpochState, Span, SweepFlags, SweepReport};
pub use error::{LifecycleFault, ResourceFault, Result, RevokeError};
pub use info::{EpochInfo, InfoPage};
pub use stats::{Counter, NullStats, RevokeStats, Stats, StatsSink, StatsSnapshot};
pub use walker::{walk_page, walk_page_ro, walk_page_with, PageOutcome};

/// Commit an epoch to the map's info page.
///
/// Returns the generation visible after the write. The generation never
/// moves backwards: publishing an older one leaves it unchanged.
pub fn publish(cookie: &Cookie<'_>, info: &EpochInfo) -> Result<u64> {
    cookie.check_live()?;
    let page = cookie.info();
    page.publish(info.generation, info);
    Ok(page.generation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address::{VirtAddr, PAGE_SIZE};
    use crate::mm::map::VmMap;

    fn setup() -> VmMap {
        let map = VmMap::new(VirtAddr::new(0x40_0000), PAGE_SIZE);
        map.install_shadow().unwrap();
        map
    }

    #[test]
    fn test_publish_is_monotonic() {
        let map = setup();
        let cookie = Cookie::init(&map).unwrap();
        let summary = EpochInfo {
            epoch_init: 3,
            generation: 3,
            pages_scanned: 10,
            caps_revoked: 2,
            bits_set: 2,
            excluded: 0,
        };
        assert_eq!(publish(&cookie, &summary), Ok(3));
        let stale = EpochInfo {
            generation: 1,
            ..summary
        };
        assert_eq!(publish(&cookie, &stale), Ok(3));
        assert_eq!(map.info().generation(), 3);
    }

    #[test]
    fn test_publish_needs_live_cookie() {
        let map = setup();
        let cookie = Cookie::init(&map).unwrap();
        cookie.release().unwrap();
        assert_eq!(
            publish(&cookie, &EpochInfo::default()),
            Err(RevokeError::Lifecycle(LifecycleFault::Released))
        );
    }
}
