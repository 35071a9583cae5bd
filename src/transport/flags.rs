//! Capability flags and identifiers shared with the transport

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Per-batch read behaviour requested from the transport.
    ///
    /// Values match the acquisition transport's flag word so they can be
    /// passed through unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ScatterFlags: u32 {
        /// Bypass the transport's memory cache.
        const NOCACHE = 0x0001;
        /// Zero-fill ranges that could not be read and report success.
        const ZEROPAD_ON_FAIL = 0x0002;
        /// Serve reads from cache only.
        const FORCECACHE_READ = 0x0008;
        /// Do not resolve paged-out memory.
        const NOPAGING = 0x0010;
        /// Do not resolve paged-out memory that needs file I/O.
        const NOPAGING_IO = 0x0020;
        /// Do not store read results in the cache.
        const NOCACHEPUT = 0x0100;
        /// Only use cache entries fetched very recently.
        const CACHE_RECENT_ONLY = 0x0200;
        /// Disable read-ahead.
        const NO_PREDICTIVE_READ = 0x0400;
    }
}

impl ScatterFlags {
    /// Flags for a batch that either uses or bypasses the cache
    pub fn from_nocache(nocache: bool) -> Self {
        if nocache {
            Self::NOCACHE
        } else {
            Self::empty()
        }
    }
}

/// Target process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl Pid {
    /// Pseudo-process addressing physical memory directly
    pub const PHYSICAL: Pid = Pid(u32::MAX);

    /// Whether this pid addresses physical memory
    pub fn is_physical(&self) -> bool {
        *self == Self::PHYSICAL
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_physical() {
            write!(f, "physical")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Opaque transport-level scatter handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScatterHandle(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert_eq!(ScatterFlags::NOCACHE.bits(), 1);
        assert_eq!(ScatterFlags::from_nocache(true), ScatterFlags::NOCACHE);
        assert!(ScatterFlags::from_nocache(false).is_empty());
    }

    #[test]
    fn test_pid_display() {
        assert_eq!(Pid::PHYSICAL.to_string(), "physical");
        assert_eq!(Pid(4).to_string(), "4");
        assert!(!Pid(4).is_physical());
    }
}
