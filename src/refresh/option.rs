//! Cache categories the transport can be asked to refresh

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::config::{
    DEFAULT_REFRESH_FAST, DEFAULT_REFRESH_MEDIUM, DEFAULT_REFRESH_MEM, DEFAULT_REFRESH_SLOW,
    DEFAULT_REFRESH_TLB,
};

/// A transport cache category, identified by its configuration option id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RefreshOption {
    /// Every cache
    All,
    /// Memory cache, fully
    Mem,
    /// Memory cache, partially per call
    MemPartial,
    /// Page table (TLB) cache, fully
    Tlb,
    /// Page table (TLB) cache, partially per call
    TlbPartial,
    /// Fast-frequency refresh
    Fast,
    /// Medium-frequency refresh
    Medium,
    /// Slow-frequency refresh
    Slow,
}

impl RefreshOption {
    /// Every option, in declaration order
    pub const ALL_OPTIONS: [RefreshOption; 8] = [
        RefreshOption::All,
        RefreshOption::Mem,
        RefreshOption::MemPartial,
        RefreshOption::Tlb,
        RefreshOption::TlbPartial,
        RefreshOption::Fast,
        RefreshOption::Medium,
        RefreshOption::Slow,
    ];

    /// Transport configuration option id
    pub fn id(&self) -> u64 {
        match self {
            RefreshOption::All => 0x2001_ffff_0000_0000,
            RefreshOption::Mem => 0x2001_1000_0000_0000,
            RefreshOption::MemPartial => 0x2001_0002_0000_0000,
            RefreshOption::Tlb => 0x2001_0800_0000_0000,
            RefreshOption::TlbPartial => 0x2001_0004_0000_0000,
            RefreshOption::Fast => 0x2001_0400_0000_0000,
            RefreshOption::Medium => 0x2001_0001_0000_0000,
            RefreshOption::Slow => 0x2001_0010_0000_0000,
        }
    }

    /// Option for a transport option id
    pub fn from_id(id: u64) -> Option<Self> {
        Self::ALL_OPTIONS.into_iter().find(|option| option.id() == id)
    }

    /// Short name used in logs and thread names
    pub fn name(&self) -> &'static str {
        match self {
            RefreshOption::All => "all",
            RefreshOption::Mem => "mem",
            RefreshOption::MemPartial => "mem-partial",
            RefreshOption::Tlb => "tlb",
            RefreshOption::TlbPartial => "tlb-partial",
            RefreshOption::Fast => "fast",
            RefreshOption::Medium => "medium",
            RefreshOption::Slow => "slow",
        }
    }

    /// Option for a short name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL_OPTIONS
            .into_iter()
            .find(|option| option.name().eq_ignore_ascii_case(name))
    }

    /// Reasonable tick interval for this category
    pub fn default_interval(&self) -> Duration {
        match self {
            RefreshOption::Mem | RefreshOption::MemPartial => DEFAULT_REFRESH_MEM,
            RefreshOption::Tlb | RefreshOption::TlbPartial => DEFAULT_REFRESH_TLB,
            RefreshOption::Fast => DEFAULT_REFRESH_FAST,
            RefreshOption::Medium => DEFAULT_REFRESH_MEDIUM,
            RefreshOption::All | RefreshOption::Slow => DEFAULT_REFRESH_SLOW,
        }
    }
}

impl fmt::Display for RefreshOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_distinct_and_roundtrip() {
        let ids: HashSet<u64> = RefreshOption::ALL_OPTIONS.iter().map(|o| o.id()).collect();
        assert_eq!(ids.len(), RefreshOption::ALL_OPTIONS.len());

        for option in RefreshOption::ALL_OPTIONS {
            assert_eq!(RefreshOption::from_id(option.id()), Some(option));
            assert_eq!(RefreshOption::from_name(option.name()), Some(option));
        }
        assert_eq!(RefreshOption::from_id(0), None);
        assert_eq!(RefreshOption::from_name("TLB"), Some(RefreshOption::Tlb));
    }
}
