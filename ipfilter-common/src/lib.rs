//! ipfilter common types
//!
//! Shared between the XDP program (`ipfilter-ebpf`) and the userspace
//! control plane (`ipfilter`). Everything here is `no_std` and
//! allocation-free so it can run on the fast path.
//!
//! Map value layouts are `#[repr(C)]` and must stay byte-compatible with the
//! maps declared by the eBPF program. The `user` feature adds `aya::Pod`
//! impls so the userspace loader can read and write them.

#![cfg_attr(not(test), no_std)]

use core::num::NonZeroU32;

// =============================================================================
// Capacities and map names
// =============================================================================

/// Maximum entries in every per-IP table and in the blacklist trie.
pub const MAX_ENTRIES: u32 = 1024;

/// Longest IPv4 prefix.
pub const MAX_PREFIX_LEN: u8 = 32;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Index of the dropped counter in `GLOBAL_STATS`.
pub const GLOBAL_DROPPED: u32 = 0;
/// Index of the passed counter in `GLOBAL_STATS`.
pub const GLOBAL_PASSED: u32 = 1;

/// BPF map names (must match the `#[map]` statics in ipfilter-ebpf).
pub mod maps {
    pub const BLACKLIST: &str = "BLACKLIST";
    pub const RATE_LIMITS: &str = "RATE_LIMITS";
    pub const TIMESTAMPS: &str = "TIMESTAMPS";
    pub const IP_STATS: &str = "IP_STATS";
    pub const GLOBAL_STATS: &str = "GLOBAL_STATS";
    pub const GENERATION: &str = "GENERATION";
}

/// Name of the XDP entry point.
pub const PROGRAM_NAME: &str = "ipfilter";

// =============================================================================
// Frame layout
// =============================================================================

pub const ETH_HDR_LEN: usize = 14;
/// Offset of the EtherType field in the Ethernet header.
pub const ETH_TYPE_OFFSET: usize = 12;
pub const ETH_P_IP: u16 = 0x0800;
pub const IPV4_MIN_HDR_LEN: usize = 20;
/// Offset of the source address in the IPv4 header.
pub const IPV4_SRC_OFFSET: usize = 12;

// =============================================================================
// Map values
// =============================================================================

/// Rate-limit rule as stored in `RATE_LIMITS` (keyed by source IP).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateLimitValue {
    pub packets_per_second: u32,
    pub _pad: u32,
    /// Minimum gap between two admitted packets.
    pub min_interval_ns: u64,
}

impl RateLimitValue {
    pub fn new(packets_per_second: NonZeroU32) -> Self {
        Self {
            packets_per_second: packets_per_second.get(),
            _pad: 0,
            min_interval_ns: min_interval_ns(packets_per_second),
        }
    }
}

/// Last admitted packet time for a rate-limited source (`TIMESTAMPS`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimestampValue {
    pub last_accept_ns: u64,
}

/// Per-source counters (`IP_STATS`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketStatsValue {
    pub dropped: u64,
    pub passed: u64,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for RateLimitValue {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for TimestampValue {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for PacketStatsValue {}

// =============================================================================
// Prefix and rate math
// =============================================================================

/// Netmask for a prefix length, in host order. Lengths above 32 saturate.
#[inline(always)]
pub const fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= MAX_PREFIX_LEN {
        u32::MAX
    } else {
        u32::MAX << (MAX_PREFIX_LEN - prefix_len)
    }
}

/// Whether `ip` falls inside `network/prefix_len` (host order).
#[inline(always)]
pub const fn prefix_contains(network: u32, prefix_len: u8, ip: u32) -> bool {
    let mask = prefix_mask(prefix_len);
    ip & mask == network & mask
}

/// `1s / pps`, truncated.
#[inline(always)]
pub const fn min_interval_ns(packets_per_second: NonZeroU32) -> u64 {
    NSEC_PER_SEC / packets_per_second.get() as u64
}

// =============================================================================
// Decisions
// =============================================================================

/// Outcome of the fixed-interval rate gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

/// Fixed-interval gate: admit only when a full interval has elapsed since the
/// last admitted packet. A `now_ns` earlier than `last_accept_ns` counts as
/// zero elapsed.
///
/// Callers store `now_ns` as the new `last_accept_ns` only on `Admitted`;
/// rejected packets never move the reference point.
#[inline(always)]
pub const fn gate(min_interval_ns: u64, last_accept_ns: u64, now_ns: u64) -> Admission {
    if now_ns.saturating_sub(last_accept_ns) >= min_interval_ns {
        Admission::Admitted
    } else {
        Admission::Rejected
    }
}

/// Per-packet verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Drop,
}

impl Verdict {
    pub const fn is_drop(self) -> bool {
        matches!(self, Verdict::Drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pps(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn test_prefix_mask_bounds() {
        assert_eq!(prefix_mask(0), 0);
        assert_eq!(prefix_mask(8), 0xFF00_0000);
        assert_eq!(prefix_mask(24), 0xFFFF_FF00);
        assert_eq!(prefix_mask(32), u32::MAX);
        assert_eq!(prefix_mask(40), u32::MAX);
    }

    #[test]
    fn test_prefix_contains() {
        // 10.0.0.0/8
        assert!(prefix_contains(0x0A00_0000, 8, 0x0A01_0203));
        assert!(!prefix_contains(0x0A00_0000, 8, 0x0B00_0001));
        // /0 contains everything
        assert!(prefix_contains(0, 0, 0xDEAD_BEEF));
        // host bits in the network are ignored
        assert!(prefix_contains(0x0A00_0001, 24, 0x0A00_00FE));
    }

    #[test]
    fn test_min_interval() {
        assert_eq!(min_interval_ns(pps(10)), 100_000_000);
        assert_eq!(min_interval_ns(pps(1)), NSEC_PER_SEC);
        assert_eq!(min_interval_ns(pps(3)), 333_333_333);
        assert_eq!(RateLimitValue::new(pps(1000)).min_interval_ns, 1_000_000);
    }

    #[test]
    fn test_gate_boundary_is_inclusive() {
        assert_eq!(gate(100, 0, 100), Admission::Admitted);
        assert_eq!(gate(100, 0, 99), Admission::Rejected);
    }

    #[test]
    fn test_gate_clock_going_backwards() {
        assert_eq!(gate(100, 500, 400), Admission::Rejected);
        assert_eq!(gate(0, 500, 400), Admission::Admitted);
    }

    #[test]
    fn test_value_layouts() {
        assert_eq!(core::mem::size_of::<RateLimitValue>(), 16);
        assert_eq!(core::mem::size_of::<TimestampValue>(), 8);
        assert_eq!(core::mem::size_of::<PacketStatsValue>(), 16);
    }
}
