//! ipfilter XDP program
//!
//! Per packet: Ethernet/IPv4 bounds checks, then
//! 1. per-source rate gate (fixed interval),
//! 2. longest-prefix blacklist match,
//! 3. pass.
//!
//! Everything that is not a well-formed IPv4 frame passes uncounted. All
//! tables are written by the userspace reconciler; this program only creates
//! timestamp and per-source stats entries.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::{
    bindings::{xdp_action, BPF_F_NO_PREALLOC, BPF_NOEXIST},
    helpers::bpf_ktime_get_ns,
    macros::{map, xdp},
    maps::{lpm_trie::Key, Array, HashMap, LpmTrie},
    programs::XdpContext,
};
use ipfilter_common::{
    gate, Admission, PacketStatsValue, RateLimitValue, TimestampValue, Verdict, ETH_HDR_LEN,
    ETH_P_IP, ETH_TYPE_OFFSET, GLOBAL_DROPPED, GLOBAL_PASSED, IPV4_MIN_HDR_LEN, IPV4_SRC_OFFSET,
    MAX_ENTRIES, MAX_PREFIX_LEN,
};

// =============================================================================
// Maps
// =============================================================================

/// Blacklisted prefixes. Key data is the network address in network order.
#[map]
static BLACKLIST: LpmTrie<u32, u8> = LpmTrie::with_max_entries(MAX_ENTRIES, BPF_F_NO_PREALLOC);

/// Source IP (network order) -> rate limit rule
#[map]
static RATE_LIMITS: HashMap<u32, RateLimitValue> = HashMap::with_max_entries(MAX_ENTRIES, 0);

/// Source IP (network order) -> last admitted packet time
#[map]
static TIMESTAMPS: HashMap<u32, TimestampValue> = HashMap::with_max_entries(MAX_ENTRIES, 0);

/// Source IP (network order) -> dropped/passed counters
#[map]
static IP_STATS: HashMap<u32, PacketStatsValue> = HashMap::with_max_entries(MAX_ENTRIES, 0);

/// Index 0: dropped, index 1: passed
#[map]
static GLOBAL_STATS: Array<u64> = Array::with_max_entries(2, 0);

/// Bumped by userspace after every reconciliation pass.
#[map]
static GENERATION: Array<u64> = Array::with_max_entries(1, 0);

// =============================================================================
// Entry point
// =============================================================================

#[xdp]
pub fn ipfilter(ctx: XdpContext) -> u32 {
    match try_ipfilter(&ctx) {
        Ok(ret) => ret,
        Err(_) => xdp_action::XDP_PASS,
    }
}

#[inline(always)]
fn try_ipfilter(ctx: &XdpContext) -> Result<u32, ()> {
    let data = ctx.data();
    let data_end = ctx.data_end();

    // Bounds check for Ethernet header
    if data + ETH_HDR_LEN > data_end {
        return Ok(xdp_action::XDP_PASS);
    }

    let ethertype = unsafe { u16::from_be(*((data + ETH_TYPE_OFFSET) as *const u16)) };
    if ethertype != ETH_P_IP {
        return Ok(xdp_action::XDP_PASS);
    }

    // Bounds check for IP header
    if data + ETH_HDR_LEN + IPV4_MIN_HDR_LEN > data_end {
        return Ok(xdp_action::XDP_PASS);
    }

    let ip_hdr = data + ETH_HDR_LEN;
    // Network order, used as-is for every map key
    let src_ip = unsafe { *((ip_hdr + IPV4_SRC_OFFSET) as *const u32) };
    let now = unsafe { bpf_ktime_get_ns() };

    Ok(match classify(src_ip, now) {
        Verdict::Pass => xdp_action::XDP_PASS,
        Verdict::Drop => xdp_action::XDP_DROP,
    })
}

// =============================================================================
// Decision
// =============================================================================

#[inline(always)]
fn classify(src_ip: u32, now: u64) -> Verdict {
    let stats = ip_stats(src_ip);

    if let Some(rule) = unsafe { RATE_LIMITS.get(&src_ip) } {
        if rate_gate(src_ip, rule.min_interval_ns, now) == Admission::Rejected {
            return drop_packet(stats);
        }
    }

    let key = Key::new(MAX_PREFIX_LEN as u32, src_ip);
    if BLACKLIST.get(&key).is_some() {
        return drop_packet(stats);
    }

    pass_packet(stats)
}

#[inline(always)]
fn rate_gate(src_ip: u32, min_interval_ns: u64, now: u64) -> Admission {
    match TIMESTAMPS.get_ptr_mut(&src_ip) {
        Some(ts) => {
            let last = unsafe { (*ts).last_accept_ns };
            let admission = gate(min_interval_ns, last, now);
            if admission == Admission::Admitted {
                unsafe { (*ts).last_accept_ns = now };
            }
            admission
        }
        None => {
            // First packet from this source. A full table admits.
            let _ = TIMESTAMPS.insert(&src_ip, &TimestampValue { last_accept_ns: now }, 0);
            Admission::Admitted
        }
    }
}

/// Per-source counters, created on first sight. `None` when the map is full.
#[inline(always)]
fn ip_stats(src_ip: u32) -> Option<*mut PacketStatsValue> {
    if let Some(stats) = IP_STATS.get_ptr_mut(&src_ip) {
        return Some(stats);
    }
    let _ = IP_STATS.insert(&src_ip, &PacketStatsValue::default(), BPF_NOEXIST as u64);
    IP_STATS.get_ptr_mut(&src_ip)
}

#[inline(always)]
fn increment(counter: *mut u64) {
    unsafe { AtomicU64::from_ptr(counter) }.fetch_add(1, Ordering::Relaxed);
}

#[inline(always)]
fn drop_packet(stats: Option<*mut PacketStatsValue>) -> Verdict {
    if let Some(stats) = stats {
        increment(unsafe { core::ptr::addr_of_mut!((*stats).dropped) });
    }
    if let Some(total) = GLOBAL_STATS.get_ptr_mut(GLOBAL_DROPPED) {
        increment(total);
    }
    Verdict::Drop
}

#[inline(always)]
fn pass_packet(stats: Option<*mut PacketStatsValue>) -> Verdict {
    if let Some(stats) = stats {
        increment(unsafe { core::ptr::addr_of_mut!((*stats).passed) });
    }
    if let Some(total) = GLOBAL_STATS.get_ptr_mut(GLOBAL_PASSED) {
        increment(total);
    }
    Verdict::Pass
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
