//! In-process packet classifier over [`MemoryTables`].
//!
//! Mirrors the XDP program decision for decision: rate gate first, then the
//! longest-prefix blacklist match, otherwise pass. Every call is lock-free and
//! allocation-free; any number of threads may classify concurrently while a
//! reconciler updates the same tables.

use std::sync::Arc;

use ipfilter_common::{
    Admission, Verdict, ETH_HDR_LEN, ETH_P_IP, ETH_TYPE_OFFSET, IPV4_MIN_HDR_LEN, IPV4_SRC_OFFSET,
};

use crate::rate_limiter;
use crate::rules::BlacklistEntry;
use crate::state::MemoryTables;

#[derive(Clone)]
pub struct Classifier {
    tables: Arc<MemoryTables>,
}

impl Classifier {
    pub fn new(tables: Arc<MemoryTables>) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &Arc<MemoryTables> {
        &self.tables
    }

    /// Decide the fate of one packet from `src_ip` (host order) arriving at
    /// `now_ns`, and count it.
    pub fn classify(&self, src_ip: u32, now_ns: u64) -> Verdict {
        let tables = &*self.tables;
        let stats = tables.stats_slot(src_ip);

        if let Some(min_interval_ns) = tables.rate_limit_interval(src_ip) {
            let admission =
                rate_limiter::admit(tables.timestamps(), min_interval_ns, src_ip, now_ns);
            if admission == Admission::Rejected {
                tables.count_drop(stats);
                return Verdict::Drop;
            }
        }

        if tables.longest_match(src_ip).is_some() {
            tables.count_drop(stats);
            return Verdict::Drop;
        }

        tables.count_pass(stats);
        Verdict::Pass
    }

    /// Classify a raw Ethernet frame. Anything that is not a complete IPv4
    /// header passes uncounted.
    pub fn classify_frame(&self, frame: &[u8], now_ns: u64) -> Verdict {
        match source_ipv4(frame) {
            Some(src_ip) => self.classify(src_ip, now_ns),
            None => Verdict::Pass,
        }
    }

    /// Most specific blacklist entry covering `src_ip`, without counting.
    pub fn longest_match(&self, src_ip: u32) -> Option<BlacklistEntry> {
        self.tables.longest_match(src_ip)
    }
}

/// Source address (host order) of an Ethernet/IPv4 frame.
pub fn source_ipv4(frame: &[u8]) -> Option<u32> {
    if frame.len() < ETH_HDR_LEN + IPV4_MIN_HDR_LEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[ETH_TYPE_OFFSET], frame[ETH_TYPE_OFFSET + 1]]);
    if ethertype != ETH_P_IP {
        return None;
    }
    let src = ETH_HDR_LEN + IPV4_SRC_OFFSET;
    let bytes: [u8; 4] = frame[src..src + 4].try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}
