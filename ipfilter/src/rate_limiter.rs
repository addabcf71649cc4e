//! Fixed-interval rate gate over the timestamp table.
//!
//! Same decision as the XDP program: one admitted packet per
//! `min_interval_ns`, rejected packets do not move the reference point.

use std::sync::atomic::Ordering;

pub use ipfilter_common::Admission;
use ipfilter_common::gate;

use crate::state::TimestampRecord;
use crate::table::FixedTable;

impl TimestampRecord {
    /// Admit if a full interval has elapsed and record `now_ns`. When two
    /// threads race on the same record only the one whose store lands is
    /// admitted. A record still at [`TimestampRecord::UNSET`] belongs to a
    /// source whose first packet is being admitted right now, so it rejects.
    pub fn try_admit(&self, min_interval_ns: u64, now_ns: u64) -> Admission {
        let last = self.last_accept_ns.load(Ordering::Acquire);
        match gate(min_interval_ns, last, now_ns) {
            Admission::Rejected => Admission::Rejected,
            Admission::Admitted => match self.last_accept_ns.compare_exchange(
                last,
                now_ns,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => Admission::Admitted,
                Err(_) => Admission::Rejected,
            },
        }
    }
}

/// Gate a packet from `ip`. The first packet from a source creates its record
/// and is admitted. A full timestamp table admits everything it cannot track.
pub fn admit(
    timestamps: &FixedTable<TimestampRecord>,
    min_interval_ns: u64,
    ip: u32,
    now_ns: u64,
) -> Admission {
    let entry = timestamps.get_or_insert(u64::from(ip), |record| {
        record.last_accept_ns.store(now_ns, Ordering::Release)
    });
    match entry {
        Some(entry) if entry.inserted => Admission::Admitted,
        Some(entry) => entry.value.try_admit(min_interval_ns, now_ns),
        None => Admission::Admitted,
    }
}
