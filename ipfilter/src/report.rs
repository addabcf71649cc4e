//! Statistics snapshots and the `stats.txt` table.

use std::io::{self, Write};
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::error::TableError;
use crate::state::StatsSource;

/// Packet totals across all sources.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GlobalTotals {
    pub dropped: u64,
    pub passed: u64,
}

impl GlobalTotals {
    pub fn total(&self) -> u64 {
        self.dropped.saturating_add(self.passed)
    }
}

/// Counters for one source address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IpStats {
    pub ip: Ipv4Addr,
    pub dropped: u64,
    pub passed: u64,
}

impl IpStats {
    pub fn total(&self) -> u64 {
        self.dropped.saturating_add(self.passed)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    pub totals: GlobalTotals,
    /// Sources with at least one counted packet, most dropped first.
    pub entries: Vec<IpStats>,
}

/// Read a consistent-enough snapshot of all counters. Counters keep moving
/// while this runs; each value is read once.
pub fn report<S: StatsSource + ?Sized>(source: &S) -> Result<StatsReport, TableError> {
    let totals = source.global_totals()?;
    let mut entries: Vec<IpStats> = source
        .ip_stats()?
        .into_iter()
        .filter(|s| s.total() > 0)
        .collect();

    // Most dropped first; ties by total then address so output is stable.
    entries.sort_by(|a, b| {
        b.dropped
            .cmp(&a.dropped)
            .then(b.total().cmp(&a.total()))
            .then(a.ip.cmp(&b.ip))
    });

    Ok(StatsReport { totals, entries })
}

impl StatsReport {
    /// The first `n` entries in report order.
    pub fn top(&self, n: usize) -> &[IpStats] {
        &self.entries[..n.min(self.entries.len())]
    }

    pub fn totals_line(&self) -> String {
        format!(
            "Total packets: {} (Dropped: {}, Passed: {})",
            self.totals.total(),
            self.totals.dropped,
            self.totals.passed
        )
    }

    /// Render the plain-text statistics table.
    pub fn write_table<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{}", self.totals_line())?;

        if self.entries.is_empty() {
            writeln!(out, "No packet statistics recorded.")?;
            return Ok(());
        }

        writeln!(
            out,
            "{:<15}  {:>10}  {:>10}  {:>10}",
            "IP Address", "Dropped", "Passed", "Total"
        )?;
        writeln!(out, "{}", "-".repeat(51))?;
        for s in &self.entries {
            writeln!(
                out,
                "{:<15}  {:>10}  {:>10}  {:>10}",
                s.ip.to_string(),
                s.dropped,
                s.passed,
                s.total()
            )?;
        }
        Ok(())
    }
}
