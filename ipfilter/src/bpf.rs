//! XDP loader and kernel map backend.
//!
//! [`IpFilter`] owns the loaded object and the attached program; [`BpfMaps`]
//! owns the map handles and implements [`FilterMaps`] for the reconciler.
//! Map keys are network byte order, the userspace model is host order.

use std::net::Ipv4Addr;
use std::num::NonZeroU32;
use std::path::Path;

use anyhow::{Context, Result};
use aya::{
    maps::{lpm_trie::Key, Array, HashMap, LpmTrie, Map, MapData, MapError},
    programs::{Xdp, XdpFlags},
    Ebpf,
};
use ipfilter_common::{
    maps, PacketStatsValue, RateLimitValue, GLOBAL_DROPPED, GLOBAL_PASSED, PROGRAM_NAME,
};
use tracing::{debug, info, warn};

use crate::error::TableError;
use crate::report::{GlobalTotals, IpStats};
use crate::rules::{BlacklistEntry, RateLimitRule};
use crate::state::{FilterMaps, StatsSource};

// =============================================================================
// Loader
// =============================================================================

pub struct IpFilter {
    bpf: Ebpf,
    interface: Option<String>,
}

impl IpFilter {
    /// Load the eBPF object at `path`, verify the program and take ownership
    /// of its maps. Nothing is attached yet.
    pub fn load(path: &Path) -> Result<(Self, BpfMaps)> {
        info!("Loading ipfilter XDP program from {}", path.display());
        let mut bpf = Ebpf::load_file(path)
            .with_context(|| format!("Failed to load eBPF object {}", path.display()))?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
            debug!("eBPF logger not available: {}", e);
        }

        let program: &mut Xdp = bpf
            .program_mut(PROGRAM_NAME)
            .context("XDP program not found")?
            .try_into()
            .context("Program is not XDP")?;
        program.load().context("Failed to load XDP program")?;
        info!("XDP program loaded");

        let maps = BpfMaps::take(&mut bpf)?;
        Ok((Self { bpf, interface: None }, maps))
    }

    /// Attach to `interface`, falling back to SKB mode when the requested
    /// mode is refused.
    pub fn attach(&mut self, interface: &str, flags: XdpFlags) -> Result<()> {
        let program: &mut Xdp = self
            .bpf
            .program_mut(PROGRAM_NAME)
            .context("XDP program not found")?
            .try_into()
            .context("Program is not XDP")?;

        match program.attach(interface, flags) {
            Ok(_) => {
                let mode = if flags.contains(XdpFlags::DRV_MODE) {
                    "native driver"
                } else if flags.contains(XdpFlags::SKB_MODE) {
                    "SKB"
                } else {
                    "default"
                };
                info!("XDP program attached to {} in {} mode", interface, mode);
            }
            Err(e) if !flags.contains(XdpFlags::SKB_MODE) => {
                warn!("Requested XDP mode failed ({}), trying SKB mode", e);
                program
                    .attach(interface, XdpFlags::SKB_MODE)
                    .context("Failed to attach XDP program in SKB mode")?;
                info!("XDP program attached to {} in SKB mode", interface);
            }
            Err(e) => return Err(e).context("Failed to attach XDP program"),
        }

        self.interface = Some(interface.to_string());
        Ok(())
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }
}

impl Drop for IpFilter {
    fn drop(&mut self) {
        if let Some(interface) = &self.interface {
            info!("Detaching XDP program from {}", interface);
        }
    }
}

// =============================================================================
// Maps
// =============================================================================

pub struct BpfMaps {
    blacklist: LpmTrie<MapData, u32, u8>,
    rate_limits: HashMap<MapData, u32, RateLimitValue>,
    ip_stats: HashMap<MapData, u32, PacketStatsValue>,
    global_stats: Array<MapData, u64>,
    generation: Array<MapData, u64>,
}

fn take_map(bpf: &mut Ebpf, name: &str) -> Result<Map> {
    bpf.take_map(name)
        .with_context(|| format!("{} map not found", name))
}

fn map_err(table: &'static str) -> impl Fn(MapError) -> TableError {
    move |e| TableError::Map { table, reason: e.to_string() }
}

impl BpfMaps {
    fn take(bpf: &mut Ebpf) -> Result<Self> {
        Ok(Self {
            blacklist: take_map(bpf, maps::BLACKLIST)?.try_into()?,
            rate_limits: take_map(bpf, maps::RATE_LIMITS)?.try_into()?,
            ip_stats: take_map(bpf, maps::IP_STATS)?.try_into()?,
            global_stats: take_map(bpf, maps::GLOBAL_STATS)?.try_into()?,
            generation: take_map(bpf, maps::GENERATION)?.try_into()?,
        })
    }

    /// Zero the global dropped/passed cells.
    pub fn reset_global_counters(&mut self) -> Result<()> {
        for index in [GLOBAL_DROPPED, GLOBAL_PASSED] {
            self.global_stats
                .set(index, 0u64, 0)
                .with_context(|| format!("Failed to reset global counter {}", index))?;
        }
        Ok(())
    }
}

/// Removing a key that is already gone is not an error.
fn ignore_missing(result: Result<(), MapError>) -> Result<(), MapError> {
    match result {
        Err(e) if is_missing(&e) => Ok(()),
        other => other,
    }
}

fn is_missing(err: &MapError) -> bool {
    if matches!(err, MapError::KeyNotFound) {
        return true;
    }
    // Deletes surface ENOENT as a syscall error wrapping an io::Error.
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return io.raw_os_error() == Some(libc::ENOENT);
        }
        source = e.source();
    }
    false
}

impl StatsSource for BpfMaps {
    fn global_totals(&self) -> Result<GlobalTotals, TableError> {
        let read = |index| {
            self.global_stats
                .get(&index, 0)
                .map_err(map_err("global_stats"))
        };
        Ok(GlobalTotals {
            dropped: read(GLOBAL_DROPPED)?,
            passed: read(GLOBAL_PASSED)?,
        })
    }

    fn ip_stats(&self) -> Result<Vec<IpStats>, TableError> {
        self.ip_stats
            .iter()
            .map(|item| {
                let (ip, value) = item.map_err(map_err("ip_stats"))?;
                Ok(IpStats {
                    ip: Ipv4Addr::from(u32::from_be(ip)),
                    dropped: value.dropped,
                    passed: value.passed,
                })
            })
            .collect()
    }
}

impl FilterMaps for BpfMaps {
    fn insert_blacklist(&mut self, entry: &BlacklistEntry) -> Result<(), TableError> {
        let key = Key::new(u32::from(entry.prefix_len()), entry.network().to_be());
        self.blacklist
            .insert(&key, 1u8, 0)
            .map_err(map_err("blacklist"))
    }

    fn remove_blacklist(&mut self, entry: &BlacklistEntry) -> Result<(), TableError> {
        let key = Key::new(u32::from(entry.prefix_len()), entry.network().to_be());
        ignore_missing(self.blacklist.remove(&key)).map_err(map_err("blacklist"))
    }

    fn upsert_rate_limit(&mut self, rule: &RateLimitRule) -> Result<(), TableError> {
        let value = RateLimitValue::new(rule.packets_per_second());
        self.rate_limits
            .insert(rule.ip().to_be(), value, 0)
            .map_err(map_err("rate_limits"))
    }

    fn remove_rate_limit(&mut self, ip: u32) -> Result<(), TableError> {
        ignore_missing(self.rate_limits.remove(&ip.to_be())).map_err(map_err("rate_limits"))
    }

    fn set_generation(&mut self, generation: u64) -> Result<(), TableError> {
        self.generation
            .set(0, generation, 0)
            .map_err(map_err("generation"))
    }

    fn generation(&self) -> Result<u64, TableError> {
        self.generation.get(&0, 0).map_err(map_err("generation"))
    }

    fn blacklist(&self) -> Result<Vec<BlacklistEntry>, TableError> {
        let mut entries = Vec::new();
        for key in self.blacklist.keys() {
            let key = key.map_err(map_err("blacklist"))?;
            let prefix_len = u8::try_from(key.prefix_len()).unwrap_or(u8::MAX);
            match BlacklistEntry::new(u32::from_be(key.data()), prefix_len) {
                Some(entry) => entries.push(entry),
                None => warn!("Ignoring blacklist key with prefix length {}", key.prefix_len()),
            }
        }
        entries.sort_unstable();
        Ok(entries)
    }

    fn rate_limits(&self) -> Result<Vec<RateLimitRule>, TableError> {
        let mut rules = Vec::new();
        for item in self.rate_limits.iter() {
            let (ip, value) = item.map_err(map_err("rate_limits"))?;
            if let Some(pps) = NonZeroU32::new(value.packets_per_second) {
                rules.push(RateLimitRule::new(u32::from_be(ip), pps));
            }
        }
        rules.sort_unstable_by_key(RateLimitRule::ip);
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_not_an_error() {
        assert!(ignore_missing(Err(MapError::KeyNotFound)).is_ok());
        assert!(ignore_missing(Ok(())).is_ok());
        assert!(ignore_missing(Err(MapError::ElementNotFound)).is_err());
    }

    #[test]
    fn test_map_err_names_table() {
        let err = map_err("blacklist")(MapError::KeyNotFound);
        assert!(err.to_string().starts_with("blacklist map operation failed"));
    }
}
