//! Config reconciler.
//!
//! Each pass parses a config snapshot, diffs it against the canonical copy of
//! what is live in the shared tables, and applies the minimal set of removals
//! then insertions/updates. Passes are serialized by the caller (`&mut self`).

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::monotonic_ns;
use crate::config::FilterConfig;
use crate::error::{ConfigError, ConfigWarning};
use crate::rules::{BlacklistEntry, RateLimitRule};
use crate::state::FilterMaps;

// =============================================================================
// Diffs
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlacklistDiff {
    pub to_add: Vec<BlacklistEntry>,
    pub to_remove: Vec<BlacklistEntry>,
}

impl BlacklistDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitDiff {
    pub to_add: Vec<RateLimitRule>,
    /// New rule for an IP that already has one with a different rate.
    pub to_update: Vec<RateLimitRule>,
    pub to_remove: Vec<RateLimitRule>,
}

impl RateLimitDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }
}

pub fn diff_blacklist(
    current: &BTreeSet<BlacklistEntry>,
    new: &BTreeSet<BlacklistEntry>,
) -> BlacklistDiff {
    BlacklistDiff {
        to_add: new.difference(current).copied().collect(),
        to_remove: current.difference(new).copied().collect(),
    }
}

pub fn diff_rate_limits(
    current: &BTreeMap<u32, RateLimitRule>,
    new: &BTreeMap<u32, RateLimitRule>,
) -> RateLimitDiff {
    let mut diff = RateLimitDiff::default();
    for (ip, rule) in new {
        match current.get(ip) {
            None => diff.to_add.push(*rule),
            Some(old) if old.packets_per_second() != rule.packets_per_second() => {
                diff.to_update.push(*rule)
            }
            Some(_) => {}
        }
    }
    diff.to_remove = current
        .iter()
        .filter(|(ip, _)| !new.contains_key(ip))
        .map(|(_, rule)| *rule)
        .collect();
    diff
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of applying one table's diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableDelta {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    /// Mutations the shared tables rejected. They are retried next pass.
    pub failed: usize,
}

impl TableDelta {
    pub fn changed(&self) -> bool {
        self.added + self.removed + self.updated > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub interface: String,
    /// True on the pass that bound the interface.
    pub first_binding: bool,
    /// `None` when the config did not mention the table.
    pub blacklist: Option<TableDelta>,
    pub rate_limits: Option<TableDelta>,
    pub warnings: Vec<ConfigWarning>,
    /// New generation marker, `None` if it could not be written.
    pub generation: Option<u64>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.blacklist.is_some_and(|d| d.changed()) || self.rate_limits.is_some_and(|d| d.changed())
    }

    pub fn failed(&self) -> usize {
        self.blacklist.map_or(0, |d| d.failed) + self.rate_limits.map_or(0, |d| d.failed)
    }
}

// =============================================================================
// Reconciler
// =============================================================================

pub struct Reconciler<M> {
    maps: M,
    interface: Option<String>,
    blacklist: BTreeSet<BlacklistEntry>,
    rate_limits: BTreeMap<u32, RateLimitRule>,
    generation: u64,
    clock: fn() -> u64,
}

impl<M: FilterMaps> Reconciler<M> {
    pub fn new(maps: M) -> Self {
        Self::with_clock(maps, monotonic_ns)
    }

    /// Use `clock` as the generation time source.
    pub fn with_clock(maps: M, clock: fn() -> u64) -> Self {
        Self {
            maps,
            interface: None,
            blacklist: BTreeSet::new(),
            rate_limits: BTreeMap::new(),
            generation: 0,
            clock,
        }
    }

    /// Interface bound by the first successful pass.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Blacklist entries known to be live.
    pub fn blacklist(&self) -> &BTreeSet<BlacklistEntry> {
        &self.blacklist
    }

    /// Rate-limit rules known to be live.
    pub fn rate_limits(&self) -> &BTreeMap<u32, RateLimitRule> {
        &self.rate_limits
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn maps(&self) -> &M {
        &self.maps
    }

    pub fn maps_mut(&mut self) -> &mut M {
        &mut self.maps
    }

    pub fn into_maps(self) -> M {
        self.maps
    }

    /// Parse `raw` and reconcile the shared tables against it.
    pub fn reconcile(&mut self, raw: &str) -> Result<ReconcileReport, ConfigError> {
        self.apply(FilterConfig::parse(raw))
    }

    /// Reconcile against an already parsed config. Fatal errors are returned
    /// before any table is touched.
    pub fn apply(&mut self, config: FilterConfig) -> Result<ReconcileReport, ConfigError> {
        let interface = config.interface.ok_or(ConfigError::MissingInterface)?;
        let first_binding = match &self.interface {
            None => true,
            Some(bound) if *bound == interface => false,
            Some(bound) => {
                return Err(ConfigError::InterfaceChangeUnsupported {
                    bound: bound.clone(),
                    requested: interface,
                })
            }
        };

        for warning in &config.warnings {
            warn!("Skipping config entry: {}", warning);
        }

        let blacklist = config.blacklist.map(|new| self.sync_blacklist(&new));
        let rate_limits = config.rate_limits.map(|new| self.sync_rate_limits(&new));

        if first_binding {
            info!("Bound to interface {}", interface);
            self.interface = Some(interface.clone());
        }

        let generation = self.bump_generation();

        let report = ReconcileReport {
            interface,
            first_binding,
            blacklist,
            rate_limits,
            warnings: config.warnings,
            generation,
        };
        info!(
            "Reconciled: {} blacklist entries, {} rate limits ({} warnings, {} failed)",
            self.blacklist.len(),
            self.rate_limits.len(),
            report.warnings.len(),
            report.failed()
        );
        Ok(report)
    }

    fn sync_blacklist(&mut self, new: &BTreeSet<BlacklistEntry>) -> TableDelta {
        let diff = diff_blacklist(&self.blacklist, new);
        let mut delta = TableDelta::default();

        for entry in &diff.to_remove {
            match self.maps.remove_blacklist(entry) {
                Ok(()) => {
                    self.blacklist.remove(entry);
                    delta.removed += 1;
                    info!("Removed {} from blacklist", entry);
                }
                Err(e) => {
                    delta.failed += 1;
                    warn!("Failed to remove {} from blacklist: {}", entry, e);
                }
            }
        }

        for entry in &diff.to_add {
            match self.maps.insert_blacklist(entry) {
                Ok(()) => {
                    self.blacklist.insert(*entry);
                    delta.added += 1;
                    info!("Added {} to blacklist", entry);
                }
                Err(e) => {
                    delta.failed += 1;
                    warn!("Failed to add {} to blacklist: {}", entry, e);
                }
            }
        }

        delta
    }

    fn sync_rate_limits(&mut self, new: &BTreeMap<u32, RateLimitRule>) -> TableDelta {
        let diff = diff_rate_limits(&self.rate_limits, new);
        let mut delta = TableDelta::default();

        for rule in &diff.to_remove {
            match self.maps.remove_rate_limit(rule.ip()) {
                Ok(()) => {
                    self.rate_limits.remove(&rule.ip());
                    delta.removed += 1;
                    info!("Removed rate limit {}", rule);
                }
                Err(e) => {
                    delta.failed += 1;
                    warn!("Failed to remove rate limit {}: {}", rule, e);
                }
            }
        }

        let upserts = diff
            .to_add
            .iter()
            .map(|r| (r, false))
            .chain(diff.to_update.iter().map(|r| (r, true)));
        for (rule, is_update) in upserts {
            match self.maps.upsert_rate_limit(rule) {
                Ok(()) => {
                    self.rate_limits.insert(rule.ip(), *rule);
                    if is_update {
                        delta.updated += 1;
                        info!("Updated rate limit {}", rule);
                    } else {
                        delta.added += 1;
                        info!("Added rate limit {}", rule);
                    }
                }
                Err(e) => {
                    delta.failed += 1;
                    warn!("Failed to set rate limit {}: {}", rule, e);
                }
            }
        }

        delta
    }

    fn bump_generation(&mut self) -> Option<u64> {
        let next = (self.clock)().max(self.generation.saturating_add(1));
        match self.maps.set_generation(next) {
            Ok(()) => {
                self.generation = next;
                debug!("Generation is now {}", next);
                Some(next)
            }
            Err(e) => {
                warn!("Failed to update generation marker: {}", e);
                None
            }
        }
    }
}
