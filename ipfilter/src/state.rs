//! Shared state between the control plane and the fast path.
//!
//! [`FilterMaps`] is the seam the reconciler writes through. Two backends
//! implement it: [`MemoryTables`] (lock-free tables read by the userspace
//! [`Classifier`](crate::Classifier)) and [`BpfMaps`](crate::BpfMaps) (the
//! kernel maps read by the XDP program).

use std::net::Ipv4Addr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ipfilter_common::{prefix_mask, MAX_ENTRIES, MAX_PREFIX_LEN};

use crate::error::TableError;
use crate::report::{GlobalTotals, IpStats};
use crate::rules::{BlacklistEntry, RateLimitRule};
use crate::table::{FixedTable, SlotValue};

// =============================================================================
// Traits
// =============================================================================

/// Read side used by the statistics reporter.
pub trait StatsSource {
    fn global_totals(&self) -> Result<GlobalTotals, TableError>;
    fn ip_stats(&self) -> Result<Vec<IpStats>, TableError>;
}

impl<T: StatsSource + ?Sized> StatsSource for Arc<T> {
    fn global_totals(&self) -> Result<GlobalTotals, TableError> {
        (**self).global_totals()
    }

    fn ip_stats(&self) -> Result<Vec<IpStats>, TableError> {
        (**self).ip_stats()
    }
}

/// Control-plane view of the shared tables.
///
/// Removing an entry that is not present succeeds.
pub trait FilterMaps: StatsSource {
    fn insert_blacklist(&mut self, entry: &BlacklistEntry) -> Result<(), TableError>;
    fn remove_blacklist(&mut self, entry: &BlacklistEntry) -> Result<(), TableError>;
    fn upsert_rate_limit(&mut self, rule: &RateLimitRule) -> Result<(), TableError>;
    fn remove_rate_limit(&mut self, ip: u32) -> Result<(), TableError>;
    fn set_generation(&mut self, generation: u64) -> Result<(), TableError>;

    fn generation(&self) -> Result<u64, TableError>;
    fn blacklist(&self) -> Result<Vec<BlacklistEntry>, TableError>;
    fn rate_limits(&self) -> Result<Vec<RateLimitRule>, TableError>;
}

// =============================================================================
// Slot values
// =============================================================================

#[derive(Default)]
pub struct RuleSlot {
    packets_per_second: AtomicU32,
    min_interval_ns: AtomicU64,
}

impl RuleSlot {
    pub fn min_interval_ns(&self) -> u64 {
        self.min_interval_ns.load(Ordering::Acquire)
    }

    fn store(&self, rule: &RateLimitRule) {
        self.packets_per_second
            .store(rule.packets_per_second().get(), Ordering::Relaxed);
        self.min_interval_ns
            .store(rule.min_interval_ns(), Ordering::Release);
    }
}

impl SlotValue for RuleSlot {
    fn reset(&self) {
        self.packets_per_second.store(0, Ordering::Release);
        self.min_interval_ns.store(0, Ordering::Release);
    }
}

/// Last admitted packet time for one rate-limited source.
///
/// A record is visible to other classifiers before its creator stores the
/// first timestamp. Until then it reads [`TimestampRecord::UNSET`], which the
/// gate treats as "admitted just now".
pub struct TimestampRecord {
    pub(crate) last_accept_ns: AtomicU64,
}

impl TimestampRecord {
    pub const UNSET: u64 = u64::MAX;

    pub fn last_accept_ns(&self) -> u64 {
        self.last_accept_ns.load(Ordering::Acquire)
    }
}

impl Default for TimestampRecord {
    fn default() -> Self {
        Self { last_accept_ns: AtomicU64::new(Self::UNSET) }
    }
}

impl SlotValue for TimestampRecord {
    fn reset(&self) {
        self.last_accept_ns.store(Self::UNSET, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct StatsSlot {
    dropped: AtomicU64,
    passed: AtomicU64,
}

impl StatsSlot {
    pub(crate) fn count_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_pass(&self) {
        self.passed.fetch_add(1, Ordering::Relaxed);
    }
}

impl SlotValue for StatsSlot {
    fn reset(&self) {
        self.dropped.store(0, Ordering::Relaxed);
        self.passed.store(0, Ordering::Relaxed);
    }
}

// =============================================================================
// MemoryTables
// =============================================================================

/// In-process Shared State. Fast-path reads and counter updates are
/// lock-free; control-plane writes are serialized by an internal mutex that
/// the fast path never touches.
pub struct MemoryTables {
    blacklist: FixedTable<()>,
    /// Bit `n` set when at least one blacklist entry has prefix length `n`.
    prefix_lengths: AtomicU64,
    rate_limits: FixedTable<RuleSlot>,
    timestamps: FixedTable<TimestampRecord>,
    ip_stats: FixedTable<StatsSlot>,
    dropped: AtomicU64,
    passed: AtomicU64,
    generation: AtomicU64,
    writer: Mutex<WriterState>,
}

struct WriterState {
    prefix_counts: [u32; MAX_PREFIX_LEN as usize + 1],
}

impl Default for WriterState {
    fn default() -> Self {
        Self { prefix_counts: [0; MAX_PREFIX_LEN as usize + 1] }
    }
}

impl Default for MemoryTables {
    fn default() -> Self {
        Self::with_capacity(MAX_ENTRIES as usize)
    }
}

impl MemoryTables {
    /// Every table (blacklist, rate limits, timestamps, per-IP stats) holds at
    /// most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            blacklist: FixedTable::with_capacity(capacity),
            prefix_lengths: AtomicU64::new(0),
            rate_limits: FixedTable::with_capacity(capacity),
            timestamps: FixedTable::with_capacity(capacity),
            ip_stats: FixedTable::with_capacity(capacity),
            dropped: AtomicU64::new(0),
            passed: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            writer: Mutex::new(WriterState::default()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn writer(&self) -> std::sync::MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -------------------------------------------------------------------------
    // Fast path
    // -------------------------------------------------------------------------

    /// Most specific blacklist entry containing `ip`.
    pub fn longest_match(&self, ip: u32) -> Option<BlacklistEntry> {
        let present = self.prefix_lengths.load(Ordering::Acquire);
        (0..=MAX_PREFIX_LEN).rev().find_map(|len| {
            if present & (1 << len) == 0 {
                return None;
            }
            let entry = BlacklistEntry::new(ip & prefix_mask(len), len)?;
            self.blacklist.contains(entry.table_key()).then_some(entry)
        })
    }

    /// Minimum interval of the rule for `ip`. A rule removed while being
    /// read counts as absent, so a reused slot never lends its new interval
    /// to the old source.
    pub(crate) fn rate_limit_interval(&self, ip: u32) -> Option<u64> {
        self.rate_limits.read(u64::from(ip), RuleSlot::min_interval_ns)
    }

    pub(crate) fn timestamps(&self) -> &FixedTable<TimestampRecord> {
        &self.timestamps
    }

    /// Per-source counter slot, created on first sight. `None` once the stats
    /// table is full; the global counters still count.
    pub(crate) fn stats_slot(&self, ip: u32) -> Option<&StatsSlot> {
        self.ip_stats
            .get_or_insert(u64::from(ip), |_| {})
            .map(|entry| entry.value)
    }

    pub(crate) fn count_drop(&self, slot: Option<&StatsSlot>) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = slot {
            slot.count_drop();
        }
    }

    pub(crate) fn count_pass(&self, slot: Option<&StatsSlot>) {
        self.passed.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = slot {
            slot.count_pass();
        }
    }

    pub fn last_accept_ns(&self, ip: u32) -> Option<u64> {
        self.timestamps
            .get(u64::from(ip))
            .map(TimestampRecord::last_accept_ns)
            .filter(|&ns| ns != TimestampRecord::UNSET)
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Control plane
    // -------------------------------------------------------------------------

    pub fn insert_blacklist(&self, entry: &BlacklistEntry) -> Result<(), TableError> {
        let mut writer = self.writer();
        let key = entry.table_key();
        if self.blacklist.contains(key) {
            return Ok(());
        }

        let len = entry.prefix_len();
        // Make the length visible before the key so a reader that finds the
        // key has already been told to look.
        self.prefix_lengths.fetch_or(1 << len, Ordering::AcqRel);
        if self.blacklist.insert_with(key, |_| {}).is_none() {
            if writer.prefix_counts[len as usize] == 0 {
                self.prefix_lengths.fetch_and(!(1 << len), Ordering::AcqRel);
            }
            return Err(TableError::Full {
                table: "blacklist",
                capacity: self.blacklist.capacity(),
            });
        }
        writer.prefix_counts[len as usize] += 1;
        Ok(())
    }

    pub fn remove_blacklist(&self, entry: &BlacklistEntry) -> Result<(), TableError> {
        let mut writer = self.writer();
        if !self.blacklist.remove(entry.table_key()) {
            return Ok(());
        }
        let len = entry.prefix_len() as usize;
        writer.prefix_counts[len] = writer.prefix_counts[len].saturating_sub(1);
        if writer.prefix_counts[len] == 0 {
            self.prefix_lengths.fetch_and(!(1 << len), Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn upsert_rate_limit(&self, rule: &RateLimitRule) -> Result<(), TableError> {
        let _writer = self.writer();
        self.rate_limits
            .insert_with(u64::from(rule.ip()), |slot| slot.store(rule))
            .map(|_| ())
            .ok_or(TableError::Full {
                table: "rate_limits",
                capacity: self.rate_limits.capacity(),
            })
    }

    /// Removes the rule only. A leftover timestamp is harmless: it is never
    /// consulted without a rule, and a re-added rule at worst admits one
    /// packet early.
    pub fn remove_rate_limit(&self, ip: u32) -> Result<(), TableError> {
        let _writer = self.writer();
        self.rate_limits.remove(u64::from(ip));
        Ok(())
    }

    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    pub fn blacklist_entries(&self) -> Vec<BlacklistEntry> {
        let mut entries: Vec<_> = self
            .blacklist
            .iter()
            .filter_map(|(key, _)| BlacklistEntry::from_table_key(key))
            .collect();
        entries.sort_unstable();
        entries
    }

    pub fn rate_limit_rules(&self) -> Vec<RateLimitRule> {
        let mut rules: Vec<_> = self
            .rate_limits
            .iter()
            .filter_map(|(key, slot)| {
                let pps = NonZeroU32::new(slot.packets_per_second.load(Ordering::Acquire))?;
                Some(RateLimitRule::new(key as u32, pps))
            })
            .collect();
        rules.sort_unstable_by_key(RateLimitRule::ip);
        rules
    }
}

impl StatsSource for MemoryTables {
    fn global_totals(&self) -> Result<GlobalTotals, TableError> {
        Ok(GlobalTotals {
            dropped: self.dropped.load(Ordering::Relaxed),
            passed: self.passed.load(Ordering::Relaxed),
        })
    }

    fn ip_stats(&self) -> Result<Vec<IpStats>, TableError> {
        Ok(self
            .ip_stats
            .iter()
            .map(|(key, slot)| IpStats {
                ip: Ipv4Addr::from(key as u32),
                dropped: slot.dropped.load(Ordering::Relaxed),
                passed: slot.passed.load(Ordering::Relaxed),
            })
            .collect())
    }
}

impl FilterMaps for Arc<MemoryTables> {
    fn insert_blacklist(&mut self, entry: &BlacklistEntry) -> Result<(), TableError> {
        MemoryTables::insert_blacklist(self, entry)
    }

    fn remove_blacklist(&mut self, entry: &BlacklistEntry) -> Result<(), TableError> {
        MemoryTables::remove_blacklist(self, entry)
    }

    fn upsert_rate_limit(&mut self, rule: &RateLimitRule) -> Result<(), TableError> {
        MemoryTables::upsert_rate_limit(self, rule)
    }

    fn remove_rate_limit(&mut self, ip: u32) -> Result<(), TableError> {
        MemoryTables::remove_rate_limit(self, ip)
    }

    fn set_generation(&mut self, generation: u64) -> Result<(), TableError> {
        MemoryTables::set_generation(self, generation);
        Ok(())
    }

    fn generation(&self) -> Result<u64, TableError> {
        Ok(self.current_generation())
    }

    fn blacklist(&self) -> Result<Vec<BlacklistEntry>, TableError> {
        Ok(self.blacklist_entries())
    }

    fn rate_limits(&self) -> Result<Vec<RateLimitRule>, TableError> {
        Ok(self.rate_limit_rules())
    }
}
