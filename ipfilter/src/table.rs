//! Fixed-capacity open-addressed table with atomic slots.
//!
//! Userspace counterpart of a BPF hash map: readers never block, capacity is
//! fixed at construction and inserts fail once it is reached. Keys are up to
//! 62 bits wide.
//!
//! Two insertion paths exist and must not be mixed on the same table:
//!
//! - [`FixedTable::get_or_insert`] may be called from any number of threads
//!   concurrently. It only claims never-used slots, so two threads racing on
//!   the same key always converge on one slot.
//! - [`FixedTable::insert_with`] and [`FixedTable::remove`] assume a single
//!   writer (callers serialize them). Removal leaves a tombstone only where
//!   some live key's search chain still passes through the slot; every other
//!   tombstone in the run goes back to empty, so misses stay short under
//!   churn.
//!
//! A table that sees `remove` must never see `get_or_insert`: turning a slot
//! back to empty is only sound while no other thread can be claiming slots.
//! Invariant: no live key's search chain contains an empty slot.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const EMPTY: u64 = 0;
const TOMBSTONE: u64 = 1;
const OCCUPIED: u64 = 1 << 63;
const KEY_MASK: u64 = (1 << 62) - 1;

const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;

/// Value stored in a [`FixedTable`] slot. Values are made of atomics so they
/// can be read and updated through a shared reference.
pub trait SlotValue: Default + Send + Sync {
    /// Return the slot to its freshly-constructed state before reuse.
    fn reset(&self);
}

impl SlotValue for () {
    fn reset(&self) {}
}

/// Result of a lookup-or-insert.
pub struct Entry<'a, V> {
    pub value: &'a V,
    pub inserted: bool,
}

pub struct FixedTable<V> {
    keys: Box<[AtomicU64]>,
    values: Box<[V]>,
    len: AtomicUsize,
    capacity: usize,
    shift: u32,
}

impl<V: SlotValue> FixedTable<V> {
    /// Table holding at most `capacity` keys.
    pub fn with_capacity(capacity: usize) -> Self {
        // Keep the load factor at or below one half.
        let slots = (capacity.max(1) * 2).next_power_of_two();
        Self {
            keys: (0..slots).map(|_| AtomicU64::new(EMPTY)).collect(),
            values: (0..slots).map(|_| V::default()).collect(),
            len: AtomicUsize::new(0),
            capacity,
            shift: 64 - slots.trailing_zeros(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn home(&self, key: u64) -> usize {
        // shift == 64 only for a single-slot table, which never happens since
        // slots >= 2.
        (key.wrapping_mul(GOLDEN) >> self.shift) as usize
    }

    #[inline]
    fn slot_mask(&self) -> usize {
        self.keys.len() - 1
    }

    #[inline]
    fn tag(key: u64) -> u64 {
        debug_assert!(key <= KEY_MASK, "key exceeds 62 bits");
        OCCUPIED | (key & KEY_MASK)
    }

    /// Slot sequence starting at the key's home slot, visiting every slot
    /// once.
    fn chain(&self, key: u64) -> impl Iterator<Item = usize> + '_ {
        let start = self.home(key);
        let mask = self.slot_mask();
        (0..self.keys.len()).map(move |i| (start + i) & mask)
    }

    pub fn get(&self, key: u64) -> Option<&V> {
        let tag = Self::tag(key);
        for idx in self.chain(key) {
            match self.keys[idx].load(Ordering::Acquire) {
                EMPTY => return None,
                k if k == tag => return Some(&self.values[idx]),
                _ => {}
            }
        }
        None
    }

    /// Run `read` on the value for `key` and return its result only if the
    /// slot still holds `key` afterwards. A concurrent remove (and possible
    /// reuse of the slot for another key) during `read` yields `None`.
    pub fn read<R>(&self, key: u64, read: impl FnOnce(&V) -> R) -> Option<R> {
        let tag = Self::tag(key);
        for idx in self.chain(key) {
            match self.keys[idx].load(Ordering::Acquire) {
                EMPTY => return None,
                k if k == tag => {
                    let result = read(&self.values[idx]);
                    return (self.keys[idx].load(Ordering::Acquire) == tag).then_some(result);
                }
                _ => {}
            }
        }
        None
    }

    pub fn contains(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    /// Find `key`, creating it in a never-used slot if absent. Safe to call
    /// from many threads at once. Returns `None` when the table is full.
    ///
    /// A newly claimed slot is published before `init` runs, so a concurrent
    /// reader may briefly observe the default value.
    pub fn get_or_insert(&self, key: u64, init: impl FnOnce(&V)) -> Option<Entry<'_, V>> {
        let tag = Self::tag(key);
        let mut reserved = false;

        for idx in self.chain(key) {
            let mut current = self.keys[idx].load(Ordering::Acquire);
            if current == EMPTY {
                if !reserved {
                    if self.len.fetch_add(1, Ordering::AcqRel) >= self.capacity {
                        self.len.fetch_sub(1, Ordering::AcqRel);
                        return None;
                    }
                    reserved = true;
                }
                match self.keys[idx].compare_exchange(
                    EMPTY,
                    tag,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let value = &self.values[idx];
                        init(value);
                        return Some(Entry { value, inserted: true });
                    }
                    Err(actual) => current = actual,
                }
            }
            if current == tag {
                if reserved {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                }
                return Some(Entry { value: &self.values[idx], inserted: false });
            }
        }

        if reserved {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        None
    }

    /// Insert or update `key`. `init` runs on the value before the key becomes
    /// visible for new keys, and in place for existing ones.
    ///
    /// Single writer only. Returns `None` when the table is full.
    pub fn insert_with(&self, key: u64, init: impl FnOnce(&V)) -> Option<Entry<'_, V>> {
        let tag = Self::tag(key);
        let mut free = None;

        for idx in self.chain(key) {
            match self.keys[idx].load(Ordering::Acquire) {
                EMPTY => {
                    free.get_or_insert(idx);
                    break;
                }
                TOMBSTONE => {
                    free.get_or_insert(idx);
                }
                k if k == tag => {
                    let value = &self.values[idx];
                    init(value);
                    return Some(Entry { value, inserted: false });
                }
                _ => {}
            }
        }

        let idx = free?;
        if self.len.load(Ordering::Acquire) >= self.capacity {
            return None;
        }
        let value = &self.values[idx];
        value.reset();
        init(value);
        self.keys[idx].store(tag, Ordering::Release);
        self.len.fetch_add(1, Ordering::AcqRel);
        Some(Entry { value, inserted: true })
    }

    /// Remove `key`, returning whether it was present. Single writer only.
    pub fn remove(&self, key: u64) -> bool {
        let tag = Self::tag(key);
        for idx in self.chain(key) {
            match self.keys[idx].load(Ordering::Acquire) {
                EMPTY => return false,
                k if k == tag => {
                    self.vacate(idx);
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    return true;
                }
                _ => {}
            }
        }
        false
    }

    /// Free slot `idx`, then turn every tombstone in its run that no live
    /// key's search chain passes through back into an empty slot.
    fn vacate(&self, idx: usize) {
        self.keys[idx].store(TOMBSTONE, Ordering::Release);

        let mask = self.slot_mask();
        let slots = self.keys.len();
        let Some(end) = (1..slots)
            .map(|i| (idx + i) & mask)
            .find(|&i| self.keys[i].load(Ordering::Acquire) == EMPTY)
        else {
            return;
        };

        // Walk the run backwards from its end. `reach` counts the slots
        // before `cur` that lie on the chain of some key after it.
        let mut reach = 0usize;
        let mut cur = end;
        for _ in 1..slots {
            cur = cur.wrapping_sub(1) & mask;
            let covered = reach > 0;
            reach = reach.saturating_sub(1);
            match self.keys[cur].load(Ordering::Acquire) {
                EMPTY => break,
                TOMBSTONE if !covered => self.keys[cur].store(EMPTY, Ordering::Release),
                TOMBSTONE => {}
                k => {
                    let home = self.home(k & KEY_MASK);
                    reach = reach.max(cur.wrapping_sub(home) & mask);
                }
            }
        }
    }

    /// Snapshot iteration over live entries. Entries inserted or removed
    /// concurrently may or may not be observed.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> + '_ {
        self.keys.iter().zip(self.values.iter()).filter_map(|(k, v)| {
            let k = k.load(Ordering::Acquire);
            (k & OCCUPIED != 0).then_some((k & KEY_MASK, v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct Counter(AtomicU64);

    impl SlotValue for Counter {
        fn reset(&self) {
            self.0.store(0, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let table: FixedTable<Counter> = FixedTable::with_capacity(8);
        assert!(table.get(42).is_none());

        let entry = table.insert_with(42, |v| v.0.store(7, Ordering::Relaxed)).unwrap();
        assert!(entry.inserted);
        assert_eq!(table.get(42).unwrap().0.load(Ordering::Relaxed), 7);
        assert_eq!(table.len(), 1);

        let entry = table.insert_with(42, |v| v.0.store(9, Ordering::Relaxed)).unwrap();
        assert!(!entry.inserted);
        assert_eq!(table.get(42).unwrap().0.load(Ordering::Relaxed), 9);
        assert_eq!(table.len(), 1);

        assert!(table.remove(42));
        assert!(!table.remove(42));
        assert!(table.get(42).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let table: FixedTable<()> = FixedTable::with_capacity(3);
        for k in 0..3 {
            assert!(table.insert_with(k, |_| {}).is_some());
        }
        assert!(table.insert_with(3, |_| {}).is_none());
        // Updating an existing key still works when full.
        assert!(table.insert_with(1, |_| {}).is_some());

        assert!(table.remove(0));
        assert!(table.insert_with(3, |_| {}).is_some());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_get_or_insert_capacity() {
        let table: FixedTable<Counter> = FixedTable::with_capacity(2);
        assert!(table.get_or_insert(1, |_| {}).unwrap().inserted);
        assert!(!table.get_or_insert(1, |_| {}).unwrap().inserted);
        assert!(table.get_or_insert(2, |_| {}).is_some());
        assert!(table.get_or_insert(3, |_| {}).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_tombstone_does_not_hide_later_keys() {
        let table: FixedTable<()> = FixedTable::with_capacity(64);
        for k in 0..40 {
            table.insert_with(k, |_| {});
        }
        for k in (0..40).step_by(2) {
            assert!(table.remove(k));
        }
        for k in 0..40 {
            assert_eq!(table.contains(k), k % 2 == 1, "key {k}");
        }
    }

    fn slot_states(table: &FixedTable<()>) -> (usize, usize) {
        let empty = table.keys.iter().filter(|k| k.load(Ordering::Relaxed) == EMPTY).count();
        let tombstones = table
            .keys
            .iter()
            .filter(|k| k.load(Ordering::Relaxed) == TOMBSTONE)
            .count();
        (empty, tombstones)
    }

    #[test]
    fn test_churn_returns_slots_to_empty() {
        let table: FixedTable<()> = FixedTable::with_capacity(4);
        for k in 0..64u64 {
            table.insert_with(k, |_| {}).unwrap();
            assert!(table.remove(k));
        }
        assert!(table.is_empty());
        assert_eq!(slot_states(&table), (8, 0));
    }

    #[test]
    fn test_churn_next_to_live_keys_leaves_no_tombstones() {
        let table: FixedTable<()> = FixedTable::with_capacity(16);
        for k in 0..4u64 {
            table.insert_with(k, |_| {}).unwrap();
        }
        for k in 100..1_100u64 {
            table.insert_with(k, |_| {}).unwrap();
            assert!(table.remove(k));
        }

        assert_eq!(table.len(), 4);
        for k in 0..4u64 {
            assert!(table.contains(k), "key {k}");
        }
        assert_eq!(slot_states(&table), (28, 0));
    }

    #[test]
    fn test_removal_keeps_colliding_keys_reachable() {
        let table: FixedTable<()> = FixedTable::with_capacity(32);
        let keys: Vec<u64> = (0..32).collect();
        for &k in &keys {
            table.insert_with(k, |_| {}).unwrap();
        }

        // Remove every other key; the rest must stay reachable after each step.
        for (n, &gone) in keys.iter().step_by(2).enumerate() {
            assert!(table.remove(gone));
            for &k in &keys {
                let removed = k % 2 == 0 && k / 2 <= n as u64;
                assert_eq!(table.contains(k), !removed, "key {k} after removing {gone}");
            }
        }
        assert_eq!(table.len(), 16);
    }

    #[test]
    fn test_read_rejects_slot_reused_during_read() {
        let table: FixedTable<Counter> = FixedTable::with_capacity(1);
        table.insert_with(1, |v| v.0.store(10, Ordering::Relaxed)).unwrap();

        let stale = table.read(1, |v| {
            let seen = v.0.load(Ordering::Acquire);
            table.remove(1);
            table.insert_with(2, |v| v.0.store(99, Ordering::Relaxed)).unwrap();
            seen
        });
        assert_eq!(stale, None);
        assert_eq!(table.read(2, |v| v.0.load(Ordering::Acquire)), Some(99));
        assert_eq!(table.read(1, |v| v.0.load(Ordering::Acquire)), None);
    }

    #[test]
    fn test_reused_slot_is_reset() {
        let table: FixedTable<Counter> = FixedTable::with_capacity(1);
        let entry = table.insert_with(5, |_| {}).unwrap();
        entry.value.0.fetch_add(10, Ordering::Relaxed);
        table.remove(5);

        table.insert_with(6, |_| {}).unwrap();
        assert_eq!(table.get(6).unwrap().0.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_iter_reports_live_keys() {
        let table: FixedTable<()> = FixedTable::with_capacity(16);
        for k in [3u64, 1 << 40, 99] {
            table.insert_with(k, |_| {});
        }
        table.remove(99);
        let mut keys: Vec<u64> = table.iter().map(|(k, _)| k).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![3, 1 << 40]);
    }

    #[test]
    fn test_concurrent_get_or_insert_converges() {
        let table: FixedTable<Counter> = FixedTable::with_capacity(128);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for k in 0..64u64 {
                        let entry = table.get_or_insert(k, |_| {}).unwrap();
                        entry.value.0.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(table.len(), 64);
        for k in 0..64u64 {
            assert_eq!(table.get(k).unwrap().0.load(Ordering::Relaxed), 8);
        }
    }
}
