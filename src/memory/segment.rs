//! Segment Implementation
//!
//! One independently locked shard of the hot tier: a chained hash table plus
//! the counters the map reads without locking.
//!
//! # Design
//!
//! - Buckets are small vectors; the bucket count is a power of two and
//!   doubles at a 0.75 load factor
//! - Every mutation happens under the write lock and updates the counters
//!   through [`Segment::account`], so the counters always describe a state
//!   the table actually passed through
//! - `mod_count` increases on every mutation and backs the optimistic size read
//! - The clock cursor (bucket, position) survives between eviction scans and
//!   is reset when the table is rehashed

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use super::slot::{EntryState, Slot};
use super::LOAD_FACTOR;
use crate::disk::DiskMarker;
use crate::element::Element;
use crate::error::Result;

/// One key's entry in a bucket chain
pub(crate) struct HashEntry<K> {
    key: K,
    hash: u32,
    /// `None` marks a placeholder for a pinned key without a value
    slot: Option<Slot<K>>,
    pinned: bool,
    spooling: bool,
    heap_size: u64,
    /// Clock bit, set on access and cleared by the eviction scan
    accessed: AtomicBool,
}

impl<K> HashEntry<K> {
    fn new(key: K, hash: u32, slot: Option<Slot<K>>, heap_size: u64, pinned: bool) -> Self {
        Self {
            key,
            hash,
            slot,
            pinned,
            spooling: false,
            heap_size,
            accessed: AtomicBool::new(true),
        }
    }

    fn state(&self) -> EntryState {
        match &self.slot {
            None => EntryState::Placeholder,
            Some(Slot::Resident(_)) if self.spooling => EntryState::Spooling,
            Some(Slot::Resident(_)) => EntryState::Resident,
            Some(Slot::OnDisk(_)) => EntryState::OnDisk,
        }
    }

    fn footprint(&self) -> (EntryState, u64) {
        (self.state(), self.heap_size)
    }
}

/// Read-only view of a live entry handed to sampling and scan callbacks
pub struct EntryView<'a, K> {
    pub key: &'a K,
    pub slot: &'a Slot<K>,
    pub pinned: bool,
    pub spooling: bool,
}

/// Outcome of a put, kept so a failed write-through can be rolled back
pub(crate) struct Replaced<K> {
    pub previous: Option<Slot<K>>,
    previous_heap: u64,
    existed: bool,
}

// =============================================================================
// Table
// =============================================================================

pub(crate) struct Table<K> {
    buckets: Vec<Vec<HashEntry<K>>>,
    len: usize,
    clock_bucket: usize,
    clock_pos: usize,
}

impl<K: PartialEq> Table<K> {
    fn with_buckets(n: usize) -> Self {
        let n = n.max(1).next_power_of_two();
        Self {
            buckets: (0..n).map(|_| Vec::new()).collect(),
            len: 0,
            clock_bucket: 0,
            clock_pos: 0,
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.buckets.len() - 1
    }

    fn position(&self, key: &K, hash: u32) -> Option<(usize, usize)> {
        let b = hash as usize & self.mask();
        self.buckets[b]
            .iter()
            .position(|e| e.hash == hash && e.key == *key)
            .map(|p| (b, p))
    }

    fn entry(&self, key: &K, hash: u32) -> Option<&HashEntry<K>> {
        self.position(key, hash).map(|(b, p)| &self.buckets[b][p])
    }

    fn entry_mut(&mut self, key: &K, hash: u32) -> Option<&mut HashEntry<K>> {
        self.position(key, hash)
            .map(move |(b, p)| &mut self.buckets[b][p])
    }

    fn insert(&mut self, entry: HashEntry<K>) {
        self.grow_if_needed();
        let b = entry.hash as usize & self.mask();
        self.buckets[b].push(entry);
        self.len += 1;
    }

    fn take(&mut self, b: usize, p: usize) -> HashEntry<K> {
        if b == self.clock_bucket && p < self.clock_pos {
            self.clock_pos -= 1;
        }
        self.len -= 1;
        self.buckets[b].remove(p)
    }

    fn grow_if_needed(&mut self) {
        let threshold = (self.buckets.len() as f32 * LOAD_FACTOR) as usize;
        if self.len < threshold.max(1) {
            return;
        }
        let new_len = self.buckets.len() * 2;
        let mut buckets: Vec<Vec<HashEntry<K>>> = (0..new_len).map(|_| Vec::new()).collect();
        for entry in self.buckets.drain(..).flatten() {
            buckets[entry.hash as usize & (new_len - 1)].push(entry);
        }
        self.buckets = buckets;
        self.clock_bucket = 0;
        self.clock_pos = 0;
    }

    fn live(&self) -> impl Iterator<Item = (&HashEntry<K>, &Slot<K>)> {
        self.buckets
            .iter()
            .flatten()
            .filter_map(|e| e.slot.as_ref().map(|s| (e, s)))
    }
}

// =============================================================================
// Segment
// =============================================================================

/// One lockable shard of the hot tier
pub(crate) struct Segment<K> {
    table: RwLock<Table<K>>,
    /// Logical entries (resident + spooling + on disk)
    count: AtomicUsize,
    mod_count: AtomicU64,
    pinned: AtomicUsize,
    placeholders: AtomicUsize,
    resident: AtomicUsize,
    spooling: AtomicUsize,
    on_disk: AtomicUsize,
    resident_bytes: AtomicU64,
    spooling_bytes: AtomicU64,
}

impl<K> Segment<K> {
    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn mod_count(&self) -> u64 {
        self.mod_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn pinned_count(&self) -> usize {
        self.pinned.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn placeholder_count(&self) -> usize {
        self.placeholders.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn resident_count(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn spooling_count(&self) -> usize {
        self.spooling.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn on_disk_count(&self) -> usize {
        self.on_disk.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn spooling_bytes(&self) -> u64 {
        self.spooling_bytes.load(Ordering::Relaxed)
    }

    /// Hold the read lock, freezing this segment's counters
    pub(crate) fn lock_shared(&self) -> RwLockReadGuard<'_, Table<K>> {
        self.table.read()
    }

    fn state_counter(&self, state: EntryState) -> &AtomicUsize {
        match state {
            EntryState::Placeholder => &self.placeholders,
            EntryState::Resident => &self.resident,
            EntryState::Spooling => &self.spooling,
            EntryState::OnDisk => &self.on_disk,
        }
    }

    fn byte_counter(&self, state: EntryState) -> Option<&AtomicU64> {
        match state {
            EntryState::Resident => Some(&self.resident_bytes),
            EntryState::Spooling => Some(&self.spooling_bytes),
            EntryState::Placeholder | EntryState::OnDisk => None,
        }
    }

    /// Move one entry between accounting states. Caller holds the write lock.
    fn account(&self, before: Option<(EntryState, u64)>, after: Option<(EntryState, u64)>) {
        if let Some((state, bytes)) = before {
            self.state_counter(state).fetch_sub(1, Ordering::Relaxed);
            if let Some(c) = self.byte_counter(state) {
                c.fetch_sub(bytes, Ordering::Relaxed);
            }
            if state != EntryState::Placeholder {
                self.count.fetch_sub(1, Ordering::Release);
            }
        }
        if let Some((state, bytes)) = after {
            self.state_counter(state).fetch_add(1, Ordering::Relaxed);
            if let Some(c) = self.byte_counter(state) {
                c.fetch_add(bytes, Ordering::Relaxed);
            }
            if state != EntryState::Placeholder {
                self.count.fetch_add(1, Ordering::Release);
            }
        }
        self.mod_count.fetch_add(1, Ordering::Release);
    }
}

impl<K: PartialEq + Clone> Segment<K> {
    pub(crate) fn new(initial_buckets: usize) -> Self {
        Self {
            table: RwLock::new(Table::with_buckets(initial_buckets)),
            count: AtomicUsize::new(0),
            mod_count: AtomicU64::new(0),
            pinned: AtomicUsize::new(0),
            placeholders: AtomicUsize::new(0),
            resident: AtomicUsize::new(0),
            spooling: AtomicUsize::new(0),
            on_disk: AtomicUsize::new(0),
            resident_bytes: AtomicU64::new(0),
            spooling_bytes: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Current slot for `key`; `touch` sets the clock bit
    pub(crate) fn get(&self, key: &K, hash: u32, touch: bool) -> Option<Slot<K>> {
        let table = self.table.read();
        let entry = table.entry(key, hash)?;
        let slot = entry.slot.as_ref()?;
        if touch {
            entry.accessed.store(true, Ordering::Relaxed);
        }
        Some(slot.clone())
    }

    pub(crate) fn contains_key(&self, key: &K, hash: u32) -> bool {
        self.table
            .read()
            .entry(key, hash)
            .is_some_and(|e| e.slot.is_some())
    }

    pub(crate) fn is_pinned(&self, key: &K, hash: u32) -> bool {
        self.table
            .read()
            .entry(key, hash)
            .is_some_and(|e| e.pinned)
    }

    /// Accounting state and pin flag of `key`, including placeholders
    pub(crate) fn entry_state(&self, key: &K, hash: u32) -> Option<(EntryState, bool)> {
        self.table
            .read()
            .entry(key, hash)
            .map(|e| (e.state(), e.pinned))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Store `slot` for `key`. With `only_if_absent`, an existing value is
    /// returned and left in place. A placeholder counts as absent.
    pub(crate) fn put(
        &self,
        key: K,
        hash: u32,
        slot: Slot<K>,
        heap_size: u64,
        pin: bool,
        only_if_absent: bool,
    ) -> Option<Slot<K>> {
        let mut table = self.table.write();
        self.put_locked(&mut table, key, hash, slot, heap_size, pin, only_if_absent)
            .previous
    }

    /// Store `slot` and run `writer` while still holding the write lock.
    /// If the writer fails the previous mapping is restored.
    ///
    /// `writer` must not call back into this map.
    pub(crate) fn put_with<F>(
        &self,
        key: K,
        hash: u32,
        slot: Slot<K>,
        heap_size: u64,
        writer: F,
    ) -> Result<Option<Slot<K>>>
    where
        F: FnOnce(&Slot<K>) -> Result<()>,
    {
        let mut table = self.table.write();
        let written = slot.clone();
        let replaced = self.put_locked(&mut table, key.clone(), hash, slot, heap_size, false, false);
        if let Err(e) = writer(&written) {
            self.restore_locked(&mut table, &key, hash, replaced);
            return Err(e);
        }
        Ok(replaced.previous)
    }

    #[allow(clippy::too_many_arguments)]
    fn put_locked(
        &self,
        table: &mut Table<K>,
        key: K,
        hash: u32,
        slot: Slot<K>,
        heap_size: u64,
        pin: bool,
        only_if_absent: bool,
    ) -> Replaced<K> {
        if let Some(entry) = table.entry_mut(&key, hash) {
            if only_if_absent && entry.slot.is_some() {
                return Replaced {
                    previous: entry.slot.clone(),
                    previous_heap: entry.heap_size,
                    existed: true,
                };
            }
            let before = entry.footprint();
            let previous = entry.slot.replace(slot);
            let previous_heap = std::mem::replace(&mut entry.heap_size, heap_size);
            entry.spooling = false;
            entry.accessed.store(true, Ordering::Relaxed);
            let newly_pinned = pin && !entry.pinned;
            entry.pinned |= pin;
            let after = entry.footprint();

            if newly_pinned {
                self.pinned.fetch_add(1, Ordering::Relaxed);
            }
            self.account(Some(before), Some(after));
            return Replaced {
                previous,
                previous_heap,
                existed: true,
            };
        }

        let entry = HashEntry::new(key, hash, Some(slot), heap_size, pin);
        let after = entry.footprint();
        table.insert(entry);
        if pin {
            self.pinned.fetch_add(1, Ordering::Relaxed);
        }
        self.account(None, Some(after));
        Replaced {
            previous: None,
            previous_heap: 0,
            existed: false,
        }
    }

    fn restore_locked(&self, table: &mut Table<K>, key: &K, hash: u32, replaced: Replaced<K>) {
        let Some((b, p)) = table.position(key, hash) else {
            return;
        };
        if !replaced.existed {
            let entry = table.take(b, p);
            if entry.pinned {
                self.pinned.fetch_sub(1, Ordering::Relaxed);
            }
            self.account(Some(entry.footprint()), None);
            return;
        }
        let entry = &mut table.buckets[b][p];
        let before = entry.footprint();
        entry.slot = replaced.previous;
        entry.heap_size = replaced.previous_heap;
        entry.spooling = false;
        let after = entry.footprint();
        self.account(Some(before), Some(after));
    }

    /// Remove `key`'s value. With `expected`, only if the slot is that exact
    /// element or marker. A pinned key keeps a placeholder.
    pub(crate) fn remove(&self, key: &K, hash: u32, expected: Option<&Slot<K>>) -> Option<Slot<K>> {
        let mut table = self.table.write();
        let (b, p) = table.position(key, hash)?;
        let current = table.buckets[b][p].slot.as_ref()?;
        if expected.is_some_and(|exp| !current.same_as(exp)) {
            return None;
        }
        self.remove_locked(&mut table, b, p)
    }

    fn remove_locked(&self, table: &mut Table<K>, b: usize, p: usize) -> Option<Slot<K>> {
        let entry = &mut table.buckets[b][p];
        if entry.pinned {
            let before = entry.footprint();
            let old = entry.slot.take();
            entry.heap_size = 0;
            entry.spooling = false;
            let after = entry.footprint();
            self.account(Some(before), Some(after));
            return old;
        }
        let entry = table.take(b, p);
        self.account(Some(entry.footprint()), None);
        entry.slot
    }

    /// Swap a disk marker for its element (fault-in). Fails if the slot moved on.
    pub(crate) fn fault_in(
        &self,
        key: &K,
        hash: u32,
        marker: &Arc<DiskMarker<K>>,
        element: Arc<Element<K>>,
        heap_size: u64,
    ) -> bool {
        let mut table = self.table.write();
        let Some(entry) = table.entry_mut(key, hash) else {
            return false;
        };
        match &entry.slot {
            Some(Slot::OnDisk(m)) if Arc::ptr_eq(m, marker) => {}
            _ => return false,
        }
        let before = entry.footprint();
        entry.slot = Some(Slot::Resident(element));
        entry.heap_size = heap_size;
        entry.accessed.store(true, Ordering::Relaxed);
        let after = entry.footprint();
        self.account(Some(before), Some(after));
        true
    }

    /// Flag a resident, unpinned element as queued for disk
    pub(crate) fn begin_spool(&self, key: &K, hash: u32, element: &Arc<Element<K>>) -> bool {
        self.set_spooling(key, hash, element, true)
    }

    /// Clear the spool flag after a failed write
    pub(crate) fn abort_spool(&self, key: &K, hash: u32, element: &Arc<Element<K>>) -> bool {
        self.set_spooling(key, hash, element, false)
    }

    fn set_spooling(&self, key: &K, hash: u32, element: &Arc<Element<K>>, spooling: bool) -> bool {
        let mut table = self.table.write();
        let Some(entry) = table.entry_mut(key, hash) else {
            return false;
        };
        let matches = matches!(&entry.slot, Some(Slot::Resident(e)) if Arc::ptr_eq(e, element));
        if !matches || entry.spooling == spooling || (spooling && entry.pinned) {
            return false;
        }
        let before = entry.footprint();
        entry.spooling = spooling;
        let after = entry.footprint();
        self.account(Some(before), Some(after));
        true
    }

    /// Replace a spooling element with its marker. Fails, leaving the slot
    /// alone, if the key was updated, removed or unflagged in the meantime.
    pub(crate) fn commit_spool(
        &self,
        key: &K,
        hash: u32,
        element: &Arc<Element<K>>,
        marker: Arc<DiskMarker<K>>,
    ) -> bool {
        self.move_to_disk(key, hash, element, marker, true)
    }

    /// Replace a resident element with its marker regardless of pin or
    /// spool state. Used when persisting everything at shutdown.
    pub(crate) fn persist_resident(
        &self,
        key: &K,
        hash: u32,
        element: &Arc<Element<K>>,
        marker: Arc<DiskMarker<K>>,
    ) -> bool {
        self.move_to_disk(key, hash, element, marker, false)
    }

    fn move_to_disk(
        &self,
        key: &K,
        hash: u32,
        element: &Arc<Element<K>>,
        marker: Arc<DiskMarker<K>>,
        require_spooling: bool,
    ) -> bool {
        let mut table = self.table.write();
        let Some(entry) = table.entry_mut(key, hash) else {
            return false;
        };
        let matches = matches!(&entry.slot, Some(Slot::Resident(e)) if Arc::ptr_eq(e, element));
        if !matches || (require_spooling && !entry.spooling) {
            return false;
        }
        let before = entry.footprint();
        entry.slot = Some(Slot::OnDisk(marker));
        entry.spooling = false;
        entry.heap_size = 0;
        let after = entry.footprint();
        self.account(Some(before), Some(after));
        true
    }

    // =========================================================================
    // Pinning
    // =========================================================================

    /// Set or clear the pin on `key`. Returns true if the pin state changed.
    pub(crate) fn set_pinned(&self, key: &K, hash: u32, pinned: bool) -> bool {
        let mut table = self.table.write();
        match table.position(key, hash) {
            Some((b, p)) => {
                let entry = &mut table.buckets[b][p];
                if entry.pinned == pinned {
                    return false;
                }
                entry.pinned = pinned;
                let placeholder = entry.slot.is_none();
                if pinned {
                    self.pinned.fetch_add(1, Ordering::Relaxed);
                    self.mod_count.fetch_add(1, Ordering::Release);
                } else {
                    self.pinned.fetch_sub(1, Ordering::Relaxed);
                    if placeholder {
                        let entry = table.take(b, p);
                        self.account(Some(entry.footprint()), None);
                    } else {
                        self.mod_count.fetch_add(1, Ordering::Release);
                    }
                }
                true
            }
            None if pinned => {
                let entry = HashEntry::new(key.clone(), hash, None, 0, true);
                let after = entry.footprint();
                table.insert(entry);
                self.pinned.fetch_add(1, Ordering::Relaxed);
                self.account(None, Some(after));
                true
            }
            None => false,
        }
    }

    /// Clear every pin and drop placeholders
    pub(crate) fn unpin_all(&self) {
        let mut table = self.table.write();
        let mut dropped = 0usize;
        for bucket in table.buckets.iter_mut() {
            bucket.retain_mut(|e| {
                e.pinned = false;
                if e.slot.is_none() {
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
        }
        table.len -= dropped;
        table.clock_bucket = 0;
        table.clock_pos = 0;
        for _ in 0..dropped {
            self.account(Some((EntryState::Placeholder, 0)), None);
        }
        self.pinned.store(0, Ordering::Relaxed);
        self.mod_count.fetch_add(1, Ordering::Release);
    }

    /// Drop every value and hand the removed slots back. Pinned keys stay
    /// behind as placeholders.
    pub(crate) fn clear(&self) -> Vec<Slot<K>> {
        let mut table = self.table.write();
        let buckets = std::mem::take(&mut table.buckets);
        let mut kept: Vec<Vec<HashEntry<K>>> = Vec::with_capacity(buckets.len());
        let mut removed = Vec::new();
        let mut len = 0;
        for bucket in buckets {
            let mut survivors = Vec::new();
            for mut entry in bucket {
                let before = entry.footprint();
                if before.0 != EntryState::Placeholder || !entry.pinned {
                    let after = entry.pinned.then_some((EntryState::Placeholder, 0));
                    self.account(Some(before), after);
                }
                removed.extend(entry.slot.take());
                if entry.pinned {
                    entry.heap_size = 0;
                    entry.spooling = false;
                    survivors.push(entry);
                    len += 1;
                }
            }
            kept.push(survivors);
        }
        table.buckets = kept;
        table.len = len;
        table.clock_bucket = 0;
        table.clock_pos = 0;
        removed
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Collect up to `n` picks total into `out`, starting at the bucket
    /// selected by `seed` and wrapping once around the table
    pub(crate) fn sample_into<T, F>(&self, seed: u32, n: usize, out: &mut Vec<T>, pick: &mut F)
    where
        F: FnMut(EntryView<'_, K>) -> Option<T>,
    {
        let table = self.table.read();
        let buckets = table.buckets.len();
        let start = seed as usize & table.mask();
        for i in 0..buckets {
            let b = (start + i) & table.mask();
            for entry in &table.buckets[b] {
                let Some(slot) = entry.slot.as_ref() else {
                    continue;
                };
                let view = EntryView {
                    key: &entry.key,
                    slot,
                    pinned: entry.pinned,
                    spooling: entry.spooling,
                };
                if let Some(t) = pick(view) {
                    out.push(t);
                    if out.len() >= n {
                        return;
                    }
                }
            }
        }
    }

    /// Visit every live entry under the read lock
    pub(crate) fn scan<T, F>(&self, out: &mut Vec<T>, pick: &mut F)
    where
        F: FnMut(EntryView<'_, K>) -> Option<T>,
    {
        let table = self.table.read();
        for (entry, slot) in table.live() {
            let view = EntryView {
                key: &entry.key,
                slot,
                pinned: entry.pinned,
                spooling: entry.spooling,
            };
            if let Some(t) = pick(view) {
                out.push(t);
            }
        }
    }

    /// Clock scan for a resident victim.
    ///
    /// Walks at most one segment's worth of entries from the saved cursor. An
    /// unpinned resident entry is returned if it is expired or its clock bit
    /// was already clear; otherwise the bit is cleared and the scan moves on.
    /// If nothing qualifies, the last unpinned resident entry seen is returned.
    pub(crate) fn clock_victim(&self, skip: Option<&K>, now: u64) -> Option<Arc<Element<K>>> {
        let mut table = self.table.write();
        let total = table.len;
        if total == 0 {
            return None;
        }

        let mask = table.mask();
        let (mut b, mut p) = (table.clock_bucket & mask, table.clock_pos);
        let mut visited = 0;
        let mut empty_buckets = 0;
        let mut fallback = None;
        let mut victim = None;

        while visited < total && empty_buckets <= mask + 1 {
            if p >= table.buckets[b].len() {
                b = (b + 1) & mask;
                p = 0;
                empty_buckets += 1;
                continue;
            }
            empty_buckets = 0;
            let entry = &table.buckets[b][p];
            p += 1;
            visited += 1;

            let Some(Slot::Resident(element)) = &entry.slot else {
                continue;
            };
            if entry.pinned || entry.spooling || skip.is_some_and(|k| *k == entry.key) {
                continue;
            }
            if element.is_expired_at(now) || !entry.accessed.swap(false, Ordering::Relaxed) {
                victim = Some(Arc::clone(element));
                break;
            }
            fallback = Some(Arc::clone(element));
        }

        table.clock_bucket = b;
        table.clock_pos = p;
        victim.or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Region;
    use crate::memory::hash_key;

    fn resident(key: u32) -> (Slot<u32>, Arc<Element<u32>>) {
        let e = Arc::new(Element::new(key, vec![0u8; 10]));
        (Slot::Resident(Arc::clone(&e)), e)
    }

    fn put(seg: &Segment<u32>, key: u32) -> Arc<Element<u32>> {
        let (slot, e) = resident(key);
        seg.put(key, hash_key(&key), slot, 10, false, false);
        e
    }

    #[test]
    fn test_put_get_remove() {
        let seg = Segment::new(4);
        let e = put(&seg, 1);
        let h = hash_key(&1u32);

        let got = seg.get(&1, h, true).unwrap();
        assert!(got.same_as(&Slot::Resident(e)));
        assert_eq!(seg.count(), 1);
        assert_eq!(seg.resident_count(), 1);
        assert_eq!(seg.resident_bytes(), 10);

        assert!(seg.remove(&1, h, None).is_some());
        assert!(seg.get(&1, h, true).is_none());
        assert_eq!(seg.count(), 0);
        assert_eq!(seg.resident_bytes(), 0);
    }

    #[test]
    fn test_put_if_absent_keeps_existing() {
        let seg = Segment::new(4);
        let first = put(&seg, 1);
        let (slot, _) = resident(1);
        let existing = seg.put(1, hash_key(&1u32), slot, 10, false, true).unwrap();
        assert!(existing.same_as(&Slot::Resident(first)));
        assert_eq!(seg.count(), 1);
    }

    #[test]
    fn test_rehash_keeps_entries() {
        let seg = Segment::new(2);
        for k in 0..500u32 {
            put(&seg, k);
        }
        assert_eq!(seg.count(), 500);
        for k in 0..500u32 {
            assert!(seg.contains_key(&k, hash_key(&k)), "lost key {}", k);
        }
    }

    #[test]
    fn test_pin_absent_key_creates_placeholder() {
        let seg: Segment<u32> = Segment::new(4);
        let h = hash_key(&7u32);

        assert!(seg.set_pinned(&7, h, true));
        assert!(seg.is_pinned(&7, h));
        assert!(!seg.contains_key(&7, h));
        assert!(seg.get(&7, h, true).is_none());
        assert_eq!(seg.count(), 0);
        assert_eq!(seg.pinned_count(), 1);
        assert_eq!(seg.placeholder_count(), 1);

        // unpinning a placeholder removes it
        assert!(seg.set_pinned(&7, h, false));
        assert_eq!(seg.pinned_count(), 0);
        assert_eq!(seg.placeholder_count(), 0);
        assert_eq!(seg.entry_state(&7, h), None);
    }

    #[test]
    fn test_put_onto_placeholder() {
        let seg = Segment::new(4);
        let h = hash_key(&3u32);
        seg.set_pinned(&3, h, true);

        let (slot, _) = resident(3);
        assert!(seg.put(3, h, slot, 10, false, false).is_none());
        assert_eq!(seg.placeholder_count(), 0);
        assert_eq!(seg.count(), 1);
        assert_eq!(seg.entry_state(&3, h), Some((EntryState::Resident, true)));
    }

    #[test]
    fn test_remove_pinned_leaves_placeholder() {
        let seg = Segment::new(4);
        let h = hash_key(&5u32);
        let (slot, _) = resident(5);
        seg.put(5, h, slot, 10, true, false);
        assert_eq!(seg.pinned_count(), 1);

        assert!(seg.remove(&5, h, None).is_some());
        assert!(seg.is_pinned(&5, h));
        assert_eq!(seg.entry_state(&5, h), Some((EntryState::Placeholder, true)));
        assert_eq!(seg.pinned_count() - seg.placeholder_count(), 0);
    }

    #[test]
    fn test_conditional_remove() {
        let seg = Segment::new(4);
        let old = put(&seg, 1);
        let _new = put(&seg, 1);
        let h = hash_key(&1u32);
        assert!(seg.remove(&1, h, Some(&Slot::Resident(old))).is_none());
        assert!(seg.contains_key(&1, h));
    }

    #[test]
    fn test_spool_commit_and_race() {
        let seg = Segment::new(4);
        let h = hash_key(&1u32);
        let e = put(&seg, 1);

        assert!(seg.begin_spool(&1, h, &e));
        assert!(!seg.begin_spool(&1, h, &e));
        assert_eq!(seg.spooling_count(), 1);
        assert_eq!(seg.resident_count(), 0);

        let marker = Arc::new(DiskMarker::new(Region::new(0, 9), u64::MAX));
        assert!(seg.commit_spool(&1, h, &e, Arc::clone(&marker)));
        assert_eq!(seg.on_disk_count(), 1);
        assert_eq!(seg.spooling_count(), 0);
        assert_eq!(seg.count(), 1);

        // a put during spooling makes the commit fail
        let e2 = put(&seg, 2);
        let h2 = hash_key(&2u32);
        assert!(seg.begin_spool(&2, h2, &e2));
        let _e3 = put(&seg, 2);
        assert!(!seg.commit_spool(&2, h2, &e2, marker));
        assert_eq!(seg.entry_state(&2, h2), Some((EntryState::Resident, false)));
    }

    #[test]
    fn test_persist_resident_ignores_pin() {
        let seg = Segment::new(4);
        let h = hash_key(&1u32);
        let e = put(&seg, 1);
        seg.set_pinned(&1, h, true);

        let marker = Arc::new(DiskMarker::new(Region::new(0, 9), u64::MAX));
        assert!(!seg.commit_spool(&1, h, &e, Arc::clone(&marker)));
        assert!(seg.persist_resident(&1, h, &e, marker));
        assert_eq!(seg.entry_state(&1, h), Some((EntryState::OnDisk, true)));
        assert_eq!(seg.resident_bytes(), 0);
    }

    #[test]
    fn test_pinned_not_spooled() {
        let seg = Segment::new(4);
        let h = hash_key(&1u32);
        let e = put(&seg, 1);
        seg.set_pinned(&1, h, true);
        assert!(!seg.begin_spool(&1, h, &e));
    }

    #[test]
    fn test_fault_in_requires_same_marker() {
        let seg: Segment<u32> = Segment::new(4);
        let h = hash_key(&1u32);
        let marker = Arc::new(DiskMarker::new(Region::new(0, 9), u64::MAX));
        seg.put(1, h, Slot::OnDisk(Arc::clone(&marker)), 0, false, false);
        assert_eq!(seg.on_disk_count(), 1);

        let other = Arc::new(DiskMarker::new(Region::new(10, 19), u64::MAX));
        let e = Arc::new(Element::new(1u32, vec![1]));
        assert!(!seg.fault_in(&1, h, &other, Arc::clone(&e), 10));
        assert!(seg.fault_in(&1, h, &marker, e, 10));
        assert_eq!(seg.on_disk_count(), 0);
        assert_eq!(seg.resident_count(), 1);
    }

    #[test]
    fn test_put_with_rolls_back_on_writer_error() {
        let seg = Segment::new(4);
        let h = hash_key(&1u32);
        let original = put(&seg, 1);

        let (slot, _) = resident(1);
        let result = seg.put_with(1, h, slot, 10, |_| {
            Err(crate::error::Error::Internal("writer down".into()))
        });
        assert!(result.is_err());
        let current = seg.get(&1, h, false).unwrap();
        assert!(current.same_as(&Slot::Resident(original)));

        let (slot, _) = resident(2);
        let result = seg.put_with(2, hash_key(&2u32), slot, 10, |_| {
            Err(crate::error::Error::Internal("writer down".into()))
        });
        assert!(result.is_err());
        assert!(!seg.contains_key(&2, hash_key(&2u32)));
        assert_eq!(seg.count(), 1);
    }

    #[test]
    fn test_clock_second_chance() {
        let seg = Segment::new(64);
        put(&seg, 1);
        put(&seg, 2);

        // fresh entries carry the clock bit: the first pass clears both and
        // falls back to the last one seen
        assert!(seg.clock_victim(None, 0).is_some());

        // touching 1 protects it for one more pass
        seg.get(&1, hash_key(&1u32), true);
        let victim = seg.clock_victim(None, 0).unwrap();
        assert_eq!(*victim.key(), 2);
    }

    #[test]
    fn test_clock_skips_pinned_and_hint() {
        let seg = Segment::new(8);
        put(&seg, 1);
        put(&seg, 2);
        seg.set_pinned(&1, hash_key(&1u32), true);

        for _ in 0..4 {
            let victim = seg.clock_victim(None, 0).unwrap();
            assert_eq!(*victim.key(), 2);
        }
        assert!(seg.clock_victim(Some(&2), 0).is_none());
    }

    #[test]
    fn test_unpin_all_and_clear() {
        let seg = Segment::new(8);
        put(&seg, 1);
        seg.set_pinned(&1, hash_key(&1u32), true);
        seg.set_pinned(&9, hash_key(&9u32), true);
        put(&seg, 2);

        assert_eq!(seg.clear().len(), 2);
        assert_eq!(seg.count(), 0);
        assert_eq!(seg.resident_bytes(), 0);
        assert_eq!(seg.placeholder_count(), 2);
        assert!(seg.is_pinned(&1, hash_key(&1u32)));

        seg.unpin_all();
        assert_eq!(seg.placeholder_count(), 0);
        assert_eq!(seg.pinned_count(), 0);
        assert_eq!(seg.entry_state(&1, hash_key(&1u32)), None);
    }

    #[test]
    fn test_sample_respects_limit_and_filter() {
        let seg = Segment::new(16);
        for k in 0..20u32 {
            put(&seg, k);
        }
        seg.set_pinned(&0, hash_key(&0u32), true);

        fn unpinned(v: EntryView<'_, u32>) -> Option<u32> {
            (!v.pinned).then(|| *v.key)
        }

        let mut out = Vec::new();
        seg.sample_into(12345, 5, &mut out, &mut unpinned);
        assert_eq!(out.len(), 5);

        let mut all = Vec::new();
        seg.sample_into(0, 100, &mut all, &mut unpinned);
        assert_eq!(all.len(), 19);
        assert!(!all.contains(&0));
    }
}
