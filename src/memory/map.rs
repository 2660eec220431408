//! Segmented element map
//!
//! Routes each key to one of a power-of-two number of [`Segment`]s by the
//! high bits of its spread hash, and aggregates the per-segment counters.

use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use super::hash::hash_key;
use super::segment::{EntryView, Segment};
use super::slot::{EntryState, Slot};
use super::{INITIAL_SEGMENT_BUCKETS, RETRIES_BEFORE_LOCK};
use crate::disk::DiskMarker;
use crate::element::Element;
use crate::error::Result;

/// Concurrent key → slot map split into independently locked segments
pub struct SegmentedMap<K> {
    segments: Box<[Segment<K>]>,
    shift: u32,
    mask: usize,
    /// Segment the next clock scan starts from
    clock_segment: AtomicUsize,
}

impl<K> std::fmt::Debug for SegmentedMap<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedMap")
            .field("segments", &self.segments.len())
            .field("quick_size", &self.quick_size())
            .finish()
    }
}

impl<K: Eq + Hash + Clone> SegmentedMap<K> {
    /// Create a map with `segment_count` segments, rounded up to a power of two
    pub fn new(segment_count: usize) -> Self {
        let count = segment_count.clamp(1, 1 << 16).next_power_of_two();
        let segments = (0..count)
            .map(|_| Segment::new(INITIAL_SEGMENT_BUCKETS))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            segments,
            shift: 32 - count.trailing_zeros(),
            mask: count - 1,
            clock_segment: AtomicUsize::new(0),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    fn segment_index(&self, hash: u32) -> usize {
        hash.checked_shr(self.shift).unwrap_or(0) as usize & self.mask
    }

    #[inline]
    fn segment_for(&self, key: &K) -> (&Segment<K>, u32) {
        let hash = hash_key(key);
        (&self.segments[self.segment_index(hash)], hash)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Slot for `key`, marking the entry as recently used
    pub fn get(&self, key: &K) -> Option<Slot<K>> {
        let (segment, hash) = self.segment_for(key);
        segment.get(key, hash, true)
    }

    /// Slot for `key` without touching clock state
    pub fn get_quiet(&self, key: &K) -> Option<Slot<K>> {
        let (segment, hash) = self.segment_for(key);
        segment.get(key, hash, false)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let (segment, hash) = self.segment_for(key);
        segment.contains_key(key, hash)
    }

    /// Accounting state and pin flag of `key`, placeholders included
    pub fn entry_state(&self, key: &K) -> Option<(EntryState, bool)> {
        let (segment, hash) = self.segment_for(key);
        segment.entry_state(key, hash)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Map `key` to `slot`, returning the previous slot. `pin` adds a pin;
    /// it never clears one.
    pub fn put(&self, key: K, slot: Slot<K>, heap_size: u64, pin: bool) -> Option<Slot<K>> {
        let (segment, hash) = self.segment_for(&key);
        segment.put(key, hash, slot, heap_size, pin, false)
    }

    /// Map `key` to `slot` unless it already has a value, which is returned
    pub fn put_if_absent(&self, key: K, slot: Slot<K>, heap_size: u64) -> Option<Slot<K>> {
        let (segment, hash) = self.segment_for(&key);
        segment.put(key, hash, slot, heap_size, false, true)
    }

    /// Map `key` to `slot` and call `writer` under the same segment lock.
    /// A writer error restores the previous mapping and is returned.
    pub fn put_with<F>(&self, key: K, slot: Slot<K>, heap_size: u64, writer: F) -> Result<Option<Slot<K>>>
    where
        F: FnOnce(&Slot<K>) -> Result<()>,
    {
        let (segment, hash) = self.segment_for(&key);
        segment.put_with(key, hash, slot, heap_size, writer)
    }

    /// Remove `key`'s value; a pinned key keeps a placeholder
    pub fn remove(&self, key: &K) -> Option<Slot<K>> {
        let (segment, hash) = self.segment_for(key);
        segment.remove(key, hash, None)
    }

    /// Remove `key`'s value only if it is still exactly `expected`
    pub fn remove_if(&self, key: &K, expected: &Slot<K>) -> Option<Slot<K>> {
        let (segment, hash) = self.segment_for(key);
        segment.remove(key, hash, Some(expected))
    }

    /// Replace the marker `expected` with the resident `element`
    pub fn fault_in(
        &self,
        key: &K,
        expected: &Arc<DiskMarker<K>>,
        element: Arc<Element<K>>,
        heap_size: u64,
    ) -> bool {
        let (segment, hash) = self.segment_for(key);
        segment.fault_in(key, hash, expected, element, heap_size)
    }

    /// Flag `element` as queued for the disk tier
    pub fn begin_spool(&self, key: &K, element: &Arc<Element<K>>) -> bool {
        let (segment, hash) = self.segment_for(key);
        segment.begin_spool(key, hash, element)
    }

    /// Return a queued element to plain residency
    pub fn abort_spool(&self, key: &K, element: &Arc<Element<K>>) -> bool {
        let (segment, hash) = self.segment_for(key);
        segment.abort_spool(key, hash, element)
    }

    /// Swap a queued element for its disk marker
    pub fn commit_spool(&self, key: &K, element: &Arc<Element<K>>, marker: Arc<DiskMarker<K>>) -> bool {
        let (segment, hash) = self.segment_for(key);
        segment.commit_spool(key, hash, element, marker)
    }

    /// Swap a resident element for its marker whatever its pin or spool state
    pub fn persist_resident(&self, key: &K, element: &Arc<Element<K>>, marker: Arc<DiskMarker<K>>) -> bool {
        let (segment, hash) = self.segment_for(key);
        segment.persist_resident(key, hash, element, marker)
    }

    // =========================================================================
    // Pinning
    // =========================================================================

    /// Pin or unpin `key`. Pinning an absent key creates a placeholder so the
    /// pin applies to a later put.
    pub fn set_pinned(&self, key: &K, pinned: bool) -> bool {
        let (segment, hash) = self.segment_for(key);
        segment.set_pinned(key, hash, pinned)
    }

    pub fn is_pinned(&self, key: &K) -> bool {
        let (segment, hash) = self.segment_for(key);
        segment.is_pinned(key, hash)
    }

    pub fn unpin_all(&self) {
        for segment in self.segments.iter() {
            segment.unpin_all();
        }
    }

    /// Drop all values, returning them; pins survive as placeholders
    pub fn clear(&self) -> Vec<Slot<K>> {
        self.segments.iter().flat_map(|s| s.clear()).collect()
    }

    // =========================================================================
    // Sampling and scans
    // =========================================================================

    /// Collect up to `n` picks, starting in the segment of `hint` (or a
    /// random one) at a random bucket and visiting segments in order from there
    pub fn sample_with<T, F>(&self, n: usize, hint: Option<&K>, mut pick: F) -> Vec<T>
    where
        F: FnMut(EntryView<'_, K>) -> Option<T>,
    {
        let mut out = Vec::with_capacity(n);
        if n == 0 {
            return out;
        }
        let seed: u32 = rand::thread_rng().gen();
        let start = self.segment_index(hint.map_or(seed, hash_key));
        for i in 0..self.segments.len() {
            let segment = &self.segments[(start + i) & self.mask];
            segment.sample_into(seed, n, &mut out, &mut pick);
            if out.len() >= n {
                break;
            }
        }
        out
    }

    /// Up to `n` resident elements that may be evicted: unpinned and not
    /// already queued for disk
    pub fn random_sample(&self, n: usize, hint: Option<&K>) -> Vec<Arc<Element<K>>> {
        self.sample_with(n, hint, |view| match view.slot {
            Slot::Resident(e) if !view.pinned && !view.spooling => Some(Arc::clone(e)),
            _ => None,
        })
    }

    /// Up to `n` unpinned disk markers with their keys
    pub fn sample_on_disk(&self, n: usize, hint: Option<&K>) -> Vec<(K, Arc<DiskMarker<K>>)> {
        self.sample_with(n, hint, |view| match view.slot {
            Slot::OnDisk(m) if !view.pinned => Some((view.key.clone(), Arc::clone(m))),
            _ => None,
        })
    }

    /// Clock selection across segments, rotating the starting segment
    pub fn clock_victim(&self, skip: Option<&K>, now: u64) -> Option<Arc<Element<K>>> {
        let start = self.clock_segment.fetch_add(1, Ordering::Relaxed);
        (0..self.segments.len()).find_map(|i| {
            self.segments[(start + i) & self.mask].clock_victim(skip, now)
        })
    }

    /// Visit every live entry, segment by segment
    pub fn collect<T, F>(&self, mut pick: F) -> Vec<T>
    where
        F: FnMut(EntryView<'_, K>) -> Option<T>,
    {
        let mut out = Vec::new();
        for segment in self.segments.iter() {
            segment.scan(&mut out, &mut pick);
        }
        out
    }

    /// Keys with a value, in either tier
    pub fn keys(&self) -> Vec<K> {
        self.collect(|view| Some(view.key.clone()))
    }
}

impl<K> SegmentedMap<K> {
    /// Exact number of entries holding a value.
    ///
    /// Sums the segment counters without locking, accepting the result if no
    /// segment changed during the pass. After [`RETRIES_BEFORE_LOCK`] failed
    /// passes every segment is read-locked in order.
    pub fn size(&self) -> usize {
        for _ in 0..RETRIES_BEFORE_LOCK {
            let mods: Vec<u64> = self.segments.iter().map(|s| s.mod_count()).collect();
            let sum: usize = self.segments.iter().map(|s| s.count()).sum();
            let stable = self
                .segments
                .iter()
                .zip(mods)
                .all(|(s, m)| s.mod_count() == m);
            if stable {
                return sum;
            }
        }
        let _guards: Vec<_> = self.segments.iter().map(|s| s.lock_shared()).collect();
        self.segments.iter().map(|s| s.count()).sum()
    }

    /// Unsynchronized sum of segment counts
    pub fn quick_size(&self) -> usize {
        self.segments.iter().map(|s| s.count()).sum()
    }

    /// Pinned keys that hold a value
    pub fn pinned_size(&self) -> usize {
        self.pinned_count().saturating_sub(self.placeholder_size())
    }

    /// All pins, placeholders included
    pub fn pinned_count(&self) -> usize {
        self.segments.iter().map(|s| s.pinned_count()).sum()
    }

    pub fn placeholder_size(&self) -> usize {
        self.segments.iter().map(|s| s.placeholder_count()).sum()
    }

    /// Elements held in memory, spooling ones included
    pub fn in_memory_size(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.resident_count() + s.spooling_count())
            .sum()
    }

    /// Elements in memory that are not queued for disk
    pub fn resident_size(&self) -> usize {
        self.segments.iter().map(|s| s.resident_count()).sum()
    }

    pub fn spooling_size(&self) -> usize {
        self.segments.iter().map(|s| s.spooling_count()).sum()
    }

    pub fn on_disk_size(&self) -> usize {
        self.segments.iter().map(|s| s.on_disk_count()).sum()
    }

    /// Estimated heap bytes of in-memory elements, spooling ones included
    pub fn in_memory_bytes(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.resident_bytes() + s.spooling_bytes())
            .sum()
    }

    /// Estimated heap bytes of elements not queued for disk
    pub fn resident_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.resident_bytes()).sum()
    }

    pub fn spooling_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.spooling_bytes()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.quick_size() == 0
    }
}
