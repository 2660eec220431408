//! Tier Coordinator
//!
//! [`TieredStore`] puts the segmented map in front of an optional disk
//! backing store and decides where each element lives.
//!
//! # Write path
//!
//! ```text
//! put ──> map.put (Resident) ──> over capacity? ──> sample ──> policy picks victim
//!                                                               │
//!                               disk tier + unexpired ──> flag Spooling, queue SpoolTask
//!                               otherwise ─────────────> remove, notify Evicted/Expired
//!
//! spool worker ──> disk.write ──> commit_spool (slot still this element?) ──> OnDisk
//!                                      └─ no ──> free the region, discard
//! ```
//!
//! # Read path
//!
//! ```text
//! get ──> Resident ──> expired? remove + notify : touch stats
//!     └─> OnDisk   ──> expired? remove + notify : disk.read ──> fault in (optional)
//! ```
//!
//! Only the caller that removes a marker from the map frees its region.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use super::accounting::{StoreCounters, StoreStatistics};
use super::workers::{SpoolTask, Workers};
use super::StoreKey;
use crate::config::{PolicyKind, StoreConfig};
use crate::disk::{DiskBackingStore, DiskMarker};
use crate::element::{current_time_millis, Element};
use crate::error::{Error, Result};
use crate::events::{RemovalCause, StoreEventListener};
use crate::memory::{SegmentedMap, Slot};
use crate::policy::{policy_for, EvictionPolicy};

/// Eviction passes attempted by a single capacity check
const MAX_EVICTION_PASSES: usize = 5;

/// Disk entries removed per disk capacity check
const MAX_DISK_EVICTIONS: usize = 5;

/// Sleep between checks of a full spool queue
const SPOOL_BACKOFF: Duration = Duration::from_millis(50);

/// Back-off rounds before a put proceeds regardless of the spool queue
const SPOOL_BACKOFF_ROUNDS: usize = 10;

/// Lookups retried when a slot changes underneath a read
const READ_ATTEMPTS: usize = 3;

/// Outcome of resolving one slot
enum Resolved<K> {
    Found(Arc<Element<K>>),
    /// The key has no live value (missing, expired or undecodable)
    Gone,
    /// The slot changed while it was being read; look again
    Moved,
}

// =============================================================================
// Shared state
// =============================================================================

/// State shared between the store handle and its workers
pub(crate) struct StoreInner<K: StoreKey> {
    name: String,
    config: StoreConfig,
    map: SegmentedMap<K>,
    disk: Option<DiskBackingStore<K>>,
    policy: Arc<dyn EvictionPolicy<K>>,
    listeners: RwLock<Vec<Arc<dyn StoreEventListener<K>>>>,
    counters: StoreCounters,
    spool_tx: Option<Sender<SpoolTask<K>>>,
    disposed: AtomicBool,
}

impl<K: StoreKey> StoreInner<K> {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.disk.as_ref().is_some_and(|d| d.is_persistent())
    }

    fn check_alive(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed(self.name.clone()));
        }
        Ok(())
    }

    fn disk(&self) -> Result<&DiskBackingStore<K>> {
        self.disk
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("store {} has no disk tier", self.name)))
    }

    fn notify(&self, element: &Arc<Element<K>>, cause: RemovalCause) {
        match cause {
            RemovalCause::Evicted => self.counters.record_eviction(),
            RemovalCause::Expired => self.counters.record_expiration(),
        }
        trace!(store = %self.name, key = ?element.key(), %cause, "element removed");
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_removal(element, cause);
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    fn prepare(&self, mut element: Element<K>) -> Arc<Element<K>> {
        element.apply_defaults(
            self.config.default_ttl_secs,
            self.config.default_tti_secs,
            self.config.eternal,
        );
        Arc::new(element)
    }

    /// Release what a put displaced. Returns true if a mapping was replaced.
    fn release_previous(&self, previous: Option<Slot<K>>, element: &Element<K>) -> bool {
        let Some(previous) = previous else {
            return false;
        };
        if let (Slot::OnDisk(marker), Some(disk)) = (&previous, self.disk.as_ref()) {
            disk.free(marker);
        }
        element.update_update_statistics();
        self.counters.record_update();
        true
    }

    fn put(&self, element: Element<K>, pin: bool) -> Result<bool> {
        self.check_alive()?;
        let element = self.prepare(element);
        let key = element.key().clone();
        let heap = element.heap_size();

        let previous = self
            .map
            .put(key.clone(), Slot::Resident(Arc::clone(&element)), heap, pin);
        let replaced = self.release_previous(previous, &element);
        self.counters.record_put();
        trace!(store = %self.name, key = ?key, replaced, "put");

        self.after_put(&key);
        Ok(!replaced)
    }

    fn put_if_absent(&self, element: Element<K>) -> Result<Option<Arc<Element<K>>>> {
        self.check_alive()?;
        let element = self.prepare(element);
        let key = element.key().clone();
        let heap = element.heap_size();

        for _ in 0..READ_ATTEMPTS {
            let slot = Slot::Resident(Arc::clone(&element));
            match self.map.put_if_absent(key.clone(), slot, heap) {
                None => {
                    self.counters.record_put();
                    self.after_put(&key);
                    return Ok(None);
                }
                Some(existing) => match self.resolve(&key, existing, true)? {
                    Resolved::Found(current) => return Ok(Some(current)),
                    Resolved::Gone | Resolved::Moved => continue,
                },
            }
        }
        Err(Error::Internal(format!(
            "put_if_absent on {} kept racing concurrent updates of {:?}",
            self.name, key
        )))
    }

    fn put_with_writer<F>(&self, element: Element<K>, writer: F) -> Result<bool>
    where
        F: FnOnce(&Element<K>) -> Result<()>,
    {
        self.check_alive()?;
        let element = self.prepare(element);
        let key = element.key().clone();
        let heap = element.heap_size();

        let previous = self.map.put_with(
            key.clone(),
            Slot::Resident(Arc::clone(&element)),
            heap,
            |_| writer(&element),
        )?;
        let replaced = self.release_previous(previous, &element);
        self.counters.record_put();

        self.after_put(&key);
        Ok(!replaced)
    }

    fn after_put(&self, key: &K) {
        self.throttle_spool();
        self.enforce_capacity(Some(key));
    }

    /// Hold the caller back while the spool queue is over its byte budget
    fn throttle_spool(&self) {
        let Some(limit) = self.config.disk.as_ref().map(|d| d.spool_buffer_bytes) else {
            return;
        };
        if limit == 0 {
            return;
        }
        for _ in 0..SPOOL_BACKOFF_ROUNDS {
            if self.counters.spool_queue_bytes() <= limit {
                return;
            }
            thread::sleep(SPOOL_BACKOFF);
        }
        debug!(
            store = %self.name,
            queued = self.counters.spool_queue_bytes(),
            limit,
            "spool queue still full, proceeding"
        );
    }

    // =========================================================================
    // Memory capacity
    // =========================================================================

    fn over_memory_capacity(&self) -> bool {
        let max = self.config.max_elements_in_memory;
        let max_bytes = self.config.max_bytes_in_memory;
        (max > 0 && self.map.resident_size() > max)
            || (max_bytes > 0 && self.map.resident_bytes() > max_bytes)
    }

    fn enforce_capacity(&self, hint: Option<&K>) {
        for _ in 0..MAX_EVICTION_PASSES {
            if !self.over_memory_capacity() {
                return;
            }
            let Some(victim) = self.select_victim(hint) else {
                return;
            };
            self.evict_or_spool(victim);
        }
    }

    fn select_victim(&self, hint: Option<&K>) -> Option<Arc<Element<K>>> {
        let now = current_time_millis();
        if self.config.eviction_policy == PolicyKind::Clock {
            return self
                .map
                .clock_victim(hint, now)
                .or_else(|| self.map.clock_victim(None, now));
        }

        let sample = self
            .map
            .random_sample(self.config.eviction_sample_size, hint);
        if let Some(expired) = sample.iter().find(|e| e.is_expired_at(now)) {
            return Some(Arc::clone(expired));
        }
        self.policy.select(&sample, hint).cloned()
    }

    fn evict_or_spool(&self, victim: Arc<Element<K>>) {
        let key = victim.key().clone();
        let now = current_time_millis();

        if let Some(tx) = self.spool_tx.as_ref().filter(|_| !victim.is_expired_at(now)) {
            if !self.map.begin_spool(&key, &victim) {
                return;
            }
            let bytes = victim.heap_size();
            self.counters.queue_spool_bytes(bytes);
            let task = SpoolTask {
                key,
                element: victim,
                bytes,
            };
            if let Err(channel::SendError(task)) = tx.send(task) {
                self.counters.dequeue_spool_bytes(task.bytes);
                self.map.abort_spool(&task.key, &task.element);
            }
            return;
        }

        let slot = Slot::Resident(Arc::clone(&victim));
        if self.map.remove_if(&key, &slot).is_some() {
            self.notify(&victim, RemovalCause::for_element(&victim, now));
        }
    }

    // =========================================================================
    // Spooling
    // =========================================================================

    /// Write one queued element to disk and swap it for its marker
    pub(crate) fn spool(&self, task: SpoolTask<K>) {
        self.counters.dequeue_spool_bytes(task.bytes);
        let Some(disk) = self.disk.as_ref() else {
            return;
        };

        let current = self.map.get_quiet(&task.key);
        let still_queued = current
            .as_ref()
            .and_then(Slot::as_resident)
            .is_some_and(|e| Arc::ptr_eq(e, &task.element));
        if !still_queued {
            self.counters.record_spool_discard();
            return;
        }

        let marker = match disk.write(&task.element) {
            Ok(marker) => marker,
            Err(e) => {
                error!(store = %self.name, key = ?task.key, error = %e, "spool write failed, element stays in memory");
                self.counters.record_spool_failure();
                self.map.abort_spool(&task.key, &task.element);
                return;
            }
        };

        if self
            .map
            .commit_spool(&task.key, &task.element, Arc::clone(&marker))
        {
            self.counters.record_spool();
            trace!(store = %self.name, key = ?task.key, offset = marker.offset(), len = marker.length(), "spooled");
            self.enforce_disk_capacity(Some(&task.key));
        } else {
            disk.free(&marker);
            self.counters.record_spool_discard();
        }
    }

    /// Drop a queued task without writing it
    pub(crate) fn discard_spool(&self, task: SpoolTask<K>) {
        self.counters.dequeue_spool_bytes(task.bytes);
        self.map.abort_spool(&task.key, &task.element);
    }

    fn over_disk_capacity(&self) -> bool {
        let (Some(config), Some(disk)) = (self.config.disk.as_ref(), self.disk.as_ref()) else {
            return false;
        };
        (config.max_elements_on_disk > 0 && self.map.on_disk_size() > config.max_elements_on_disk)
            || (config.max_bytes_on_disk > 0 && disk.bytes_on_disk() > config.max_bytes_on_disk)
    }

    /// Remove the least-hit sampled disk entries while the disk tier is full
    fn enforce_disk_capacity(&self, hint: Option<&K>) {
        for _ in 0..MAX_DISK_EVICTIONS {
            if !self.over_disk_capacity() {
                return;
            }
            let sample = self
                .map
                .sample_on_disk(self.config.eviction_sample_size, hint);
            let victim = sample
                .iter()
                .filter(|(key, _)| Some(key) != hint)
                .min_by_key(|(_, marker)| marker.hit_count())
                .or_else(|| sample.first());
            let Some((key, marker)) = victim else {
                return;
            };
            if self.drop_marker(key, marker, current_time_millis()) {
                self.counters.record_disk_eviction();
            }
        }
    }

    /// Remove an on-disk entry the store chose to drop, notifying listeners.
    /// Returns false if the slot had already changed.
    fn drop_marker(&self, key: &K, marker: &Arc<DiskMarker<K>>, now: u64) -> bool {
        let Some(disk) = self.disk.as_ref() else {
            return false;
        };
        if self
            .map
            .remove_if(key, &Slot::OnDisk(Arc::clone(marker)))
            .is_none()
        {
            return false;
        }
        let read = disk.read(marker);
        disk.free(marker);
        match read {
            Ok(element) => {
                let cause = if marker.is_expired_at(now) {
                    RemovalCause::Expired
                } else {
                    RemovalCause::for_element(&element, now)
                };
                self.notify(&element, cause);
            }
            Err(e) => {
                warn!(store = %self.name, key = ?key, error = %e, "removed element could not be read back for notification");
                self.counters.record_disk_read_failure();
            }
        }
        true
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn get(&self, key: &K, quiet: bool) -> Result<Option<Arc<Element<K>>>> {
        self.check_alive()?;
        for _ in 0..READ_ATTEMPTS {
            let slot = if quiet {
                self.map.get_quiet(key)
            } else {
                self.map.get(key)
            };
            let Some(slot) = slot else {
                break;
            };
            match self.resolve(key, slot, quiet)? {
                Resolved::Found(element) => return Ok(Some(element)),
                Resolved::Gone => break,
                Resolved::Moved => continue,
            }
        }
        if !quiet {
            self.counters.record_miss();
        }
        Ok(None)
    }

    fn resolve(&self, key: &K, slot: Slot<K>, quiet: bool) -> Result<Resolved<K>> {
        let now = current_time_millis();
        match slot {
            Slot::Resident(element) => {
                if element.is_expired_at(now) {
                    let slot = Slot::Resident(Arc::clone(&element));
                    if self.map.remove_if(key, &slot).is_some() {
                        self.notify(&element, RemovalCause::Expired);
                    }
                    return Ok(Resolved::Gone);
                }
                if !quiet {
                    element.update_access_statistics();
                    self.counters.record_memory_hit();
                }
                Ok(Resolved::Found(element))
            }
            Slot::OnDisk(marker) => {
                if marker.is_expired_at(now) {
                    self.drop_marker(key, &marker, now);
                    return Ok(Resolved::Gone);
                }
                self.read_from_disk(key, marker, quiet, now)
            }
        }
    }

    fn read_from_disk(
        &self,
        key: &K,
        marker: Arc<DiskMarker<K>>,
        quiet: bool,
        now: u64,
    ) -> Result<Resolved<K>> {
        let disk = self.disk()?;
        let slot = Slot::OnDisk(Arc::clone(&marker));

        let element = match disk.read(&marker) {
            Ok(element) => element,
            Err(e) if e.is_corruption() => {
                return Ok(self.discard_unreadable(key, &marker, &e.to_string()));
            }
            Err(e) => {
                // a region freed and truncated away under a stale marker
                if !self.holds(key, &slot) {
                    return Ok(Resolved::Moved);
                }
                error!(store = %self.name, key = ?key, error = %e, "disk read failed");
                self.counters.record_disk_read_failure();
                return Err(Error::DiskRead {
                    key: format!("{:?}", key),
                    reason: e.to_string(),
                });
            }
        };

        // a marker still mapped owns its region, so another key there is corruption
        if element.key() != key {
            let reason = format!("region holds key {:?}", element.key());
            return Ok(self.discard_unreadable(key, &marker, &reason));
        }

        if element.is_expired_at(now) {
            if self.drop_marker(key, &marker, now) {
                return Ok(Resolved::Gone);
            }
            return Ok(Resolved::Moved);
        }

        if quiet {
            return Ok(Resolved::Found(element));
        }

        element.update_access_statistics();
        marker.hit(&element);
        self.counters.record_disk_hit();

        let fault_in = self.config.disk.as_ref().is_some_and(|d| d.fault_in);
        if fault_in {
            let heap = element.heap_size();
            if self.map.fault_in(key, &marker, Arc::clone(&element), heap) {
                disk.free(&marker);
                self.counters.record_fault_in();
                trace!(store = %self.name, key = ?key, "faulted in");
                self.enforce_capacity(Some(key));
            }
        }
        Ok(Resolved::Found(element))
    }

    /// Whether `key` still maps to exactly `slot`
    fn holds(&self, key: &K, slot: &Slot<K>) -> bool {
        self.map
            .get_quiet(key)
            .is_some_and(|current| current.same_as(slot))
    }

    /// Drop a marker whose bytes cannot be turned back into its element.
    /// Returns `Moved` if the marker was replaced in the meantime.
    fn discard_unreadable(
        &self,
        key: &K,
        marker: &Arc<DiskMarker<K>>,
        reason: &str,
    ) -> Resolved<K> {
        let slot = Slot::OnDisk(Arc::clone(marker));
        if self.map.remove_if(key, &slot).is_none() {
            return Resolved::Moved;
        }
        warn!(
            store = %self.name,
            key = ?key,
            offset = marker.offset(),
            len = marker.length(),
            %reason,
            "discarding unreadable element"
        );
        self.counters.record_disk_read_failure();
        if let Some(disk) = self.disk.as_ref() {
            disk.free(marker);
        }
        Resolved::Gone
    }

    // =========================================================================
    // Removal
    // =========================================================================

    fn remove(&self, key: &K) -> Result<Option<Arc<Element<K>>>> {
        self.check_alive()?;
        let Some(slot) = self.map.remove(key) else {
            return Ok(None);
        };
        Ok(self.release_removed(key, slot))
    }

    fn release_removed(&self, key: &K, slot: Slot<K>) -> Option<Arc<Element<K>>> {
        match slot {
            Slot::Resident(element) => Some(element),
            Slot::OnDisk(marker) => {
                let disk = self.disk.as_ref()?;
                let read = disk.read(&marker);
                disk.free(&marker);
                match read {
                    Ok(element) => Some(element),
                    Err(e) => {
                        warn!(store = %self.name, key = ?key, error = %e, "removed element could not be read back");
                        self.counters.record_disk_read_failure();
                        None
                    }
                }
            }
        }
    }

    fn remove_all(&self) -> Result<()> {
        self.check_alive()?;
        let removed = self.map.clear();
        if let Some(disk) = self.disk.as_ref() {
            for slot in &removed {
                if let Slot::OnDisk(marker) = slot {
                    disk.free(marker);
                }
            }
        }
        info!(store = %self.name, removed = removed.len(), "removed all elements");
        Ok(())
    }

    /// Sweep expired elements out of both tiers
    pub(crate) fn expire_elements(&self) -> usize {
        let now = current_time_millis();
        let expired = self.map.collect(|view| {
            view.slot
                .is_expired_at(now)
                .then(|| (view.key.clone(), view.slot.clone()))
        });

        let mut count = 0;
        for (key, slot) in expired {
            let removed = match &slot {
                Slot::Resident(element) => {
                    let gone = self.map.remove_if(&key, &slot).is_some();
                    if gone {
                        self.notify(element, RemovalCause::Expired);
                    }
                    gone
                }
                Slot::OnDisk(marker) => self.drop_marker(&key, marker, now),
            };
            count += usize::from(removed);
        }
        debug!(store = %self.name, expired = count, "expiry sweep");
        count
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn flush(&self) -> Result<()> {
        self.check_alive()?;
        self.write_index()
    }

    fn write_index(&self) -> Result<()> {
        let Some(disk) = self.disk.as_ref().filter(|d| d.is_persistent()) else {
            return Ok(());
        };
        let entries = self.map.collect(|view| match view.slot {
            Slot::OnDisk(marker) => Some((view.key.clone(), marker.record())),
            Slot::Resident(_) => None,
        });
        disk.write_index(&entries)
    }

    /// Write every element still in memory to disk, pinned ones included
    /// Elements that could not be written are left out of the index; the
    /// first such failure is returned after every other element is tried.
    fn spool_all_resident(&self) -> Result<usize> {
        let Some(disk) = self.disk.as_ref() else {
            return Ok(0);
        };
        let resident = self.map.collect(|view| match view.slot {
            Slot::Resident(element) => Some((view.key.clone(), Arc::clone(element))),
            Slot::OnDisk(_) => None,
        });

        let mut written = 0;
        let mut first_failure = None;
        for (key, element) in resident {
            match disk.write(&element) {
                Ok(marker) => {
                    if self.map.persist_resident(&key, &element, Arc::clone(&marker)) {
                        written += 1;
                    } else {
                        disk.free(&marker);
                    }
                }
                Err(e) => {
                    error!(store = %self.name, key = ?key, error = %e, "could not persist element at shutdown");
                    self.counters.record_spool_failure();
                    if first_failure.is_none() {
                        first_failure = Some(Error::DiskWrite {
                            key: format!("{:?}", key),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    fn statistics(&self) -> StoreStatistics {
        let mut stats = StoreStatistics {
            name: self.name.clone(),
            taken_at: Some(Utc::now()),
            size: self.map.size(),
            in_memory_size: self.map.in_memory_size(),
            on_disk_size: self.map.on_disk_size(),
            spooling: self.map.spooling_size(),
            pinned: self.map.pinned_size(),
            in_memory_bytes: self.map.in_memory_bytes(),
            on_disk_bytes: self.disk.as_ref().map_or(0, |d| d.bytes_on_disk()),
            data_file_bytes: self.disk.as_ref().map_or(0, |d| d.file_size()),
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }
}

// =============================================================================
// TieredStore
// =============================================================================

/// A memory tier with optional disk overflow, safe to share between threads
///
/// # Example
///
/// ```no_run
/// use tierstore::{Element, StoreConfig, TieredStore};
///
/// let store: TieredStore<String> = TieredStore::open(StoreConfig::new("users", 1000))?;
/// store.put(Element::new("alice".to_string(), b"admin".to_vec()))?;
/// assert!(store.get(&"alice".to_string())?.is_some());
/// store.dispose()?;
/// # Ok::<(), tierstore::Error>(())
/// ```
pub struct TieredStore<K: StoreKey> {
    inner: Arc<StoreInner<K>>,
    workers: Mutex<Option<Workers>>,
}

impl<K: StoreKey> std::fmt::Debug for TieredStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore")
            .field("name", &self.inner.name)
            .field("map", &self.inner.map)
            .field("disk", &self.inner.disk)
            .finish()
    }
}

impl<K: StoreKey> TieredStore<K> {
    /// Build a store from `config`, loading a persisted index if there is one
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let name = config.name.clone();

        let disk = config
            .disk
            .as_ref()
            .map(|d| DiskBackingStore::open(&name, d))
            .transpose()?;
        let (spool_tx, spool_rx) = match disk {
            Some(_) => {
                let (tx, rx) = channel::unbounded();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let inner = Arc::new(StoreInner {
            name: name.clone(),
            map: SegmentedMap::new(config.segment_count),
            policy: policy_for(config.eviction_policy),
            listeners: RwLock::new(Vec::new()),
            counters: StoreCounters::new(),
            spool_tx,
            disposed: AtomicBool::new(false),
            disk,
            config,
        });

        if let Some(disk) = inner.disk.as_ref() {
            let loaded = disk.load_index()?;
            for (key, marker) in loaded {
                inner.map.put(key, Slot::OnDisk(marker), 0, false);
            }
        }

        let workers = Workers::start(&inner, spool_rx, inner.config.expiry_interval())?;

        info!(
            store = %name,
            segments = inner.map.segment_count(),
            policy = %inner.config.eviction_policy,
            max_in_memory = inner.config.max_elements_in_memory,
            disk = inner.disk.is_some(),
            restored = inner.map.on_disk_size(),
            "opened store"
        );

        Ok(Self {
            inner,
            workers: Mutex::new(Some(workers)),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look up `key`, updating access statistics and faulting a disk hit
    /// back into memory when configured to
    pub fn get(&self, key: &K) -> Result<Option<Arc<Element<K>>>> {
        self.inner.get(key, false)
    }

    /// Look up `key` without touching statistics or moving it between tiers.
    /// Expired elements are still removed.
    pub fn get_quiet(&self, key: &K) -> Result<Option<Arc<Element<K>>>> {
        self.inner.get(key, true)
    }

    /// Whether `key` has a value in either tier. Does not check expiry.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.map.contains_key(key)
    }

    /// Snapshot of the keys with a value in either tier
    pub fn keys(&self) -> Result<Vec<K>> {
        self.inner.check_alive()?;
        Ok(self.inner.map.keys())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `element`. Returns true if the key had no previous value.
    pub fn put(&self, element: Element<K>) -> Result<bool> {
        self.inner.put(element, false)
    }

    /// Store `element` and pin its key
    pub fn put_pinned(&self, element: Element<K>) -> Result<bool> {
        self.inner.put(element, true)
    }

    /// Store `element` unless the key already holds an unexpired value, which
    /// is returned instead
    pub fn put_if_absent(&self, element: Element<K>) -> Result<Option<Arc<Element<K>>>> {
        self.inner.put_if_absent(element)
    }

    /// Store `element` and call `writer` with it while the key's segment is
    /// still locked. If `writer` fails, the previous value is restored and
    /// the writer's error returned.
    ///
    /// `writer` must not call back into this store.
    pub fn put_with_writer<F>(&self, element: Element<K>, writer: F) -> Result<bool>
    where
        F: FnOnce(&Element<K>) -> Result<()>,
    {
        self.inner.put_with_writer(element, writer)
    }

    /// Remove `key`, returning its element. Listeners are not notified.
    pub fn remove(&self, key: &K) -> Result<Option<Arc<Element<K>>>> {
        self.inner.remove(key)
    }

    /// Remove every element from both tiers. Pins are kept.
    pub fn remove_all(&self) -> Result<()> {
        self.inner.remove_all()
    }

    /// Run an expiry sweep now, returning the number of elements removed
    pub fn expire_elements(&self) -> Result<usize> {
        self.inner.check_alive()?;
        Ok(self.inner.expire_elements())
    }

    // =========================================================================
    // Pinning
    // =========================================================================

    /// Pin or unpin `key`; a pin on an absent key applies to a later put
    pub fn set_pinned(&self, key: &K, pinned: bool) -> Result<()> {
        self.inner.check_alive()?;
        self.inner.map.set_pinned(key, pinned);
        if !pinned {
            self.inner.enforce_capacity(None);
        }
        Ok(())
    }

    pub fn is_pinned(&self, key: &K) -> bool {
        self.inner.map.is_pinned(key)
    }

    pub fn unpin_all(&self) -> Result<()> {
        self.inner.check_alive()?;
        self.inner.map.unpin_all();
        self.inner.enforce_capacity(None);
        Ok(())
    }

    // =========================================================================
    // Sizes
    // =========================================================================

    /// Exact number of elements across both tiers
    pub fn size(&self) -> usize {
        self.inner.map.size()
    }

    /// Approximate size, read without locking
    pub fn quick_size(&self) -> usize {
        self.inner.map.quick_size()
    }

    /// Elements held in memory, including those queued for disk
    pub fn in_memory_size(&self) -> usize {
        self.inner.map.in_memory_size()
    }

    pub fn on_disk_size(&self) -> usize {
        self.inner.map.on_disk_size()
    }

    /// Elements waiting for the spool worker
    pub fn spooling_size(&self) -> usize {
        self.inner.map.spooling_size()
    }

    pub fn in_memory_bytes(&self) -> u64 {
        self.inner.map.in_memory_bytes()
    }

    pub fn on_disk_bytes(&self) -> u64 {
        self.inner.disk.as_ref().map_or(0, |d| d.bytes_on_disk())
    }

    pub fn statistics(&self) -> StoreStatistics {
        self.inner.statistics()
    }

    // =========================================================================
    // Events and lifecycle
    // =========================================================================

    /// Receive eviction and expiry notifications
    pub fn register_listener(&self, listener: Arc<dyn StoreEventListener<K>>) {
        self.inner.listeners.write().push(listener);
    }

    /// Persist the index of disk-resident elements (persistent stores only)
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    /// Whether [`dispose`](Self::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Shut the store down.
    ///
    /// Stops the workers (the spool queue is drained first), then for a
    /// persistent store writes every in-memory element to disk and saves the
    /// index. The data file is closed and its claim released. Later calls
    /// fail with [`Error::Disposed`]; disposing twice is a no-op.
    pub fn dispose(&self) -> Result<()> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(workers) = self.workers.lock().take() {
            workers.stop();
        }

        let Some(disk) = self.inner.disk.as_ref() else {
            info!(store = %self.inner.name, "disposed store");
            return Ok(());
        };

        let mut result = Ok(());
        if disk.is_persistent() {
            match self.inner.spool_all_resident() {
                Ok(written) => {
                    debug!(store = %self.inner.name, written, "persisted in-memory elements")
                }
                Err(e) => result = Err(e),
            }
            if let Err(e) = self.inner.write_index() {
                error!(store = %self.inner.name, error = %e, "failed to write index at shutdown");
                result = result.and(Err(e));
            }
        }
        if let Err(e) = disk.close() {
            error!(store = %self.inner.name, error = %e, "failed to close data file");
            result = result.and(Err(e));
        }

        info!(
            store = %self.inner.name,
            on_disk = self.inner.map.on_disk_size(),
            "disposed store"
        );
        result
    }
}

impl<K: StoreKey> Drop for TieredStore<K> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(store = %self.inner.name, error = %e, "dispose on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use crate::events::RecordingListener;
    use std::time::Instant;

    fn memory_store(max: usize) -> TieredStore<String> {
        TieredStore::open(StoreConfig::new("mem", max)).unwrap()
    }

    fn disk_store(dir: &std::path::Path, name: &str, max: usize) -> TieredStore<String> {
        let config = StoreConfig::new(name, max).with_disk(DiskConfig::new(dir));
        TieredStore::open(config).unwrap()
    }

    fn element(key: &str, value: &str) -> Element<String> {
        Element::new(key.to_string(), value.as_bytes().to_vec())
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_put_get_remove() {
        let store = memory_store(100);
        assert!(store.put(element("a", "1")).unwrap());
        assert!(!store.put(element("a", "2")).unwrap());

        let got = store.get(&"a".to_string()).unwrap().unwrap();
        assert_eq!(got.value().as_ref(), b"2");
        assert_eq!(got.hit_count(), 1);
        assert!(got.last_update_time() > 0);

        let removed = store.remove(&"a".to_string()).unwrap().unwrap();
        assert_eq!(removed.value().as_ref(), b"2");
        assert!(store.get(&"a".to_string()).unwrap().is_none());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_get_quiet_leaves_stats_alone() {
        let store = memory_store(100);
        store.put(element("a", "1")).unwrap();
        let e = store.get_quiet(&"a".to_string()).unwrap().unwrap();
        assert_eq!(e.hit_count(), 0);
        assert_eq!(store.statistics().memory_hits, 0);
    }

    #[test]
    fn test_put_if_absent() {
        let store = memory_store(100);
        assert!(store.put_if_absent(element("a", "1")).unwrap().is_none());
        let existing = store.put_if_absent(element("a", "2")).unwrap().unwrap();
        assert_eq!(existing.value().as_ref(), b"1");
    }

    #[test]
    fn test_defaults_applied() {
        let config = StoreConfig {
            default_ttl_secs: 30,
            ..StoreConfig::new("defaults", 10)
        };
        let store: TieredStore<String> = TieredStore::open(config).unwrap();
        store.put(element("a", "1")).unwrap();
        store.put(element("b", "1").with_ttl(5)).unwrap();

        assert_eq!(store.get(&"a".into()).unwrap().unwrap().time_to_live(), 30);
        assert_eq!(store.get(&"b".into()).unwrap().unwrap().time_to_live(), 5);
    }

    #[test]
    fn test_memory_only_eviction_notifies() {
        let store = memory_store(10);
        let listener = Arc::new(RecordingListener::new());
        store.register_listener(listener.clone());

        for i in 0..50 {
            store.put(element(&format!("k{}", i), "v")).unwrap();
        }
        assert!(store.size() <= 10);
        assert_eq!(listener.len(), 50 - store.size());
        assert!(listener
            .events()
            .iter()
            .all(|(_, cause)| *cause == RemovalCause::Evicted));
    }

    #[test]
    fn test_clock_policy_bounds_memory() {
        let config = StoreConfig::new("clock", 20).with_policy(PolicyKind::Clock);
        let store: TieredStore<String> = TieredStore::open(config).unwrap();
        for i in 0..200 {
            store.put(element(&format!("k{}", i), "v")).unwrap();
        }
        assert!(store.size() <= 20);
        assert!(store.get(&"k199".into()).unwrap().is_some());
    }

    #[test]
    fn test_overflow_to_disk_and_fault_in() {
        let dir = tempfile::tempdir().unwrap();
        let store = disk_store(dir.path(), "overflow", 5);

        for i in 0..20 {
            store.put(element(&format!("k{}", i), "value")).unwrap();
        }
        wait_for(|| store.spooling_size() == 0);
        assert_eq!(store.size(), 20);
        assert!(store.on_disk_size() >= 15);

        let on_disk = store
            .keys()
            .unwrap()
            .into_iter()
            .find(|k| {
                matches!(
                    store.inner.map.entry_state(k),
                    Some((crate::memory::EntryState::OnDisk, _))
                )
            })
            .unwrap();
        let e = store.get(&on_disk).unwrap().unwrap();
        assert_eq!(e.value().as_ref(), b"value");
        assert_eq!(store.statistics().fault_ins, 1);
        assert_eq!(store.size(), 20);
    }

    #[test]
    fn test_disk_capacity_evicts_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new("diskcap", 5).with_disk(DiskConfig {
            max_elements_on_disk: 10,
            ..DiskConfig::new(dir.path())
        });
        let store: TieredStore<String> = TieredStore::open(config).unwrap();
        let listener = Arc::new(RecordingListener::new());
        store.register_listener(listener.clone());

        for i in 0..40 {
            store.put(element(&format!("k{}", i), "value")).unwrap();
        }
        wait_for(|| store.spooling_size() == 0);
        assert!(store.on_disk_size() <= 10);
        assert!(store.statistics().disk_evictions > 0);
        assert_eq!(listener.len(), 40 - store.size());
    }

    #[test]
    fn test_put_with_writer_rolls_back() {
        let store = memory_store(10);
        store.put(element("a", "old")).unwrap();

        let result = store.put_with_writer(element("a", "new"), |_| {
            Err(Error::Internal("system of record unavailable".into()))
        });
        assert!(result.is_err());
        let current = store.get(&"a".into()).unwrap().unwrap();
        assert_eq!(current.value().as_ref(), b"old");

        let mut seen = None;
        store
            .put_with_writer(element("a", "newer"), |e| {
                seen = Some(e.value().clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.unwrap().as_ref(), b"newer");
    }

    #[test]
    fn test_expire_elements_sweeps_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = disk_store(dir.path(), "sweep", 2);
        let listener = Arc::new(RecordingListener::new());
        store.register_listener(listener.clone());

        for i in 0..6 {
            store
                .put(element(&format!("k{}", i), "v").with_ttl(1))
                .unwrap();
        }
        wait_for(|| store.spooling_size() == 0);
        thread::sleep(Duration::from_millis(2100));

        let reported_by_puts = listener.len();
        assert_eq!(store.expire_elements().unwrap(), 6 - reported_by_puts);
        assert_eq!(store.size(), 0);
        assert_eq!(listener.len(), 6);
        assert!(listener
            .events()
            .iter()
            .all(|(_, cause)| *cause == RemovalCause::Expired));
    }

    #[test]
    fn test_disposed_store_rejects_operations() {
        let store = memory_store(10);
        store.put(element("a", "1")).unwrap();
        store.dispose().unwrap();
        store.dispose().unwrap();

        assert!(store.is_disposed());
        assert!(matches!(store.get(&"a".into()), Err(Error::Disposed(_))));
        assert!(matches!(store.put(element("b", "1")), Err(Error::Disposed(_))));
    }

    #[test]
    fn test_remove_all_frees_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = disk_store(dir.path(), "clear", 2);
        for i in 0..10 {
            store.put(element(&format!("k{}", i), "value")).unwrap();
        }
        wait_for(|| store.spooling_size() == 0);
        assert!(store.on_disk_bytes() > 0);

        store.remove_all().unwrap();
        assert_eq!(store.size(), 0);
        assert_eq!(store.on_disk_bytes(), 0);
        assert!(store.put(element("k0", "again")).unwrap());
    }

    fn on_disk_keys(store: &TieredStore<String>) -> Vec<String> {
        let mut keys: Vec<String> = store
            .keys()
            .unwrap()
            .into_iter()
            .filter(|k| {
                matches!(
                    store.inner.map.entry_state(k),
                    Some((crate::memory::EntryState::OnDisk, _))
                )
            })
            .collect();
        keys.sort();
        keys
    }

    fn marker_of(store: &TieredStore<String>, key: &str) -> Arc<DiskMarker<String>> {
        let slot = store.inner.map.get_quiet(&key.to_string()).unwrap();
        Arc::clone(slot.as_on_disk().unwrap())
    }

    #[test]
    fn test_disk_reads_keep_idle_element_alive() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new("idle", 1).with_disk(DiskConfig {
            fault_in: false,
            ..DiskConfig::new(dir.path())
        });
        let store: TieredStore<String> = TieredStore::open(config).unwrap();

        store.put(element("a", "idle").with_tti(2)).unwrap();
        store.put(element("b", "other")).unwrap();
        wait_for(|| on_disk_keys(&store) == vec!["a".to_string()]);

        // reads span more than twice the idle time
        for expected_hits in 1..=5u64 {
            let e = store.get(&"a".into()).unwrap().expect("idle element expired");
            assert_eq!(e.value().as_ref(), b"idle");
            assert_eq!(e.hit_count(), expected_hits);
            thread::sleep(Duration::from_millis(700));
        }
        assert_eq!(on_disk_keys(&store), vec!["a".to_string()]);
        assert_eq!(store.statistics().disk_hits, 5);
    }

    #[test]
    fn test_region_holding_other_key_is_discarded() {
        use std::os::unix::fs::FileExt;

        let dir = tempfile::tempdir().unwrap();
        let store = disk_store(dir.path(), "mismatch", 1);
        for i in 0..6 {
            store.put(element(&format!("k{}", i), "value")).unwrap();
        }
        wait_for(|| store.spooling_size() == 0);
        let keys = on_disk_keys(&store);
        assert!(keys.len() >= 2);
        let (victim, donor) = (&keys[0], &keys[1]);

        let disk = store.inner.disk.as_ref().unwrap();
        let victim_marker = marker_of(&store, victim);
        let donor_bytes = disk.read_bytes(&marker_of(&store, donor)).unwrap();
        assert_eq!(donor_bytes.len(), victim_marker.length() as usize);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(disk.data_path())
            .unwrap();
        file.write_all_at(&donor_bytes, victim_marker.offset()).unwrap();

        let size = store.size();
        assert!(store.get(victim).unwrap().is_none());
        assert!(!store.contains_key(victim));
        assert_eq!(store.size(), size - 1);
        assert_eq!(store.statistics().disk_read_failures, 1);

        let donor_element = store.get(donor).unwrap().unwrap();
        assert_eq!(donor_element.key(), donor);
    }

    #[test]
    fn test_read_of_truncated_stale_marker_retries() {
        let dir = tempfile::tempdir().unwrap();
        let store = disk_store(dir.path(), "truncated", 1);
        for i in 0..4 {
            store.put(element(&format!("k{}", i), "value")).unwrap();
        }
        wait_for(|| store.spooling_size() == 0);
        let key = on_disk_keys(&store).pop().unwrap();
        let marker = marker_of(&store, &key);

        store.remove(&key).unwrap();
        let path = store.inner.disk.as_ref().unwrap().data_path().to_path_buf();
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_len(marker.offset()).unwrap();

        let outcome = store.inner.resolve(&key, Slot::OnDisk(marker), false);
        assert!(matches!(outcome, Ok(Resolved::Moved)));
        assert_eq!(store.statistics().disk_read_failures, 0);
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Deserialize)]
    struct Unencodable(String);

    impl serde::Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("key cannot be encoded"))
        }
    }

    #[test]
    fn test_dispose_reports_unwritable_element() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new("unwritable", 10).with_disk(DiskConfig {
            persistent: true,
            ..DiskConfig::new(dir.path())
        });
        let store: TieredStore<Unencodable> = TieredStore::open(config).unwrap();
        store
            .put(Element::new(Unencodable("a".into()), b"1".to_vec()))
            .unwrap();

        let result = store.dispose();
        assert!(
            matches!(&result, Err(Error::DiskWrite { key, .. }) if key.contains("\"a\"")),
            "unexpected {:?}",
            result
        );
        assert!(store.is_disposed());
        assert_eq!(store.statistics().spool_failures, 1);
    }
}
