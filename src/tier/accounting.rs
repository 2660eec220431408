//! Store Accounting
//!
//! Atomic counters updated on the hot paths and a [`StoreStatistics`]
//! snapshot assembled on demand.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operation counters for one store
#[derive(Debug, Default)]
pub struct StoreCounters {
    // Reads
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,

    // Writes
    puts: AtomicU64,
    updates: AtomicU64,

    // Removals initiated by the store
    evictions: AtomicU64,
    expirations: AtomicU64,
    disk_evictions: AtomicU64,

    // Spooling
    spools: AtomicU64,
    spool_discards: AtomicU64,
    spool_failures: AtomicU64,
    fault_ins: AtomicU64,
    disk_read_failures: AtomicU64,

    /// Heap bytes of elements waiting in the spool queue
    spool_queue_bytes: AtomicU64,
}

impl StoreCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_eviction(&self) {
        self.disk_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spool(&self) {
        self.spools.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spool_discard(&self) {
        self.spool_discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spool_failure(&self) {
        self.spool_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault_in(&self) {
        self.fault_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_read_failure(&self) {
        self.disk_read_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Spool queue pool
    pub fn queue_spool_bytes(&self, bytes: u64) {
        self.spool_queue_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn dequeue_spool_bytes(&self, bytes: u64) {
        let _ = self
            .spool_queue_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    pub fn spool_queue_bytes(&self) -> u64 {
        self.spool_queue_bytes.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed) + self.disk_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn spools(&self) -> u64 {
        self.spools.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Fill the counter half of a statistics snapshot
    pub(crate) fn fill(&self, stats: &mut StoreStatistics) {
        stats.memory_hits = self.memory_hits.load(Ordering::Relaxed);
        stats.disk_hits = self.disk_hits.load(Ordering::Relaxed);
        stats.misses = self.misses();
        stats.puts = self.puts.load(Ordering::Relaxed);
        stats.updates = self.updates.load(Ordering::Relaxed);
        stats.evictions = self.evictions();
        stats.expirations = self.expirations();
        stats.disk_evictions = self.disk_evictions.load(Ordering::Relaxed);
        stats.spools = self.spools();
        stats.spool_discards = self.spool_discards.load(Ordering::Relaxed);
        stats.spool_failures = self.spool_failures.load(Ordering::Relaxed);
        stats.fault_ins = self.fault_ins.load(Ordering::Relaxed);
        stats.disk_read_failures = self.disk_read_failures.load(Ordering::Relaxed);
        stats.spool_queue_bytes = self.spool_queue_bytes();
        stats.hit_ratio = self.hit_ratio();
    }
}

/// Point-in-time view of a store's sizes and counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub name: String,
    pub taken_at: Option<DateTime<Utc>>,

    // Sizes
    pub size: usize,
    pub in_memory_size: usize,
    pub on_disk_size: usize,
    pub spooling: usize,
    pub pinned: usize,
    pub in_memory_bytes: u64,
    pub on_disk_bytes: u64,
    pub data_file_bytes: u64,

    // Counters
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub puts: u64,
    pub updates: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub disk_evictions: u64,
    pub spools: u64,
    pub spool_discards: u64,
    pub spool_failures: u64,
    pub fault_ins: u64,
    pub disk_read_failures: u64,
    pub spool_queue_bytes: u64,
}

impl StoreStatistics {
    pub fn hits(&self) -> u64 {
        self.memory_hits + self.disk_hits
    }
}

impl std::fmt::Display for StoreStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "store            {}", self.name)?;
        writeln!(
            f,
            "size             {} ({} in memory, {} on disk, {} spooling, {} pinned)",
            self.size, self.in_memory_size, self.on_disk_size, self.spooling, self.pinned
        )?;
        writeln!(
            f,
            "bytes            {} in memory, {} on disk, data file {}",
            self.in_memory_bytes, self.on_disk_bytes, self.data_file_bytes
        )?;
        writeln!(
            f,
            "reads            {} hits ({} memory, {} disk), {} misses, ratio {:.3}",
            self.hits(),
            self.memory_hits,
            self.disk_hits,
            self.misses,
            self.hit_ratio
        )?;
        writeln!(f, "writes           {} puts, {} updates", self.puts, self.updates)?;
        writeln!(
            f,
            "removals         {} evicted, {} expired, {} evicted from disk",
            self.evictions, self.expirations, self.disk_evictions
        )?;
        write!(
            f,
            "spooling         {} spooled, {} discarded, {} failed, {} faulted in",
            self.spools, self.spool_discards, self.spool_failures, self.fault_ins
        )
    }
}
