//! Disk Markers
//!
//! A marker takes an element's place in the hot tier once its bytes live in
//! the data file. It is a handle into the file arena (offset + length) plus
//! the little metadata the store needs without touching disk: expiry for
//! sweeps, a hit count for disk-tier eviction and the last read time, which
//! reads that leave the element on disk would otherwise lose.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::region::Region;
use crate::element::Element;

/// Persisted form of a marker as stored in the index file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub offset: u64,
    pub length: u32,
    pub expiry: u64,
    pub hit_count: u64,
    pub last_access: u64,
}

/// Handle to an element stored in the data file
#[derive(Debug)]
pub struct DiskMarker<K> {
    offset: u64,
    length: u32,
    /// Epoch millis, `u64::MAX` = never
    expiry: AtomicU64,
    hit_count: AtomicU64,
    /// Epoch millis of the latest read, 0 = never
    last_access: AtomicU64,
    /// Just-written element kept until first read (caching variant)
    cached: Mutex<Option<Arc<Element<K>>>>,
}

impl<K> DiskMarker<K> {
    pub fn new(region: Region, expiry: u64) -> Self {
        Self {
            offset: region.start(),
            length: region.size() as u32,
            expiry: AtomicU64::new(expiry),
            hit_count: AtomicU64::new(0),
            last_access: AtomicU64::new(0),
            cached: Mutex::new(None),
        }
    }

    pub fn from_record(record: MarkerRecord) -> Self {
        Self {
            offset: record.offset,
            length: record.length,
            expiry: AtomicU64::new(record.expiry),
            hit_count: AtomicU64::new(record.hit_count),
            last_access: AtomicU64::new(record.last_access),
            cached: Mutex::new(None),
        }
    }

    pub fn record(&self) -> MarkerRecord {
        MarkerRecord {
            offset: self.offset,
            length: self.length,
            expiry: self.expiry(),
            hit_count: self.hit_count(),
            last_access: self.last_access(),
        }
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    /// The file region this marker owns
    #[inline]
    pub fn region(&self) -> Region {
        Region::with_len(self.offset, u64::from(self.length))
    }

    #[inline]
    pub fn expiry(&self) -> u64 {
        self.expiry.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expiry()
    }

    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Record a read of the element behind this marker
    pub fn hit(&self, element: &Element<K>) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        self.last_access
            .fetch_max(element.last_access_time(), Ordering::Relaxed);
        self.expiry
            .store(element.expiration_time(), Ordering::Relaxed);
    }

    pub(crate) fn set_cached(&self, element: Arc<Element<K>>) {
        *self.cached.lock() = Some(element);
    }

    /// Take the cached element, leaving the marker uncached
    pub(crate) fn take_cached(&self) -> Option<Arc<Element<K>>> {
        self.cached.lock().take()
    }

    #[inline]
    pub fn is_cached(&self) -> bool {
        self.cached.lock().is_some()
    }
}
