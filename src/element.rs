//! Element Types
//!
//! An [`Element`] is a key, an opaque value blob and the metadata the tiers
//! use for expiry and eviction. Metadata that changes on access (last access,
//! hit count, last update) is atomic so a shared `Arc<Element>` can be
//! touched under a segment read lock.
//!
//! # Expiry
//!
//! Times are epoch milliseconds; lifespans are whole seconds. An element with
//! no lifespan of its own inherits the store defaults when it is put. Once a
//! lifespan is set:
//!
//! - TTL = TTI = 0 means eternal
//! - TTL only (or never accessed): `creation + ttl`
//! - TTI only: `max(creation, last_access) + tti`
//! - both: the earlier of the two

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed per-element bookkeeping added to heap size estimates
pub const ELEMENT_OVERHEAD_BYTES: u64 = 128;

/// Current wall clock time in epoch milliseconds
#[inline]
pub fn current_time_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A stored key/value pair plus metadata
#[derive(Debug)]
pub struct Element<K> {
    key: K,
    value: Bytes,
    version: u64,
    /// Epoch millis, immutable after construction
    creation_time: u64,
    /// Epoch millis, 0 = never accessed
    last_access_time: AtomicU64,
    last_update_time: AtomicU64,
    hit_count: AtomicU64,
    ttl_secs: u32,
    tti_secs: u32,
    lifespan_set: bool,
}

impl<K> Element<K> {
    /// Create a new element with no lifespan of its own
    pub fn new(key: K, value: impl Into<Bytes>) -> Self {
        let now = current_time_millis();
        Self {
            key,
            value: value.into(),
            version: 1,
            creation_time: now,
            last_access_time: AtomicU64::new(0),
            last_update_time: AtomicU64::new(now),
            hit_count: AtomicU64::new(0),
            ttl_secs: 0,
            tti_secs: 0,
            lifespan_set: false,
        }
    }

    /// Set the time-to-live in seconds
    pub fn with_ttl(mut self, secs: u32) -> Self {
        self.ttl_secs = secs;
        self.lifespan_set = true;
        self
    }

    /// Set the time-to-idle in seconds
    pub fn with_tti(mut self, secs: u32) -> Self {
        self.tti_secs = secs;
        self.lifespan_set = true;
        self
    }

    /// Make the element eternal (or clear eternity, leaving it with no lifespan)
    pub fn eternal(mut self, eternal: bool) -> Self {
        if eternal {
            self.ttl_secs = 0;
            self.tti_secs = 0;
            self.lifespan_set = true;
        } else if self.is_eternal() {
            self.lifespan_set = false;
        }
        self
    }

    /// Set a caller-supplied version
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_creation_time(mut self, millis: u64) -> Self {
        self.creation_time = millis;
        self
    }

    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    #[inline]
    pub fn last_access_time(&self) -> u64 {
        self.last_access_time.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn last_update_time(&self) -> u64 {
        self.last_update_time.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn time_to_live(&self) -> u32 {
        self.ttl_secs
    }

    #[inline]
    pub fn time_to_idle(&self) -> u32 {
        self.tti_secs
    }

    /// Whether the element carries its own lifespan
    #[inline]
    pub fn is_lifespan_set(&self) -> bool {
        self.lifespan_set
    }

    /// Eternal elements never expire
    #[inline]
    pub fn is_eternal(&self) -> bool {
        self.lifespan_set && self.ttl_secs == 0 && self.tti_secs == 0
    }

    /// Apply store defaults to an element without a lifespan of its own
    pub fn apply_defaults(&mut self, ttl_secs: u32, tti_secs: u32, eternal: bool) {
        if self.lifespan_set {
            return;
        }
        if eternal {
            self.ttl_secs = 0;
            self.tti_secs = 0;
        } else {
            self.ttl_secs = ttl_secs;
            self.tti_secs = tti_secs;
        }
        self.lifespan_set = true;
    }

    /// Epoch millis after which the element is expired (`u64::MAX` = never)
    pub fn expiration_time(&self) -> u64 {
        if !self.lifespan_set || self.is_eternal() {
            return u64::MAX;
        }

        let last_access = self.last_access_time();
        let ttl_expiry = self
            .creation_time
            .saturating_add(u64::from(self.ttl_secs) * 1000);
        let most_recent = self.creation_time.max(last_access);
        let tti_expiry = most_recent.saturating_add(u64::from(self.tti_secs) * 1000);

        if self.ttl_secs != 0 && (self.tti_secs == 0 || last_access == 0) {
            ttl_expiry
        } else if self.ttl_secs == 0 {
            tti_expiry
        } else {
            ttl_expiry.min(tti_expiry)
        }
    }

    /// Whether the element is expired at `now` (epoch millis)
    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.lifespan_set && now > self.expiration_time()
    }

    /// Whether the element is expired now
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_time_millis())
    }

    /// Record a hit: bump the hit count and move last access forward
    pub fn update_access_statistics(&self) {
        self.last_access_time
            .fetch_max(current_time_millis(), Ordering::Relaxed);
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold in reads recorded while the element stayed on disk
    pub(crate) fn restore_access(&self, last_access: u64, extra_hits: u64) {
        self.last_access_time
            .fetch_max(last_access, Ordering::Relaxed);
        self.hit_count.fetch_add(extra_hits, Ordering::Relaxed);
    }

    /// Stamp the element as an update of an existing mapping
    pub fn update_update_statistics(&self) {
        self.last_update_time
            .fetch_max(current_time_millis(), Ordering::Relaxed);
    }

    /// Approximate heap footprint used for byte-based capacity
    pub fn heap_size(&self) -> u64
    where
        K: Serialize,
    {
        let key_size = bincode::serialized_size(&self.key).unwrap_or(0);
        self.value.len() as u64 + key_size + ELEMENT_OVERHEAD_BYTES
    }
}

impl<K: Clone> Clone for Element<K> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            version: self.version,
            creation_time: self.creation_time,
            last_access_time: AtomicU64::new(self.last_access_time()),
            last_update_time: AtomicU64::new(self.last_update_time()),
            hit_count: AtomicU64::new(self.hit_count()),
            ttl_secs: self.ttl_secs,
            tti_secs: self.tti_secs,
            lifespan_set: self.lifespan_set,
        }
    }
}

// =============================================================================
// Wire form
// =============================================================================

/// Serializable snapshot of an element as written to the data file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRecord<K> {
    pub key: K,
    pub value: Bytes,
    pub version: u64,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_update_time: u64,
    pub hit_count: u64,
    pub ttl_secs: u32,
    pub tti_secs: u32,
    pub lifespan_set: bool,
}

impl<K: Clone> From<&Element<K>> for ElementRecord<K> {
    fn from(e: &Element<K>) -> Self {
        Self {
            key: e.key.clone(),
            value: e.value.clone(),
            version: e.version,
            creation_time: e.creation_time,
            last_access_time: e.last_access_time(),
            last_update_time: e.last_update_time(),
            hit_count: e.hit_count(),
            ttl_secs: e.ttl_secs,
            tti_secs: e.tti_secs,
            lifespan_set: e.lifespan_set,
        }
    }
}

impl<K> From<ElementRecord<K>> for Element<K> {
    fn from(r: ElementRecord<K>) -> Self {
        Self {
            key: r.key,
            value: r.value,
            version: r.version,
            creation_time: r.creation_time,
            last_access_time: AtomicU64::new(r.last_access_time),
            last_update_time: AtomicU64::new(r.last_update_time),
            hit_count: AtomicU64::new(r.hit_count),
            ttl_secs: r.ttl_secs,
            tti_secs: r.tti_secs,
            lifespan_set: r.lifespan_set,
        }
    }
}

/// Encode an element into `buf`
pub fn encode_element<K>(element: &Element<K>, buf: &mut Vec<u8>) -> Result<()>
where
    K: Serialize + Clone,
{
    bincode::serialize_into(buf, &ElementRecord::from(element))?;
    Ok(())
}

/// Decode an element previously written by [`encode_element`]
pub fn decode_element<K>(bytes: &[u8]) -> Result<Element<K>>
where
    K: DeserializeOwned,
{
    let record: ElementRecord<K> =
        bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(record.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_creation() {
        let e = Element::new("k1".to_string(), Bytes::from_static(b"v1"));
        assert_eq!(e.key(), "k1");
        assert_eq!(e.value().as_ref(), b"v1");
        assert_eq!(e.hit_count(), 0);
        assert_eq!(e.last_access_time(), 0);
        assert!(!e.is_lifespan_set());
        assert!(!e.is_eternal());
        assert_eq!(e.expiration_time(), u64::MAX);
        assert!(!e.is_expired());
    }

    #[test]
    fn test_ttl_only_expiry() {
        let e = Element::new(1u32, vec![0u8; 4]).with_ttl(10);
        let created = e.creation_time();
        assert_eq!(e.expiration_time(), created + 10_000);
        assert!(!e.is_expired_at(created + 10_000));
        assert!(e.is_expired_at(created + 10_001));
    }

    #[test]
    fn test_tti_only_tracks_last_access() {
        let e = Element::new(1u32, vec![0u8; 4])
            .with_tti(5)
            .with_creation_time(1_000);
        assert_eq!(e.expiration_time(), 6_000);

        e.update_access_statistics();
        let last = e.last_access_time();
        assert!(last > 1_000);
        assert_eq!(e.expiration_time(), last + 5_000);
    }

    #[test]
    fn test_ttl_and_tti_takes_earlier() {
        let e = Element::new(1u32, vec![0u8; 4])
            .with_ttl(100)
            .with_tti(1)
            .with_creation_time(1_000);
        // never accessed: ttl governs
        assert_eq!(e.expiration_time(), 101_000);

        e.update_access_statistics();
        assert_eq!(e.expiration_time(), e.last_access_time() + 1_000);
    }

    #[test]
    fn test_eternal() {
        let e = Element::new(1u32, vec![]).with_ttl(5).eternal(true);
        assert!(e.is_eternal());
        assert_eq!(e.time_to_live(), 0);
        assert!(!e.is_expired_at(u64::MAX - 1));
    }

    #[test]
    fn test_apply_defaults_only_without_lifespan() {
        let mut own = Element::new(1u32, vec![]).with_ttl(7);
        own.apply_defaults(100, 100, false);
        assert_eq!(own.time_to_live(), 7);
        assert_eq!(own.time_to_idle(), 0);

        let mut inherited = Element::new(2u32, vec![]);
        inherited.apply_defaults(100, 50, false);
        assert!(inherited.is_lifespan_set());
        assert_eq!(inherited.time_to_live(), 100);
        assert_eq!(inherited.time_to_idle(), 50);

        let mut eternal = Element::new(3u32, vec![]);
        eternal.apply_defaults(100, 50, true);
        assert!(eternal.is_eternal());
    }

    #[test]
    fn test_access_statistics() {
        let e = Element::new("a".to_string(), vec![1]);
        e.update_access_statistics();
        e.update_access_statistics();
        assert_eq!(e.hit_count(), 2);
        assert!(e.last_access_time() >= e.creation_time());
    }

    #[test]
    fn test_encode_decode_preserves_metadata() {
        let e = Element::new("key".to_string(), Bytes::from_static(b"payload"))
            .with_ttl(30)
            .with_tti(10)
            .with_version(42);
        e.update_access_statistics();

        let mut buf = Vec::new();
        encode_element(&e, &mut buf).unwrap();
        let back: Element<String> = decode_element(&buf).unwrap();

        assert_eq!(ElementRecord::from(&back), ElementRecord::from(&e));
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let result = decode_element::<String>(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_clone_copies_counters() {
        let e = Element::new(9u64, vec![1, 2, 3]);
        e.update_access_statistics();
        let c = e.clone();
        assert_eq!(c.hit_count(), 1);
        assert_eq!(c.last_access_time(), e.last_access_time());
    }
}
