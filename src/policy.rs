//! Eviction Policies
//!
//! A policy picks one victim from a small random sample handed to it by the
//! hot tier. It never scans the full population, so eviction quality is
//! probabilistic: the victim is the worst element of the sample, not of the
//! store.
//!
//! Ties go to the element met first in sample order.

use std::sync::Arc;

use crate::config::PolicyKind;
use crate::element::Element;

/// Victim selection over a sample of elements
pub trait EvictionPolicy<K: PartialEq>: Send + Sync {
    /// Policy name for logs and stats
    fn name(&self) -> &'static str;

    /// True if `candidate` is a better victim than `current`
    fn compare(&self, current: &Element<K>, candidate: &Element<K>) -> bool;

    /// Pick a victim from `candidates`, avoiding `just_added` when there is
    /// any other choice
    fn select<'a>(
        &self,
        candidates: &'a [Arc<Element<K>>],
        just_added: Option<&K>,
    ) -> Option<&'a Arc<Element<K>>> {
        if candidates.len() == 1 {
            return candidates.first();
        }

        let mut lowest: Option<&'a Arc<Element<K>>> = None;
        for candidate in candidates {
            if just_added.is_some_and(|k| candidate.key() == k) {
                continue;
            }
            match lowest {
                None => lowest = Some(candidate),
                Some(current) if self.compare(current, candidate) => lowest = Some(candidate),
                Some(_) => {}
            }
        }
        lowest
    }
}

/// Least recently used: oldest of creation or last access
#[derive(Debug, Clone, Copy, Default)]
pub struct LruPolicy;

impl<K: PartialEq> EvictionPolicy<K> for LruPolicy {
    fn name(&self) -> &'static str {
        "LRU"
    }

    fn compare(&self, current: &Element<K>, candidate: &Element<K>) -> bool {
        recency(candidate) < recency(current)
    }
}

/// Least frequently used: lowest hit count
#[derive(Debug, Clone, Copy, Default)]
pub struct LfuPolicy;

impl<K: PartialEq> EvictionPolicy<K> for LfuPolicy {
    fn name(&self) -> &'static str {
        "LFU"
    }

    fn compare(&self, current: &Element<K>, candidate: &Element<K>) -> bool {
        candidate.hit_count() < current.hit_count()
    }
}

/// First in, first out: oldest creation time
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoPolicy;

impl<K: PartialEq> EvictionPolicy<K> for FifoPolicy {
    fn name(&self) -> &'static str {
        "FIFO"
    }

    fn compare(&self, current: &Element<K>, candidate: &Element<K>) -> bool {
        candidate.creation_time() < current.creation_time()
    }
}

#[inline]
fn recency<K>(e: &Element<K>) -> u64 {
    e.creation_time().max(e.last_access_time())
}

/// Build the sample-based policy for a configured kind.
///
/// `Clock` scans segments directly; its sampling fallback is LRU.
pub fn policy_for<K: PartialEq + 'static>(kind: PolicyKind) -> Arc<dyn EvictionPolicy<K>> {
    match kind {
        PolicyKind::Lru | PolicyKind::Clock => Arc::new(LruPolicy),
        PolicyKind::Lfu => Arc::new(LfuPolicy),
        PolicyKind::Fifo => Arc::new(FifoPolicy),
    }
}
