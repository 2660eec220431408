//! Key hashing
//!
//! Native hashes are folded to 32 bits and run through a Wang/Jenkins style
//! mix so that both the high bits (segment choice) and the low bits (bucket
//! choice) are well distributed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Mix a 32-bit hash
#[inline]
pub fn spread(h: u32) -> u32 {
    let mut h = h;
    h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^ (h >> 16)
}

/// Hash a key for segment and bucket selection
#[inline]
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let h = hasher.finish();
    spread((h ^ (h >> 32)) as u32)
}
