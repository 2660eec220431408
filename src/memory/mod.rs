//! Hot Tier: Segmented Element Map
//!
//! A fixed number of independently locked segments, each a chained hash table
//! from key to [`Slot`]. A slot holds either the element itself or the marker
//! of an element that lives in the data file.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          SegmentedMap                                 │
//! │   hash = spread(key)   segment = hash >> shift   bucket = hash & mask │
//! ├──────────────┬──────────────┬──────────────┬──────────────────────────┤
//! │ Segment 0    │ Segment 1    │ ...          │ Segment N-1              │
//! │ RwLock       │ RwLock       │              │ RwLock                   │
//! │ buckets[]    │ buckets[]    │              │ buckets[]                │
//! │ clock cursor │ clock cursor │              │ clock cursor             │
//! │ counters     │ counters     │              │ counters                 │
//! └──────────────┴──────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - One lock per segment; no global lock on the common path
//! - Counters are atomics written under the segment lock and read without it
//! - Pin state lives on the map entry; pinning an absent key leaves a
//!   placeholder entry behind
//! - Eviction candidates come from random sampling or a per-segment clock

mod hash;
mod map;
mod segment;
mod slot;

pub use hash::{hash_key, spread};
pub use map::SegmentedMap;
pub use segment::EntryView;
pub use slot::{EntryState, Slot};

/// Lock-free size passes attempted before locking every segment
pub const RETRIES_BEFORE_LOCK: usize = 2;

/// Buckets each segment starts with
pub const INITIAL_SEGMENT_BUCKETS: usize = 16;

/// Load factor at which a segment doubles its bucket array
pub const LOAD_FACTOR: f32 = 0.75;
