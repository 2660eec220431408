//! Tierstore - Tiered In-Process Element Store
//!
//! A concurrent key/value store with a bounded in-memory tier and an
//! optional disk overflow tier. Elements carry expiry metadata; when the
//! memory tier is full a sampling eviction policy picks a victim that is
//! either dropped or spooled to disk in the background.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     TieredStore (tier)                         │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   victim   ┌──────────────┐                 │
//! │  │ SegmentedMap │───────────▶│ spool worker │                 │
//! │  │  (memory)    │            └──────┬───────┘                 │
//! │  └──────┬───────┘                   ▼                         │
//! │         │ sample         ┌────────────────────┐               │
//! │         ▼                │ DiskBackingStore   │               │
//! │  ┌──────────────┐        │  FileAllocator     │               │
//! │  │EvictionPolicy│        │  (AA-tree regions) │               │
//! │  └──────────────┘        └────────────────────┘               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`] - Store and disk configuration
//! - [`disk`] - Data file, region allocator and index persistence
//! - [`element`] - Elements and their expiry metadata
//! - [`error`] - Error types
//! - [`events`] - Removal notifications
//! - [`memory`] - Segmented concurrent map (hot tier)
//! - [`policy`] - Eviction policies
//! - [`tier`] - The tiered store itself, its workers and statistics

pub mod config;
pub mod disk;
pub mod element;
pub mod error;
pub mod events;
pub mod memory;
pub mod policy;
pub mod tier;

// Re-export commonly used types
pub use config::{DiskConfig, PolicyKind, StoreConfig};
pub use element::Element;
pub use error::{Error, Result};
pub use events::{RecordingListener, RemovalCause, StoreEventListener};
pub use policy::EvictionPolicy;
pub use tier::{AsyncTieredStore, StoreKey, StoreStatistics, TieredStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
