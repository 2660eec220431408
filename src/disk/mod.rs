//! Disk Tier
//!
//! Overflow storage for elements pushed out of memory.
//!
//! # Components
//!
//! - [`Region`] / [`RegionSet`]: byte ranges and the AA tree of free holes
//! - [`FileAllocator`]: first-fit allocation over the data file
//! - [`DiskMarker`]: the in-memory handle left in the map for a spooled element
//! - [`DiskBackingStore`]: data file I/O, index flush and load, staleness checks
//!
//! The data file is accessed with positional reads and writes and therefore
//! requires a Unix platform.

mod allocator;
mod index;
mod marker;
mod proptest;
mod region;
mod store;

pub use allocator::FileAllocator;
pub use index::{index_is_stale, INDEX_MAGIC, INDEX_VERSION};
pub use marker::{DiskMarker, MarkerRecord};
pub use region::{Region, RegionSet};
pub use store::DiskBackingStore;
