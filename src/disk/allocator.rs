//! Data File Allocator
//!
//! Treats the data file as an arena of bytes. The free set only ever holds
//! holes *inside* the file: a request that no hole can satisfy is served by
//! appending at end-of-file, and freeing the last region of the file shrinks
//! the logical file size instead of leaving a free tail.
//!
//! This keeps a simple conservation law: free bytes + allocated bytes equals
//! the logical file size.

use tracing::warn;

use super::region::{Region, RegionSet};
use crate::error::{Error, Result};

/// Free-space manager for one data file
#[derive(Debug, Default, Clone)]
pub struct FileAllocator {
    free: RegionSet,
    file_size: u64,
    allocated: u64,
}

impl FileAllocator {
    /// Allocator for an empty file
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator for a file of `file_size` bytes that is entirely free.
    /// Used when rebuilding state from an index: callers [`mark`](Self::mark)
    /// every live region afterwards.
    pub fn with_free_file(file_size: u64) -> Self {
        let mut free = RegionSet::new();
        if file_size > 0 {
            free.insert(Region::new(0, file_size - 1));
        }
        Self {
            free,
            file_size,
            allocated: 0,
        }
    }

    /// Logical data file size in bytes
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes currently handed out
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Bytes sitting in holes
    pub fn free_bytes(&self) -> u64 {
        self.free.total_size()
    }

    /// The free set, in ascending order
    pub fn free_regions(&self) -> impl Iterator<Item = Region> + '_ {
        self.free.iter()
    }

    /// Allocate `size` bytes: reuse the first hole that fits, otherwise grow
    pub fn alloc(&mut self, size: u64) -> Result<Region> {
        if size == 0 {
            return Err(Error::Internal("zero-length allocation".into()));
        }
        if let Some(region) = self.free.find(size) {
            self.take(region)?;
            return Ok(region);
        }

        let start = self.file_size;
        let end = start
            .checked_add(size - 1)
            .ok_or_else(|| Error::Internal("data file address space exhausted".into()))?;
        self.file_size = end + 1;
        self.allocated += size;
        Ok(Region::new(start, end))
    }

    /// Mark `region` as used. It must lie inside a single free hole.
    pub fn mark(&mut self, region: Region) -> Result<()> {
        match self.free.find_containing(region.start()) {
            Some(hole) if hole.encloses(&region) => self.take(region),
            _ => Err(Error::Internal(format!(
                "region {} is not free (file size {})",
                region, self.file_size
            ))),
        }
    }

    /// Return `region` to the free set, merging with neighbouring holes.
    /// Returns the merged span (which may have fallen off the end of the file
    /// and shrunk it), or `None` if the region was not allocated.
    pub fn free(&mut self, region: Region) -> Option<Region> {
        if region.end() >= self.file_size || self.free.overlapping(&region).is_some() {
            warn!(%region, file_size = self.file_size, "ignoring free of region that is not allocated");
            return None;
        }
        self.allocated -= region.size();

        let mut merged = region;
        if region.start() > 0 {
            if let Some(prev) = self.free.remove_containing(region.start() - 1) {
                merged = Region::new(prev.start(), merged.end());
            }
        }
        if let Some(next) = self.free.remove_containing(region.end() + 1) {
            merged = Region::new(merged.start(), next.end());
        }

        if merged.end() + 1 >= self.file_size {
            self.file_size = merged.start();
            return Some(merged);
        }
        self.free.insert(merged);
        Some(merged)
    }

    /// Drop a free hole at the end of the file, shrinking the logical size
    pub fn trim_tail(&mut self) {
        if self.file_size == 0 {
            return;
        }
        if let Some(tail) = self.free.find_containing(self.file_size - 1) {
            self.free.remove_containing(tail.start());
            self.file_size = tail.start();
        }
    }

    /// Forget everything; the file is treated as empty
    pub fn reset(&mut self) {
        self.free.clear();
        self.file_size = 0;
        self.allocated = 0;
    }

    fn take(&mut self, region: Region) -> Result<()> {
        let hole = self
            .free
            .remove_containing(region.start())
            .ok_or_else(|| Error::Internal(format!("no free hole at {}", region.start())))?;
        let (before, after) = hole.split_out(&region);
        if let Some(b) = before {
            self.free.insert(b);
        }
        if let Some(a) = after {
            self.free.insert(a);
        }
        self.allocated += region.size();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> std::result::Result<(), String> {
        self.free.check_invariants()?;
        if self.free.total_size() + self.allocated != self.file_size {
            return Err(format!(
                "free {} + allocated {} != file size {}",
                self.free.total_size(),
                self.allocated,
                self.file_size
            ));
        }
        if let Some(last) = self.free.iter().last() {
            if last.end() + 1 >= self.file_size {
                return Err(format!("free hole {} touches end of file", last));
            }
        }
        Ok(())
    }
}
