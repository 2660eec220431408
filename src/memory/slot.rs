//! Slot contents

use std::sync::Arc;

use crate::disk::DiskMarker;
use crate::element::Element;

/// What a key's map slot holds: the element itself or a handle to its bytes on disk
#[derive(Debug)]
pub enum Slot<K> {
    Resident(Arc<Element<K>>),
    OnDisk(Arc<DiskMarker<K>>),
}

impl<K> Clone for Slot<K> {
    fn clone(&self) -> Self {
        match self {
            Slot::Resident(e) => Slot::Resident(Arc::clone(e)),
            Slot::OnDisk(m) => Slot::OnDisk(Arc::clone(m)),
        }
    }
}

impl<K> Slot<K> {
    /// Identity comparison: same element or same marker instance
    pub fn same_as(&self, other: &Slot<K>) -> bool {
        match (self, other) {
            (Slot::Resident(a), Slot::Resident(b)) => Arc::ptr_eq(a, b),
            (Slot::OnDisk(a), Slot::OnDisk(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, Slot::Resident(_))
    }

    pub fn as_resident(&self) -> Option<&Arc<Element<K>>> {
        match self {
            Slot::Resident(e) => Some(e),
            Slot::OnDisk(_) => None,
        }
    }

    pub fn as_on_disk(&self) -> Option<&Arc<DiskMarker<K>>> {
        match self {
            Slot::OnDisk(m) => Some(m),
            Slot::Resident(_) => None,
        }
    }

    /// Whether the slot's content is expired at `now`
    pub fn is_expired_at(&self, now: u64) -> bool {
        match self {
            Slot::Resident(e) => e.is_expired_at(now),
            Slot::OnDisk(m) => m.is_expired_at(now),
        }
    }
}

/// Accounting category of a map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Pinned key with no value
    Placeholder,
    /// Element in memory
    Resident,
    /// Element in memory with a disk write queued
    Spooling,
    /// Element in the data file
    OnDisk,
}
