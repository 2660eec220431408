//! Property-Based Tests for the Free-Space Allocator
//!
//! # Test Properties
//!
//! 1. **No overlap**: the free set never holds overlapping regions, and no
//!    allocated region overlaps a free one
//! 2. **Conservation**: free bytes + allocated bytes = logical file size
//! 3. **Tree shape**: AA levels and cached contiguous sizes stay correct
//! 4. **Reuse**: a request that fits a hole never grows the file

#![cfg(test)]

use proptest::prelude::*;

use super::allocator::FileAllocator;
use super::region::{Region, RegionSet};

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Alloc(u64),
    /// Free the n-th live allocation (modulo live count)
    Free(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..512).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..300)
}

// =============================================================================
// Allocator Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: any alloc/free sequence keeps the allocator consistent.
    #[test]
    fn prop_alloc_free_conserves_bytes(ops in ops_strategy()) {
        let mut alloc = FileAllocator::new();
        let mut live: Vec<Region> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    let region = alloc.alloc(size)?;
                    prop_assert_eq!(region.size(), size);
                    for other in &live {
                        prop_assert!(!region.overlaps(other), "{} overlaps live {}", region, other);
                    }
                    live.push(region);
                }
                Op::Free(n) => {
                    if live.is_empty() {
                        continue;
                    }
                    let region = live.swap_remove(n % live.len());
                    alloc.free(region);
                }
            }

            if let Err(msg) = alloc.check_invariants() {
                return Err(TestCaseError::fail(msg));
            }
            let allocated: u64 = live.iter().map(Region::size).sum();
            prop_assert_eq!(allocated, alloc.allocated());
            for hole in alloc.free_regions() {
                for used in &live {
                    prop_assert!(!hole.overlaps(used), "hole {} overlaps live {}", hole, used);
                }
            }
        }

        for region in live.drain(..) {
            alloc.free(region);
        }
        prop_assert_eq!(alloc.file_size(), 0);
        prop_assert_eq!(alloc.free_bytes(), 0);
    }

    /// Property: when a hole is large enough, allocation does not grow the file.
    #[test]
    fn prop_fitting_request_reuses_hole(
        sizes in prop::collection::vec(1u64..256, 3..40),
        pick in any::<usize>(),
    ) {
        let mut alloc = FileAllocator::new();
        let regions: Vec<Region> = sizes.iter().map(|&s| alloc.alloc(s).unwrap()).collect();

        // free an interior region so the hole cannot fall off the end
        let idx = pick % (regions.len() - 1);
        let hole = regions[idx];
        alloc.free(hole);

        let before = alloc.file_size();
        let region = alloc.alloc(hole.size())?;
        prop_assert_eq!(region, hole);
        prop_assert_eq!(alloc.file_size(), before);
    }
}

// =============================================================================
// Region Tree Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: inserts and removals of disjoint regions keep the AA tree valid
    /// and `find` agrees with a linear first-fit scan.
    #[test]
    fn prop_region_set_matches_linear_scan(
        slots in prop::collection::vec((any::<bool>(), 1u64..64), 1..200),
        queries in prop::collection::vec(1u64..80, 1..20),
    ) {
        let mut set = RegionSet::new();
        let mut model: Vec<Region> = Vec::new();

        // slot i owns offsets [i*64, i*64+63]; flag decides insert vs remove
        for (i, (insert, len)) in slots.iter().enumerate() {
            let region = Region::with_len(i as u64 * 64, *len);
            if *insert {
                prop_assert!(set.insert(region));
                model.push(region);
            } else if let Some(pos) = model.iter().position(|r| r.start() < region.start()) {
                let victim = model.remove(pos);
                prop_assert_eq!(set.remove_containing(victim.start()), Some(victim));
            }
            if let Err(msg) = set.check_invariants() {
                return Err(TestCaseError::fail(msg));
            }
        }

        model.sort_by_key(|r| r.start());
        prop_assert_eq!(set.iter().collect::<Vec<_>>(), model.clone());

        for size in queries {
            let expected = model
                .iter()
                .find(|r| r.size() >= size)
                .map(|r| Region::with_len(r.start(), size));
            prop_assert_eq!(set.find(size), expected);
        }
    }
}
