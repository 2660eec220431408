//! Regions and the Free-Region Tree
//!
//! A [`Region`] is an inclusive byte interval `[start, end]` of the data file.
//! [`RegionSet`] keeps a set of non-overlapping regions in an AA tree ordered
//! by start offset. Every node caches the largest region size found in its
//! subtree, so [`RegionSet::find`] can walk straight to a subtree that holds a
//! large enough region.
//!
//! # Layout
//!
//! Nodes live in an arena (`Vec<Node>`) and link to each other by index.
//! Slot 0 is the sentinel leaf (level 0, size 0), which keeps skew/split
//! free of special cases.
//!
//! ```text
//!            [40..=59] L2 c=40
//!            /              \
//!   [0..=9] L1 c=10     [100..=139] L1 c=40
//! ```

use serde::{Deserialize, Serialize};

const NIL: usize = 0;

/// An inclusive byte interval of the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    start: u64,
    end: u64,
}

impl Region {
    /// Region covering `start..=end`
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "region start {} > end {}", start, end);
        Self { start, end }
    }

    /// Region of `len` bytes beginning at `start` (`len` must be > 0)
    pub fn with_len(start: u64, len: u64) -> Self {
        debug_assert!(len > 0);
        Self::new(start, start + len - 1)
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Length in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset <= self.end
    }

    /// Whether `other` lies entirely inside this region
    #[inline]
    pub fn encloses(&self, other: &Region) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    #[inline]
    pub fn overlaps(&self, other: &Region) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Join an adjacent region onto this one
    pub fn merge(&self, other: &Region) -> Option<Region> {
        if self.end.checked_add(1) == Some(other.start) {
            Some(Region::new(self.start, other.end))
        } else if other.end.checked_add(1) == Some(self.start) {
            Some(Region::new(other.start, self.end))
        } else {
            None
        }
    }

    /// Cut `inner` out of this region, returning the pieces left before and after it
    pub fn split_out(&self, inner: &Region) -> (Option<Region>, Option<Region>) {
        debug_assert!(self.encloses(inner));
        let before = (inner.start > self.start).then(|| Region::new(self.start, inner.start - 1));
        let after = (inner.end < self.end).then(|| Region::new(inner.end + 1, self.end));
        (before, after)
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..={}]", self.start, self.end)
    }
}

// =============================================================================
// AA tree
// =============================================================================

#[derive(Debug, Clone)]
struct Node {
    region: Region,
    left: usize,
    right: usize,
    level: u32,
    /// Largest region size in this subtree
    contiguous: u64,
}

impl Node {
    fn sentinel() -> Self {
        Self {
            region: Region { start: 0, end: 0 },
            left: NIL,
            right: NIL,
            level: 0,
            contiguous: 0,
        }
    }
}

/// Balanced set of non-overlapping regions
#[derive(Debug, Clone)]
pub struct RegionSet {
    nodes: Vec<Node>,
    vacant: Vec<usize>,
    root: usize,
    len: usize,
    total: u64,
    // deletion scratch
    last: usize,
    deleted: usize,
    removed: Option<Region>,
}

impl Default for RegionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionSet {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::sentinel()],
            vacant: Vec::new(),
            root: NIL,
            len: 0,
            total: 0,
            last: NIL,
            deleted: NIL,
            removed: None,
        }
    }

    /// Number of regions
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sum of region sizes
    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Size of the largest region, 0 if empty
    pub fn max_contiguous(&self) -> u64 {
        self.nodes[self.root].contiguous
    }

    /// Remove every region
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Insert a region. Returns false (and leaves the set unchanged) if it
    /// overlaps a region already present.
    pub fn insert(&mut self, region: Region) -> bool {
        if self.overlapping(&region).is_some() {
            return false;
        }
        let node = self.alloc_node(region);
        let root = self.root;
        self.root = self.insert_at(root, node);
        self.len += 1;
        self.total += region.size();
        true
    }

    /// Remove and return the region containing `offset`
    pub fn remove_containing(&mut self, offset: u64) -> Option<Region> {
        self.last = NIL;
        self.deleted = NIL;
        self.removed = None;
        let root = self.root;
        self.root = self.remove_at(root, offset);
        let removed = self.removed.take();
        if let Some(r) = removed {
            self.len -= 1;
            self.total -= r.size();
        }
        removed
    }

    /// Remove exactly `region`; fails if no region with those bounds is present
    pub fn remove(&mut self, region: &Region) -> Option<Region> {
        match self.find_containing(region.start) {
            Some(found) if found == *region => self.remove_containing(region.start),
            _ => None,
        }
    }

    /// First region (lowest offset) of at least `size` bytes, trimmed to `size`.
    /// `None` means no free span is large enough and the file must grow.
    pub fn find(&self, size: u64) -> Option<Region> {
        if size == 0 || self.nodes[self.root].contiguous < size {
            return None;
        }
        let mut cur = self.root;
        loop {
            let node = &self.nodes[cur];
            if self.nodes[node.left].contiguous >= size {
                cur = node.left;
            } else if node.region.size() >= size {
                return Some(Region::with_len(node.region.start, size));
            } else if self.nodes[node.right].contiguous >= size {
                cur = node.right;
            } else {
                return None;
            }
        }
    }

    /// Region containing `offset`, if any
    pub fn find_containing(&self, offset: u64) -> Option<Region> {
        let mut cur = self.root;
        while cur != NIL {
            let node = &self.nodes[cur];
            if offset < node.region.start {
                cur = node.left;
            } else if offset > node.region.end {
                cur = node.right;
            } else {
                return Some(node.region);
            }
        }
        None
    }

    /// Some region that overlaps `region`, if any
    pub fn overlapping(&self, region: &Region) -> Option<Region> {
        let mut cur = self.root;
        while cur != NIL {
            let node = &self.nodes[cur];
            if node.region.overlaps(region) {
                return Some(node.region);
            }
            cur = if region.end < node.region.start {
                node.left
            } else {
                node.right
            };
        }
        None
    }

    /// Regions in ascending offset order
    pub fn iter(&self) -> impl Iterator<Item = Region> + '_ {
        let mut stack = Vec::new();
        let mut cur = self.root;
        std::iter::from_fn(move || {
            while cur != NIL {
                stack.push(cur);
                cur = self.nodes[cur].left;
            }
            let n = stack.pop()?;
            cur = self.nodes[n].right;
            Some(self.nodes[n].region)
        })
    }

    // -------------------------------------------------------------------------
    // Arena
    // -------------------------------------------------------------------------

    fn alloc_node(&mut self, region: Region) -> usize {
        let node = Node {
            region,
            left: NIL,
            right: NIL,
            level: 1,
            contiguous: region.size(),
        };
        match self.vacant.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release_node(&mut self, idx: usize) {
        self.nodes[idx] = Node::sentinel();
        self.vacant.push(idx);
    }

    #[inline]
    fn refresh(&mut self, n: usize) {
        if n == NIL {
            return;
        }
        let node = &self.nodes[n];
        let best = node
            .region
            .size()
            .max(self.nodes[node.left].contiguous)
            .max(self.nodes[node.right].contiguous);
        self.nodes[n].contiguous = best;
    }

    #[inline]
    fn set_left(&mut self, n: usize, child: usize) {
        if n != NIL {
            self.nodes[n].left = child;
            self.refresh(n);
        }
    }

    #[inline]
    fn set_right(&mut self, n: usize, child: usize) {
        if n != NIL {
            self.nodes[n].right = child;
            self.refresh(n);
        }
    }

    // -------------------------------------------------------------------------
    // Balancing
    // -------------------------------------------------------------------------

    /// Rotate right when the left child sits on the same level
    fn skew(&mut self, t: usize) -> usize {
        if t == NIL {
            return NIL;
        }
        let l = self.nodes[t].left;
        if l != NIL && self.nodes[l].level == self.nodes[t].level {
            let lr = self.nodes[l].right;
            self.set_left(t, lr);
            self.set_right(l, t);
            return l;
        }
        t
    }

    /// Rotate left and promote when two right links share a level
    fn split(&mut self, t: usize) -> usize {
        if t == NIL {
            return NIL;
        }
        let r = self.nodes[t].right;
        if r == NIL {
            return t;
        }
        let rr = self.nodes[r].right;
        if rr != NIL && self.nodes[rr].level == self.nodes[t].level {
            let rl = self.nodes[r].left;
            self.set_right(t, rl);
            self.set_left(r, t);
            self.nodes[r].level += 1;
            return r;
        }
        t
    }

    fn insert_at(&mut self, t: usize, node: usize) -> usize {
        if t == NIL {
            return node;
        }
        if self.nodes[node].region.start < self.nodes[t].region.start {
            let l = self.nodes[t].left;
            let nl = self.insert_at(l, node);
            self.set_left(t, nl);
        } else {
            let r = self.nodes[t].right;
            let nr = self.insert_at(r, node);
            self.set_right(t, nr);
        }
        let t = self.skew(t);
        self.split(t)
    }

    fn remove_at(&mut self, t: usize, offset: u64) -> usize {
        if t == NIL {
            return NIL;
        }

        self.last = t;
        if offset < self.nodes[t].region.start {
            let l = self.nodes[t].left;
            let nl = self.remove_at(l, offset);
            self.set_left(t, nl);
        } else {
            self.deleted = t;
            let r = self.nodes[t].right;
            let nr = self.remove_at(r, offset);
            self.set_right(t, nr);
        }

        if t == self.last {
            // bottom of the search path: t is the in-order successor of the
            // target (or the target itself) and has no left child
            let target = self.deleted;
            if target != NIL && self.nodes[target].region.contains(offset) {
                self.removed = Some(self.nodes[target].region);
                if target != t {
                    self.nodes[target].region = self.nodes[t].region;
                    self.refresh(target);
                }
                self.deleted = NIL;
                let replacement = self.nodes[t].right;
                self.release_node(t);
                return replacement;
            }
            return t;
        }

        let level = self.nodes[t].level;
        let l = self.nodes[t].left;
        let r = self.nodes[t].right;
        if self.nodes[l].level + 1 < level || self.nodes[r].level + 1 < level {
            let level = level - 1;
            self.nodes[t].level = level;
            if r != NIL && self.nodes[r].level > level {
                self.nodes[r].level = level;
            }

            let t = self.skew(t);
            let r = self.nodes[t].right;
            let r = self.skew(r);
            self.set_right(t, r);
            if r != NIL {
                let rr = self.nodes[r].right;
                let rr = self.skew(rr);
                self.set_right(r, rr);
            }
            let t = self.split(t);
            let r = self.nodes[t].right;
            let r = self.split(r);
            self.set_right(t, r);
            return t;
        }
        t
    }

    /// Check ordering, AA levels and cached sizes. Returns a description of the
    /// first violation found.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> std::result::Result<(), String> {
        fn walk(set: &RegionSet, n: usize) -> std::result::Result<(u64, usize, u64), String> {
            if n == NIL {
                return Ok((0, 0, 0));
            }
            let node = &set.nodes[n];
            let left = &set.nodes[node.left];
            let right = &set.nodes[node.right];
            let right_right = &set.nodes[right.right];
            if left.level + 1 != node.level {
                return Err(format!("left level at {}", node.region));
            }
            if right.level != node.level && right.level + 1 != node.level {
                return Err(format!("right level at {}", node.region));
            }
            if node.right != NIL && right_right.level == node.level {
                return Err(format!("double horizontal link at {}", node.region));
            }
            if node.left != NIL && left.region.end >= node.region.start {
                return Err(format!("left order at {}", node.region));
            }
            if node.right != NIL && right.region.start <= node.region.end {
                return Err(format!("right order at {}", node.region));
            }
            let (lc, ln, lt) = walk(set, node.left)?;
            let (rc, rn, rt) = walk(set, node.right)?;
            let contiguous = node.region.size().max(lc).max(rc);
            if contiguous != node.contiguous {
                return Err(format!(
                    "contiguous at {}: cached {} actual {}",
                    node.region, node.contiguous, contiguous
                ));
            }
            Ok((contiguous, ln + rn + 1, lt + rt + node.region.size()))
        }

        let (_, count, total) = walk(self, self.root)?;
        if count != self.len {
            return Err(format!("len {} but {} nodes reachable", self.len, count));
        }
        if total != self.total {
            return Err(format!("total {} but {} reachable", self.total, total));
        }
        let regions: Vec<Region> = self.iter().collect();
        for pair in regions.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(format!("{} overlaps {}", pair[0], pair[1]));
            }
        }
        Ok(())
    }
}
