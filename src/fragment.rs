//! Fragment ledger.
//!
//! Large files and images are split across archive parts; each archive entry
//! carries one fragment `[offset, offset+size)` of the logical byte range.
//! The ledger tracks which ranges of each logical entry have been processed
//! so the driver can detect completeness, overlap and gaps.
//!
//! The ledger itself is not synchronized; the operation driver shares it as
//! `Arc<Mutex<FragmentLedger>>` and serializes every mutation.

use std::collections::BTreeMap;

/// A half-open byte range `[lo, hi)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRange {
    /// Inclusive lower bound.
    pub lo: u64,
    /// Exclusive upper bound.
    pub hi: u64,
}

/// Tracking state for one logical entry.
#[derive(Debug, Clone)]
pub struct FragmentNode {
    name: String,
    total_size: u64,
    parts: Vec<FragmentRange>,
}

impl FragmentNode {
    fn new(name: String, total_size: u64) -> Self {
        Self {
            name,
            total_size,
            parts: Vec::new(),
        }
    }

    /// The logical entry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The logical entry's total size in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// The recorded ranges, pairwise disjoint and ascending by `lo`.
    pub fn parts(&self) -> &[FragmentRange] {
        &self.parts
    }

    /// Inserts `[offset, offset+length)`, merging adjacent and overlapping
    /// ranges so the disjoint-ascending invariant holds.
    pub fn add_range(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let lo = offset;
        let hi = offset.saturating_add(length);

        // Insertion point by lower bound.
        let idx = self.parts.partition_point(|r| r.lo < lo);

        // Merge backward into the predecessor when it reaches the new range.
        let cur = if idx > 0 && self.parts[idx - 1].hi >= lo {
            let prev = idx - 1;
            self.parts[prev].hi = self.parts[prev].hi.max(hi);
            prev
        } else {
            self.parts.insert(idx, FragmentRange { lo, hi });
            idx
        };

        // Coalesce forward while later ranges start inside the current one.
        while cur + 1 < self.parts.len() && self.parts[cur + 1].lo <= self.parts[cur].hi {
            let next_hi = self.parts[cur + 1].hi;
            self.parts[cur].hi = self.parts[cur].hi.max(next_hi);
            self.parts.remove(cur + 1);
        }
    }

    /// Returns `true` if any recorded range overlaps `[offset, offset+length)`.
    pub fn range_exists(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let lo = offset;
        let hi = offset.saturating_add(length);
        self.parts.iter().any(|r| r.lo < hi && lo < r.hi)
    }

    /// Returns `true` iff the recorded ranges cover `[0, total_size)`.
    pub fn is_complete(&self) -> bool {
        self.total_size == 0
            || (self.parts.len() == 1
                && self.parts[0].lo == 0
                && self.parts[0].hi >= self.total_size)
    }
}

/// Maps logical entry names to their fragment tracking state.
#[derive(Debug, Default)]
pub struct FragmentLedger {
    nodes: BTreeMap<String, FragmentNode>,
}

impl FragmentLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a node by exact name.
    pub fn find(&self, name: &str) -> Option<&FragmentNode> {
        self.nodes.get(name)
    }

    /// Creates an empty node for `name`, replacing any existing one.
    pub fn add(&mut self, name: &str, total_size: u64) -> &mut FragmentNode {
        self.nodes
            .insert(name.to_string(), FragmentNode::new(name.to_string(), total_size));
        self.nodes.get_mut(name).expect("node was just inserted")
    }

    /// Returns the node for `name`, creating it on first observation.
    pub fn ensure(&mut self, name: &str, total_size: u64) -> &mut FragmentNode {
        self.nodes
            .entry(name.to_string())
            .or_insert_with(|| FragmentNode::new(name.to_string(), total_size))
    }

    /// Inserts a range into the named node, creating the node if needed.
    pub fn add_range(&mut self, name: &str, total_size: u64, offset: u64, length: u64) {
        self.ensure(name, total_size).add_range(offset, length);
    }

    /// Returns `true` if the named node exists and any of its ranges
    /// overlaps the given window.
    pub fn range_exists(&self, name: &str, offset: u64, length: u64) -> bool {
        self.nodes
            .get(name)
            .is_some_and(|n| n.range_exists(offset, length))
    }

    /// Returns `true` iff the named node exists and is complete.
    pub fn is_complete(&self, name: &str) -> bool {
        self.nodes.get(name).is_some_and(FragmentNode::is_complete)
    }

    /// Drops the named node.
    pub fn discard(&mut self, name: &str) {
        self.nodes.remove(name);
    }

    /// Names of all nodes that are not complete, in name order.
    pub fn incomplete_names(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| !n.is_complete())
            .map(|n| n.name.clone())
            .collect()
    }

    /// Number of tracked nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the ledger tracks no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
