//! Per-lookup tracker of visited node offsets.
//!
//! One tracker is allocated per lookup or scan. Offsets are bucketed by the
//! page stride, so two offsets inside the same page count as the same node.
//! A second visit means the on-disk tree has a cycle; the caller fails the
//! lookup instead of looping.

use std::collections::HashSet;

pub(crate) struct BlockTree {
    leaf_value_size: u64,
    visited: HashSet<u64>,
}

pub(crate) enum Insert {
    Inserted,
    AlreadyPresent,
}

impl BlockTree {
    pub fn new(leaf_value_size: u64) -> Self {
        Self {
            leaf_value_size: leaf_value_size.max(1),
            visited: HashSet::new(),
        }
    }

    pub fn insert(&mut self, offset: u64) -> Insert {
        if self.visited.insert(offset / self.leaf_value_size) {
            Insert::Inserted
        } else {
            Insert::AlreadyPresent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_second_visit() {
        let mut tree = BlockTree::new(512);
        assert!(matches!(tree.insert(0x4400), Insert::Inserted));
        assert!(matches!(tree.insert(0x4600), Insert::Inserted));
        assert!(matches!(tree.insert(0x4400), Insert::AlreadyPresent));
    }

    #[test]
    fn test_offsets_bucket_by_stride() {
        let mut tree = BlockTree::new(512);
        assert!(matches!(tree.insert(0x4400), Insert::Inserted));
        assert!(matches!(tree.insert(0x44FF), Insert::AlreadyPresent));
    }
}
