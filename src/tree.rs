//! Index arithmetic for the linearized binary tree of blocks.
//!
//! The tree is never materialized. A node is just an index into a complete
//! binary tree laid out in breadth-first order, and all navigation is plain
//! arithmetic on that index:
//!
//! ```text
//!                 +-----------------------+
//!                 |           0           |
//!                 +-----------------------+
//!                 |     1     |     2     |
//!                 +-----------------------+
//!                 |  3  |  4  |  5  |  6  |
//!                 +-----------------------+
//! ```
//!
//! Node 0 is the whole arena and the nodes at depth `d` (bucket `d`) are the
//! blocks of the corresponding size class, left to right. Offsets within the
//! arena map to indexes and back with shifts, so none of these functions ever
//! walk the tree.

/// Index of the parent of `index`. The root has no parent.
#[inline]
pub(crate) fn parent(index: usize) -> usize {
    debug_assert!(index != 0);
    (index - 1) / 2
}

/// Index of the left child of `index`.
#[inline]
pub(crate) fn left_child(index: usize) -> usize {
    2 * index + 1
}

/// Index of the buddy of `index`: its sibling, the other half of the parent
/// block. Flipping the lowest bit of `index - 1` moves between the two
/// children of the same parent.
#[inline]
pub(crate) fn buddy(index: usize) -> usize {
    debug_assert!(index != 0);
    ((index - 1) ^ 1) + 1
}

/// Maps an offset within the arena to the index of the node that represents
/// it at depth `bucket`. Every offset corresponds to one node per depth, so
/// the bucket is what picks the node; passing it in is what makes this
/// constant time instead of a tree walk.
#[inline]
pub(crate) fn node_for_offset(offset: usize, bucket: usize, max_log2: u32) -> usize {
    (offset >> (max_log2 as usize - bucket)) + (1 << bucket) - 1
}

/// Maps a node index at depth `bucket` back to the offset of its block
/// within the arena. Inverse of [`node_for_offset`].
#[inline]
pub(crate) fn offset_for_node(index: usize, bucket: usize, max_log2: u32) -> usize {
    (index - ((1 << bucket) - 1)) << (max_log2 as usize - bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_LOG2: u32 = 8;

    #[test]
    fn navigation() {
        assert_eq!(left_child(0), 1);
        assert_eq!(left_child(2), 5);

        assert_eq!(parent(1), 0);
        assert_eq!(parent(2), 0);
        assert_eq!(parent(5), 2);
        assert_eq!(parent(6), 2);

        assert_eq!(buddy(1), 2);
        assert_eq!(buddy(2), 1);
        assert_eq!(buddy(5), 6);
        assert_eq!(buddy(6), 5);
    }

    #[test]
    fn offsets_and_nodes() {
        // The root covers the whole arena.
        assert_eq!(node_for_offset(0, 0, MAX_LOG2), 0);
        assert_eq!(offset_for_node(0, 0, MAX_LOG2), 0);

        // Depth 1 splits the arena in two halves of 128 bytes.
        assert_eq!(node_for_offset(0, 1, MAX_LOG2), 1);
        assert_eq!(node_for_offset(128, 1, MAX_LOG2), 2);
        assert_eq!(offset_for_node(2, 1, MAX_LOG2), 128);

        // Depth 3, blocks of 32 bytes, indexes 7..=14.
        assert_eq!(node_for_offset(0, 3, MAX_LOG2), 7);
        assert_eq!(node_for_offset(96, 3, MAX_LOG2), 10);
        assert_eq!(offset_for_node(10, 3, MAX_LOG2), 96);
        assert_eq!(offset_for_node(14, 3, MAX_LOG2), 224);
    }

    #[test]
    fn buddies_share_a_parent_block() {
        for index in [3, 9, 27, 33] {
            let sibling = buddy(index);
            assert_eq!(parent(index), parent(sibling));
            assert_eq!(buddy(sibling), index);
        }
    }
}
