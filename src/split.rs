//! One bit of state per internal tree node.
//!
//! A node can conceptually be in three states: entirely free (`UNUSED`),
//! handed out as a whole (`USED`), or subdivided (`SPLIT`). Storing three
//! states would cost two bits, but both call sites already know whether the
//! block they hold is free (the allocation path just popped it off a free
//! list, the release path was just given it back), so the only thing worth
//! remembering is the `SPLIT` flag of internal nodes. That flag is encoded as
//! the XOR of the two children's `UNUSED` flags: it reads 1 exactly when one
//! child is free and the other is not, i.e. when the node is split. The
//! payoff is that any child changing state updates the parent with a single
//! bit flip, no matter which child or which direction.
//!
//! Leaves (minimum size blocks) have no bit; whether they are free follows
//! from free list membership alone.

use std::ptr::NonNull;

use crate::tree;

/// View over the bit array holding the split flags. The bits live in host
/// memory next to the free list sentinels (see [`crate::allocator`]), this
/// struct only carries the base address around.
pub(crate) struct SplitFlags {
    bits: NonNull<u8>,
}

impl SplitFlags {
    /// # Safety
    ///
    /// `bits` must point to enough committed bytes to hold one bit per
    /// internal node, and they must start out zeroed.
    pub unsafe fn new(bits: NonNull<u8>) -> Self {
        Self { bits }
    }

    /// Flips the split flag of the parent of `index` and returns the new
    /// value. This is the only mutator: it's called exactly when a child
    /// transitions between free and not free, which by the XOR encoding is
    /// precisely when the parent's flag has to toggle.
    ///
    /// # Safety
    ///
    /// `index` must not be the root.
    pub unsafe fn flip_parent(&mut self, index: usize) -> bool {
        let parent = tree::parent(index);
        let byte = self.bits.as_ptr().add(parent / 8);
        let mask = 1 << (parent % 8);

        *byte ^= mask;

        *byte & mask != 0
    }

    /// Reads the split flag of `index` without modifying it. The allocator
    /// never needs this, it's here for integrity checks in tests.
    ///
    /// # Safety
    ///
    /// `index` must be an internal node covered by the bit array.
    #[cfg(test)]
    pub unsafe fn is_split(&self, index: usize) -> bool {
        *self.bits.as_ptr().add(index / 8) & (1 << (index % 8)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flips_toggle_one_parent_bit() {
        unsafe {
            let mut bytes = [0u8; 4];
            let mut flags = SplitFlags::new(NonNull::new_unchecked(bytes.as_mut_ptr()));

            // Nodes 1 and 2 share parent 0, nodes 9 and 10 share parent 4.
            assert!(flags.flip_parent(1));
            assert!(flags.is_split(0));
            assert!(!flags.is_split(4));

            assert!(flags.flip_parent(9));
            assert!(flags.is_split(4));

            // Flipping through the other child clears the same bit.
            assert!(!flags.flip_parent(2));
            assert!(!flags.is_split(0));
            assert!(flags.is_split(4));

            assert!(!flags.flip_parent(10));
            assert_eq!(bytes, [0; 4]);
        }
    }
}
