//! Size classes. Every allocation is rounded up to a power of two between
//! [`MIN_ALLOC`] and the arena size, and each of those sizes has a *bucket*:
//! an index into the table of free lists. Bucket 0 is the whole arena and the
//! last bucket is the minimum block, so buckets grow downwards in size, the
//! same direction the tree in [`crate::tree`] grows in depth. A bucket number
//! is also the depth of the corresponding tree nodes, which is what makes the
//! two vocabularies interchangeable throughout the allocator.

use std::mem;

use crate::list::ListNode;

/// Log2 of the minimum block size.
pub(crate) const MIN_ALLOC_LOG2: u32 = 4;

/// Minimum block size in bytes, headers included. This is not a tunable: a
/// free block must be able to hold the two list links of [`ListNode`] while
/// staying 8-byte aligned, and 16 bytes is the smallest size that does it.
pub(crate) const MIN_ALLOC: usize = 1 << MIN_ALLOC_LOG2;

const _: () = assert!(mem::size_of::<ListNode>() <= MIN_ALLOC);

/// Block size in bytes for the given bucket.
#[inline]
pub(crate) fn size_of_bucket(bucket: usize, max_log2: u32) -> usize {
    1 << (max_log2 as usize - bucket)
}

/// Returns the smallest bucket whose block size can fit `request` bytes.
/// `request` must already include the block header and must not exceed the
/// arena size.
#[inline]
pub(crate) fn bucket_for_request(request: usize, buckets: usize) -> usize {
    let class = request.max(MIN_ALLOC).next_power_of_two();
    let doublings = class.trailing_zeros() - MIN_ALLOC_LOG2;

    buckets - 1 - doublings as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKETS: usize = 28;
    const MAX_LOG2: u32 = MIN_ALLOC_LOG2 + BUCKETS as u32 - 1;

    /// The obvious definition: start at the smallest class and double until
    /// the request fits.
    fn naive_bucket_for_request(request: usize) -> usize {
        let mut bucket = BUCKETS - 1;
        let mut size = MIN_ALLOC;

        while size < request {
            bucket -= 1;
            size *= 2;
        }

        bucket
    }

    #[test]
    fn smallest_requests_round_up_to_the_minimum_class() {
        assert_eq!(bucket_for_request(0, BUCKETS), BUCKETS - 1);
        assert_eq!(bucket_for_request(1, BUCKETS), BUCKETS - 1);
        assert_eq!(bucket_for_request(MIN_ALLOC, BUCKETS), BUCKETS - 1);
        assert_eq!(bucket_for_request(MIN_ALLOC + 1, BUCKETS), BUCKETS - 2);
    }

    #[test]
    fn buckets_and_sizes_are_inverses() {
        for bucket in 0..BUCKETS {
            let size = size_of_bucket(bucket, MAX_LOG2);
            assert_eq!(bucket_for_request(size, BUCKETS), bucket);

            // One byte more tips over into the next larger class.
            if bucket > 0 {
                assert_eq!(bucket_for_request(size + 1, BUCKETS), bucket - 1);
            }
        }
    }

    #[test]
    fn matches_the_naive_definition() {
        for request in 0..=4096 {
            assert_eq!(
                bucket_for_request(request, BUCKETS),
                naive_bucket_for_request(request),
                "request = {request}"
            );
        }
    }
}
