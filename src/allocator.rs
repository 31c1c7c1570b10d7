use std::{
    alloc::{AllocError, Allocator, GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{
    bucket::{self, MIN_ALLOC, MIN_ALLOC_LOG2},
    header::{Header, HEADER_SIZE},
    list::{ListNode, LIST_NODE_SIZE},
    platform::{HostMemory, ReservedRange},
    split::SplitFlags,
    tree, AllocResult, Pointer,
};

/// The allocator core. Once you've read [`crate::list`], [`crate::tree`],
/// [`crate::split`] and [`crate::bucket`], this is where the circle gets
/// completed.
///
/// The arena is an implicit complete binary tree: the root is the whole
/// address range and every level cuts the blocks in half, down to
/// [`MIN_ALLOC`] bytes. None of the tree is materialized. The only state is
/// one free list sentinel per bucket, one bit per internal node, and two
/// pointers (the arena base and the commit high-water mark). Even that state
/// doesn't live in the struct itself: it's written into a metadata region
/// obtained from the host right below the arena, the same place the C world
/// would keep its zeroed statics:
///
/// ```text
/// metadata                          base                        base + ARENA
/// v                                 v                           v
/// +-------------------+------------+------------------~ ~ ~-----+
/// | bucket free lists | split bits | arena                      |
/// +-------------------+------------+------------------~ ~ ~-----+
///                                  |<-- committed -->|
/// ```
///
/// Free blocks store their list links in their own first bytes, so a block
/// costs nothing while allocated and 16 bytes of itself while free. The
/// commit high-water mark grows through [`HostMemory::commit_up_to`] right
/// before the allocator writes to a part of the arena it has never touched,
/// and it never moves back.
///
/// Allocation pops a free block of the right class, or splits a bigger one:
/// walk down the left children, push every right sibling on its bucket's
/// free list, stop at the requested class. Release walks back up: while the
/// parent's split bit says the buddy is free too, unlink the buddy and merge,
/// then push whatever came out of the loop. Both walks are bounded by the
/// number of buckets.
///
/// This struct is not thread safe and needs mutable borrows to operate, so
/// it has to be wrapped in some container like [`Mutex`] to satisfy
/// [`std::alloc::Allocator`]. See [`Ruddy`] for the public API.
///
/// # Drop
///
/// This struct doesn't implement [`Drop`]. The metadata and the arena live
/// inside the host's range, so dropping the host (for example
/// [`ReservedRange`] returning its reservation) takes everything with it,
/// including any outstanding allocations.
pub struct BuddyAllocator<H: HostMemory, const BUCKETS: usize, const SPLIT_BYTES: usize> {
    /// Where the address range comes from.
    host: H,
    /// Start of the metadata region: `BUCKETS` list sentinels followed by
    /// the split bits. [`None`] until initialized.
    metadata: Pointer<u8>,
    /// Start of the arena. Every block is an offset of this address.
    base: Pointer<u8>,
    /// Commit high-water mark: everything in `metadata..committed` is safe
    /// to read and write. Never decreases.
    committed: Pointer<u8>,
}

impl<H: HostMemory, const BUCKETS: usize, const SPLIT_BYTES: usize>
    BuddyAllocator<H, BUCKETS, SPLIT_BYTES>
{
    /// Log2 of the arena size. Buckets go from the whole arena (bucket 0)
    /// down to [`MIN_ALLOC`] (bucket `BUCKETS - 1`), one power of two each.
    pub const MAX_LOG2: u32 = MIN_ALLOC_LOG2 + BUCKETS as u32 - 1;

    /// Arena size in bytes.
    pub const ARENA: usize = 1 << Self::MAX_LOG2;

    /// How much host address space the allocator needs in total: metadata,
    /// arena, and alignment slack in case the host's break isn't aligned.
    /// Useful for sizing a [`ReservedRange`].
    pub const FOOTPRINT: usize = Self::METADATA_SIZE + Self::ARENA + MIN_ALLOC;

    /// The free list sentinels, one per bucket, at the front of the metadata
    /// region.
    const SENTINELS_SIZE: usize = BUCKETS * LIST_NODE_SIZE;

    /// Metadata region size: sentinels plus split bits, rounded up so the
    /// arena base keeps the minimum block alignment.
    const METADATA_SIZE: usize =
        (Self::SENTINELS_SIZE + SPLIT_BYTES + MIN_ALLOC - 1) & !(MIN_ALLOC - 1);

    /// The two const parameters have to agree with each other: there is one
    /// split bit for every internal node of a tree with `BUCKETS` levels.
    /// They would be a single parameter if expressions on const generics
    /// could size arrays, but they can't, so the relation is checked here
    /// instead.
    const PARAMS_OK: () = assert!(
        BUCKETS >= 4 && Self::MAX_LOG2 < usize::BITS && SPLIT_BYTES * 8 == 1 << (BUCKETS - 1),
        "SPLIT_BYTES must hold exactly 2^(BUCKETS - 1) bits",
    );

    /// Builds a new allocator on top of `host`. No memory is touched until
    /// the first allocation (or an explicit [`Self::initialize`]), so this
    /// is `const` and can live in a `static`.
    pub const fn new(host: H) -> Self {
        let _ = Self::PARAMS_OK;

        Self {
            host,
            metadata: None,
            base: None,
            committed: None,
        }
    }

    /// Anchors the arena at the host's current break and sets up the
    /// metadata region. Returns `false` if the host can't produce a break or
    /// refuses the initial commit, in which case nothing was touched and
    /// every later allocation will fail the same way.
    ///
    /// Calling this more than once is fine, only the first call does
    /// anything.
    ///
    /// # Safety
    ///
    /// The host's range must not be manipulated by anyone else from here on.
    pub unsafe fn initialize(&mut self) -> bool {
        if self.base.is_some() {
            return true;
        }

        let Some(brk) = self.host.current_break() else {
            return false;
        };

        // The sentinels and the arena base both need the minimum block
        // alignment, the break makes no such promise. Advancing the original
        // pointer instead of rebuilding it from an integer keeps provenance,
        // which Miri cares about.
        let padding = (brk.as_ptr() as usize).wrapping_neg() & (MIN_ALLOC - 1);
        let metadata = NonNull::new_unchecked(brk.as_ptr().add(padding));
        let base = NonNull::new_unchecked(metadata.as_ptr().add(Self::METADATA_SIZE));

        // Everything up to the end of the metadata has to be usable before
        // the sentinels can be written, plus one list entry past the base
        // for the block that represents the whole arena. The split bits
        // need no extra work: freshly committed memory reads as zero, and
        // all-zero is exactly "nothing is split".
        let first_entry_end = NonNull::new_unchecked(base.as_ptr().add(LIST_NODE_SIZE));
        if !self.host.commit_up_to(first_entry_end) {
            return false;
        }

        self.metadata = Some(metadata);
        self.base = Some(base);
        self.committed = Some(first_entry_end);

        for bucket in 0..BUCKETS {
            ListNode::init(self.bucket_head(bucket));
        }

        // A single free block spanning the entire address range.
        ListNode::push_back(self.bucket_head(0), base.cast());

        true
    }

    /// Allocates `request` bytes and returns an 8-byte aligned address, or
    /// [`None`] if the request can't be satisfied. `request` is allowed to
    /// be zero, it still occupies a minimum size block.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::initialize`]. The returned address stays
    /// valid until it is passed to [`Self::release`] or the host range goes
    /// away, whichever comes first.
    pub unsafe fn allocate(&mut self, request: usize) -> Option<NonNull<u8>> {
        if !self.initialize() {
            return None;
        }

        // Nothing bigger than the arena itself can ever succeed.
        let needed = request.checked_add(HEADER_SIZE)?;
        if needed > Self::ARENA {
            return None;
        }

        let target = bucket::bucket_for_request(needed, BUCKETS);

        // Find a free block in the smallest fitting class, or failing that
        // in any larger one. Larger classes have smaller bucket numbers, so
        // the scan walks towards bucket 0.
        for source in (0..=target).rev() {
            let Some(entry) = ListNode::pop_back(self.bucket_head(source)) else {
                continue;
            };

            let block = entry.cast::<u8>();
            let size = bucket::size_of_bucket(source, Self::MAX_LOG2);

            // Expand the committed range before writing anything. If the
            // block is going to be split, only the left half gets handed
            // out; the splits themselves write one list entry at the start
            // of each right sibling, and the deepest of those sits at
            // `size / 2`. Otherwise the whole block becomes usable.
            let bytes_needed = if source < target {
                size / 2 + LIST_NODE_SIZE
            } else {
                size
            };

            if !self.ensure_committed(NonNull::new_unchecked(block.as_ptr().add(bytes_needed))) {
                // Out of host memory. Put the block back where it came from
                // and report failure with the free lists exactly as they
                // were.
                ListNode::push_back(self.bucket_head(source), entry);
                return None;
            }

            // The block just left its free list, so its "free" flag (the
            // one that only exists as an XOR term) changed and the parent's
            // split bit has to toggle. The grandparent never needs the same
            // treatment: our buddy is in use, so the parent was already not
            // a free whole.
            let mut index = self.node_for_address(block, source);
            if index != 0 {
                self.split_flags().flip_parent(index);
            }

            // If the block is larger than requested, split it down to size:
            // descend into the left child, flip the new parent's bit, and
            // put the right sibling on the free list one class below.
            let mut bucket = source;
            while bucket < target {
                index = tree::left_child(index);
                bucket += 1;

                self.split_flags().flip_parent(index);

                let sibling = self.address_for_node(index + 1, bucket);
                ListNode::push_back(self.bucket_head(bucket), sibling.cast());
            }

            // The caller gets the address right after the header. The header
            // keeps the original request, not the class size; release
            // recomputes the class from it.
            Header::write(block, request);

            return Some(NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE)));
        }

        None
    }

    /// Gives the block that backs `address` back to the allocator, merging
    /// it with its buddy as many levels up as possible.
    ///
    /// # Safety
    ///
    /// `address` must come from a previous [`Self::allocate`] on this same
    /// allocator and must not have been released already. The 8 bytes in
    /// front of it must be untouched.
    pub unsafe fn release(&mut self, address: NonNull<u8>) {
        let header = Header::from_user_address(address);
        let block = header.cast::<u8>();
        let request = (*header.as_ptr()).request;

        // Same rounding the allocation used, so same bucket.
        let mut bucket = bucket::bucket_for_request(request + HEADER_SIZE, BUCKETS);
        let mut index = self.node_for_address(block, bucket);

        // Walk towards the root merging buddies. Flipping the parent's bit
        // accounts for this node going back to free; what the flip returns
        // decides whether the walk continues:
        //
        // - Bit is now set: exactly one child is free (us), the buddy is
        //   still in use, no merge. Stop here.
        // - Bit is now clear: the buddy is free as well, so the parent
        //   becomes one whole free block. Unlink the buddy from its free
        //   list and keep going one level up.
        while index != 0 {
            if self.split_flags().flip_parent(index) {
                break;
            }

            let buddy = self.address_for_node(tree::buddy(index), bucket);
            ListNode::remove(buddy.cast());

            index = tree::parent(index);
            bucket -= 1;
        }

        // Whatever the loop settled on (the original block or a merged
        // ancestor) becomes a free block. Push at the back: allocation pops
        // from the back too, so a release followed by an allocation of the
        // same class reuses the same, still warm, address.
        ListNode::push_back(
            self.bucket_head(bucket),
            self.address_for_node(index, bucket).cast(),
        );
    }

    /// Number of bytes actually usable at an address returned for a
    /// `request` byte allocation: the class size the request rounds up to,
    /// minus the header.
    pub fn usable_size(request: usize) -> usize {
        let bucket = bucket::bucket_for_request(request + HEADER_SIZE, BUCKETS);

        bucket::size_of_bucket(bucket, Self::MAX_LOG2) - HEADER_SIZE
    }

    /// Grows the committed range to cover `upto`. The host is only consulted
    /// when the high-water mark actually has to move, and the mark only
    /// moves on success, so a refusal leaves no trace.
    unsafe fn ensure_committed(&mut self, upto: NonNull<u8>) -> bool {
        // SAFETY: only called after initialization.
        if upto <= self.committed.unwrap_unchecked() {
            return true;
        }

        if !self.host.commit_up_to(upto) {
            return false;
        }

        self.committed = Some(upto);

        true
    }

    /// Start of the arena.
    ///
    /// # Safety
    ///
    /// The allocator must be initialized.
    unsafe fn base(&self) -> NonNull<u8> {
        self.base.unwrap_unchecked()
    }

    /// Free list sentinel for `bucket`. The sentinels live at the front of
    /// the metadata region, laid out like any other array.
    unsafe fn bucket_head(&self, bucket: usize) -> NonNull<ListNode> {
        let sentinels = self.metadata.unwrap_unchecked().cast::<ListNode>();

        NonNull::new_unchecked(sentinels.as_ptr().add(bucket))
    }

    /// The split bits, right after the sentinels.
    unsafe fn split_flags(&self) -> SplitFlags {
        let bits = self.metadata.unwrap_unchecked().as_ptr().add(Self::SENTINELS_SIZE);

        SplitFlags::new(NonNull::new_unchecked(bits))
    }

    /// Address of the block that node `index` at depth `bucket` represents.
    unsafe fn address_for_node(&self, index: usize, bucket: usize) -> NonNull<u8> {
        let offset = tree::offset_for_node(index, bucket, Self::MAX_LOG2);

        NonNull::new_unchecked(self.base().as_ptr().add(offset))
    }

    /// Node index representing the block at `address` at depth `bucket`.
    unsafe fn node_for_address(&self, address: NonNull<u8>, bucket: usize) -> usize {
        let offset = address.as_ptr() as usize - self.base().as_ptr() as usize;

        tree::node_for_offset(offset, bucket, Self::MAX_LOG2)
    }
}

/// This struct exposes the public interface by wrapping [`BuddyAllocator`]
/// behind a [`Mutex`] and implementing [`std::alloc::Allocator`] and
/// [`GlobalAlloc`]. The buddy allocator itself is strictly single threaded;
/// the mutex is nothing more than the external serialization it demands.
///
/// The default configuration is a 2 GiB arena backed by a [`ReservedRange`],
/// with blocks from 16 bytes up. Both const parameters shrink it: `BUCKETS`
/// is the number of size classes (the arena is `2^(BUCKETS + 3)` bytes) and
/// `SPLIT_BYTES` must hold one bit per internal tree node, i.e.
/// `2^(BUCKETS - 1) / 8` bytes.
///
/// Addresses are aligned to 8 bytes and no further, so allocation requests
/// with stricter alignments are refused.
///
/// # Examples
///
/// ## Standalone allocator
///
/// ```rust
/// #![feature(allocator_api)]
///
/// use std::alloc::{Allocator, Layout};
///
/// use ruddy::Ruddy;
///
/// let ruddy = Ruddy::default();
/// let layout = Layout::array::<u8>(128).unwrap();
///
/// unsafe {
///     let address = ruddy.allocate(layout).unwrap();
///     // The allocator can return more space than requested.
///     assert!(address.len() >= 128);
///     // Same class, released and allocated again: same address.
///     ruddy.deallocate(address.cast(), layout);
///     let again = ruddy.allocate(layout).unwrap();
///     assert_eq!(again.cast::<u8>(), address.cast::<u8>());
///     ruddy.deallocate(again.cast(), layout);
/// }
/// ```
///
/// ## Collections and [`Box`]
///
/// ```no_run
/// #![feature(allocator_api)]
///
/// use ruddy::Ruddy;
///
/// let ruddy = Ruddy::default();
///
/// // Any struct that supports the allocator API works.
/// let num = Box::new_in(12, &ruddy);
/// assert_eq!(*num, 12);
///
/// let mut vec = Vec::new_in(&ruddy);
/// vec.push(5);
/// assert_eq!(vec[0], 5);
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use ruddy::Ruddy;
///
/// #[global_allocator]
/// static ALLOCATOR: Ruddy = Ruddy::with_default_config();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
pub struct Ruddy<
    H: HostMemory = ReservedRange,
    const BUCKETS: usize = 28,
    const SPLIT_BYTES: usize = 16777216,
> {
    /// One global lock. Fine grained locking (per bucket, or atomics on the
    /// split bits) would be a redesign of the whole tree discipline, not a
    /// wrapper change, so it's deliberately not attempted here.
    allocator: Mutex<BuddyAllocator<H, BUCKETS, SPLIT_BYTES>>,
}

/// SAFETY: every access to the inner allocator, and through it to the host,
/// goes through the mutex.
unsafe impl<H: HostMemory, const BUCKETS: usize, const SPLIT_BYTES: usize> Sync
    for Ruddy<H, BUCKETS, SPLIT_BYTES>
{
}

impl Ruddy {
    /// Default configuration: 2 GiB arena on top of a lazily committed
    /// [`ReservedRange`]. The reservation is address space, not memory;
    /// pages only start counting once allocations touch them.
    pub const fn with_default_config() -> Self {
        Self::with_host(ReservedRange::new(
            BuddyAllocator::<ReservedRange, 28, 16777216>::FOOTPRINT,
        ))
    }
}

impl<H: HostMemory, const BUCKETS: usize, const SPLIT_BYTES: usize> Ruddy<H, BUCKETS, SPLIT_BYTES> {
    /// Builds an allocator on top of the given host. The host needs to have
    /// [`BuddyAllocator::FOOTPRINT`] bytes of range to offer, anything less
    /// and allocations will start failing early on commit refusals.
    pub const fn with_host(host: H) -> Self {
        Self {
            allocator: Mutex::new(BuddyAllocator::new(host)),
        }
    }
}

impl Default for Ruddy {
    fn default() -> Self {
        Ruddy::with_default_config()
    }
}

unsafe impl<H: HostMemory, const BUCKETS: usize, const SPLIT_BYTES: usize> Allocator
    for Ruddy<H, BUCKETS, SPLIT_BYTES>
{
    fn allocate(&self, layout: Layout) -> AllocResult {
        // 8-byte alignment comes for free from the block layout, anything
        // stricter would need padding machinery this allocator doesn't have.
        if layout.align() > HEADER_SIZE {
            return Err(AllocError);
        }

        match self.allocator.lock() {
            Ok(mut allocator) => unsafe {
                match allocator.allocate(layout.size()) {
                    Some(address) => Ok(NonNull::slice_from_raw_parts(
                        address,
                        BuddyAllocator::<H, BUCKETS, SPLIT_BYTES>::usable_size(layout.size()),
                    )),
                    None => Err(AllocError),
                }
            },
            Err(_) => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, address: NonNull<u8>, _layout: Layout) {
        // The header in front of `address` already knows the size, the
        // layout brings nothing the release path needs.
        if let Ok(mut allocator) = self.allocator.lock() {
            allocator.release(address);
        }
    }
}

unsafe impl<H: HostMemory, const BUCKETS: usize, const SPLIT_BYTES: usize> GlobalAlloc
    for Ruddy<H, BUCKETS, SPLIT_BYTES>
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.allocate(layout) {
            Ok(address) => address.cast().as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, address: *mut u8, layout: Layout) {
        self.deallocate(NonNull::new_unchecked(address), layout)
    }
}
