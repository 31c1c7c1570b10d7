//! A buddy memory allocator. All memory is served from one contiguous range
//! of virtual address space that is spanned by an implicit binary tree of
//! power-of-two blocks. Allocating splits blocks on the way down, releasing
//! merges them back up, and both operations finish in a number of steps
//! proportional to the number of size classes, never to the number of live
//! allocations.
//!
//! The address range itself comes from a [`HostMemory`] implementation and is
//! committed lazily: the allocator keeps a monotone high-water mark and only
//! asks the host to make more of the range usable right before it has to
//! write there. The host can be the classic program break, or a reserved
//! range that is committed piece by piece (`mmap` + `mprotect` on Unix,
//! `VirtualAlloc` on Windows).
//!
//! ```text
//!                         +-------------------------------+
//! bucket 0 (whole arena)  |               A               |
//!                         +-------------------------------+
//! bucket 1                |       A       |       B       |
//!                         +-------------------------------+
//! bucket 2                |   A   |   C   |      ...      |
//!                         +-------------------------------+
//! ...                     |              ...              |
//!                         +-------------------------------+
//! bucket N-1 (16 bytes)   | A | D |          ...          |
//!                         +-------------------------------+
//! ```
//!
//! Every row is a size class (a *bucket*) with its own free list, and every
//! block in a row is the *buddy* of its neighbor, the other half of the same
//! parent block one row above. A block can only ever merge with its buddy,
//! which is what keeps both operations logarithmic. See [`BuddyAllocator`]
//! for how the tree is stored without allocating a single node.
//!
//! # Examples
//!
//! ```rust
//! #![feature(allocator_api)]
//!
//! use std::alloc::{Allocator, Layout};
//!
//! use ruddy::Ruddy;
//!
//! let ruddy = Ruddy::default();
//! let layout = Layout::array::<u8>(100).unwrap();
//!
//! let address = ruddy.allocate(layout).unwrap();
//! // The allocator can return more space than requested.
//! assert!(address.len() >= 100);
//!
//! unsafe { ruddy.deallocate(address.cast(), layout) };
//! ```

#![feature(allocator_api)]

use std::{alloc::AllocError, ptr::NonNull};

mod allocator;
mod bucket;
mod header;
mod list;
mod platform;
mod split;
mod tree;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case. I think variance doesn't have much implications here except for the
/// links inside [`list::ListNode`], but those never leave the arena anyway.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// Shorter syntax for allocation return types.
pub(crate) type AllocResult = Result<NonNull<[u8]>, AllocError>;

pub use allocator::{BuddyAllocator, Ruddy};
#[cfg(target_os = "linux")]
pub use platform::ProgramBreak;
pub use platform::{HostMemory, ReservedRange};
