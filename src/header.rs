use std::{mem, ptr::NonNull};

/// Size of [`Header`] in bytes. Every pointer handed to the caller sits this
/// many bytes after the start of its block.
pub(crate) const HEADER_SIZE: usize = 8;

/// Block header. It stores the number of bytes the caller originally asked
/// for, *not* the rounded up class size, and it occupies the 8 bytes right
/// before the address the caller receives:
///
/// ```text
/// +--------------+
/// |    Header    | <- Start of the block. 8 bytes.
/// +--------------+
/// | User content | <- Returned address points here.
/// |     ...      |
/// +--------------+
/// ```
///
/// Release gets nothing but the user pointer back, so the header is what lets
/// it recover the request size and from there the block's size class. The
/// caller must not touch those 8 bytes: there is no checksum or magic value
/// guarding them, a corrupted header silently derails the coalescing walk.
#[repr(C, align(8))]
pub(crate) struct Header {
    /// Originally requested size in bytes.
    pub request: usize,
}

const _: () = assert!(mem::size_of::<Header>() == HEADER_SIZE);

impl Header {
    /// Writes a header with the given request size at `block`.
    ///
    /// # Safety
    ///
    /// `block` must be the start of a committed block, aligned to at least
    /// [`HEADER_SIZE`].
    #[inline]
    pub unsafe fn write(block: NonNull<u8>, request: usize) {
        block.cast::<Header>().as_ptr().write(Header { request });
    }

    /// Returns a pointer to the [`Header`] given the address right after it,
    /// i.e. the address that was handed out by the allocator.
    ///
    /// # Safety
    ///
    /// `address` must come from a previous allocation that has not been
    /// released yet. As long as that's true this is safe, otherwise it's
    /// undefined behaviour.
    #[inline]
    pub unsafe fn from_user_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the address right after `header`, the one the caller gets to
    /// use.
    #[inline]
    pub unsafe fn user_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }
}
