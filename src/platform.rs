use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for the two primitives the allocator needs from whoever owns
/// the address space. The allocator anchors its arena at whatever
/// [`HostMemory::current_break`] returns and then grows the usable prefix of
/// it with [`HostMemory::commit_up_to`], never going backwards. It doesn't
/// care whether that maps to an actual moving program break or to a range
/// that was reserved up front.
pub trait HostMemory {
    /// Returns the lowest address that has not been committed yet. The first
    /// call decides where the arena lives, so the result must stay stable
    /// until [`HostMemory::commit_up_to`] moves it.
    unsafe fn current_break(&mut self) -> Pointer<u8>;

    /// Makes every address before `address` safe to read and write, or
    /// returns `false` without side effects if that's impossible. Newly
    /// committed memory must read as zero the first time it becomes
    /// addressable, which `brk`, `mmap` and `VirtualAlloc` all guarantee.
    unsafe fn commit_up_to(&mut self, address: NonNull<u8>) -> bool;
}

/// The classic break-based host: the arena starts at the current program
/// break and committing means moving the break up with `brk(2)`.
///
/// Only use this when nothing else in the process allocates through the
/// break. The usual libc allocator does exactly that, so this host is really
/// meant for sandboxes and runtimes that own their heap outright; everywhere
/// else [`ReservedRange`] is the safer choice.
#[cfg(target_os = "linux")]
pub struct ProgramBreak;

#[cfg(target_os = "linux")]
impl HostMemory for ProgramBreak {
    unsafe fn current_break(&mut self) -> Pointer<u8> {
        let address = libc::sbrk(0);

        if address == usize::MAX as *mut libc::c_void {
            return None;
        }

        Some(NonNull::new_unchecked(address).cast())
    }

    unsafe fn commit_up_to(&mut self, address: NonNull<u8>) -> bool {
        libc::brk(address.as_ptr().cast()) == 0
    }
}

/// A host backed by a fixed reservation of address space. The whole range is
/// reserved (but not committed) on first use, and [`HostMemory::commit_up_to`]
/// then commits prefixes of it on demand: `mmap` with `PROT_NONE` plus
/// `mprotect` on Unix, `VirtualAlloc` with `MEM_RESERVE`/`MEM_COMMIT` on
/// Windows. Committing never fails short of kernel resource exhaustion; the
/// only hard refusal is running past the end of the reservation.
pub struct ReservedRange {
    /// Reservation length in bytes, rounded up to whole pages on first use.
    length: usize,
    /// Start of the reserved range, [`None`] until reserved.
    base: Pointer<u8>,
    /// Bytes committed so far, always a multiple of the page size.
    committed: usize,
}

impl ReservedRange {
    /// Builds a host that will reserve `length` bytes of address space the
    /// first time the allocator touches it. Nothing happens until then, so
    /// this is `const` and can live in a `static`.
    pub const fn new(length: usize) -> Self {
        Self {
            length,
            base: None,
            committed: 0,
        }
    }
}

impl HostMemory for ReservedRange {
    unsafe fn current_break(&mut self) -> Pointer<u8> {
        if self.base.is_none() {
            // Reserve whole pages, otherwise the last commit would have to
            // stop short of the reservation end.
            let page = page_size();
            self.length = page * ((self.length + page - 1) / page);
            self.base = sys::reserve(self.length);
        }

        self.base
    }

    unsafe fn commit_up_to(&mut self, address: NonNull<u8>) -> bool {
        let Some(base) = self.base else {
            return false;
        };

        let bytes = address.as_ptr() as usize - base.as_ptr() as usize;

        if bytes > self.length {
            return false;
        }

        if bytes <= self.committed {
            return true;
        }

        let page = page_size();
        let rounded = page * ((bytes + page - 1) / page);

        if !sys::commit(base, rounded) {
            return false;
        }

        self.committed = rounded;

        true
    }
}

impl Drop for ReservedRange {
    fn drop(&mut self) {
        if let Some(base) = self.base {
            unsafe { sys::unreserve(base, self.length) };
        }
    }
}

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time.
static mut PAGE_SIZE: usize = 0;

/// We only know the value of the page size at runtime by calling into the
/// kernel, so we'll do that once and then mutate a global variable to reuse
/// it afterwards.
#[inline]
pub(crate) fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = sys::page_size();
        }

        PAGE_SIZE
    }
}

#[cfg(all(unix, not(miri)))]
use self::unix as sys;

#[cfg(all(windows, not(miri)))]
use self::windows as sys;

#[cfg(miri)]
use self::miri as sys;

#[cfg(all(unix, not(miri)))]
mod unix {
    use std::ptr::{self, NonNull};

    use crate::Pointer;

    pub unsafe fn reserve(length: usize) -> Pointer<u8> {
        // No protection at all: the pages only become usable once they are
        // committed, and inaccessible pages don't count towards overcommit.
        let protection = libc::PROT_NONE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
            libc::MAP_FAILED => None,
            address => Some(NonNull::new_unchecked(address).cast()),
        }
    }

    pub unsafe fn commit(base: NonNull<u8>, length: usize) -> bool {
        // Re-protecting the already committed prefix is redundant but
        // harmless, and it keeps the caller's bookkeeping to a single number.
        let protection = libc::PROT_READ | libc::PROT_WRITE;

        libc::mprotect(base.as_ptr().cast(), length, protection) == 0
    }

    pub unsafe fn unreserve(base: NonNull<u8>, length: usize) {
        if libc::munmap(base.as_ptr().cast(), length) != 0 {
            // TODO: What should we do here? Panic? The range is still valid,
            // it just wasn't unmapped.
        }
    }

    pub unsafe fn page_size() -> usize {
        libc::sysconf(libc::_SC_PAGE_SIZE) as usize
    }
}

#[cfg(all(windows, not(miri)))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use crate::Pointer;

    pub unsafe fn reserve(length: usize) -> Pointer<u8> {
        // Memory has to be reserved first and committed later in order to
        // become usable, which is exactly the discipline the allocator wants.
        let address = Memory::VirtualAlloc(
            None,
            length,
            Memory::MEM_RESERVE,
            Memory::PAGE_NOACCESS,
        );

        NonNull::new(address.cast())
    }

    pub unsafe fn commit(base: NonNull<u8>, length: usize) -> bool {
        let address = Memory::VirtualAlloc(
            Some(base.as_ptr() as *const _),
            length,
            Memory::MEM_COMMIT,
            Memory::PAGE_READWRITE,
        );

        !address.is_null()
    }

    pub unsafe fn unreserve(base: NonNull<u8>, _length: usize) {
        // Length must be 0 with MEM_RELEASE, the whole reservation goes away
        // at once. See the docs for details:
        // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
        if !Memory::VirtualFree(base.as_ptr().cast(), 0, Memory::MEM_RELEASE).as_bool() {
            // TODO: Release failed, don't know what to do here yet. Same
            // problem as munmap on Unix.
        }
    }

    pub unsafe fn page_size() -> usize {
        let mut system_info = MaybeUninit::uninit();
        SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

        system_info.assume_init().dwPageSize as usize
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so the reservation becomes one ordinary
    //! zeroed allocation made up front and committing becomes a bounds
    //! check. That loses the laziness but keeps every ordering rule intact,
    //! which is the part Miri is good at checking anyway.

    use std::{alloc, ptr::NonNull};

    use crate::Pointer;

    fn layout_for(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size_value()).unwrap()
    }

    const fn page_size_value() -> usize {
        4096
    }

    pub unsafe fn reserve(length: usize) -> Pointer<u8> {
        NonNull::new(alloc::alloc_zeroed(layout_for(length)))
    }

    pub unsafe fn commit(_base: NonNull<u8>, _length: usize) -> bool {
        true
    }

    pub unsafe fn unreserve(base: NonNull<u8>, length: usize) {
        alloc::dealloc(base.as_ptr(), layout_for(length));
    }

    pub unsafe fn page_size() -> usize {
        page_size_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_range_commits_prefixes() {
        unsafe {
            let mut host = ReservedRange::new(4 * page_size());

            let base = host.current_break().unwrap();
            let end = NonNull::new_unchecked(base.as_ptr().add(host.length));

            // Committing a prefix makes it writable, and it reads as zero.
            let first = NonNull::new_unchecked(base.as_ptr().add(100));
            assert!(host.commit_up_to(first));
            assert_eq!(*base.as_ptr(), 0);
            *base.as_ptr() = 42;
            assert_eq!(*base.as_ptr(), 42);

            // Committing is monotone and idempotent.
            assert!(host.commit_up_to(first));
            assert!(host.commit_up_to(end));

            // The reservation boundary is a hard refusal. (`wrapping_add`
            // because the address is past the reservation and only ever
            // compared, never dereferenced.)
            let beyond = NonNull::new_unchecked(end.as_ptr().wrapping_add(1));
            assert!(!host.commit_up_to(beyond));
        }
    }

    #[cfg(all(target_os = "linux", not(miri)))]
    #[test]
    fn program_break_is_somewhere() {
        unsafe {
            assert!(ProgramBreak.current_break().is_some());
        }
    }
}
