//! Exercises the public allocator surface the way real callers do: through
//! `std::alloc::Allocator`, with collections on top and with several threads
//! serialized by the wrapper's lock.

#![feature(allocator_api)]

use std::{
    alloc::{Allocator, Layout},
    sync::Barrier,
    thread,
};

use ruddy::{BuddyAllocator, ReservedRange, Ruddy};

/// A small configuration so the tests can exhaust the arena: 12 buckets
/// means a 32 KiB arena of 16 byte to 32 KiB blocks.
type SmallRuddy = Ruddy<ReservedRange, 12, 256>;

fn small() -> SmallRuddy {
    SmallRuddy::with_host(ReservedRange::new(
        BuddyAllocator::<ReservedRange, 12, 256>::FOOTPRINT,
    ))
}

#[test]
fn raw_allocate_and_deallocate() {
    let ruddy = small();

    let layout = Layout::array::<u8>(300).unwrap();
    let address = ruddy.allocate(layout).unwrap();

    // 300 bytes round up to a 512 byte block, 8 of which hold the header.
    assert!(address.len() >= 300);
    assert_eq!(address.cast::<u8>().as_ptr() as usize % 8, 0);

    unsafe {
        // The whole reported block is ours to write.
        address.cast::<u8>().as_ptr().write_bytes(0xAB, address.len());
        ruddy.deallocate(address.cast(), layout);
    }
}

#[test]
fn alignment_above_the_quantum_is_refused() {
    let ruddy = small();

    assert!(ruddy
        .allocate(Layout::from_size_align(64, 16).unwrap())
        .is_err());
    assert!(ruddy
        .allocate(Layout::from_size_align(64, 8).unwrap())
        .is_ok());
}

#[test]
fn arena_sized_failures_leave_the_allocator_working() {
    let ruddy = small();

    // 32 KiB arena: a request that large can't also fit the header.
    assert!(ruddy.allocate(Layout::array::<u8>(32 * 1024).unwrap()).is_err());

    let layout = Layout::array::<u8>(1000).unwrap();
    let address = ruddy.allocate(layout).unwrap();
    unsafe { ruddy.deallocate(address.cast(), layout) };
}

#[test]
fn collections_and_boxes() {
    let ruddy = small();

    let mut vec = Vec::new_in(&ruddy);
    for i in 0..500u32 {
        vec.push(i);
    }
    for (i, value) in vec.iter().enumerate() {
        assert_eq!(*value, i as u32);
    }

    let num = Box::new_in(42usize, &ruddy);
    assert_eq!(*num, 42);

    drop(vec);
    drop(num);

    // Everything went back, so the largest possible request fits again.
    let layout = Layout::array::<u8>(32 * 1024 - 8).unwrap();
    let address = ruddy.allocate(layout).unwrap();
    unsafe { ruddy.deallocate(address.cast(), layout) };
}

#[test]
fn default_configuration_smoke_test() {
    // The default arena reserves 2 GiB of address space; committed pages
    // only appear once allocations touch them. Miri can't fake a
    // reservation that big, so this one is native only.
    if cfg!(miri) {
        return;
    }

    let ruddy = Ruddy::default();

    let layout = Layout::array::<u64>(1024).unwrap();
    let address = ruddy.allocate(layout).unwrap();
    assert!(address.len() >= 8 * 1024);

    unsafe { ruddy.deallocate(address.cast(), layout) };
}

/// The core is single threaded by construction; the wrapper's mutex is what
/// lets threads share it. All threads allocate, meet at a barrier, verify
/// their data survived everyone else's traffic, and release.
#[test]
fn multiple_threads_synchronized_allocs_and_releases() {
    let ruddy = small();

    let num_threads = 8;
    let barrier = Barrier::new(num_threads);

    thread::scope(|scope| {
        for t in 0..num_threads {
            let ruddy = &ruddy;
            let barrier = &barrier;

            scope.spawn(move || {
                let num_elements = 100;
                let layout = Layout::array::<usize>(num_elements).unwrap();
                let address = ruddy.allocate(layout).unwrap().cast::<usize>();

                unsafe {
                    for i in 0..num_elements {
                        *address.as_ptr().add(i) = t * 1000 + i;
                    }

                    barrier.wait();

                    // Check memory corruption.
                    for i in 0..num_elements {
                        assert_eq!(*address.as_ptr().add(i), t * 1000 + i);
                    }

                    ruddy.deallocate(address.cast(), layout);
                }
            });
        }
    });

    // With every thread done, the arena must be whole again.
    let layout = Layout::array::<u8>(32 * 1024 - 8).unwrap();
    let address = ruddy.allocate(layout).unwrap();
    unsafe { ruddy.deallocate(address.cast(), layout) };
}
