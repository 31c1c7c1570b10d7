#![feature(allocator_api)]

use std::{
    alloc::{Allocator, Layout},
    ptr::NonNull,
};

use ruddy::Ruddy;

fn print_alloc(addr: NonNull<u8>, layout: Layout) {
    println!("Requested {} bytes of memory", layout.size());
    println!("Received this address: {addr:?}");
}

fn main() {
    let ruddy = Ruddy::default();

    unsafe {
        let layout1 = Layout::new::<u8>();
        let addr1 = ruddy.allocate(layout1).unwrap().cast();
        print_alloc(addr1, layout1);

        let layout2 = Layout::array::<u8>(1024).unwrap();
        let addr2 = ruddy.allocate(layout2).unwrap().cast();
        print_alloc(addr2, layout2);

        let layout3 = Layout::array::<u8>(4096).unwrap();
        let addr3 = ruddy.allocate(layout3).unwrap().cast::<u8>();
        print_alloc(addr3.cast(), layout3);

        println!("\nBlocks are powers of two, so neighbors sit at power of two distances.");

        println!("Releasing the last block and allocating the same size again...");
        ruddy.deallocate(addr3, layout3);
        let again = ruddy.allocate(layout3).unwrap().cast::<u8>();
        println!("Received {again:?}, the address we just gave back.");
        assert_eq!(again, addr3);

        println!("\nDeallocating everything...");
        ruddy.deallocate(addr1, layout1);
        ruddy.deallocate(addr2, layout2);
        ruddy.deallocate(again, layout3);

        println!("\nNow let's try to use Vec with our allocator...");
        let mut v = Vec::with_capacity_in(10, &ruddy);
        for i in 0..1000 {
            v.push(i as u32);
        }
        println!("Vec at {:?}, first 5 elements: {:?}", v.as_ptr(), &v[..5]);
    }
}
