use ruddy::Ruddy;

// NOTE: This example doesn't work with Miri. The reserved range is simulated
// with `std::alloc::alloc` when `cfg!(miri)` because there's no FFI there,
// but WE are the global allocator in this program, so the simulation would
// have to call back into ourselves while we hold our own lock. It turns out
// that we cannot simulate ourselves within ourselves :(
//
// Also note that every returned address is aligned to 8 bytes and no
// further, so programs that allocate types with stricter alignments (16 byte
// SIMD vectors, `u128`...) will see those allocations fail.

#[global_allocator]
static ALLOCATOR: Ruddy = Ruddy::with_default_config();

fn main() {
    let num = Box::new(10usize);
    println!("Boxed num {num} at {:?}", &*num as *const usize);

    let mut vec = Vec::with_capacity(*num);

    for i in 0..*num {
        vec.push(i);
    }

    println!("Vec: {vec:?} at {:?}", vec.as_ptr());

    let text = String::from("all of this lives in the buddy arena");
    println!("String \"{text}\" at {:?}", text.as_ptr());

    let cap = 1024 * 1024;
    let mut big: Vec<u8> = Vec::with_capacity(cap);
    big.push(1);

    println!("Large allocation of {cap} bytes at {:?}", big.as_ptr());
}
