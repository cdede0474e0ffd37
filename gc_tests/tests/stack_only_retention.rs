// Run-time:
//   status: success

// A block kept alive only by a local variable survives while that local is
// in scope, and is reclaimed once the stack slot holding its address has
// been overwritten.

fn clobber_stack() {
    // Forces the stack slot(s) that used to hold `p`'s address to be
    // overwritten with unrelated bytes before the next collection.
    let buf = [0u8; 4096];
    std::hint::black_box(&buf);
}

fn main() {
    let bos = 0u8;
    ggc::start(&bos as *const _ as usize);

    {
        let p = ggc::alloc(1, 64).unwrap();
        let freed = ggc::run();
        assert_eq!(freed, 0);
        assert!(ggc::stats().size >= 1);
        std::hint::black_box(p);
    }

    clobber_stack();

    let freed = ggc::run();
    assert_eq!(freed, 64);

    ggc::stop();
}
