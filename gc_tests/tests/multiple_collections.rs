// Run-time:
//   status: success

// Disabling the sweep half of a cycle via debug_flags leaves a still-reachable
// block marked but unreclaimed; once the block drops out of scope and a
// later cycle runs with both halves enabled, it is reclaimed. Several cycles
// compose as plain sequential calls to run().

fn clobber_stack() {
    let buf = [0u8; 4096];
    std::hint::black_box(&buf);
}

fn main() {
    let bos = 0u8;
    ggc::start(&bos as *const _ as usize);

    let p = ggc::alloc(1, 64).unwrap();

    ggc::debug_flags(ggc::DebugFlags::new().sweep_phase(false));
    let freed = ggc::run();
    assert_eq!(freed, 0);
    assert!(ggc::stats().size >= 1);
    std::hint::black_box(p);

    drop(p);
    clobber_stack();

    ggc::debug_flags(ggc::DebugFlags::new());
    let freed = ggc::run();
    assert_eq!(freed, 64);
    assert_eq!(ggc::stats().size, 0);

    ggc::stop();
}
