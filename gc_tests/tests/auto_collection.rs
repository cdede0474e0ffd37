// Run-time:
//   status: success

// A tight sweep_factor on a small index triggers an automatic collection
// from inside alloc() itself, with no explicit run() call, once size
// crosses the configured sweep_limit.

fn main() {
    let bos = 0u8;
    let config = ggc::GcConfig {
        min_capacity: 8,
        upsize_factor: 0.8,
        downsize_factor: 0.2,
        sweep_factor: 0.25,
    };
    ggc::start_with_config(&bos as *const _ as usize, config);

    for _ in 0..4 {
        let p = ggc::alloc(1, 8).unwrap();
        drop(p);
    }

    // sweep_limit starts at floor(8 * 0.25) = 2, so by the time a third
    // unrooted, unreferenced block is requested a collection has already
    // run and reclaimed the earlier ones.
    assert!(ggc::stats().size <= 2);

    ggc::stop();
}
