// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A conservative, tracing, mark-and-sweep garbage collector for unmanaged
//! host programs.
//!
//! The collector replaces a host's raw allocator with tracked allocations
//! whose liveness is determined by scanning the call stack, saved
//! registers, and the managed heap for word-aligned bit patterns that look
//! like pointers into managed memory. It never requires type information,
//! never moves or compacts objects, and assumes a single mutator thread.
//!
//! ```no_run
//! fn main() {
//!     let bos = 0usize;
//!     ggc::start(&bos as *const _ as usize);
//!
//!     let p = ggc::alloc(1, 64).unwrap();
//!     ggc::run();
//!     // `p` is still reachable from this stack frame, so it survives.
//!
//!     ggc::stop();
//! }
//! ```

mod arch;
mod collector;
mod config;
mod error;
mod index;
mod raw_alloc;
mod scanner;

pub use collector::{Collector, CollectorStats, DebugFlags};
pub use config::GcConfig;
pub use error::GcError;
pub use index::Finalizer;
pub use raw_alloc::{LibcAllocator, RawAllocator};

use parking_lot::Mutex;
use std::ptr::NonNull;

static GLOBAL: Mutex<Option<Collector<LibcAllocator>>> = Mutex::new(None);

fn with_global<R>(f: impl FnOnce(&mut Collector<LibcAllocator>) -> R) -> R {
    let mut guard = GLOBAL.lock();
    let gc = guard
        .as_mut()
        .expect("ggc: operation called before start() or after stop()");
    f(gc)
}

/// Initializes the process-wide collector. Must be called before any other
/// managed allocation. `bos` is conventionally the address of a local
/// variable in the program's main entry frame; it must dominate every
/// subsequent allocation call site.
pub fn start(bos: usize) {
    let mut guard = GLOBAL.lock();
    *guard = Some(Collector::start(bos));
}

/// Initializes the collector with non-default tuning constants.
pub fn start_with_config(bos: usize, config: GcConfig) {
    let mut guard = GLOBAL.lock();
    *guard = Some(Collector::start_with(bos, config, LibcAllocator));
}

/// Like [`start`], but determines `bos` automatically from the platform
/// instead of taking it from the caller. Returns `false` (and leaves the
/// collector uninitialized) on a platform where auto-detection isn't
/// available; callers there must fall back to [`start`].
pub fn start_auto() -> bool {
    let mut guard = GLOBAL.lock();
    match Collector::start_auto() {
        Some(gc) => {
            *guard = Some(gc);
            true
        }
        None => false,
    }
}

/// Tears down the singleton: clears every root tag, sweeps (reclaiming
/// everything), and releases the index. Returns the total bytes reclaimed.
pub fn stop() -> usize {
    let gc = GLOBAL.lock().take();
    match gc {
        Some(gc) => gc.stop(),
        None => 0,
    }
}

/// Request `count * size` bytes (or `size` bytes when `count == 0`),
/// zero-initialized if `count > 0`.
pub fn alloc(count: usize, size: usize) -> Result<NonNull<u8>, GcError> {
    with_global(|gc| gc.alloc(count, size))
}

/// As [`alloc`], but `finalizer` runs exactly once immediately before
/// reclamation.
pub fn alloc_with_finalizer(
    count: usize,
    size: usize,
    finalizer: Finalizer,
) -> Result<NonNull<u8>, GcError> {
    with_global(|gc| gc.alloc_with_finalizer(count, size, finalizer))
}

/// As [`alloc`], but the block is implicitly rooted for its lifetime until
/// explicitly [`unroot`]ed or [`stop`] is called.
pub fn alloc_static(count: usize, size: usize) -> Result<NonNull<u8>, GcError> {
    with_global(|gc| gc.alloc_static(count, size))
}

/// Resizes a tracked block in place or by moving it, preserving its
/// finalizer across a move. See [`Collector::realloc`] for the full
/// contract.
pub fn realloc(p: *mut u8, size: usize) -> Result<NonNull<u8>, GcError> {
    with_global(|gc| gc.realloc(p, size))
}

/// Unconditional release; unknown pointers are silently ignored.
pub fn free(p: *mut u8) {
    with_global(|gc| gc.free(p))
}

/// Explicitly roots an already-tracked pointer. A no-op for unknown
/// pointers.
pub fn root(p: *mut u8) {
    with_global(|gc| gc.root(p))
}

/// Inverse of [`root`].
pub fn unroot(p: *mut u8) {
    with_global(|gc| gc.unroot(p))
}

/// While paused, neither size-triggered nor OOM-triggered collection fires.
/// Explicit [`run`] still collects.
pub fn pause() {
    with_global(|gc| gc.pause())
}

/// Resumes automatic collection after [`pause`].
pub fn resume() {
    with_global(|gc| gc.resume())
}

/// Runs one full mark-and-sweep cycle, returning the total bytes reclaimed.
pub fn run() -> usize {
    with_global(|gc| gc.run())
}

/// Selectively enables/disables the mark and sweep halves of a cycle, for
/// testing.
pub fn debug_flags(flags: DebugFlags) {
    with_global(|gc| gc.debug_flags = flags)
}

/// A read-only snapshot of the collector's index state.
pub fn stats() -> CollectorStats {
    with_global(|gc| gc.stats())
}
