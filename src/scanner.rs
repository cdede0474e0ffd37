// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The conservative marker: register/stack roots plus tagged-ROOT records
//! seed a worklist; transitive marking walks every record's bytes for
//! further candidate pointers.
//!
//! Scanning is intentionally unaligned: a candidate word is read at every
//! byte offset within the scanned range, not just word-aligned offsets, so
//! a pointer stored in a packed layout is still found.

use crate::arch::Address;
use crate::index::AllocIndex;
use std::mem::size_of;

const WORD_SIZE: usize = size_of::<usize>();

/// Runs the full mark procedure: tag-rooted records first, then every
/// candidate word found in `[tos, bos - WORD_SIZE]` of the stack.
///
/// Every record's `MARK` bit is cleared before tracing starts. This matters
/// even when a host's debug tooling runs a mark phase without a following
/// sweep (see [`crate::collector::DebugFlags`]): without clearing here, a
/// block that survived a prior unswept cycle would carry a stale `MARK`
/// into a later cycle in which it is no longer reachable, and escape
/// reclamation.
///
/// # Safety
/// `tos`/`bos` must bound a readable stack extent for the calling thread,
/// with `tos <= bos`, and must enclose every frame that could hold a
/// managed pointer.
pub unsafe fn mark(index: &mut AllocIndex, tos: Address, bos: Address) {
    for record in index.iter_mut() {
        record.set_marked(false);
    }
    let mut worklist: Vec<*mut u8> = index.roots().collect();
    scan_stack(tos, bos, index, &mut worklist);
    run_worklist(index, worklist);
}

/// Byte-by-byte scan of the stack range for word-sized candidates that are
/// known base pointers, pushing matches onto `worklist`.
///
/// # Safety
/// See [`mark`].
unsafe fn scan_stack(tos: Address, bos: Address, index: &AllocIndex, worklist: &mut Vec<*mut u8>) {
    if bos < tos + WORD_SIZE {
        return;
    }
    let mut addr = tos;
    while addr <= bos - WORD_SIZE {
        let candidate = (addr as *const u8).cast::<usize>().read_unaligned() as *mut u8;
        if index.get(candidate).is_some() {
            worklist.push(candidate);
        }
        addr += 1;
    }
}

/// Byte-by-byte scan of one managed block's contents for further
/// candidates.
///
/// # Safety
/// `base` must point to a live, readable block of at least `size` bytes.
unsafe fn scan_block(base: *mut u8, size: usize, index: &AllocIndex, worklist: &mut Vec<*mut u8>) {
    if size < WORD_SIZE {
        return;
    }
    for i in 0..=(size - WORD_SIZE) {
        let candidate = base.add(i).cast::<usize>().read_unaligned() as *mut u8;
        if index.get(candidate).is_some() {
            worklist.push(candidate);
        }
    }
}

/// Drains `worklist`, marking each unmarked record and pushing every
/// candidate found within it. Idempotent and insensitive to visitation
/// order.
fn run_worklist(index: &mut AllocIndex, mut worklist: Vec<*mut u8>) {
    while let Some(ptr) = worklist.pop() {
        let (already_marked, base, size) = match index.get_mut(ptr) {
            Some(record) => {
                if record.is_marked() {
                    (true, record.base, record.size)
                } else {
                    record.set_marked(true);
                    (false, record.base, record.size)
                }
            }
            None => continue,
        };
        if already_marked {
            continue;
        }
        // SAFETY: `base`/`size` come from a live record in `index`, which
        // only ever holds metadata for blocks the collector itself
        // allocated and has not yet released.
        unsafe { scan_block(base, size, index, &mut worklist) };
    }
}
