// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread scratch buffers for serialization.
//!
//! Each producer thread owns one buffer that is cleared and reused for every record, so the
//! steady state allocates nothing and no buffer is ever visible to another thread.

use std::cell::Cell;

const INITIAL_CAPACITY: usize = 8 * 1024;

/// Buffers that grew past this size are released after use instead of being kept around.
const MAX_RETAINED_CAPACITY: usize = 256 * 1024;

thread_local! {
    static SCRATCH: Cell<Vec<u8>> = const { Cell::new(Vec::new()) };
}

/// Runs `f` with the calling thread's cleared scratch buffer.
///
/// The buffer is moved out of the thread-local slot for the duration of `f`, so a re-entrant
/// call (for example from a transport that serializes again while sending) finds the slot empty
/// and works on its own buffer.
pub fn with_scratch<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    let mut buffer = SCRATCH.try_with(Cell::take).unwrap_or_default();
    buffer.clear();
    if buffer.capacity() == 0 {
        buffer.reserve(INITIAL_CAPACITY);
    }

    let result = f(&mut buffer);

    if buffer.capacity() <= MAX_RETAINED_CAPACITY {
        // fails only during thread teardown, in which case the buffer is simply dropped
        let _ = SCRATCH.try_with(|slot| slot.set(buffer));
    }
    result
}
