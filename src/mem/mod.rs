//! Object memory: three collected spaces and the GC orchestration.
//!
//! * [`new_space`]: two equal bump-allocated semispaces.  Objects are born
//!   here (state `NEW`), survive one fast collection in place (state `MID`),
//!   and are promoted to old space on the next.
//! * [`old_space`]: a list of fixed-size chunks collected by mark-compact.
//!   Each chunk carries a lazily allocated remembered-set bitmap recording
//!   which of its objects may reference young objects.
//! * [`big_space`]: individually allocated large objects on a singly linked
//!   list threaded through their meta words, collected by mark-sweep.
//!
//! [`objmem`] ties the spaces together: allocation with GC-and-retry,
//! fast (young-only) and full collection cycles, precise root and
//! weak-reference registries, and the write barrier.

pub mod big_space;
pub mod chunk;
pub mod new_space;
pub mod objmem;
pub mod old_space;

use crate::util::constants::{BYTES_IN_GBYTE, BYTES_IN_KBYTE, BYTES_IN_WORD};

/// Largest object admitted to new or old space.  Anything bigger goes to big
/// space regardless of the allocation hint.
pub const NON_BIG_SPACE_MAX_ALLOC_SIZE: usize = BYTES_IN_WORD * BYTES_IN_KBYTE;

const NEW_SPACE_CHUNK_SIZE_MIN: usize = BYTES_IN_WORD * 4 * BYTES_IN_KBYTE;
const NEW_SPACE_CHUNK_SIZE_DFL: usize = BYTES_IN_WORD * 64 * BYTES_IN_KBYTE;

const OLD_SPACE_CHUNK_SIZE_MIN: usize = BYTES_IN_WORD * 4 * BYTES_IN_KBYTE;
const OLD_SPACE_CHUNK_SIZE_DFL: usize = BYTES_IN_WORD * 32 * BYTES_IN_KBYTE;
const OLD_SPACE_SIZE_LIMIT_DFL: usize = BYTES_IN_GBYTE;

const BIG_SPACE_THRESHOLD_INIT_DFL: usize = 16 * NON_BIG_SPACE_MAX_ALLOC_SIZE;
const BIG_SPACE_SIZE_LIMIT_DFL: usize = BYTES_IN_GBYTE;

const_assert!(NON_BIG_SPACE_MAX_ALLOC_SIZE >= 4 * BYTES_IN_KBYTE);
const_assert!(NEW_SPACE_CHUNK_SIZE_DFL >= NEW_SPACE_CHUNK_SIZE_MIN);
const_assert!(OLD_SPACE_CHUNK_SIZE_DFL >= OLD_SPACE_CHUNK_SIZE_MIN);
const_assert!(NEW_SPACE_CHUNK_SIZE_MIN > NON_BIG_SPACE_MAX_ALLOC_SIZE * 2);
const_assert!(OLD_SPACE_CHUNK_SIZE_MIN > NON_BIG_SPACE_MAX_ALLOC_SIZE * 2);

/// Resolved object-memory configuration.  Zero in any
/// [`crate::context::MemOptions`] field selects the default; undersized
/// requests are clamped to the minimums.
#[derive(Copy, Clone, Debug)]
pub struct MemConfig {
    pub new_chunk_size: usize,
    pub old_chunk_size: usize,
    pub old_size_limit: usize,
    pub big_threshold_init: usize,
    pub big_size_limit: usize,
}

impl MemConfig {
    pub fn from_options(opts: &crate::context::MemOptions) -> MemConfig {
        let new_chunk_size = if opts.new_space_size == 0 {
            NEW_SPACE_CHUNK_SIZE_DFL
        } else if opts.new_space_size < NEW_SPACE_CHUNK_SIZE_MIN * 2 {
            NEW_SPACE_CHUNK_SIZE_MIN
        } else {
            opts.new_space_size / 2
        };
        let old_chunk_size = if opts.old_space_chunk_size == 0 {
            OLD_SPACE_CHUNK_SIZE_DFL
        } else if opts.old_space_chunk_size < OLD_SPACE_CHUNK_SIZE_MIN {
            OLD_SPACE_CHUNK_SIZE_MIN
        } else {
            opts.old_space_chunk_size
        };
        let old_size_limit = if opts.old_space_size_max == 0 {
            OLD_SPACE_SIZE_LIMIT_DFL
        } else if opts.old_space_size_max < old_chunk_size {
            old_chunk_size
        } else {
            opts.old_space_size_max
        };
        let big_threshold_init = if opts.big_space_size == 0 {
            BIG_SPACE_THRESHOLD_INIT_DFL
        } else {
            opts.big_space_size
        };
        let big_size_limit = if opts.big_space_size_max == 0 {
            BIG_SPACE_SIZE_LIMIT_DFL
        } else {
            opts.big_space_size_max
        };
        MemConfig {
            new_chunk_size,
            old_chunk_size,
            old_size_limit,
            big_threshold_init,
            big_size_limit,
        }
    }
}
