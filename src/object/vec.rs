//! Primitives over vectors of value slots.

use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

use super::value::Value;

/// Copy `n` slots from `src` to `dst`.  The ranges must not overlap.
///
/// # Safety
/// Both ranges must be valid slot storage.
pub unsafe fn copy(dst: Address, src: Address, n: usize) {
    std::ptr::copy_nonoverlapping(src.to_ptr::<Value>(), dst.to_mut_ptr::<Value>(), n);
}

/// Copy `n` slots from `src` to `dst`, allowing overlap.
///
/// # Safety
/// Both ranges must be valid slot storage.
pub unsafe fn move_(dst: Address, src: Address, n: usize) {
    std::ptr::copy(src.to_ptr::<Value>(), dst.to_mut_ptr::<Value>(), n);
}

/// Fill `n` slots at `dst` with `val`.
///
/// # Safety
/// The range must be valid slot storage.
pub unsafe fn fill(dst: Address, val: Value, n: usize) {
    let mut p = dst;
    let end = dst + n * BYTES_IN_WORD;
    while p < end {
        p.store(val);
        p += BYTES_IN_WORD;
    }
}
