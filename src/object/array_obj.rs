//! The `Array` type and its backing storage.
//!
//! `ArraySlots` is an extendable slot vector (same layout as `Tuple`, but
//! mutable); `Array` pairs a backing `ArraySlots` with a live length and
//! grows or shrinks the backing as elements come and go.

use crate::context::{Context, ExecResult};
use crate::mem::objmem::{self, AllocHint};
use crate::util::constants::BYTES_IN_WORD;

use super::exception_obj;
use super::int_obj;
use super::type_obj::SizeSpec;
use super::value::{ObjRef, Value};
use super::ObjectMeta;

// ----- ArraySlots --------------------------------------------------------

pub mod slots {
    use super::*;

    pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Extendable, SizeSpec::Fixed(0));

    /// Number of elements.
    pub fn length(v: Value) -> usize {
        let header = v.as_obj().slot(0);
        debug_assert!(header.is_smallint());
        header.as_smallint() as usize - 1
    }

    pub fn get(v: Value, index: usize) -> Value {
        debug_assert!(index < length(v));
        v.as_obj().slot(1 + index)
    }

    pub fn set(v: Value, index: usize, element: Value) {
        debug_assert!(index < length(v));
        v.as_obj().set_slot(1 + index, element);
    }

    /// Create a vector of `count` elements, filled with small-int zero.
    pub fn new(ctx: &mut Context, count: usize) -> Value {
        let ty = ctx.globals.type_array_slots.as_obj();
        let obj = ctx.mem.alloc_ex(AllocHint::Auto, ty, 1 + count, 0);
        for i in 0..count {
            obj.set_slot_no_barrier(1 + i, Value::SMALLINT_ZERO);
        }
        Value::from_obj(obj)
    }
}

// ----- Array -------------------------------------------------------------

pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Fixed(1), SizeSpec::Fixed(BYTES_IN_WORD));

/// Smallest capacity an append grows to.
const GROW_CAPACITY_MIN: usize = 4;
/// A pop only shrinks the backing when at least this many elements remain.
const SHRINK_LENGTH_MIN: usize = 16;

#[repr(C)]
struct ArrayObj {
    _meta: ObjectMeta,
    // --- SLOTS ---
    data: Value, // ArraySlots
    // --- BYTES ---
    length: usize,
}

/// Create an array able to hold `capacity` elements without growing.
pub fn new_with_capacity(ctx: &mut Context, capacity: usize) -> Value {
    // Allocate the backing first: the array object must never hold a
    // half-initialised data slot.
    let backing = slots::new(ctx, capacity);
    let t = ctx.stack.alloc_temp(1);
    ctx.stack.set(t, backing);
    let ty = ctx.globals.type_array.as_obj();
    let obj = ctx.mem.alloc(ty);
    let raw = unsafe { obj.deref::<ArrayObj>() };
    raw.data = ctx.stack.get(t);
    raw.length = 0;
    objmem::write_barrier(obj, raw.data);
    ctx.stack.free_temp(1);
    Value::from_obj(obj)
}

/// Build an array from `count` consecutive stack slots starting at
/// `src_slot` (absolute).
pub fn new_from_stack(ctx: &mut Context, src_slot: usize, count: usize) -> Value {
    let v = new_with_capacity(ctx, count);
    let obj = v.as_obj();
    let raw = unsafe { obj.deref::<ArrayObj>() };
    raw.length = count;
    let backing = raw.data.as_obj();
    for i in 0..count {
        backing.set_slot_no_barrier(1 + i, ctx.stack.get(src_slot + i));
    }
    objmem::write_barrier_n(backing, 1, count);
    v
}

pub fn length(v: Value) -> usize {
    unsafe { v.as_obj().deref::<ArrayObj>() }.length
}

/// The backing `ArraySlots`.
pub fn backing(v: Value) -> Value {
    unsafe { v.as_obj().deref::<ArrayObj>() }.data
}

pub fn capacity(v: Value) -> usize {
    slots::length(backing(v))
}

/// Bounds-checked element read.
pub fn get(v: Value, index: usize) -> Option<Value> {
    if index < length(v) {
        Some(slots::get(backing(v), index))
    } else {
        None
    }
}

/// Bounds-checked element write.
pub fn set(v: Value, index: usize, element: Value) -> bool {
    if index < length(v) {
        slots::set(backing(v), index, element);
        true
    } else {
        false
    }
}

/// Append the value held in stack slot `val_slot` to the array held in
/// stack slot `arr_slot`; grows the backing when full.
pub fn push(ctx: &mut Context, arr_slot: usize, val_slot: usize) {
    let arr = ctx.stack.get(arr_slot);
    let len = length(arr);
    if len == capacity(arr) {
        grow(ctx, arr_slot, (len * 2).max(GROW_CAPACITY_MIN));
    }
    let arr = ctx.stack.get(arr_slot);
    let raw = unsafe { arr.as_obj().deref::<ArrayObj>() };
    raw.length = len + 1;
    slots::set(raw.data, len, ctx.stack.get(val_slot));
}

/// Remove and return the last element.  The backing shrinks to half once
/// the length drops to half the capacity (but never below a small floor).
pub fn pop(ctx: &mut Context, arr_slot: usize) -> Option<Value> {
    let arr = ctx.stack.get(arr_slot);
    let len = length(arr);
    if len == 0 {
        return None;
    }
    let last = slots::get(backing(arr), len - 1);
    slots::set(backing(arr), len - 1, Value::SMALLINT_ZERO);
    unsafe { arr.as_obj().deref::<ArrayObj>() }.length = len - 1;

    let new_len = len - 1;
    if new_len >= SHRINK_LENGTH_MIN && new_len <= capacity(arr) / 2 {
        let t = ctx.stack.alloc_temp(1);
        ctx.stack.set(t, last);
        grow(ctx, arr_slot, capacity(arr) / 2);
        let last = ctx.stack.get(t);
        ctx.stack.free_temp(1);
        return Some(last);
    }
    Some(last)
}

/// Insert the value from `val_slot` at `index`, sliding the tail up.
pub fn insert(ctx: &mut Context, arr_slot: usize, index: usize, val_slot: usize) -> bool {
    let len = length(ctx.stack.get(arr_slot));
    if index > len {
        return false;
    }
    push(ctx, arr_slot, val_slot); // grows and appends; we then rotate
    let arr = ctx.stack.get(arr_slot);
    let backing = backing(arr);
    let mut i = length(arr) - 1;
    while i > index {
        let prev = slots::get(backing, i - 1);
        slots::set(backing, i, prev);
        i -= 1;
    }
    slots::set(backing, index, ctx.stack.get(val_slot));
    true
}

/// Remove the element at `index`, sliding the tail down.
pub fn remove(ctx: &mut Context, arr_slot: usize, index: usize) -> bool {
    let arr = ctx.stack.get(arr_slot);
    let len = length(arr);
    if index >= len {
        return false;
    }
    let backing = backing(arr);
    for i in index..len - 1 {
        let next = slots::get(backing, i + 1);
        slots::set(backing, i, next);
    }
    slots::set(backing, len - 1, Value::SMALLINT_ZERO);
    unsafe { arr.as_obj().deref::<ArrayObj>() }.length = len - 1;
    let _ = pop_shrink_check(ctx, arr_slot);
    true
}

fn pop_shrink_check(ctx: &mut Context, arr_slot: usize) -> bool {
    let arr = ctx.stack.get(arr_slot);
    let len = length(arr);
    if len >= SHRINK_LENGTH_MIN && len <= capacity(arr) / 2 {
        grow(ctx, arr_slot, capacity(arr) / 2);
        return true;
    }
    false
}

/// Replace the backing with one of `new_capacity`, copying the live prefix.
fn grow(ctx: &mut Context, arr_slot: usize, new_capacity: usize) {
    debug_assert!(new_capacity >= length(ctx.stack.get(arr_slot)));
    let new_backing = slots::new(ctx, new_capacity);
    let arr = ctx.stack.get(arr_slot); // re-read: the allocation may have moved it
    let raw = unsafe { arr.as_obj().deref::<ArrayObj>() };
    let old_backing = raw.data.as_obj();
    let new_ref = new_backing.as_obj();
    let n = raw.length;
    for i in 0..n {
        new_ref.set_slot_no_barrier(1 + i, old_backing.slot(1 + i));
    }
    objmem::write_barrier_n(new_ref, 1, n);
    raw.data = new_backing;
    objmem::write_barrier(arr.as_obj(), new_backing);
}

// ----- native methods ----------------------------------------------------

fn index_operand(ctx: &mut Context, v: Value) -> Result<usize, crate::context::Thrown> {
    match int_obj::to_i128(ctx, v) {
        Some(i) if i >= 0 => Ok(i as usize),
        _ => Err(exception_obj::throw_format(
            ctx,
            "type",
            v,
            "not a valid index".to_string(),
        )),
    }
}

fn throw_index(ctx: &mut Context, key: Value) -> crate::context::Thrown {
    exception_obj::throw_format(ctx, "key", key, "index out of range".to_string())
}

/// `[]`: REG-1 = array, REG-2 = index.
pub(crate) fn native_get_element(ctx: &mut Context) -> ExecResult {
    let key = ctx.stack.reg(2);
    let index = index_operand(ctx, key)?;
    match get(ctx.stack.reg(1), index) {
        Some(v) => {
            ctx.stack.set_reg(0, v);
            Ok(())
        }
        None => Err(throw_index(ctx, key)),
    }
}

/// `[]=`: REG-1 = array, REG-2 = index, REG-3 = value.
pub(crate) fn native_set_element(ctx: &mut Context) -> ExecResult {
    let key = ctx.stack.reg(2);
    let index = index_operand(ctx, key)?;
    if set(ctx.stack.reg(1), index, ctx.stack.reg(3)) {
        let nil = ctx.globals.val_nil;
        ctx.stack.set_reg(0, nil);
        Ok(())
    } else {
        Err(throw_index(ctx, key))
    }
}

/// `insert`: REG-1 = array, REG-2 = index, REG-3 = value.
pub(crate) fn native_insert(ctx: &mut Context) -> ExecResult {
    let key = ctx.stack.reg(2);
    let index = index_operand(ctx, key)?;
    let arr_slot = ctx.stack.frame() + 1;
    let val_slot = ctx.stack.frame() + 3;
    if insert(ctx, arr_slot, index, val_slot) {
        let nil = ctx.globals.val_nil;
        ctx.stack.set_reg(0, nil);
        Ok(())
    } else {
        Err(throw_index(ctx, key))
    }
}

/// `remove`: REG-1 = array, REG-2 = index.
pub(crate) fn native_remove(ctx: &mut Context) -> ExecResult {
    let key = ctx.stack.reg(2);
    let index = index_operand(ctx, key)?;
    let arr_slot = ctx.stack.frame() + 1;
    if remove(ctx, arr_slot, index) {
        let nil = ctx.globals.val_nil;
        ctx.stack.set_reg(0, nil);
        Ok(())
    } else {
        Err(throw_index(ctx, key))
    }
}
