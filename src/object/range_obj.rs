//! The `Range` type: a (begin, end) pair with an exclusive-bound flag.
//!
//! Built by the `MKRNG` / `MKRNGX` instructions.

use crate::context::Context;
use crate::util::constants::BYTES_IN_WORD;

use super::type_obj::SizeSpec;
use super::value::Value;
use super::ObjectMeta;

pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Fixed(2), SizeSpec::Fixed(BYTES_IN_WORD));

#[repr(C)]
struct RangeObj {
    _meta: ObjectMeta,
    // --- SLOTS ---
    begin: Value,
    end: Value,
    // --- BYTES ---
    exclusive: usize,
}

/// Build a range from two stack slots (the bounds stay rooted while the
/// range allocates).
pub fn new_from_stack(
    ctx: &mut Context,
    begin_slot: usize,
    end_slot: usize,
    exclusive: bool,
) -> Value {
    let ty = ctx.globals.type_range.as_obj();
    let obj = ctx.mem.alloc(ty);
    let raw = unsafe { obj.deref::<RangeObj>() };
    raw.begin = ctx.stack.get(begin_slot);
    raw.end = ctx.stack.get(end_slot);
    raw.exclusive = exclusive as usize;
    Value::from_obj(obj)
}

pub fn begin(v: Value) -> Value {
    unsafe { v.as_obj().deref::<RangeObj>() }.begin
}

pub fn end(v: Value) -> Value {
    unsafe { v.as_obj().deref::<RangeObj>() }.end
}

pub fn is_exclusive(v: Value) -> bool {
    unsafe { v.as_obj().deref::<RangeObj>() }.exclusive != 0
}
